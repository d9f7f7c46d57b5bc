//! btleplug implementation of the platform capability.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic as BtleCharacteristic, Manager as _,
    Peripheral as _, PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use uuid::Uuid;

use async_trait::async_trait;

use crate::adapter::{
    AdvertisementObservation, AdvertisementStream, BleAdapter, BleLink, CharacteristicDescriptor,
    CharacteristicProps, LinkEvent, LinkEventStream, ServiceDescriptor,
};
use crate::{Error, Result};

/// Platform adapter backed by btleplug.
pub struct BtleplugAdapter {
    _manager: Manager,
    adapter: Adapter,
}

impl BtleplugAdapter {
    /// Use the first adapter found on the system.
    pub async fn new() -> Result<Self> {
        Self::with_adapter_index(0).await
    }

    pub async fn with_adapter_index(index: usize) -> Result<Self> {
        let manager = Manager::new().await.map_err(adapter_error)?;
        let mut adapters = manager.adapters().await.map_err(adapter_error)?;

        if index >= adapters.len() {
            return Err(Error::AdapterUnavailable(format!(
                "no bluetooth adapter at index {}",
                index
            )));
        }

        let adapter = adapters.swap_remove(index);

        log::trace!("Using adapter: {:?}", adapter);

        Ok(Self {
            _manager: manager,
            adapter,
        })
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn scan_events(&self) -> Result<AdvertisementStream> {
        let events = self.adapter.events().await.map_err(adapter_error)?;

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(adapter_error)?;

        let adapter = self.adapter.clone();
        let observations = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                let peripheral_id = match event {
                    CentralEvent::DeviceDiscovered(peripheral_id)
                    | CentralEvent::DeviceUpdated(peripheral_id) => peripheral_id,
                    _ => return None,
                };

                let peripheral = adapter.peripheral(&peripheral_id).await.ok()?;
                let properties = peripheral.properties().await.ok().flatten()?;

                Some(Ok(observation_from(properties)))
            }
        });

        Ok(Box::pin(observations))
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await.map_err(adapter_error)
    }

    async fn connect(&self, address: &str) -> Result<(Box<dyn BleLink>, LinkEventStream)> {
        let peripherals = self.adapter.peripherals().await.map_err(adapter_error)?;

        let peripheral = peripherals
            .into_iter()
            .find(|peripheral| {
                peripheral
                    .address()
                    .to_string()
                    .eq_ignore_ascii_case(address)
            })
            .ok_or_else(|| Error::ConnectionRefused {
                address: address.to_string(),
                reason: "device is not known to the adapter".to_string(),
            })?;

        peripheral
            .connect()
            .await
            .map_err(|e| Error::ConnectionRefused {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        log::debug!("Connected to {}", address);

        // Handles are assigned during discovery; the notification
        // stream resolves uuids through this shared map.
        let handle_map: Arc<Mutex<HashMap<Uuid, u16>>> = Arc::new(Mutex::new(HashMap::new()));

        let notifications = peripheral
            .notifications()
            .await
            .map_err(|e| Error::ConnectionRefused {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        let map_for_stream = handle_map.clone();
        let values = notifications.filter_map(move |notification| {
            let map_for_stream = map_for_stream.clone();
            async move {
                let handle = *map_for_stream.lock().unwrap().get(&notification.uuid)?;
                Some(LinkEvent::Notification {
                    handle,
                    value: notification.value,
                })
            }
        });

        let peripheral_id = peripheral.id();
        let central_events = self.adapter.events().await.map_err(adapter_error)?;
        let disconnects = central_events.filter_map(move |event| {
            let peripheral_id = peripheral_id.clone();
            async move {
                match event {
                    CentralEvent::DeviceDisconnected(disconnected)
                        if disconnected == peripheral_id =>
                    {
                        Some(LinkEvent::Disconnected)
                    }
                    _ => None,
                }
            }
        });

        let events: LinkEventStream = Box::pin(futures::stream::select(values, disconnects));

        let link = BtleplugLink {
            peripheral,
            characteristics: HashMap::new(),
            handle_map,
        };

        Ok((Box::new(link), events))
    }
}

struct BtleplugLink {
    peripheral: Peripheral,
    characteristics: HashMap<u16, BtleCharacteristic>,
    handle_map: Arc<Mutex<HashMap<Uuid, u16>>>,
}

impl BtleplugLink {
    fn characteristic(&self, handle: u16) -> Option<&BtleCharacteristic> {
        self.characteristics.get(&handle)
    }
}

#[async_trait]
impl BleLink for BtleplugLink {
    async fn discover_services(&mut self) -> Result<Vec<ServiceDescriptor>> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| Error::DiscoveryFailed(e.to_string()))?;

        let mut next_handle: u16 = 1;
        let mut descriptors = Vec::new();
        let mut handle_map = HashMap::new();

        for service in self.peripheral.services() {
            let service_handle = next_handle;
            next_handle += 1;

            let mut characteristics = Vec::new();
            for characteristic in &service.characteristics {
                let handle = next_handle;
                next_handle += 1;

                self.characteristics.insert(handle, characteristic.clone());
                handle_map.insert(characteristic.uuid, handle);
                characteristics.push(CharacteristicDescriptor {
                    uuid: characteristic.uuid,
                    handle,
                    properties: props_from(characteristic.properties),
                });
            }

            descriptors.push(ServiceDescriptor {
                uuid: service.uuid,
                handle: service_handle,
                characteristics,
            });
        }

        *self.handle_map.lock().unwrap() = handle_map;

        Ok(descriptors)
    }

    async fn read(&mut self, handle: u16) -> Result<Vec<u8>> {
        let characteristic = self
            .characteristic(handle)
            .ok_or(Error::CharacteristicNotReadable { handle })?
            .clone();

        self.peripheral
            .read(&characteristic)
            .await
            .map_err(gatt_error)
    }

    async fn write(&mut self, handle: u16, value: &[u8], with_ack: bool) -> Result<()> {
        let characteristic = self
            .characteristic(handle)
            .ok_or(Error::CharacteristicNotWritable { handle })?
            .clone();

        let write_type = if with_ack {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        self.peripheral
            .write(&characteristic, value, write_type)
            .await
            .map_err(gatt_error)
    }

    async fn set_notify(&mut self, handle: u16, enabled: bool) -> Result<()> {
        let characteristic = self
            .characteristic(handle)
            .ok_or(Error::CharacteristicNotNotifiable { handle })?
            .clone();

        if enabled {
            self.peripheral
                .subscribe(&characteristic)
                .await
                .map_err(gatt_error)
        } else {
            self.peripheral
                .unsubscribe(&characteristic)
                .await
                .map_err(gatt_error)
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.peripheral.disconnect().await.map_err(gatt_error)
    }
}

fn observation_from(properties: PeripheralProperties) -> AdvertisementObservation {
    let raw_payload = raw_payload(&properties);

    AdvertisementObservation {
        address: properties.address.to_string(),
        name: properties.local_name,
        rssi: properties.rssi,
        tx_power: properties.tx_power_level,
        service_uuids: properties.services,
        manufacturer_data: properties.manufacturer_data,
        raw_payload,
    }
}

/// btleplug does not expose the raw advertisement PDU, so the payload
/// is reconstructed from the data sections it does report, in a stable
/// order.
fn raw_payload(properties: &PeripheralProperties) -> Vec<u8> {
    let mut payload = Vec::new();

    let mut manufacturer: Vec<_> = properties.manufacturer_data.iter().collect();
    manufacturer.sort_by_key(|(company, _)| **company);
    for (company, data) in manufacturer {
        payload.extend_from_slice(&company.to_le_bytes());
        payload.extend_from_slice(data);
    }

    let mut service_data: Vec<_> = properties.service_data.iter().collect();
    service_data.sort_by_key(|(uuid, _)| **uuid);
    for (_, data) in service_data {
        payload.extend_from_slice(data);
    }

    payload
}

fn props_from(flags: CharPropFlags) -> CharacteristicProps {
    CharacteristicProps {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

fn adapter_error(e: btleplug::Error) -> Error {
    Error::AdapterUnavailable(e.to_string())
}

fn gatt_error(e: btleplug::Error) -> Error {
    match e {
        btleplug::Error::NotConnected => Error::NotConnected,
        btleplug::Error::TimedOut(elapsed) => Error::OperationTimeout(elapsed),
        other => Error::AdapterUnavailable(other.to_string()),
    }
}
