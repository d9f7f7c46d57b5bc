//! Scripted adapter and peripherals for exercising the engine without
//! a radio.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::adapter::{
    AdvertisementObservation, AdvertisementStream, BleAdapter, BleLink, CharacteristicDescriptor,
    CharacteristicProps, LinkEvent, LinkEventStream, ServiceDescriptor,
};
use crate::session::{DeviceSession, SessionState};
use crate::{Error, Result};

pub(crate) const READABLE: CharacteristicProps = CharacteristicProps {
    read: true,
    write: false,
    write_without_response: false,
    notify: false,
    indicate: false,
};

pub(crate) const WRITABLE: CharacteristicProps = CharacteristicProps {
    read: false,
    write: true,
    write_without_response: false,
    notify: false,
    indicate: false,
};

pub(crate) const NOTIFIABLE: CharacteristicProps = CharacteristicProps {
    read: false,
    write: false,
    write_without_response: false,
    notify: true,
    indicate: false,
};

pub(crate) fn characteristic(handle: u16, properties: CharacteristicProps) -> CharacteristicDescriptor {
    CharacteristicDescriptor {
        uuid: Uuid::from_u128(0x1000 + handle as u128),
        handle,
        properties,
    }
}

pub(crate) fn service(handle: u16, characteristics: Vec<CharacteristicDescriptor>) -> ServiceDescriptor {
    ServiceDescriptor {
        uuid: Uuid::from_u128(handle as u128),
        handle,
        characteristics,
    }
}

/// Wait until the session state satisfies the predicate, or panic.
pub(crate) async fn wait_for_session(
    session: &DeviceSession,
    predicate: impl Fn(&SessionState) -> bool,
) {
    let mut watch = session.state_watch();

    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let current = watch.borrow().clone();
            if predicate(&current) {
                return;
            }
            if watch.changed().await.is_err() {
                let last = watch.borrow().clone();
                assert!(
                    predicate(&last),
                    "session ended in unexpected state {:?}",
                    last
                );
                return;
            }
        }
    })
    .await
    .expect("session did not reach the expected state in time");
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ConnectBehavior {
    Accept,
    Refuse,
    Hang,
}

struct PeripheralShared {
    writes: Mutex<Vec<(u16, Vec<u8>, bool)>>,
    notify_enabled: Mutex<HashSet<u16>>,
    link_tx: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
}

/// One scripted peripheral: its GATT layout and how it behaves.
#[derive(Clone)]
pub(crate) struct MockPeripheral {
    address: String,
    services: Vec<ServiceDescriptor>,
    read_values: HashMap<u16, Vec<u8>>,
    read_delay: Duration,
    discovery_delay: Duration,
    behavior: ConnectBehavior,
    fail_discovery: bool,
    shared: Arc<PeripheralShared>,
}

impl MockPeripheral {
    pub(crate) fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            services: Vec::new(),
            read_values: HashMap::new(),
            read_delay: Duration::ZERO,
            discovery_delay: Duration::ZERO,
            behavior: ConnectBehavior::Accept,
            fail_discovery: false,
            shared: Arc::new(PeripheralShared {
                writes: Mutex::new(Vec::new()),
                notify_enabled: Mutex::new(HashSet::new()),
                link_tx: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn with_service(mut self, service: ServiceDescriptor) -> Self {
        self.services.push(service);
        self
    }

    pub(crate) fn read_value(mut self, handle: u16, value: Vec<u8>) -> Self {
        self.read_values.insert(handle, value);
        self
    }

    pub(crate) fn read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub(crate) fn discovery_delay(mut self, delay: Duration) -> Self {
        self.discovery_delay = delay;
        self
    }

    pub(crate) fn refuse_connection(mut self) -> Self {
        self.behavior = ConnectBehavior::Refuse;
        self
    }

    pub(crate) fn hang_on_connect(mut self) -> Self {
        self.behavior = ConnectBehavior::Hang;
        self
    }

    pub(crate) fn fail_discovery(mut self) -> Self {
        self.fail_discovery = true;
        self
    }
}

/// Scripted stand-in for the platform BLE stack.
pub(crate) struct MockAdapter {
    scan_tx: Mutex<Option<mpsc::UnboundedSender<Result<AdvertisementObservation>>>>,
    fail_next_scan: AtomicBool,
    peripherals: Mutex<HashMap<String, MockPeripheral>>,
}

impl MockAdapter {
    pub(crate) fn new() -> Self {
        Self {
            scan_tx: Mutex::new(None),
            fail_next_scan: AtomicBool::new(false),
            peripherals: Mutex::new(HashMap::new()),
        }
    }

    /// Make the next `scan_events` call fail.
    pub(crate) fn fail_next_scan(&self) {
        self.fail_next_scan.store(true, Ordering::SeqCst);
    }

    /// Report an observation on the active scan.
    pub(crate) fn push_observation(&self, observation: AdvertisementObservation) {
        if let Some(tx) = self.scan_tx.lock().unwrap().as_ref() {
            tx.send(Ok(observation)).ok();
        }
    }

    /// Inject an adapter fault into the active scan.
    pub(crate) fn push_scan_error(&self, error: Error) {
        if let Some(tx) = self.scan_tx.lock().unwrap().as_ref() {
            tx.send(Err(error)).ok();
        }
    }

    pub(crate) fn add_peripheral(&self, peripheral: MockPeripheral) {
        self.peripherals
            .lock()
            .unwrap()
            .insert(peripheral.address.clone(), peripheral);
    }

    /// Writes recorded on a peripheral, in order: (handle, value, ack).
    pub(crate) fn writes(&self, address: &str) -> Vec<(u16, Vec<u8>, bool)> {
        self.peripherals.lock().unwrap()[address]
            .shared
            .writes
            .lock()
            .unwrap()
            .clone()
    }

    pub(crate) fn notify_enabled(&self, address: &str, handle: u16) -> bool {
        self.peripherals.lock().unwrap()[address]
            .shared
            .notify_enabled
            .lock()
            .unwrap()
            .contains(&handle)
    }

    /// Push a value notification from the peripheral.
    pub(crate) fn send_notification(&self, address: &str, handle: u16, value: Vec<u8>) {
        let peripherals = self.peripherals.lock().unwrap();
        let link_tx = peripherals[address].shared.link_tx.lock().unwrap();
        if let Some(tx) = link_tx.as_ref() {
            tx.send(LinkEvent::Notification { handle, value }).ok();
        }
    }

    /// Drop the radio link from the peripheral side.
    pub(crate) fn drop_link(&self, address: &str) {
        let peripherals = self.peripherals.lock().unwrap();
        let mut link_tx = peripherals[address].shared.link_tx.lock().unwrap();
        if let Some(tx) = link_tx.take() {
            tx.send(LinkEvent::Disconnected).ok();
        }
    }
}

#[async_trait]
impl BleAdapter for MockAdapter {
    async fn scan_events(&self) -> Result<AdvertisementStream> {
        if self.fail_next_scan.swap(false, Ordering::SeqCst) {
            return Err(Error::AdapterUnavailable("adapter powered off".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.scan_tx.lock().unwrap() = Some(tx);

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn stop_scan(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<(Box<dyn BleLink>, LinkEventStream)> {
        let peripheral = self
            .peripherals
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| Error::ConnectionRefused {
                address: address.to_string(),
                reason: "unknown device".to_string(),
            })?;

        match peripheral.behavior {
            ConnectBehavior::Refuse => Err(Error::ConnectionRefused {
                address: address.to_string(),
                reason: "refused by peripheral".to_string(),
            }),
            ConnectBehavior::Hang => futures::future::pending().await,
            ConnectBehavior::Accept => {
                let (tx, rx) = mpsc::unbounded_channel();
                *peripheral.shared.link_tx.lock().unwrap() = Some(tx);

                let events: LinkEventStream = Box::pin(UnboundedReceiverStream::new(rx));
                Ok((Box::new(MockLink { peripheral }), events))
            }
        }
    }
}

struct MockLink {
    peripheral: MockPeripheral,
}

#[async_trait]
impl BleLink for MockLink {
    async fn discover_services(&mut self) -> Result<Vec<ServiceDescriptor>> {
        if self.peripheral.fail_discovery {
            return Err(Error::DiscoveryFailed("scripted failure".to_string()));
        }
        if !self.peripheral.discovery_delay.is_zero() {
            tokio::time::sleep(self.peripheral.discovery_delay).await;
        }
        Ok(self.peripheral.services.clone())
    }

    async fn read(&mut self, handle: u16) -> Result<Vec<u8>> {
        if !self.peripheral.read_delay.is_zero() {
            tokio::time::sleep(self.peripheral.read_delay).await;
        }
        Ok(self
            .peripheral
            .read_values
            .get(&handle)
            .cloned()
            .unwrap_or_default())
    }

    async fn write(&mut self, handle: u16, value: &[u8], with_ack: bool) -> Result<()> {
        self.peripheral
            .shared
            .writes
            .lock()
            .unwrap()
            .push((handle, value.to_vec(), with_ack));
        Ok(())
    }

    async fn set_notify(&mut self, handle: u16, enabled: bool) -> Result<()> {
        let mut notify_enabled = self.peripheral.shared.notify_enabled.lock().unwrap();
        if enabled {
            notify_enabled.insert(handle);
        } else {
            notify_enabled.remove(&handle);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.peripheral.shared.link_tx.lock().unwrap().take();
        Ok(())
    }
}
