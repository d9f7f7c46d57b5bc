//! Capability boundary towards the platform BLE stack.
//!
//! The engine never talks to a radio directly. It consumes a
//! [`BleAdapter`] for scanning and connecting, and a [`BleLink`] for
//! GATT traffic on an established connection. The shipped
//! implementation lives in [`crate::backend`] on top of btleplug; tests
//! substitute a scripted adapter.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use crate::Result;

/// One raw advertisement observation, as reported by the platform stack.
#[derive(Debug, Clone, Default)]
pub struct AdvertisementObservation {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub tx_power: Option<i16>,
    pub service_uuids: Vec<Uuid>,
    /// Manufacturer-specific data keyed by 16-bit company identifier.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Raw advertisement bytes of this observation.
    pub raw_payload: Vec<u8>,
}

/// Properties of a GATT characteristic, as discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProps {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProps {
    pub fn readable(&self) -> bool {
        self.read
    }

    pub fn writable(&self) -> bool {
        self.write || self.write_without_response
    }

    pub fn notifiable(&self) -> bool {
        self.notify || self.indicate
    }
}

/// A discovered GATT characteristic. Immutable after discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub uuid: Uuid,
    /// Link-local handle assigned at discovery time.
    pub handle: u16,
    pub properties: CharacteristicProps,
}

/// A discovered GATT service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
    pub handle: u16,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

/// Asynchronous event on an established link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The peripheral pushed a new value for a subscribed characteristic.
    Notification { handle: u16, value: Vec<u8> },
    /// The peripheral dropped the link.
    Disconnected,
}

pub type AdvertisementStream =
    Pin<Box<dyn Stream<Item = Result<AdvertisementObservation>> + Send>>;
pub type LinkEventStream = Pin<Box<dyn Stream<Item = LinkEvent> + Send>>;

/// Scanning and connection capability of a platform BLE adapter.
///
/// Scanning is a single shared resource: callers must not assume more
/// than one observation stream can be live at a time. Connections to
/// distinct addresses may be held concurrently.
#[async_trait]
pub trait BleAdapter: Send + Sync + 'static {
    /// Start a platform scan and return the observation stream.
    ///
    /// The stream ends when the scan is stopped or the platform stack
    /// stops reporting. Adapter faults mid-scan surface as an `Err`
    /// item.
    async fn scan_events(&self) -> Result<AdvertisementStream>;

    /// Stop the platform scan. Idempotent.
    async fn stop_scan(&self) -> Result<()>;

    /// Open a connection to the peripheral with the given address.
    ///
    /// Returns the GATT link and its event stream. The event stream
    /// carries value notifications and the unsolicited-disconnect
    /// signal for this link only.
    async fn connect(&self, address: &str) -> Result<(Box<dyn BleLink>, LinkEventStream)>;
}

/// GATT operations on one established connection.
///
/// A link is exclusively owned by the session task that drives it, so
/// methods take `&mut self` and never race each other.
#[async_trait]
pub trait BleLink: Send + 'static {
    /// Enumerate services and characteristics. Handles returned here
    /// are stable for the life of the link.
    async fn discover_services(&mut self) -> Result<Vec<ServiceDescriptor>>;

    async fn read(&mut self, handle: u16) -> Result<Vec<u8>>;

    /// Write a characteristic value. With `with_ack` the call resolves
    /// once the peripheral acknowledges; without, once the write is
    /// queued.
    async fn write(&mut self, handle: u16, value: &[u8], with_ack: bool) -> Result<()>;

    /// Enable or disable value notifications for a characteristic.
    async fn set_notify(&mut self, handle: u16, enabled: bool) -> Result<()>;

    /// Release the link. Best effort.
    async fn disconnect(&mut self) -> Result<()>;
}
