//! BLE scan and session engine.
//!
//! The goal of this library is to provide the moving parts of a BLE
//! explorer: a bounded advertisement scan that feeds a live device
//! table, filters over that table, and per-device GATT sessions for
//! reading, writing and subscribing to characteristics.
//!
//! ## Usage
//!
//! Here is an example that scans for ten seconds, connects to the
//! strongest device and reads one of its characteristics:
//!
//! ```rust,no_run
//! use blescope::{BtleplugAdapter, NotificationHub, ScanController, SessionConfig};
//! use blescope::{AdvertisementStore, SessionRegistry, SessionState};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), blescope::Error> {
//!     pretty_env_logger::init();
//!
//!     let adapter = Arc::new(BtleplugAdapter::new().await?);
//!     let store = Arc::new(AdvertisementStore::new());
//!
//!     // Scan for ten seconds, collecting advertisements into the store
//!     let mut scanner = ScanController::new(adapter.clone(), store.clone());
//!     scanner.start(Duration::from_secs(10)).await?;
//!     tokio::time::sleep(Duration::from_secs(10)).await;
//!
//!     // Take the strongest device seen during the scan
//!     let mut devices = store.snapshot();
//!     devices.sort_by_key(|d| std::cmp::Reverse(d.rssi));
//!     let device = devices.first().expect("no devices found");
//!
//!     // Connect and wait for service discovery to finish
//!     let hub = Arc::new(NotificationHub::new());
//!     let registry = SessionRegistry::new(adapter, hub, SessionConfig::default());
//!     let session = registry.connect(&device.address);
//!
//!     let mut state = session.state_watch();
//!     while *state.borrow() != SessionState::Ready {
//!         if state.changed().await.is_err() {
//!             return Ok(());
//!         }
//!     }
//!
//!     // Read the first readable characteristic
//!     for service in session.services().iter().flat_map(|s| s.iter()) {
//!         for characteristic in &service.characteristics {
//!             if characteristic.properties.readable() {
//!                 let value = session.read(characteristic.handle).await?;
//!                 println!("{}: {:?}", characteristic.uuid, value);
//!                 return Ok(());
//!             }
//!         }
//!     }
//!
//!     Ok(())
//! }
//!```

#![warn(clippy::all, future_incompatible, nonstandard_style, rust_2018_idioms)]

pub use adapter::{
    AdvertisementObservation, AdvertisementStream, BleAdapter, BleLink, CharacteristicDescriptor,
    CharacteristicProps, LinkEvent, LinkEventStream, ServiceDescriptor,
};
pub use backend::BtleplugAdapter;
pub use config::{SessionConfig, DEFAULT_MAX_SCAN_DURATION};
pub use error::{Error, Result};
pub use filter::FilterSpec;
pub use notify::{ListenerId, NotificationEvent, NotificationHub};
pub use registry::SessionRegistry;
pub use scanner::{ScanController, ScanState};
pub use session::{DeviceSession, SessionState};
pub use store::{Advertisement, AdvertisementStore, StoreUpdate, UpsertOutcome};

mod adapter;
mod backend;
mod config;
mod error;
mod filter;
mod notify;
mod registry;
mod scanner;
mod session;
mod store;

#[cfg(test)]
mod testutil;
