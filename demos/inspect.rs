//! This example connects to a BLE device and prints its GATT layout,
//! reading the value of every readable characteristic.
//! The device address should be given as a command line argument.

use blescope::{
    BtleplugAdapter, Error, NotificationHub, ScanController, SessionConfig, SessionRegistry,
    SessionState,
};
use blescope::AdvertisementStore;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let address = std::env::args().nth(1).expect("Expected device address");
    pretty_env_logger::init();

    let adapter = Arc::new(BtleplugAdapter::new().await?);

    // A short scan so the platform adapter learns about the device
    let store = Arc::new(AdvertisementStore::new());
    let mut scanner = ScanController::new(adapter.clone(), store);
    scanner.start(Duration::from_secs(5)).await?;
    sleep(Duration::from_secs(5)).await;

    let hub = Arc::new(NotificationHub::new());
    let registry = SessionRegistry::new(adapter, hub, SessionConfig::default());

    let session = registry.connect(&address);

    // Wait until service discovery has finished
    let mut state = session.state_watch();
    loop {
        match state.borrow().clone() {
            SessionState::Ready => break,
            SessionState::Error(e) => return Err(e),
            _ => {}
        }
        if state.changed().await.is_err() {
            panic!("session ended before becoming ready");
        }
    }

    let services = session.services().expect("services were discovered");
    for service in services.iter() {
        println!("Service {}", service.uuid);
        for characteristic in &service.characteristics {
            print!("  {} {:?}", characteristic.uuid, characteristic.properties);
            if characteristic.properties.readable() {
                match session.read(characteristic.handle).await {
                    Ok(value) => print!(" = {:?}", value),
                    Err(e) => print!(" (read failed: {})", e),
                }
            }
            println!();
        }
    }

    registry.disconnect(&address).await;

    Ok(())
}
