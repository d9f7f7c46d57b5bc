//! This example connects to a BLE device, subscribes to its first
//! notifiable characteristic and prints incoming values.
//! The device address should be given as a command line argument.

use blescope::{
    AdvertisementStore, BtleplugAdapter, Error, NotificationHub, ScanController, SessionConfig,
    SessionRegistry, SessionState,
};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let address = std::env::args().nth(1).expect("Expected device address");
    pretty_env_logger::init();

    let adapter = Arc::new(BtleplugAdapter::new().await?);

    let store = Arc::new(AdvertisementStore::new());
    let mut scanner = ScanController::new(adapter.clone(), store);
    scanner.start(Duration::from_secs(5)).await?;
    sleep(Duration::from_secs(5)).await;

    let hub = Arc::new(NotificationHub::new());
    let registry = SessionRegistry::new(adapter, hub.clone(), SessionConfig::default());

    let session = registry.connect(&address);

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

    // Find the first characteristic that supports notifications
    let services = session.services().expect("services were discovered");
    let characteristic = services
        .iter()
        .flat_map(|service| service.characteristics.iter())
        .find(|c| c.properties.notifiable())
        .cloned()
        .expect("device has no notifiable characteristic");

    println!("Subscribing to {}", characteristic.uuid);

    // Register a listener before enabling notifications
    let (_listener, mut values) = hub.register(&address, characteristic.handle);
    session.subscribe(characteristic.handle).await?;

    let printer = tokio::spawn(async move {
        while let Some(event) = values.recv().await {
            println!("{}", event.value.iter().fold(String::new(), |mut s, b| {
                s.push_str(&format!("{:02x} ", b));
                s
            }));
        }
    });

    sleep(Duration::from_secs(30)).await;

    session.unsubscribe(characteristic.handle).await?;
    registry.disconnect(&address).await;
    printer.abort();

    Ok(())
}
