//! This example scans for nearby BLE devices for ten seconds and
//! prints the ones that pass an RSSI filter, strongest first.

use blescope::{AdvertisementStore, BtleplugAdapter, Error, FilterSpec, ScanController};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let adapter = Arc::new(BtleplugAdapter::new().await?);
    let store = Arc::new(AdvertisementStore::new());

    // Start a scan bounded to ten seconds
    let mut scanner = ScanController::new(adapter, store.clone());
    scanner.start(Duration::from_secs(10)).await?;

    // Print updates as they arrive
    let mut updates = store.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            println!(
                "{} {:?} rssi={:?}",
                update.advertisement.address, update.advertisement.name, update.advertisement.rssi
            );
        }
    });

    sleep(Duration::from_secs(10)).await;
    printer.abort();

    // Keep only devices heard at -70 dBm or better
    let filter = FilterSpec::new().min_rssi(-70);
    let devices = filter.apply(&store.snapshot());

    println!("\n{} devices passed the filter:", devices.len());
    for device in devices {
        println!(
            "{} {:?} rssi={:?} interval={:?}",
            device.address,
            device.name,
            device.rssi,
            device.interval_estimate()
        );
    }

    Ok(())
}
