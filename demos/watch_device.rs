//! Watches property changes on one Bluetooth device.
//!
//! Usage: `cargo run --example watch_device -- /org/bluez/hci0/dev_XX_XX_XX_XX_XX_XX`

use bzrs::Bus;
use bzrs::profile::Device1;
use zvariant::OwnedObjectPath;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .ok_or("expected a device object path argument")?;
    let path = OwnedObjectPath::try_from(path)?;

    let bus = Bus::system().await?;
    let device = Device1::new(&bus, path).await?;

    println!(
        "{} ({}) connected={} rssi={}",
        device.alias(),
        device.address(),
        device.connected(),
        device.rssi()
    );

    let mut changes = device.watch_properties().await?;
    println!("Watching for property changes, Ctrl-C to quit...");

    while let Some(change) = changes.recv().await {
        println!("{}: {} = {:?}", change.interface, change.name, change.value);
    }

    device.close().await;
    Ok(())
}
