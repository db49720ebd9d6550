//! Dumps object lifecycle events from the system bus.
//!
//! Run `bluetoothctl scan on` in another terminal to see devices appear.

use bzrs::{Bus, LifecycleEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let bus = Bus::system().await?;
    let monitor = bus.lifecycle().clone();
    let mut events = monitor.register().await?;

    println!("Listening for object lifecycle events, Ctrl-C to quit...");
    while let Some(event) = events.recv().await {
        match event {
            LifecycleEvent::ObjectAdded { path, interfaces } => {
                let names: Vec<_> = interfaces.keys().cloned().collect();
                println!("+ {path} [{}]", names.join(", "));
            }
            LifecycleEvent::ObjectRemoved { path, interfaces } => {
                println!("- {path} [{}]", interfaces.join(", "));
            }
        }
    }

    Ok(())
}
