//! A Rust library for proxying BlueZ-style D-Bus objects.
//!
//! Each remote object (a device, an adapter, a media item) exposes named
//! typed properties and invokable methods. This crate provides the generic
//! engine every proxy facade is built on:
//!
//! - A per-proxy [`PropertyCache`](cache::PropertyCache) holding the last
//!   known value of each declared property behind a reader/writer lock
//! - A [`PropertyWatcher`](watcher::PropertyWatcher) that follows
//!   `PropertiesChanged` signals, keeps the cache in sync, and republishes
//!   one typed [`PropertyChanged`] event per changed field
//! - A shared [`LifecycleMonitor`](lifecycle::LifecycleMonitor) multiplexing
//!   the bus-wide object added/removed stream to any number of proxies over
//!   a single subscription
//!
//! # Example
//!
//! ```no_run
//! use bzrs::{Bus, profile::Device1};
//! use zvariant::OwnedObjectPath;
//!
//! # async fn example() -> bzrs::Result<()> {
//! let bus = Bus::system().await?;
//! let path = OwnedObjectPath::try_from("/org/bluez/hci0/dev_00_11_22_33_44_55")?;
//! let device = Device1::new(&bus, path).await?;
//!
//! println!("{} ({})", device.alias(), device.address());
//!
//! let mut changes = device.watch_properties().await?;
//! while let Some(change) = changes.recv().await {
//!     println!("{} = {:?}", change.name, change.value);
//! }
//! device.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Consistency model
//!
//! Cached reads are eventually consistent: between a remote-side change and
//! the arrival of its notification the cache is stale. A `set` is mirrored
//! locally as soon as the remote accepts it, so the caller may observe its
//! own write twice (once synchronously, once via the watcher), idempotently.
//!
//! # Error Handling
//!
//! Synchronous operations return `Result<T, Error>`. Background listeners
//! never die on malformed input: per-field decode failures are logged via
//! the [`log`](https://docs.rs/log) facade and skipped. Add a logging
//! implementation like `env_logger` to see them.

// Engine modules
pub mod cache;
pub mod lifecycle;
pub mod transport;
pub mod value;
pub mod watcher;

// Public API modules
mod error;
pub mod profile;
pub mod proxy;

// Re-exported public API
pub use cache::{Properties, PropertyCache};
pub use error::Error;
pub use lifecycle::{LifecycleEvent, LifecycleHandle, LifecycleMonitor};
pub use proxy::{Bus, Proxy};
pub use transport::{
    BusTransport, OBJECT_MANAGER_INTERFACE, PROPERTIES_INTERFACE, ProxyId, SignalEvent,
    Subscription, ZbusTransport,
};
pub use value::{PropertyMap, PropertyValue};
pub use watcher::{PropertyChanged, PropertyWatcher};

/// A specialized `Result` type for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;
