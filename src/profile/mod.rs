//! Generated-style proxy facades for BlueZ interfaces.
//!
//! The full set of facades is produced mechanically from the interface
//! descriptions; these hand-written representatives show the exact shape
//! the generator emits: a properties struct with an explicit name→field
//! table, typed accessors over the cache, and thin method wrappers.

mod device;
mod media_item;

pub use device::{Device1, DeviceProperties};
pub use media_item::{MediaItem1, MediaItemProperties};

/// Well-known bus name of the BlueZ daemon.
pub const SERVICE_NAME: &str = "org.bluez";
