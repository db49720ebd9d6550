//! Per-proxy typed property cache.
//!
//! Every generated facade declares a properties struct implementing
//! [`Properties`]: an explicit name→field table mapping wire names onto
//! statically typed fields. [`PropertyCache`] wraps one such struct in a
//! proxy-scoped reader/writer lock and provides the load/get/set/apply
//! operations shared by all proxies.
//!
//! The cache is eventually consistent: it may be momentarily stale between a
//! remote-side change and the arrival of the corresponding notification.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, warn};

use crate::Result;
use crate::transport::{BusTransport, ProxyId};
use crate::value::{PropertyMap, PropertyValue};

/// The declared property schema of one proxy interface.
///
/// Implementations are mechanical: one match arm per declared field in
/// `set_field`/`get_field`/`clear_field`. Undeclared names are not an error
/// anywhere; the wire is allowed to carry more than the schema declares.
pub trait Properties: Default + Send + Sync + 'static {
    /// The D-Bus interface these properties belong to.
    const INTERFACE: &'static str;

    /// Declared field names, in declaration order.
    fn field_names() -> &'static [&'static str];

    /// Assigns one field from a wire value.
    ///
    /// Returns `Ok(true)` if the field was assigned, `Ok(false)` if `name`
    /// is not declared, and a decode error if the value does not match the
    /// declared type (the field is left unchanged).
    fn set_field(&mut self, name: &str, value: &PropertyValue) -> Result<bool>;

    /// Reads one field as a wire value; `None` if `name` is not declared.
    fn get_field(&self, name: &str) -> Option<PropertyValue>;

    /// Resets one field to its zero value; returns `false` if not declared.
    fn clear_field(&mut self, name: &str) -> bool;

    /// Converts the whole struct to a name→value map.
    fn to_map(&self) -> PropertyMap {
        Self::field_names()
            .iter()
            .filter_map(|name| self.get_field(name).map(|v| (name.to_string(), v)))
            .collect()
    }

    /// Builds a struct from a name→value map.
    ///
    /// Undeclared names are ignored; a field whose value does not decode is
    /// logged, skipped, and left at its zero value.
    fn from_map(map: &PropertyMap) -> Self {
        let mut props = Self::default();
        for (name, value) in map {
            match props.set_field(name, value) {
                Ok(true) => {}
                Ok(false) => debug!("Ignoring undeclared property '{name}'"),
                Err(e) => warn!("Skipping property '{name}': {e}"),
            }
        }
        props
    }
}

/// Concurrency-safe container for one proxy's last known property values.
///
/// Readers proceed concurrently; writers (a `set` or the watcher's signal
/// application) are exclusive, so a multi-field update is never observed
/// half-applied.
pub struct PropertyCache<P> {
    inner: RwLock<P>,
}

impl<P: Properties> PropertyCache<P> {
    pub fn new(props: P) -> Self {
        PropertyCache {
            inner: RwLock::new(props),
        }
    }

    /// Populates a fresh cache with one synchronous get-all call.
    ///
    /// Declared fields missing from the reply stay at their zero values. On
    /// transport failure the error is returned and no cache is built.
    pub async fn load<T: BusTransport + ?Sized>(transport: &T, id: &ProxyId) -> Result<Self> {
        let map = transport.get_all_properties(id).await?;
        debug!("Loaded {} properties for {id}", map.len());
        Ok(PropertyCache::new(P::from_map(&map)))
    }

    fn read_lock(&self) -> RwLockReadGuard<'_, P> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, P> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads one cached field; `None` if `name` is not declared.
    pub fn get(&self, name: &str) -> Option<PropertyValue> {
        self.read_lock().get_field(name)
    }

    /// Runs `f` against the typed struct under the reader lock.
    pub fn read<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        f(&self.read_lock())
    }

    /// Writes a property remotely, then mirrors it locally.
    ///
    /// The remote write happens first; if the service refuses it
    /// ([`crate::Error::Rejected`]) or the transport fails, the local cache
    /// is left unchanged.
    pub async fn set<T: BusTransport + ?Sized>(
        &self,
        transport: &T,
        id: &ProxyId,
        name: &str,
        value: PropertyValue,
    ) -> Result<()> {
        transport.set_property(id, name, value.clone()).await?;
        match self.write_lock().set_field(name, &value) {
            Ok(_) => {}
            // The remote accepted the write, so the cache merely stays
            // stale until the change notification arrives.
            Err(e) => warn!("Remote accepted '{name}' but local assignment failed: {e}"),
        }
        Ok(())
    }

    /// Applies a changed-fields map under a single writer-lock hold.
    ///
    /// A field that fails to decode is logged and skipped; the remaining
    /// fields are still applied. Returns how many fields were assigned.
    pub fn apply(&self, changed: &PropertyMap) -> usize {
        let mut guard = self.write_lock();
        let mut assigned = 0;
        for (name, value) in changed {
            match guard.set_field(name, value) {
                Ok(true) => assigned += 1,
                Ok(false) => debug!("Change for undeclared property '{name}' not cached"),
                Err(e) => warn!("Skipping change for '{name}': {e}"),
            }
        }
        assigned
    }

    /// Resets invalidated fields to their zero values.
    ///
    /// The remote withdrew these values without replacements; keeping the
    /// last known value would report state the service no longer claims.
    pub fn invalidate(&self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        let mut guard = self.write_lock();
        for name in names {
            if guard.clear_field(name) {
                debug!("Invalidated property '{name}' reset to zero value");
            }
        }
    }

    /// Replaces the whole snapshot (used by `refresh`).
    pub fn replace(&self, props: P) {
        *self.write_lock() = props;
    }

    /// Snapshot of all declared fields as a name→value map.
    pub fn to_map(&self) -> PropertyMap {
        self.read_lock().to_map()
    }
}
