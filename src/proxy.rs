//! Facade-support glue: the shared bus context and the generic proxy.
//!
//! [`Bus`] owns what all proxies on one connection share: the transport and
//! the lifecycle monitor. [`Proxy`] ties one remote object's identity to its
//! property cache and watcher; generated facades are thin typed wrappers
//! around it.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use zvariant::OwnedObjectPath;

use crate::Result;
use crate::cache::{Properties, PropertyCache};
use crate::lifecycle::{LifecycleHandle, LifecycleMonitor};
use crate::transport::{BusTransport, ProxyId, ZbusTransport};
use crate::value::{PropertyMap, PropertyValue};
use crate::watcher::{PropertyChanged, PropertyWatcher};

/// Shared per-connection context: the transport plus the one lifecycle
/// monitor every proxy on this connection fans out from.
pub struct Bus<T: BusTransport> {
    transport: Arc<T>,
    lifecycle: Arc<LifecycleMonitor<T>>,
}

impl<T: BusTransport> Bus<T> {
    /// Wraps a transport in a new bus context.
    pub fn new(transport: T) -> Self {
        let transport = Arc::new(transport);
        let lifecycle = Arc::new(LifecycleMonitor::new(Arc::clone(&transport)));
        Bus {
            transport,
            lifecycle,
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleMonitor<T>> {
        &self.lifecycle
    }

    /// Builds a proxy for one remote object and eagerly loads its
    /// properties. Construction fails if the initial get-all fails.
    pub async fn proxy<P: Properties>(
        &self,
        service: impl Into<String>,
        path: OwnedObjectPath,
    ) -> Result<Proxy<T, P>> {
        let id = ProxyId::new(service, P::INTERFACE, path);
        let cache = Arc::new(PropertyCache::load(self.transport.as_ref(), &id).await?);
        let watcher = PropertyWatcher::new(id.clone(), Arc::clone(&cache));
        Ok(Proxy {
            transport: Arc::clone(&self.transport),
            lifecycle: Arc::clone(&self.lifecycle),
            id,
            cache,
            watcher: Mutex::new(watcher),
        })
    }
}

impl Bus<ZbusTransport> {
    /// Connects to the system bus.
    pub async fn system() -> Result<Self> {
        Ok(Bus::new(ZbusTransport::system().await?))
    }

    /// Connects to the session bus.
    pub async fn session() -> Result<Self> {
        Ok(Bus::new(ZbusTransport::session().await?))
    }
}

/// Local mirror of one remote object.
///
/// Reads go to the local cache; writes and method calls go to the remote
/// service. An optional background watcher keeps the cache in sync with
/// change notifications.
pub struct Proxy<T: BusTransport, P: Properties> {
    transport: Arc<T>,
    lifecycle: Arc<LifecycleMonitor<T>>,
    id: ProxyId,
    cache: Arc<PropertyCache<P>>,
    watcher: Mutex<PropertyWatcher<P>>,
}

impl<T: BusTransport, P: Properties> Proxy<T, P> {
    pub fn id(&self) -> &ProxyId {
        &self.id
    }

    pub fn path(&self) -> &OwnedObjectPath {
        &self.id.path
    }

    pub fn interface(&self) -> &str {
        &self.id.interface
    }

    /// Reads one property from the local cache.
    pub fn cached(&self, name: &str) -> Option<PropertyValue> {
        self.cache.get(name)
    }

    /// Runs `f` against the typed properties struct under the reader lock.
    pub fn properties<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        self.cache.read(f)
    }

    /// Snapshot of all declared properties.
    pub fn to_map(&self) -> PropertyMap {
        self.cache.to_map()
    }

    /// Re-reads all properties from the remote object, replacing the cache.
    pub async fn refresh(&self) -> Result<()> {
        let map = self.transport.get_all_properties(&self.id).await?;
        self.cache.replace(P::from_map(&map));
        Ok(())
    }

    /// Reads one property from the remote object, bypassing the cache.
    pub async fn get_property(&self, name: &str) -> Result<PropertyValue> {
        self.transport.get_property(&self.id, name).await
    }

    /// Writes one property remotely, mirroring it locally on success.
    pub async fn set_property(&self, name: &str, value: PropertyValue) -> Result<()> {
        self.cache
            .set(self.transport.as_ref(), &self.id, name, value)
            .await
    }

    /// Invokes a method on the remote object.
    pub async fn call(
        &self,
        method: &str,
        args: Vec<PropertyValue>,
    ) -> Result<Option<PropertyValue>> {
        self.transport.call(&self.id, method, args).await
    }

    /// Starts the background watcher and returns its event stream.
    ///
    /// One change event is delivered per changed field. Errs with
    /// [`crate::Error::WatcherActive`] if already watching.
    pub async fn watch_properties(&self) -> Result<mpsc::UnboundedReceiver<PropertyChanged>> {
        self.watcher
            .lock()
            .await
            .start(self.transport.as_ref())
            .await
    }

    /// Stops the background watcher, releasing its subscription.
    /// Idempotent when not watching.
    pub async fn unwatch_properties(&self) {
        self.watcher.lock().await.stop().await;
    }

    /// Registers with the shared lifecycle monitor.
    ///
    /// Events are bus-wide; filter by [`LifecycleEvent::path`] for this
    /// proxy's neighborhood. Hand the handle back to
    /// [`Self::unregister_lifecycle`] when done.
    ///
    /// [`LifecycleEvent::path`]: crate::lifecycle::LifecycleEvent::path
    pub async fn lifecycle_events(&self) -> Result<LifecycleHandle> {
        self.lifecycle.register().await
    }

    /// Deregisters a lifecycle handle obtained from this proxy's bus.
    pub async fn unregister_lifecycle(&self, handle: LifecycleHandle) {
        self.lifecycle.unregister(handle).await;
    }

    /// Shuts the proxy down: stops the watcher if running.
    ///
    /// The cache stays readable afterwards; it just goes stale.
    pub async fn close(&self) {
        self.unwatch_properties().await;
    }
}
