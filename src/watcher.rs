//! Background property-change watching for one proxy.
//!
//! A started watcher holds one bus subscription scoped to the proxy's path
//! and the standard properties interface, applies every change notification
//! to the proxy's [`PropertyCache`], and republishes one normalized
//! [`PropertyChanged`] event per changed field.
//!
//! Cancellation is an explicit stop signal selected against the signal
//! stream; control never travels on the data channel, so a stopped loop can
//! always be told apart from an idle one.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::Result;
use crate::cache::{Properties, PropertyCache};
use crate::error::Error;
use crate::transport::{BusTransport, PROPERTIES_INTERFACE, ProxyId, SignalEvent, Subscription};
use crate::value::PropertyValue;

/// One property's new value, as observed on the bus.
///
/// One event is emitted per changed field, even when several fields change
/// in a single notification, and even for fields the declared schema does
/// not know (the event stream is more permissive than the typed cache).
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChanged {
    /// Interface that reported the change.
    pub interface: String,
    /// Wire name of the property.
    pub name: String,
    /// The new value.
    pub value: PropertyValue,
}

struct ActiveWatch {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Watches one proxy's property changes and keeps its cache in sync.
///
/// Lifecycle: idle → watching → stopped, where a stopped watcher is idle
/// again and may be restarted with a fresh subscription.
pub struct PropertyWatcher<P: Properties> {
    id: ProxyId,
    cache: Arc<PropertyCache<P>>,
    active: Option<ActiveWatch>,
}

impl<P: Properties> PropertyWatcher<P> {
    pub fn new(id: ProxyId, cache: Arc<PropertyCache<P>>) -> Self {
        PropertyWatcher {
            id,
            cache,
            active: None,
        }
    }

    /// Whether a listener loop is currently running.
    pub fn is_watching(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }

    /// Opens the subscription and spawns the listener loop.
    ///
    /// Returns the event stream for this watch. Fails with
    /// [`Error::WatcherActive`] if already watching; `stop()` first to
    /// re-subscribe.
    pub async fn start<T: BusTransport + ?Sized>(
        &mut self,
        transport: &T,
    ) -> Result<mpsc::UnboundedReceiver<PropertyChanged>> {
        // A loop that exited on its own (event stream dropped, subscription
        // ended) does not block a restart.
        if let Some(active) = &self.active
            && active.task.is_finished()
        {
            self.active = None;
        }
        if self.active.is_some() {
            return Err(Error::WatcherActive);
        }

        let subscription = transport
            .subscribe(&self.id.path, PROPERTIES_INTERFACE)
            .await?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let id = self.id.clone();
        let cache = Arc::clone(&self.cache);
        let task = tokio::spawn(watch_loop(id, cache, subscription, stop_rx, event_tx));

        self.active = Some(ActiveWatch {
            stop: stop_tx,
            task,
        });
        Ok(event_rx)
    }

    /// Signals the listener loop to stop and waits for it to exit.
    ///
    /// The subscription is released when the loop drops it; no terminal
    /// event is forwarded. Idempotent on an idle watcher.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        // A finished loop has already dropped its receiver; that's fine.
        let _ = active.stop.send(());
        if let Err(e) = active.task.await {
            warn!("Watcher task for {} ended abnormally: {e}", self.id);
        }
        debug!("Stopped property watcher for {}", self.id);
    }
}

async fn watch_loop<P: Properties>(
    id: ProxyId,
    cache: Arc<PropertyCache<P>>,
    mut subscription: Subscription,
    mut stop: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<PropertyChanged>,
) {
    debug!("Watching property changes for {id}");
    loop {
        tokio::select! {
            _ = &mut stop => {
                debug!("Stop requested for {id}");
                break;
            }
            event = subscription.recv() => {
                let Some(event) = event else {
                    warn!("Signal subscription for {id} ended");
                    break;
                };
                let SignalEvent::PropertiesChanged { path, interface, changed, invalidated } = event
                else {
                    continue;
                };
                // Several proxies can share a path prefix; only exact
                // matches belong to this one.
                if path != id.path {
                    continue;
                }

                cache.apply(&changed);
                cache.invalidate(&invalidated);

                for (name, value) in changed {
                    let event = PropertyChanged {
                        interface: interface.clone(),
                        name,
                        value,
                    };
                    if events.send(event).is_err() {
                        debug!("Event stream for {id} dropped, stopping watch");
                        return;
                    }
                }
            }
        }
    }
}
