//! Shared object-lifecycle multiplexer.
//!
//! Every proxy may independently want the bus-wide "objects added/removed"
//! stream. Opening one bus subscription per proxy would be wasteful, so a
//! single [`LifecycleMonitor`] per bus handle owns one underlying
//! subscription and fans every event out to each registered private channel.
//! Callers filter client-side by the path/interface they care about.
//!
//! The underlying subscription is created lazily on the first `register()`
//! and torn down after the last `unregister()`; a later `register()` opens
//! a fresh one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use log::{debug, warn};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use zvariant::OwnedObjectPath;

use crate::Result;
use crate::transport::{BusTransport, OBJECT_MANAGER_INTERFACE, SignalEvent, Subscription};
use crate::value::PropertyMap;

/// Buffered events per registrant; a slow consumer loses deliveries beyond
/// this rather than stalling the broadcaster.
const REGISTRANT_BUFFER: usize = 16;

/// An object appeared on or disappeared from the bus.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// An object (or new interfaces on one) appeared, with initial
    /// properties per interface.
    ObjectAdded {
        path: OwnedObjectPath,
        interfaces: HashMap<String, PropertyMap>,
    },
    /// An object or some of its interfaces disappeared.
    ObjectRemoved {
        path: OwnedObjectPath,
        interfaces: Vec<String>,
    },
}

impl LifecycleEvent {
    /// Path of the object the event concerns.
    pub fn path(&self) -> &OwnedObjectPath {
        match self {
            LifecycleEvent::ObjectAdded { path, .. } => path,
            LifecycleEvent::ObjectRemoved { path, .. } => path,
        }
    }
}

/// One registrant's private forwarding channel.
///
/// Must be handed back via [`LifecycleMonitor::unregister`] before being
/// discarded, so the monitor can tear down the shared subscription once
/// nobody is listening.
pub struct LifecycleHandle {
    id: u64,
    events: mpsc::Receiver<LifecycleEvent>,
}

impl LifecycleHandle {
    /// Receives the next lifecycle event; `None` once unregistered or the
    /// shared subscription ended.
    pub async fn recv(&mut self) -> Option<LifecycleEvent> {
        self.events.recv().await
    }
}

struct Registrant {
    id: u64,
    tx: mpsc::Sender<LifecycleEvent>,
}

type Registrants = Arc<StdMutex<Vec<Registrant>>>;

struct Upstream {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Process-wide fan-out point for object lifecycle signals, one per bus
/// handle. Explicitly constructed and shared via `Arc`; not a global.
pub struct LifecycleMonitor<T: BusTransport> {
    transport: Arc<T>,
    registrants: Registrants,
    // Guards upstream subscription lifecycle and id allocation; the
    // registrant list has its own lock so the broadcast task never waits
    // on an async mutex.
    state: Mutex<MonitorState>,
}

struct MonitorState {
    upstream: Option<Upstream>,
    next_id: u64,
}

impl<T: BusTransport> LifecycleMonitor<T> {
    pub fn new(transport: Arc<T>) -> Self {
        LifecycleMonitor {
            transport,
            registrants: Arc::new(StdMutex::new(Vec::new())),
            state: Mutex::new(MonitorState {
                upstream: None,
                next_id: 0,
            }),
        }
    }

    /// Registers a new forwarding channel.
    ///
    /// The first registrant lazily opens the single underlying subscription
    /// (root path, ObjectManager interface) and spawns the fan-out task;
    /// later registrants share it.
    pub async fn register(&self) -> Result<LifecycleHandle> {
        let mut state = self.state.lock().await;

        // A broadcast loop that ended on its own (bus disconnect) leaves a
        // stale entry behind; reap it so a fresh subscription is opened.
        if let Some(upstream) = &state.upstream
            && upstream.task.is_finished()
        {
            warn!("Shared object-lifecycle subscription ended, reopening");
            state.upstream = None;
        }

        if state.upstream.is_none() {
            let root = OwnedObjectPath::try_from("/")?;
            let subscription = self
                .transport
                .subscribe(&root, OBJECT_MANAGER_INTERFACE)
                .await?;
            let (stop_tx, stop_rx) = oneshot::channel();
            let task = tokio::spawn(broadcast_loop(
                subscription,
                stop_rx,
                Arc::clone(&self.registrants),
            ));
            state.upstream = Some(Upstream {
                stop: stop_tx,
                task,
            });
            debug!("Opened shared object-lifecycle subscription");
        }

        let id = state.next_id;
        state.next_id += 1;

        let (tx, rx) = mpsc::channel(REGISTRANT_BUFFER);
        lock_registrants(&self.registrants).push(Registrant { id, tx });
        debug!("Registered lifecycle listener #{id}");
        Ok(LifecycleHandle { id, events: rx })
    }

    /// Removes exactly one forwarding channel.
    ///
    /// When the last one goes, the underlying subscription is released; the
    /// next `register()` recreates it.
    pub async fn unregister(&self, handle: LifecycleHandle) {
        let mut state = self.state.lock().await;

        let now_empty = {
            let mut registrants = lock_registrants(&self.registrants);
            registrants.retain(|r| r.id != handle.id);
            registrants.is_empty()
        };
        debug!("Unregistered lifecycle listener #{}", handle.id);

        if now_empty
            && let Some(upstream) = state.upstream.take()
        {
            let _ = upstream.stop.send(());
            if let Err(e) = upstream.task.await {
                warn!("Lifecycle broadcast task ended abnormally: {e}");
            }
            debug!("Released shared object-lifecycle subscription");
        }
    }

    /// Number of currently registered channels (for diagnostics).
    pub fn registered(&self) -> usize {
        lock_registrants(&self.registrants).len()
    }
}

fn lock_registrants(registrants: &Registrants) -> std::sync::MutexGuard<'_, Vec<Registrant>> {
    registrants.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn broadcast_loop(
    mut subscription: Subscription,
    mut stop: oneshot::Receiver<()>,
    registrants: Registrants,
) {
    loop {
        tokio::select! {
            _ = &mut stop => {
                debug!("Lifecycle broadcast stopping");
                break;
            }
            event = subscription.recv() => {
                let Some(event) = event else {
                    warn!("Object-lifecycle subscription ended");
                    break;
                };
                let event = match event {
                    SignalEvent::InterfacesAdded { path, interfaces } => {
                        LifecycleEvent::ObjectAdded { path, interfaces }
                    }
                    SignalEvent::InterfacesRemoved { path, interfaces } => {
                        LifecycleEvent::ObjectRemoved { path, interfaces }
                    }
                    SignalEvent::PropertiesChanged { .. } => continue,
                };
                broadcast(&registrants, &event);
            }
        }
    }
}

/// Best-effort delivery to every registered channel.
///
/// A registrant with a full buffer loses this delivery; one whose receiver
/// is gone is pruned. The broadcaster never blocks on a consumer.
fn broadcast(registrants: &Registrants, event: &LifecycleEvent) {
    let mut registrants = lock_registrants(registrants);
    registrants.retain(|r| match r.tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(
                "Lifecycle listener #{} is not consuming, dropping event for {}",
                r.id,
                event.path()
            );
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Pruning disconnected lifecycle listener #{}", r.id);
            false
        }
    });
}
