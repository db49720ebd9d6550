//! Engine tests against a scripted in-process transport.
//!
//! These cover the property cache, the per-proxy watcher, and the shared
//! lifecycle multiplexer without touching a real bus: the mock implements
//! the same `BusTransport` seam the zbus adapter does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;
use zvariant::OwnedObjectPath;

use bzrs::profile::{Device1, DeviceProperties};
use bzrs::{
    Bus, BusTransport, Error, LifecycleEvent, PropertyCache, PropertyMap, PropertyValue, ProxyId,
    SignalEvent, Subscription,
};

const DEVICE_PATH: &str = "/org/bluez/hci0/dev_00_11_22_33_44_55";

fn device_path() -> OwnedObjectPath {
    OwnedObjectPath::try_from(DEVICE_PATH).unwrap()
}

/// Scripted transport: serves a fixed property map, optionally rejects
/// writes, and lets tests inject signals into open subscriptions.
#[derive(Default)]
struct MockTransport {
    props: Mutex<PropertyMap>,
    reject_writes: AtomicBool,
    writes: Mutex<Vec<(String, PropertyValue)>>,
    calls: Mutex<Vec<String>>,
    signal_txs: Mutex<Vec<mpsc::Sender<SignalEvent>>>,
    subscriptions: AtomicUsize,
}

impl MockTransport {
    fn with_props(entries: Vec<(&str, PropertyValue)>) -> Self {
        let mock = MockTransport::default();
        {
            let mut props = mock.props.lock().unwrap();
            for (name, value) in entries {
                props.insert(name.to_owned(), value);
            }
        }
        mock
    }

    /// Delivers a signal to every open subscription, pruning dead ones.
    fn inject(&self, event: SignalEvent) {
        self.signal_txs
            .lock()
            .unwrap()
            .retain(|tx| tx.try_send(event.clone()).is_ok());
    }

    /// Drops every open subscription's sender, as a bus disconnect would.
    fn close_subscriptions(&self) {
        self.signal_txs.lock().unwrap().clear();
    }

    fn live_subscriptions(&self) -> usize {
        self.signal_txs
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

#[async_trait]
impl BusTransport for MockTransport {
    async fn call(
        &self,
        _id: &ProxyId,
        method: &str,
        _args: Vec<PropertyValue>,
    ) -> bzrs::Result<Option<PropertyValue>> {
        self.calls.lock().unwrap().push(method.to_owned());
        Ok(None)
    }

    async fn get_property(&self, _id: &ProxyId, name: &str) -> bzrs::Result<PropertyValue> {
        self.props
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Rejected {
                name: "org.freedesktop.DBus.Error.InvalidArgs".into(),
                reason: format!("no such property: {name}"),
            })
    }

    async fn get_all_properties(&self, _id: &ProxyId) -> bzrs::Result<PropertyMap> {
        Ok(self.props.lock().unwrap().clone())
    }

    async fn set_property(
        &self,
        _id: &ProxyId,
        name: &str,
        value: PropertyValue,
    ) -> bzrs::Result<()> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(Error::Rejected {
                name: "org.bluez.Error.NotPermitted".into(),
                reason: format!("{name} is read-only"),
            });
        }
        self.props
            .lock()
            .unwrap()
            .insert(name.to_owned(), value.clone());
        self.writes.lock().unwrap().push((name.to_owned(), value));
        Ok(())
    }

    async fn subscribe(
        &self,
        _path: &OwnedObjectPath,
        _interface: &str,
    ) -> bzrs::Result<Subscription> {
        let (tx, rx) = mpsc::channel(64);
        self.signal_txs.lock().unwrap().push(tx);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(Subscription::from_receiver(rx))
    }
}

fn loaded_device_props() -> Vec<(&'static str, PropertyValue)> {
    vec![
        ("Address", PropertyValue::Str("00:11:22:33:44:55".into())),
        ("Name", PropertyValue::Str("Headset".into())),
        ("Alias", PropertyValue::Str("My Headset".into())),
        ("Class", PropertyValue::U32(0x240404)),
        ("Connected", PropertyValue::Bool(false)),
        ("RSSI", PropertyValue::I16(-52)),
        (
            "UUIDs",
            PropertyValue::List(vec![PropertyValue::Str(
                "0000110b-0000-1000-8000-00805f9b34fb".into(),
            )]),
        ),
        // Not part of the declared schema.
        ("Modalias", PropertyValue::Str("usb:v1D6B".into())),
    ]
}

async fn mock_device(bus: &Bus<MockTransport>) -> Device1<MockTransport> {
    Device1::new(bus, device_path()).await.unwrap()
}

fn changed_signal(path: OwnedObjectPath, fields: Vec<(&str, PropertyValue)>) -> SignalEvent {
    SignalEvent::PropertiesChanged {
        path,
        interface: "org.bluez.Device1".into(),
        changed: fields
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect(),
        invalidated: Vec::new(),
    }
}

#[tokio::test]
async fn test_load_populates_declared_fields() {
    let bus = Bus::new(MockTransport::with_props(loaded_device_props()));
    let device = mock_device(&bus).await;

    assert_eq!(device.address(), "00:11:22:33:44:55");
    assert_eq!(device.name(), "Headset");
    assert_eq!(device.alias(), "My Headset");
    assert_eq!(device.class(), 0x240404);
    assert!(!device.connected());
    assert_eq!(device.rssi(), -52);
    assert_eq!(device.uuids().len(), 1);

    // Fields missing from the reply stay at their zero values.
    assert!(!device.paired());
    assert_eq!(device.appearance(), 0);

    // The undeclared field is not in the typed snapshot.
    assert!(!device.proxy().to_map().contains_key("Modalias"));
}

#[tokio::test]
async fn test_load_failure_surfaces_transport_error() {
    struct FailingTransport;

    #[async_trait]
    impl BusTransport for FailingTransport {
        async fn call(
            &self,
            _id: &ProxyId,
            _method: &str,
            _args: Vec<PropertyValue>,
        ) -> bzrs::Result<Option<PropertyValue>> {
            unreachable!()
        }
        async fn get_property(&self, _id: &ProxyId, _name: &str) -> bzrs::Result<PropertyValue> {
            unreachable!()
        }
        async fn get_all_properties(&self, _id: &ProxyId) -> bzrs::Result<PropertyMap> {
            Err(Error::Transport(zbus::Error::InvalidReply))
        }
        async fn set_property(
            &self,
            _id: &ProxyId,
            _name: &str,
            _value: PropertyValue,
        ) -> bzrs::Result<()> {
            unreachable!()
        }
        async fn subscribe(
            &self,
            _path: &OwnedObjectPath,
            _interface: &str,
        ) -> bzrs::Result<Subscription> {
            unreachable!()
        }
    }

    let bus = Bus::new(FailingTransport);
    let result = Device1::new(&bus, device_path()).await;
    assert!(matches!(result, Err(Error::Transport(_))));
}

#[tokio::test]
async fn test_set_accepted_updates_cache() {
    let bus = Bus::new(MockTransport::with_props(loaded_device_props()));
    let device = mock_device(&bus).await;

    device.set_alias("Kitchen Speaker").await.unwrap();
    assert_eq!(device.alias(), "Kitchen Speaker");

    let writes = bus.transport().writes.lock().unwrap().clone();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].0, "Alias");
}

#[tokio::test]
async fn test_set_rejected_leaves_cache_unchanged() {
    let bus = Bus::new(MockTransport::with_props(loaded_device_props()));
    let device = mock_device(&bus).await;
    bus.transport().reject_writes.store(true, Ordering::SeqCst);

    let err = device.set_trusted(true).await.unwrap_err();
    assert!(err.is_rejection());
    assert!(!device.trusted());
}

#[tokio::test]
async fn test_change_notification_updates_cache_and_emits_events() {
    let bus = Bus::new(MockTransport::with_props(loaded_device_props()));
    let device = mock_device(&bus).await;
    let mut events = device.watch_properties().await.unwrap();

    bus.transport().inject(changed_signal(
        device_path(),
        vec![
            ("Connected", PropertyValue::Bool(true)),
            ("RSSI", PropertyValue::I16(-38)),
        ],
    ));

    // One event per changed field, in either order.
    let mut seen = HashMap::new();
    for _ in 0..2 {
        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event within deadline")
            .expect("event stream open");
        assert_eq!(event.interface, "org.bluez.Device1");
        seen.insert(event.name.clone(), event.value.clone());
    }
    assert_eq!(seen.get("Connected"), Some(&PropertyValue::Bool(true)));
    assert_eq!(seen.get("RSSI"), Some(&PropertyValue::I16(-38)));

    assert!(device.connected());
    assert_eq!(device.rssi(), -38);
    device.close().await;
}

#[tokio::test]
async fn test_undeclared_field_still_emits_event() {
    let bus = Bus::new(MockTransport::with_props(loaded_device_props()));
    let device = mock_device(&bus).await;
    let snapshot = device.proxy().to_map();
    let mut events = device.watch_properties().await.unwrap();

    bus.transport().inject(changed_signal(
        device_path(),
        vec![("TxPower", PropertyValue::I16(4))],
    ));

    let event = timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.name, "TxPower");
    assert_eq!(event.value, PropertyValue::I16(4));

    // The typed cache is untouched.
    assert_eq!(device.proxy().to_map(), snapshot);
    device.close().await;
}

#[tokio::test]
async fn test_notification_for_other_path_is_discarded() {
    let bus = Bus::new(MockTransport::with_props(loaded_device_props()));
    let device = mock_device(&bus).await;
    let mut events = device.watch_properties().await.unwrap();

    let other = OwnedObjectPath::try_from("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF").unwrap();
    bus.transport().inject(changed_signal(
        other,
        vec![("Connected", PropertyValue::Bool(true))],
    ));

    assert!(
        timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err()
    );
    assert!(!device.connected());
    device.close().await;
}

#[tokio::test]
async fn test_invalidated_field_resets_without_event() {
    let bus = Bus::new(MockTransport::with_props(loaded_device_props()));
    let device = mock_device(&bus).await;
    assert_eq!(device.rssi(), -52);
    let mut events = device.watch_properties().await.unwrap();

    bus.transport().inject(SignalEvent::PropertiesChanged {
        path: device_path(),
        interface: "org.bluez.Device1".into(),
        changed: PropertyMap::new(),
        invalidated: vec!["RSSI".into()],
    });

    assert!(
        timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err()
    );
    assert_eq!(device.rssi(), 0);
    device.close().await;
}

#[tokio::test]
async fn test_stop_terminates_watcher_and_allows_restart() {
    let bus = Bus::new(MockTransport::with_props(loaded_device_props()));
    let device = mock_device(&bus).await;

    let mut events = device.watch_properties().await.unwrap();
    device.unwatch_properties().await;

    // The loop is gone: nothing further is delivered even if signals keep
    // coming, and the event stream reports closure.
    bus.transport().inject(changed_signal(
        device_path(),
        vec![("Connected", PropertyValue::Bool(true))],
    ));
    assert!(events.recv().await.is_none());
    assert!(!device.connected());

    // A stopped watcher can be started again with a fresh subscription.
    let mut events = device.watch_properties().await.unwrap();
    bus.transport().inject(changed_signal(
        device_path(),
        vec![("Connected", PropertyValue::Bool(true))],
    ));
    let event = timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.name, "Connected");
    device.close().await;
}

#[tokio::test]
async fn test_double_start_is_an_error() {
    let bus = Bus::new(MockTransport::with_props(loaded_device_props()));
    let device = mock_device(&bus).await;

    let _events = device.watch_properties().await.unwrap();
    assert!(matches!(
        device.watch_properties().await,
        Err(Error::WatcherActive)
    ));
    device.close().await;
}

fn added_signal(path: &str) -> SignalEvent {
    SignalEvent::InterfacesAdded {
        path: OwnedObjectPath::try_from(path).unwrap(),
        interfaces: HashMap::from([("org.bluez.Device1".to_owned(), PropertyMap::new())]),
    }
}

#[tokio::test]
async fn test_lifecycle_broadcast_reaches_every_registrant_once() {
    let bus = Bus::new(MockTransport::default());
    let monitor = bus.lifecycle();

    let mut first = monitor.register().await.unwrap();
    let mut second = monitor.register().await.unwrap();
    // Both registrants share one underlying subscription.
    assert_eq!(bus.transport().subscriptions.load(Ordering::SeqCst), 1);

    bus.transport().inject(added_signal("/org/bluez/hci1"));

    for handle in [&mut first, &mut second] {
        let event = timeout(Duration::from_secs(1), handle.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            LifecycleEvent::ObjectAdded { path, .. } => {
                assert_eq!(path.as_str(), "/org/bluez/hci1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    // Exactly once each.
    assert!(
        timeout(Duration::from_millis(100), first.recv())
            .await
            .is_err()
    );

    monitor.unregister(first).await;
    bus.transport().inject(added_signal("/org/bluez/hci2"));
    let event = timeout(Duration::from_secs(1), second.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.path().as_str(), "/org/bluez/hci2");

    monitor.unregister(second).await;
}

#[tokio::test]
async fn test_lifecycle_resubscribes_after_last_unregister() {
    let bus = Bus::new(MockTransport::default());
    let monitor = bus.lifecycle();

    let handle = monitor.register().await.unwrap();
    assert_eq!(bus.transport().subscriptions.load(Ordering::SeqCst), 1);
    monitor.unregister(handle).await;
    assert_eq!(bus.transport().live_subscriptions(), 0);

    let mut handle = monitor.register().await.unwrap();
    assert_eq!(bus.transport().subscriptions.load(Ordering::SeqCst), 2);

    bus.transport().inject(added_signal("/org/bluez/hci0"));
    assert!(
        timeout(Duration::from_secs(1), handle.recv())
            .await
            .unwrap()
            .is_some()
    );
    monitor.unregister(handle).await;
}

#[tokio::test]
async fn test_slow_lifecycle_consumer_drops_overflow_without_stalling() {
    let bus = Bus::new(MockTransport::default());
    let monitor = bus.lifecycle();
    let mut handle = monitor.register().await.unwrap();

    // Four more than one registrant buffer's worth, with nobody consuming.
    for i in 0..20 {
        bus.transport()
            .inject(added_signal(&format!("/org/bluez/hci{i}")));
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut received = 0;
    while let Ok(Some(_)) = timeout(Duration::from_millis(50), handle.recv()).await {
        received += 1;
    }
    assert_eq!(received, 16);

    // The broadcaster survived the overflow and kept the registrant.
    bus.transport().inject(added_signal("/org/bluez/hci99"));
    let event = timeout(Duration::from_secs(1), handle.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.path().as_str(), "/org/bluez/hci99");
    monitor.unregister(handle).await;
}

#[tokio::test]
async fn test_dropped_lifecycle_receiver_pruned_on_next_broadcast() {
    let bus = Bus::new(MockTransport::default());
    let monitor = bus.lifecycle();

    let mut kept = monitor.register().await.unwrap();
    let discarded = monitor.register().await.unwrap();
    assert_eq!(monitor.registered(), 2);
    drop(discarded);

    bus.transport().inject(added_signal("/org/bluez/hci3"));
    let event = timeout(Duration::from_secs(1), kept.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.path().as_str(), "/org/bluez/hci3");

    // The discarded channel was detected and removed during delivery.
    assert_eq!(monitor.registered(), 1);
    monitor.unregister(kept).await;
}

#[tokio::test]
async fn test_lifecycle_reopens_subscription_after_upstream_ends() {
    let bus = Bus::new(MockTransport::default());
    let monitor = bus.lifecycle();

    let mut first = monitor.register().await.unwrap();
    assert_eq!(bus.transport().subscriptions.load(Ordering::SeqCst), 1);

    // The bus side goes away; the broadcast loop winds down on its own.
    bus.transport().close_subscriptions();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The next registration notices the dead loop and resubscribes.
    let mut second = monitor.register().await.unwrap();
    assert_eq!(bus.transport().subscriptions.load(Ordering::SeqCst), 2);

    bus.transport().inject(added_signal("/org/bluez/hci5"));
    for handle in [&mut first, &mut second] {
        let event = timeout(Duration::from_secs(1), handle.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.path().as_str(), "/org/bluez/hci5");
    }

    monitor.unregister(first).await;
    monitor.unregister(second).await;
}

#[tokio::test]
async fn test_watcher_restarts_after_event_stream_dropped() {
    let bus = Bus::new(MockTransport::with_props(loaded_device_props()));
    let device = mock_device(&bus).await;

    let events = device.watch_properties().await.unwrap();
    drop(events);

    // With nobody listening, the next notification ends the loop.
    bus.transport().inject(changed_signal(
        device_path(),
        vec![("Connected", PropertyValue::Bool(true))],
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The dead loop does not count as watching; a new one can start.
    let mut events = device.watch_properties().await.unwrap();
    bus.transport().inject(changed_signal(
        device_path(),
        vec![("RSSI", PropertyValue::I16(-45))],
    ));
    let event = timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.name, "RSSI");
    device.close().await;
}

#[test]
fn test_concurrent_readers_never_see_torn_updates() {
    let cache = Arc::new(PropertyCache::new(DeviceProperties::default()));

    let states = ["one", "two"];
    let mut writer_maps = Vec::new();
    for state in states {
        let mut map = PropertyMap::new();
        map.insert("Name".into(), PropertyValue::Str(state.into()));
        map.insert("Alias".into(), PropertyValue::Str(state.into()));
        writer_maps.push(map);
    }
    cache.apply(&writer_maps[0]);

    let writer = {
        let cache = Arc::clone(&cache);
        std::thread::spawn(move || {
            for i in 0..2_000 {
                cache.apply(&writer_maps[i % 2]);
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    let (name, alias) = cache.read(|p| (p.name.clone(), p.alias.clone()));
                    // Both fields are written under one lock hold, so a
                    // reader sees them move together or not at all.
                    assert_eq!(name, alias);
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}

#[tokio::test]
async fn test_method_call_goes_to_transport() {
    let bus = Bus::new(MockTransport::with_props(loaded_device_props()));
    let device = mock_device(&bus).await;

    device.connect().await.unwrap();
    device.disconnect().await.unwrap();

    let calls = bus.transport().calls.lock().unwrap().clone();
    assert_eq!(calls, vec!["Connect".to_owned(), "Disconnect".to_owned()]);
}
