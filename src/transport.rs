//! The bus transport seam.
//!
//! Everything the engine needs from the bus goes through [`BusTransport`]:
//! typed method calls, property get/set, and signal subscriptions. The
//! production implementation is [`ZbusTransport`] over a [`zbus::Connection`];
//! tests drive the engine through an in-process mock implementing the same
//! trait.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use zbus::names::{BusName, InterfaceName};
use zbus::{Connection, MatchRule, MessageStream, message};
use zvariant::{OwnedObjectPath, OwnedValue, Value};

use crate::error::Error;
use crate::value::{PropertyMap, PropertyValue, decode_value_map};
use crate::Result;

/// Well-known interface carrying `PropertiesChanged` signals.
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Well-known interface carrying object lifecycle signals.
pub const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";

/// Queue depth for raw signal messages per subscription.
const SIGNAL_QUEUE: usize = 64;

/// Identity of one remote object: (service bus name, interface, object path).
///
/// Immutable for the proxy's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ProxyId {
    /// Well-known bus name of the remote service (e.g. `org.bluez`).
    pub service: String,
    /// Interface whose properties and methods the proxy mirrors.
    pub interface: String,
    /// Path of the remote object.
    pub path: OwnedObjectPath,
}

impl ProxyId {
    pub fn new(service: impl Into<String>, interface: impl Into<String>, path: OwnedObjectPath) -> Self {
        ProxyId {
            service: service.into(),
            interface: interface.into(),
            path,
        }
    }
}

impl Display for ProxyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} @ {}", self.service, self.interface, self.path)
    }
}

/// A decoded signal delivered on a [`Subscription`].
#[derive(Debug, Clone)]
pub enum SignalEvent {
    /// One or more properties changed on an object; `invalidated` lists
    /// properties whose values were withdrawn without a replacement.
    PropertiesChanged {
        path: OwnedObjectPath,
        interface: String,
        changed: PropertyMap,
        invalidated: Vec<String>,
    },
    /// An object appeared (or grew interfaces), with its initial properties.
    InterfacesAdded {
        path: OwnedObjectPath,
        interfaces: HashMap<String, PropertyMap>,
    },
    /// An object (or some of its interfaces) disappeared.
    InterfacesRemoved {
        path: OwnedObjectPath,
        interfaces: Vec<String>,
    },
}

/// An open signal subscription.
///
/// Events arrive in the order the transport received them. Dropping the
/// subscription releases the bus-level match.
pub struct Subscription {
    events: mpsc::Receiver<SignalEvent>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Subscription {
    /// Wraps a plain receiver; used by transports that have no decode task
    /// of their own (e.g. test mocks).
    pub fn from_receiver(events: mpsc::Receiver<SignalEvent>) -> Self {
        Subscription { events, task: None }
    }

    fn with_task(events: mpsc::Receiver<SignalEvent>, task: tokio::task::JoinHandle<()>) -> Self {
        Subscription {
            events,
            task: Some(task),
        }
    }

    /// Receives the next signal; `None` once the transport side is gone.
    pub async fn recv(&mut self) -> Option<SignalEvent> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// What the engine consumes from the bus. See the module docs.
#[async_trait]
pub trait BusTransport: Send + Sync + 'static {
    /// Invokes a method on the remote object. Returns the reply's single
    /// return value, if any.
    async fn call(
        &self,
        id: &ProxyId,
        method: &str,
        args: Vec<PropertyValue>,
    ) -> Result<Option<PropertyValue>>;

    /// Reads one property from the remote object.
    async fn get_property(&self, id: &ProxyId, name: &str) -> Result<PropertyValue>;

    /// Reads all properties of the proxy's interface in one call.
    async fn get_all_properties(&self, id: &ProxyId) -> Result<PropertyMap>;

    /// Writes one property on the remote object. A refusal by the remote
    /// service surfaces as [`Error::Rejected`].
    async fn set_property(&self, id: &ProxyId, name: &str, value: PropertyValue) -> Result<()>;

    /// Opens a signal subscription scoped to `(path, interface)`.
    async fn subscribe(&self, path: &OwnedObjectPath, interface: &str) -> Result<Subscription>;
}

/// Production transport over a zbus connection.
#[derive(Clone)]
pub struct ZbusTransport {
    conn: Connection,
}

impl ZbusTransport {
    /// Connects to the system bus.
    pub async fn system() -> Result<Self> {
        Ok(ZbusTransport {
            conn: Connection::system().await?,
        })
    }

    /// Connects to the session bus.
    pub async fn session() -> Result<Self> {
        Ok(ZbusTransport {
            conn: Connection::session().await?,
        })
    }

    /// Wraps an existing connection.
    pub fn new(conn: Connection) -> Self {
        ZbusTransport { conn }
    }

    /// The underlying connection, for callers needing direct bus access.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    async fn properties_proxy(&self, id: &ProxyId) -> Result<zbus::fdo::PropertiesProxy<'_>> {
        let destination = BusName::try_from(id.service.clone())?;
        Ok(zbus::fdo::PropertiesProxy::builder(&self.conn)
            .destination(destination)?
            .path(id.path.clone())?
            .build()
            .await?)
    }

    fn interface_name(id: &ProxyId) -> Result<InterfaceName<'_>> {
        Ok(InterfaceName::try_from(id.interface.as_str())?)
    }
}

#[async_trait]
impl BusTransport for ZbusTransport {
    async fn call(
        &self,
        id: &ProxyId,
        method: &str,
        args: Vec<PropertyValue>,
    ) -> Result<Option<PropertyValue>> {
        let destination = BusName::try_from(id.service.clone())?;
        let interface = InterfaceName::try_from(id.interface.as_str())?;

        let reply = if args.is_empty() {
            self.conn
                .call_method(Some(destination), &id.path, Some(interface), method, &())
                .await
        } else {
            let mut builder = zvariant::StructureBuilder::new();
            for arg in &args {
                builder = builder.append_field(Value::from(arg));
            }
            let body = builder.build().map_err(zbus::Error::from)?;
            self.conn
                .call_method(Some(destination), &id.path, Some(interface), method, &body)
                .await
        };

        let reply = reply.map_err(|e| match e {
            zbus::Error::MethodError(name, detail, _) => {
                Error::rejected(name.to_string(), detail.unwrap_or_default())
            }
            other => Error::Transport(other),
        })?;

        let body = reply.body();
        if body.signature() == &zvariant::Signature::Unit {
            return Ok(None);
        }
        let value: Value<'_> = body
            .deserialize()
            .map_err(|e| Error::decode(format!("{method} reply"), e))?;
        Ok(Some(PropertyValue::try_from(&value)?))
    }

    async fn get_property(&self, id: &ProxyId, name: &str) -> Result<PropertyValue> {
        let proxy = self.properties_proxy(id).await?;
        let value = proxy
            .get(Self::interface_name(id)?, name)
            .await
            .map_err(zbus::Error::from)?;
        PropertyValue::try_from(&value)
    }

    async fn get_all_properties(&self, id: &ProxyId) -> Result<PropertyMap> {
        let proxy = self.properties_proxy(id).await?;
        let raw: HashMap<String, OwnedValue> = proxy
            .get_all(Self::interface_name(id)?)
            .await
            .map_err(zbus::Error::from)?;
        Ok(decode_value_map(&raw))
    }

    async fn set_property(&self, id: &ProxyId, name: &str, value: PropertyValue) -> Result<()> {
        let proxy = self.properties_proxy(id).await?;
        proxy
            .set(Self::interface_name(id)?, name, Value::from(&value))
            .await
            .map_err(|e| classify_set_error(name, e))
    }

    async fn subscribe(&self, path: &OwnedObjectPath, interface: &str) -> Result<Subscription> {
        let rule = MatchRule::builder()
            .msg_type(message::Type::Signal)
            .path(path.clone())?
            .interface(interface)?
            .build();

        let stream = MessageStream::for_match_rule(rule, &self.conn, Some(SIGNAL_QUEUE)).await?;
        let (tx, rx) = mpsc::channel(SIGNAL_QUEUE);

        let task = tokio::spawn(decode_signals(stream, tx));
        debug!("Subscribed to {interface} signals at {path}");
        Ok(Subscription::with_task(rx, task))
    }
}

/// Turns raw signal messages into [`SignalEvent`]s.
///
/// Runs until the stream or all receivers are gone. A message that fails to
/// decode is logged and dropped; it never ends the subscription.
async fn decode_signals(mut stream: MessageStream, tx: mpsc::Sender<SignalEvent>) {
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("Signal stream error: {e}");
                continue;
            }
        };
        let Some(event) = decode_signal_message(&msg) else {
            continue;
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
    debug!("Signal decode task finished");
}

/// Splits a property-write failure into a remote refusal versus a transport
/// problem. Timeouts and missing replies are not refusals: the write may or
/// may not have been applied.
fn classify_set_error(property: &str, e: zbus::fdo::Error) -> Error {
    use zbus::fdo::Error as Fdo;
    match e {
        Fdo::ZBus(inner) => Error::Transport(inner),
        refusal @ (Fdo::AccessDenied(_)
        | Fdo::PropertyReadOnly(_)
        | Fdo::NotSupported(_)
        | Fdo::InvalidArgs(_)
        | Fdo::UnknownProperty(_)
        | Fdo::UnknownInterface(_)
        | Fdo::UnknownObject(_)
        | Fdo::Failed(_)) => Error::rejected(property, refusal),
        other => Error::Transport(zbus::Error::FDO(Box::new(other))),
    }
}

fn decode_signal_message(msg: &zbus::Message) -> Option<SignalEvent> {
    let header = msg.header();
    let member = header.member()?.as_str().to_owned();
    let body = msg.body();

    match member.as_str() {
        "PropertiesChanged" => {
            let path: OwnedObjectPath = header.path()?.to_owned().into();
            let (interface, changed, invalidated): (
                String,
                HashMap<String, OwnedValue>,
                Vec<String>,
            ) = match body.deserialize() {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("Malformed PropertiesChanged signal: {e}");
                    return None;
                }
            };
            Some(SignalEvent::PropertiesChanged {
                path,
                interface,
                changed: decode_value_map(&changed),
                invalidated,
            })
        }
        "InterfacesAdded" => {
            let (path, raw): (OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>) =
                match body.deserialize() {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        warn!("Malformed InterfacesAdded signal: {e}");
                        return None;
                    }
                };
            let interfaces = raw
                .iter()
                .map(|(iface, props)| (iface.clone(), decode_value_map(props)))
                .collect();
            Some(SignalEvent::InterfacesAdded { path, interfaces })
        }
        "InterfacesRemoved" => {
            let (path, interfaces): (OwnedObjectPath, Vec<String>) = match body.deserialize() {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("Malformed InterfacesRemoved signal: {e}");
                    return None;
                }
            };
            Some(SignalEvent::InterfacesRemoved { path, interfaces })
        }
        _ => None,
    }
}
