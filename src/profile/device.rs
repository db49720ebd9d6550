//! `org.bluez.Device1` proxy facade.

use tokio::sync::mpsc;
use zvariant::OwnedObjectPath;

use crate::Result;
use crate::cache::Properties;
use crate::error::Error;
use crate::proxy::{Bus, Proxy};
use crate::transport::{BusTransport, ProxyId, ZbusTransport};
use crate::value::{PropertyMap, PropertyValue};
use crate::watcher::PropertyChanged;

use super::SERVICE_NAME;

/// Declared properties of a remote Bluetooth device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProperties {
    /// The Bluetooth device address (e.g. `00:11:22:33:44:55`).
    pub address: String,
    /// The remote name, as reported by the device itself.
    pub name: String,
    /// User-settable friendly name; falls back to `name` remotely.
    pub alias: String,
    /// The Bluetooth class of device.
    pub class: u32,
    /// External appearance, as found on GAP service.
    pub appearance: u16,
    /// Proposed icon name.
    pub icon: String,
    /// Whether the device is paired.
    pub paired: bool,
    /// Whether the remote is seen as trusted.
    pub trusted: bool,
    /// If set, any incoming connections are rejected.
    pub blocked: bool,
    /// Whether the device is currently connected.
    pub connected: bool,
    /// Received signal strength of the device, in dBm.
    pub rssi: i16,
    /// Available service UUIDs.
    pub uuids: Vec<String>,
    /// Object path of the adapter the device belongs to.
    pub adapter: OwnedObjectPath,
    /// Service advertisement data, keyed by UUID.
    pub service_data: PropertyMap,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        DeviceProperties {
            address: String::new(),
            name: String::new(),
            alias: String::new(),
            class: 0,
            appearance: 0,
            icon: String::new(),
            paired: false,
            trusted: false,
            blocked: false,
            connected: false,
            rssi: 0,
            uuids: Vec::new(),
            adapter: crate::value::zero_object_path(),
            service_data: PropertyMap::new(),
        }
    }
}

impl Properties for DeviceProperties {
    const INTERFACE: &'static str = "org.bluez.Device1";

    fn field_names() -> &'static [&'static str] {
        &[
            "Address",
            "Name",
            "Alias",
            "Class",
            "Appearance",
            "Icon",
            "Paired",
            "Trusted",
            "Blocked",
            "Connected",
            "RSSI",
            "UUIDs",
            "Adapter",
            "ServiceData",
        ]
    }

    fn set_field(&mut self, name: &str, value: &PropertyValue) -> Result<bool> {
        let mismatch = || Error::decode(name, value.type_name());
        match name {
            "Address" => self.address = value.as_str().ok_or_else(mismatch)?.to_owned(),
            "Name" => self.name = value.as_str().ok_or_else(mismatch)?.to_owned(),
            "Alias" => self.alias = value.as_str().ok_or_else(mismatch)?.to_owned(),
            "Class" => self.class = value.as_u32().ok_or_else(mismatch)?,
            "Appearance" => self.appearance = value.as_u16().ok_or_else(mismatch)?,
            "Icon" => self.icon = value.as_str().ok_or_else(mismatch)?.to_owned(),
            "Paired" => self.paired = value.as_bool().ok_or_else(mismatch)?,
            "Trusted" => self.trusted = value.as_bool().ok_or_else(mismatch)?,
            "Blocked" => self.blocked = value.as_bool().ok_or_else(mismatch)?,
            "Connected" => self.connected = value.as_bool().ok_or_else(mismatch)?,
            "RSSI" => self.rssi = value.as_i16().ok_or_else(mismatch)?,
            "UUIDs" => self.uuids = value.as_string_list().ok_or_else(mismatch)?,
            "Adapter" => self.adapter = value.as_object_path().ok_or_else(mismatch)?.clone(),
            "ServiceData" => self.service_data = value.as_map().ok_or_else(mismatch)?.clone(),
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn get_field(&self, name: &str) -> Option<PropertyValue> {
        match name {
            "Address" => Some(PropertyValue::Str(self.address.clone())),
            "Name" => Some(PropertyValue::Str(self.name.clone())),
            "Alias" => Some(PropertyValue::Str(self.alias.clone())),
            "Class" => Some(PropertyValue::U32(self.class)),
            "Appearance" => Some(PropertyValue::U16(self.appearance)),
            "Icon" => Some(PropertyValue::Str(self.icon.clone())),
            "Paired" => Some(PropertyValue::Bool(self.paired)),
            "Trusted" => Some(PropertyValue::Bool(self.trusted)),
            "Blocked" => Some(PropertyValue::Bool(self.blocked)),
            "Connected" => Some(PropertyValue::Bool(self.connected)),
            "RSSI" => Some(PropertyValue::I16(self.rssi)),
            "UUIDs" => Some(PropertyValue::List(
                self.uuids.iter().cloned().map(PropertyValue::Str).collect(),
            )),
            "Adapter" => Some(PropertyValue::ObjectPath(self.adapter.clone())),
            "ServiceData" => Some(PropertyValue::Map(self.service_data.clone())),
            _ => None,
        }
    }

    fn clear_field(&mut self, name: &str) -> bool {
        match name {
            "Address" => self.address = String::new(),
            "Name" => self.name = String::new(),
            "Alias" => self.alias = String::new(),
            "Class" => self.class = 0,
            "Appearance" => self.appearance = 0,
            "Icon" => self.icon = String::new(),
            "Paired" => self.paired = false,
            "Trusted" => self.trusted = false,
            "Blocked" => self.blocked = false,
            "Connected" => self.connected = false,
            "RSSI" => self.rssi = 0,
            "UUIDs" => self.uuids = Vec::new(),
            "Adapter" => self.adapter = crate::value::zero_object_path(),
            "ServiceData" => self.service_data = PropertyMap::new(),
            _ => return false,
        }
        true
    }
}

/// Proxy for one remote Bluetooth device.
///
/// Getters read the local cache; start [`Self::watch_properties`] to keep it
/// following remote changes, or [`Self::refresh`] to re-pull on demand.
pub struct Device1<T: BusTransport = ZbusTransport> {
    proxy: Proxy<T, DeviceProperties>,
}

impl<T: BusTransport> Device1<T> {
    /// Builds a device proxy and loads its properties.
    ///
    /// `objectPath` convention: `[variable prefix]/{hci0,...}/dev_XX_XX_XX_XX_XX_XX`.
    pub async fn new(bus: &Bus<T>, path: OwnedObjectPath) -> Result<Self> {
        Ok(Device1 {
            proxy: bus.proxy(SERVICE_NAME, path).await?,
        })
    }

    pub fn id(&self) -> &ProxyId {
        self.proxy.id()
    }

    pub fn path(&self) -> &OwnedObjectPath {
        self.proxy.path()
    }

    /// Access to the generic proxy beneath the typed surface.
    pub fn proxy(&self) -> &Proxy<T, DeviceProperties> {
        &self.proxy
    }

    pub fn address(&self) -> String {
        self.proxy.properties(|p| p.address.clone())
    }

    pub fn name(&self) -> String {
        self.proxy.properties(|p| p.name.clone())
    }

    pub fn alias(&self) -> String {
        self.proxy.properties(|p| p.alias.clone())
    }

    pub async fn set_alias(&self, alias: impl Into<String>) -> Result<()> {
        self.proxy
            .set_property("Alias", PropertyValue::Str(alias.into()))
            .await
    }

    pub fn class(&self) -> u32 {
        self.proxy.properties(|p| p.class)
    }

    pub fn appearance(&self) -> u16 {
        self.proxy.properties(|p| p.appearance)
    }

    pub fn paired(&self) -> bool {
        self.proxy.properties(|p| p.paired)
    }

    pub fn trusted(&self) -> bool {
        self.proxy.properties(|p| p.trusted)
    }

    pub async fn set_trusted(&self, trusted: bool) -> Result<()> {
        self.proxy
            .set_property("Trusted", PropertyValue::Bool(trusted))
            .await
    }

    pub fn blocked(&self) -> bool {
        self.proxy.properties(|p| p.blocked)
    }

    pub async fn set_blocked(&self, blocked: bool) -> Result<()> {
        self.proxy
            .set_property("Blocked", PropertyValue::Bool(blocked))
            .await
    }

    pub fn connected(&self) -> bool {
        self.proxy.properties(|p| p.connected)
    }

    pub fn rssi(&self) -> i16 {
        self.proxy.properties(|p| p.rssi)
    }

    pub fn uuids(&self) -> Vec<String> {
        self.proxy.properties(|p| p.uuids.clone())
    }

    pub fn adapter(&self) -> OwnedObjectPath {
        self.proxy.properties(|p| p.adapter.clone())
    }

    pub fn service_data(&self) -> PropertyMap {
        self.proxy.properties(|p| p.service_data.clone())
    }

    /// Re-reads all properties from the daemon.
    pub async fn refresh(&self) -> Result<()> {
        self.proxy.refresh().await
    }

    /// Connects all profiles the remote device supports.
    ///
    /// Possible errors: `org.bluez.Error.NotReady`, `org.bluez.Error.Failed`,
    /// `org.bluez.Error.InProgress`, `org.bluez.Error.AlreadyConnected`.
    pub async fn connect(&self) -> Result<()> {
        self.proxy.call("Connect", Vec::new()).await.map(|_| ())
    }

    /// Gracefully disconnects all connected profiles.
    pub async fn disconnect(&self) -> Result<()> {
        self.proxy.call("Disconnect", Vec::new()).await.map(|_| ())
    }

    /// Connects a specific profile by UUID.
    pub async fn connect_profile(&self, uuid: impl Into<String>) -> Result<()> {
        self.proxy
            .call("ConnectProfile", vec![PropertyValue::Str(uuid.into())])
            .await
            .map(|_| ())
    }

    /// Pairs with the remote device.
    pub async fn pair(&self) -> Result<()> {
        self.proxy.call("Pair", Vec::new()).await.map(|_| ())
    }

    /// Cancels an ongoing pairing attempt.
    pub async fn cancel_pairing(&self) -> Result<()> {
        self.proxy
            .call("CancelPairing", Vec::new())
            .await
            .map(|_| ())
    }

    /// Starts following property changes; see
    /// [`Proxy::watch_properties`](crate::proxy::Proxy::watch_properties).
    pub async fn watch_properties(&self) -> Result<mpsc::UnboundedReceiver<PropertyChanged>> {
        self.proxy.watch_properties().await
    }

    pub async fn unwatch_properties(&self) {
        self.proxy.unwatch_properties().await;
    }

    /// Stops background listeners. The cached values remain readable.
    pub async fn close(&self) {
        self.proxy.close().await;
    }
}
