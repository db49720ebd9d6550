//! `org.bluez.MediaItem1` proxy facade (browsing subset).

use zvariant::OwnedObjectPath;

use crate::Result;
use crate::cache::Properties;
use crate::error::Error;
use crate::proxy::{Bus, Proxy};
use crate::transport::{BusTransport, ZbusTransport};
use crate::value::{PropertyMap, PropertyValue};

use super::SERVICE_NAME;

/// Declared properties of a media item exposed by a remote player.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaItemProperties {
    /// Item displayable name.
    pub name: String,
    /// Item type; one of `video`, `audio`, `folder`.
    pub item_type: String,
    /// Whether the item can be played.
    pub playable: bool,
    /// Player object path the item belongs to.
    pub player: OwnedObjectPath,
    /// Item metadata (title, artist, duration, ...).
    pub metadata: PropertyMap,
}

impl Default for MediaItemProperties {
    fn default() -> Self {
        MediaItemProperties {
            name: String::new(),
            item_type: String::new(),
            playable: false,
            player: crate::value::zero_object_path(),
            metadata: PropertyMap::new(),
        }
    }
}

impl Properties for MediaItemProperties {
    const INTERFACE: &'static str = "org.bluez.MediaItem1";

    fn field_names() -> &'static [&'static str] {
        &["Name", "Type", "Playable", "Player", "Metadata"]
    }

    fn set_field(&mut self, name: &str, value: &PropertyValue) -> Result<bool> {
        let mismatch = || Error::decode(name, value.type_name());
        match name {
            "Name" => self.name = value.as_str().ok_or_else(mismatch)?.to_owned(),
            "Type" => self.item_type = value.as_str().ok_or_else(mismatch)?.to_owned(),
            "Playable" => self.playable = value.as_bool().ok_or_else(mismatch)?,
            "Player" => self.player = value.as_object_path().ok_or_else(mismatch)?.clone(),
            // Metadata is the catch-all: any nested name→value structure
            // is accepted as-is.
            "Metadata" => self.metadata = value.as_map().ok_or_else(mismatch)?.clone(),
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn get_field(&self, name: &str) -> Option<PropertyValue> {
        match name {
            "Name" => Some(PropertyValue::Str(self.name.clone())),
            "Type" => Some(PropertyValue::Str(self.item_type.clone())),
            "Playable" => Some(PropertyValue::Bool(self.playable)),
            "Player" => Some(PropertyValue::ObjectPath(self.player.clone())),
            "Metadata" => Some(PropertyValue::Map(self.metadata.clone())),
            _ => None,
        }
    }

    fn clear_field(&mut self, name: &str) -> bool {
        match name {
            "Name" => self.name = String::new(),
            "Type" => self.item_type = String::new(),
            "Playable" => self.playable = false,
            "Player" => self.player = crate::value::zero_object_path(),
            "Metadata" => self.metadata = PropertyMap::new(),
            _ => return false,
        }
        true
    }
}

/// Proxy for one item in a remote player's media hierarchy.
pub struct MediaItem1<T: BusTransport = ZbusTransport> {
    proxy: Proxy<T, MediaItemProperties>,
}

impl<T: BusTransport> MediaItem1<T> {
    /// `objectPath`: `[variable prefix]/{hci0,...}/dev_XX.../playerX/itemX`.
    pub async fn new(bus: &Bus<T>, path: OwnedObjectPath) -> Result<Self> {
        Ok(MediaItem1 {
            proxy: bus.proxy(SERVICE_NAME, path).await?,
        })
    }

    pub fn proxy(&self) -> &Proxy<T, MediaItemProperties> {
        &self.proxy
    }

    pub fn name(&self) -> String {
        self.proxy.properties(|p| p.name.clone())
    }

    pub fn item_type(&self) -> String {
        self.proxy.properties(|p| p.item_type.clone())
    }

    pub fn playable(&self) -> bool {
        self.proxy.properties(|p| p.playable)
    }

    pub fn player(&self) -> OwnedObjectPath {
        self.proxy.properties(|p| p.player.clone())
    }

    pub fn metadata(&self) -> PropertyMap {
        self.proxy.properties(|p| p.metadata.clone())
    }

    /// Plays the item.
    ///
    /// Possible errors: `org.bluez.Error.NotSupported`,
    /// `org.bluez.Error.Failed`.
    pub async fn play(&self) -> Result<()> {
        self.proxy.call("Play", Vec::new()).await.map(|_| ())
    }

    /// Adds the item to the now-playing list.
    pub async fn add_to_now_playing(&self) -> Result<()> {
        self.proxy
            .call("AddtoNowPlaying", Vec::new())
            .await
            .map(|_| ())
    }

    pub async fn close(&self) {
        self.proxy.close().await;
    }
}
