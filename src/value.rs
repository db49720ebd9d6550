//! Marshalling between D-Bus variants and typed property values.
//!
//! The bus delivers property values as dynamically typed variants. This
//! module narrows them into [`PropertyValue`], a tagged union over the value
//! space BlueZ-style services actually use: booleans, unsigned integers,
//! signed 16-bit integers (RSSI/TX power), strings, object paths, uniform
//! lists, and nested name→value maps for metadata-style properties.
//! Conversions are lossless in both directions.

use std::collections::HashMap;

use log::warn;
use serde::Serialize;
use zvariant::{OwnedObjectPath, OwnedValue, Value};

use crate::error::Error;

/// A generic name→value mapping, as carried by `GetAll` replies and
/// `PropertiesChanged` payloads.
pub type PropertyMap = HashMap<String, PropertyValue>;

/// A single property value in its typed, wire-independent form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PropertyValue {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    I16(i16),
    Str(String),
    ObjectPath(OwnedObjectPath),
    /// A uniform or mixed sequence of values.
    List(Vec<PropertyValue>),
    /// A nested name→value map (`a{sv}` on the wire).
    Map(PropertyMap),
}

impl PropertyValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            PropertyValue::U8(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            PropertyValue::U16(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            PropertyValue::U32(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self {
            PropertyValue::I16(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object_path(&self) -> Option<&OwnedObjectPath> {
        match self {
            PropertyValue::ObjectPath(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[PropertyValue]> {
        match self {
            PropertyValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&PropertyMap> {
        match self {
            PropertyValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Narrows a list of strings (`as` on the wire, e.g. UUID lists).
    ///
    /// Returns `None` if the value is not a list or any element is not a
    /// string.
    pub fn as_string_list(&self) -> Option<Vec<String>> {
        let items = self.as_list()?;
        items
            .iter()
            .map(|v| v.as_str().map(str::to_owned))
            .collect()
    }

    /// Short type tag used in decode-error messages.
    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Bool(_) => "bool",
            PropertyValue::U8(_) => "u8",
            PropertyValue::U16(_) => "u16",
            PropertyValue::U32(_) => "u32",
            PropertyValue::I16(_) => "i16",
            PropertyValue::Str(_) => "string",
            PropertyValue::ObjectPath(_) => "object path",
            PropertyValue::List(_) => "list",
            PropertyValue::Map(_) => "map",
        }
    }
}

impl TryFrom<&Value<'_>> for PropertyValue {
    type Error = Error;

    fn try_from(value: &Value<'_>) -> Result<Self, Error> {
        match value {
            Value::Bool(b) => Ok(PropertyValue::Bool(*b)),
            Value::U8(n) => Ok(PropertyValue::U8(*n)),
            Value::U16(n) => Ok(PropertyValue::U16(*n)),
            Value::U32(n) => Ok(PropertyValue::U32(*n)),
            Value::I16(n) => Ok(PropertyValue::I16(*n)),
            Value::Str(s) => Ok(PropertyValue::Str(s.as_str().to_owned())),
            Value::ObjectPath(p) => Ok(PropertyValue::ObjectPath(p.to_owned().into())),
            // Variants are unwrapped transparently; the engine never needs
            // to know a value arrived boxed.
            Value::Value(inner) => PropertyValue::try_from(&**inner),
            Value::Array(_) => {
                let items: Vec<OwnedValue> = value
                    .try_clone()
                    .map_err(|e| Error::decode("array value", e))?
                    .downcast()
                    .map_err(|e| Error::decode("array value", e))?;
                let converted = items
                    .iter()
                    .map(|v| PropertyValue::try_from(&**v))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(PropertyValue::List(converted))
            }
            Value::Dict(_) => {
                let entries: HashMap<String, OwnedValue> = value
                    .try_clone()
                    .map_err(|e| Error::decode("dict value", e))?
                    .downcast()
                    .map_err(|e| Error::decode("dict value", e))?;
                let mut map = PropertyMap::with_capacity(entries.len());
                for (name, v) in &entries {
                    map.insert(name.clone(), PropertyValue::try_from(&**v)?);
                }
                Ok(PropertyValue::Map(map))
            }
            other => Err(Error::decode(
                "wire value",
                format!("unsupported D-Bus type: {other:?}"),
            )),
        }
    }
}

impl TryFrom<&OwnedValue> for PropertyValue {
    type Error = Error;

    fn try_from(value: &OwnedValue) -> Result<Self, Error> {
        PropertyValue::try_from(&**value)
    }
}

impl From<&PropertyValue> for Value<'static> {
    fn from(value: &PropertyValue) -> Self {
        match value {
            PropertyValue::Bool(b) => Value::from(*b),
            PropertyValue::U8(n) => Value::from(*n),
            PropertyValue::U16(n) => Value::from(*n),
            PropertyValue::U32(n) => Value::from(*n),
            PropertyValue::I16(n) => Value::from(*n),
            PropertyValue::Str(s) => Value::from(s.clone()),
            PropertyValue::ObjectPath(p) => Value::ObjectPath((**p).clone()),
            PropertyValue::List(items) => {
                // Uniform string lists keep their natural `as` signature;
                // anything else travels as an array of variants.
                if items.iter().all(|i| matches!(i, PropertyValue::Str(_))) {
                    let strings: Vec<String> = items
                        .iter()
                        .filter_map(|i| i.as_str().map(str::to_owned))
                        .collect();
                    Value::from(strings)
                } else {
                    // Elements serialized under the `v` signature are
                    // wrapped by the serializer; no explicit boxing here.
                    let variants: Vec<Value<'static>> =
                        items.iter().map(Value::from).collect();
                    Value::from(variants)
                }
            }
            PropertyValue::Map(m) => {
                let entries: HashMap<String, Value<'static>> = m
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from(v)))
                    .collect();
                Value::from(entries)
            }
        }
    }
}

impl From<PropertyValue> for Value<'static> {
    fn from(value: PropertyValue) -> Self {
        Value::from(&value)
    }
}

/// The zero value for object-path fields (the bus has no empty path).
pub(crate) fn zero_object_path() -> OwnedObjectPath {
    zvariant::ObjectPath::from_static_str_unchecked("/").into()
}

/// Decodes a raw `name → variant` map into a [`PropertyMap`].
///
/// Entries whose values cannot be represented (file descriptors, non-string
/// dict keys) are dropped with a warning; the rest of the map is kept.
pub(crate) fn decode_value_map(raw: &HashMap<String, OwnedValue>) -> PropertyMap {
    let mut map = PropertyMap::with_capacity(raw.len());
    for (name, value) in raw {
        match PropertyValue::try_from(value) {
            Ok(v) => {
                map.insert(name.clone(), v);
            }
            Err(e) => warn!("Dropping undecodable value for '{name}': {e}"),
        }
    }
    map
}
