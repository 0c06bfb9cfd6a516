//! Typed property values.
//!
//! A row is a bag of named scalar properties. Every value stored in the remote
//! table has one of the kinds below; decimals are not a storage kind and travel
//! as doubles (see [`crate::entity`]).
//!
//! # Supported Types
//!
//! - **String**: UTF-8 text
//! - **Binary**: raw bytes (base64 in JSON dumps)
//! - **Int32** / **Int64**: signed integers
//! - **Double**: 64-bit floating point
//! - **Boolean**: true or false
//! - **DateTime**: UTC timestamp
//! - **Guid**: 128-bit UUID
//!
//! `Null` is never persisted. It marks an absent value: insert and replace
//! skip it, merge removes the stored property.
//!
//! Property names compare case-insensitively, so `Amount` and `amount` address
//! the same property.

use crate::error::{Error, Result};
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Storage kind of a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    String,
    Binary,
    Int32,
    Int64,
    Double,
    Boolean,
    DateTime,
    Guid,
}

impl ValueKind {
    /// Whether a member of this kind may act as a partition or row key
    pub fn is_key_compatible(self) -> bool {
        !matches!(self, ValueKind::Binary)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::String => "string",
            ValueKind::Binary => "binary",
            ValueKind::Int32 => "int32",
            ValueKind::Int64 => "int64",
            ValueKind::Double => "double",
            ValueKind::Boolean => "boolean",
            ValueKind::DateTime => "datetime",
            ValueKind::Guid => "guid",
        };
        f.write_str(name)
    }
}

/// A single property value of a row
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    String(String),
    Binary(Vec<u8>),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Boolean(bool),
    DateTime(DateTime<Utc>),
    Guid(Uuid),
}

impl PropertyValue {
    /// Check if value is null
    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    /// Storage kind, `None` for null
    pub fn kind(&self) -> Option<ValueKind> {
        Some(match self {
            PropertyValue::Null => return None,
            PropertyValue::String(_) => ValueKind::String,
            PropertyValue::Binary(_) => ValueKind::Binary,
            PropertyValue::Int32(_) => ValueKind::Int32,
            PropertyValue::Int64(_) => ValueKind::Int64,
            PropertyValue::Double(_) => ValueKind::Double,
            PropertyValue::Boolean(_) => ValueKind::Boolean,
            PropertyValue::DateTime(_) => ValueKind::DateTime,
            PropertyValue::Guid(_) => ValueKind::Guid,
        })
    }

    /// Get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as signed integer, widening int32
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int32(n) => Some(i64::from(*n)),
            PropertyValue::Int64(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as double, widening integers
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Double(d) => Some(*d),
            PropertyValue::Int32(n) => Some(f64::from(*n)),
            PropertyValue::Int64(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Get as boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Invariant key rendering.
    ///
    /// Datetimes use RFC 3339 UTC with nanosecond precision so that lexical
    /// order matches chronological order. Guids are hyphenated lowercase.
    pub fn to_key_string(&self) -> Result<String> {
        match self {
            PropertyValue::String(s) => Ok(s.clone()),
            PropertyValue::Int32(n) => Ok(n.to_string()),
            PropertyValue::Int64(n) => Ok(n.to_string()),
            PropertyValue::Double(d) => Ok(format!("{}", d)),
            PropertyValue::Boolean(b) => Ok(b.to_string()),
            PropertyValue::DateTime(dt) => Ok(dt.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            PropertyValue::Guid(g) => Ok(g.hyphenated().to_string()),
            PropertyValue::Null => Err(Error::Serialization(
                "null cannot be used as a key".to_string(),
            )),
            PropertyValue::Binary(_) => Err(Error::Serialization(
                "binary values cannot be used as a key".to_string(),
            )),
        }
    }

    /// Parse an invariant key string back into a value of `kind`
    pub fn parse_key(kind: ValueKind, key: &str) -> Result<PropertyValue> {
        let bad = |e: &dyn fmt::Display| {
            Error::Serialization(format!("cannot parse key '{}' as {}: {}", key, kind, e))
        };
        match kind {
            ValueKind::String => Ok(PropertyValue::String(key.to_string())),
            ValueKind::Int32 => key.parse().map(PropertyValue::Int32).map_err(|e| bad(&e)),
            ValueKind::Int64 => key.parse().map(PropertyValue::Int64).map_err(|e| bad(&e)),
            ValueKind::Double => key.parse().map(PropertyValue::Double).map_err(|e| bad(&e)),
            ValueKind::Boolean => match key.to_ascii_lowercase().as_str() {
                "true" => Ok(PropertyValue::Boolean(true)),
                "false" => Ok(PropertyValue::Boolean(false)),
                _ => Err(bad(&"expected true or false")),
            },
            ValueKind::DateTime => DateTime::parse_from_rfc3339(key)
                .map(|dt| PropertyValue::DateTime(dt.with_timezone(&Utc)))
                .map_err(|e| bad(&e)),
            ValueKind::Guid => Uuid::parse_str(key)
                .map(PropertyValue::Guid)
                .map_err(|e| bad(&e)),
            ValueKind::Binary => Err(bad(&"binary is not key-compatible")),
        }
    }

    /// Ordering between values of comparable kinds.
    ///
    /// Numbers compare across int32/int64/double; everything else only within
    /// its own kind. Returns `None` for incomparable pairs.
    pub fn compare(&self, other: &PropertyValue) -> Option<Ordering> {
        use PropertyValue as V;
        match (self, other) {
            (V::String(a), V::String(b)) => Some(a.as_str().cmp(b.as_str())),
            (V::Binary(a), V::Binary(b)) => Some(a.cmp(b)),
            (V::Boolean(a), V::Boolean(b)) => Some(a.cmp(b)),
            (V::DateTime(a), V::DateTime(b)) => Some(a.cmp(b)),
            (V::Guid(a), V::Guid(b)) => Some(a.cmp(b)),
            (V::Int32(_) | V::Int64(_), V::Int32(_) | V::Int64(_)) => {
                Some(self.as_i64()?.cmp(&other.as_i64()?))
            }
            (
                V::Int32(_) | V::Int64(_) | V::Double(_),
                V::Int32(_) | V::Int64(_) | V::Double(_),
            ) => self.as_f64()?.partial_cmp(&other.as_f64()?),
            _ => None,
        }
    }
}

// Conversions
impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(b: Vec<u8>) -> Self {
        PropertyValue::Binary(b)
    }
}

impl From<i32> for PropertyValue {
    fn from(n: i32) -> Self {
        PropertyValue::Int32(n)
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        PropertyValue::Int64(n)
    }
}

impl From<f64> for PropertyValue {
    fn from(d: f64) -> Self {
        PropertyValue::Double(d)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Boolean(b)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(dt: DateTime<Utc>) -> Self {
        PropertyValue::DateTime(dt)
    }
}

impl From<Uuid> for PropertyValue {
    fn from(g: Uuid) -> Self {
        PropertyValue::Guid(g)
    }
}

impl From<&PropertyValue> for serde_json::Value {
    fn from(value: &PropertyValue) -> Self {
        match value {
            PropertyValue::Null => serde_json::Value::Null,
            PropertyValue::String(s) => serde_json::Value::String(s.clone()),
            PropertyValue::Binary(b) => serde_json::Value::String(
                base64::engine::general_purpose::STANDARD.encode(b),
            ),
            PropertyValue::Int32(n) => serde_json::Value::from(*n),
            PropertyValue::Int64(n) => serde_json::Value::from(*n),
            PropertyValue::Double(d) => serde_json::Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| serde_json::Value::String(d.to_string())),
            PropertyValue::Boolean(b) => serde_json::Value::Bool(*b),
            PropertyValue::DateTime(dt) => {
                serde_json::Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            PropertyValue::Guid(g) => serde_json::Value::String(g.to_string()),
        }
    }
}

impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serde_json::Value::from(self).serialize(serializer)
    }
}

/// Filter-literal rendering: `'text'`, `42`, `42L`, `1.5`, `true`,
/// `datetime'..'`, `guid'..'`, `binary'..'`.
impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Null => write!(f, "null"),
            PropertyValue::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            PropertyValue::Binary(b) => {
                write!(f, "binary'")?;
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                write!(f, "'")
            }
            PropertyValue::Int32(n) => write!(f, "{}", n),
            PropertyValue::Int64(n) => write!(f, "{}L", n),
            PropertyValue::Double(d) => {
                if d.fract() == 0.0 && d.is_finite() {
                    write!(f, "{:.1}", d)
                } else {
                    write!(f, "{}", d)
                }
            }
            PropertyValue::Boolean(b) => write!(f, "{}", b),
            PropertyValue::DateTime(dt) => write!(
                f,
                "datetime'{}'",
                dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
            ),
            PropertyValue::Guid(g) => write!(f, "guid'{}'", g),
        }
    }
}

/// Case-insensitive property name
#[derive(Debug, Clone)]
pub struct PropertyName(String);

impl PropertyName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Name as originally spelled
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn folded(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.bytes().map(|b| b.to_ascii_lowercase())
    }
}

impl PartialEq for PropertyName {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for PropertyName {}

impl Hash for PropertyName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.folded() {
            state.write_u8(b);
        }
        state.write_u8(0xff);
    }
}

impl PartialOrd for PropertyName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PropertyName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.folded().cmp(other.folded())
    }
}

impl fmt::Display for PropertyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PropertyName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PropertyName {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Property bag of a row, keyed case-insensitively
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    entries: BTreeMap<PropertyName, PropertyValue>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.entries.get(&PropertyName::new(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&PropertyName::new(name))
    }

    /// Set a property, keeping nulls as removal markers.
    pub fn set(&mut self, name: impl Into<PropertyName>, value: PropertyValue) {
        let name = name.into();
        // replace the key too, so the latest spelling wins
        self.entries.remove(&name);
        self.entries.insert(name, value);
    }

    /// Drop null markers
    pub fn without_nulls(mut self) -> Self {
        self.entries.retain(|_, v| !v.is_null());
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.entries.remove(&PropertyName::new(name))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PropertyName, &PropertyValue)> {
        self.entries.iter()
    }
}

impl FromIterator<(PropertyName, PropertyValue)> for Properties {
    fn from_iter<I: IntoIterator<Item = (PropertyName, PropertyValue)>>(iter: I) -> Self {
        let mut props = Properties::new();
        for (name, value) in iter {
            props.set(name, value);
        }
        props
    }
}

impl Serialize for Properties {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name.as_str(), value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_property_names_ignore_case() {
        let mut props = Properties::new();
        props.set("Amount", PropertyValue::Double(1.5));
        props.set("amount", PropertyValue::Double(2.5));

        assert_eq!(props.len(), 1);
        assert_eq!(props.get("AMOUNT"), Some(&PropertyValue::Double(2.5)));

        props.set("AMOUNT", PropertyValue::Null);
        assert_eq!(props.get("amount"), Some(&PropertyValue::Null));
        assert!(props.without_nulls().is_empty());
    }

    #[test]
    fn test_datetime_keys_sort_chronologically() {
        let early = PropertyValue::DateTime(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap());
        let late = PropertyValue::DateTime(
            Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap() + chrono::Duration::milliseconds(5),
        );
        let a = early.to_key_string().unwrap();
        let b = late.to_key_string().unwrap();
        assert!(a < b);
        assert_eq!(PropertyValue::parse_key(ValueKind::DateTime, &b).unwrap(), late);
    }

    #[test]
    fn test_key_parsing_rejects_garbage() {
        assert!(PropertyValue::parse_key(ValueKind::Int32, "twelve").is_err());
        assert!(PropertyValue::parse_key(ValueKind::Guid, "not-a-guid").is_err());
        assert_eq!(
            PropertyValue::parse_key(ValueKind::Boolean, "True").unwrap(),
            PropertyValue::Boolean(true)
        );
    }

    #[test]
    fn test_numeric_comparison_across_kinds() {
        let a = PropertyValue::Int32(3);
        let b = PropertyValue::Double(3.5);
        assert_eq!(a.compare(&b), Some(Ordering::Less));
        assert_eq!(a.compare(&PropertyValue::String("3".into())), None);
    }

    #[test]
    fn test_json_dump_encodes_binary_as_base64() {
        let mut props = Properties::new();
        props.set("Blob", PropertyValue::Binary(vec![1, 2, 3]));
        let json = serde_json::to_value(&props).unwrap();
        assert_eq!(json["Blob"], serde_json::json!("AQID"));
    }

    #[test]
    fn test_literal_rendering() {
        assert_eq!(PropertyValue::from("o'neil").to_string(), "'o''neil'");
        assert_eq!(PropertyValue::Int64(7).to_string(), "7L");
        assert_eq!(PropertyValue::Double(2.0).to_string(), "2.0");
    }
}
