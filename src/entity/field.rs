//! Member types an entity may map.

use crate::error::{Error, Result};
use crate::value::{PropertyValue, ValueKind};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;
use uuid::Uuid;

/// A Rust type that can be stored as a row property.
///
/// Types without an implementation cannot be registered, so unsupported member
/// types are rejected when the entity is compiled rather than at runtime.
pub trait EntityField: Sized + Send + Sync + 'static {
    /// Storage kind the member is written as
    const KIND: ValueKind;

    /// `Option<_>` members; never usable as keys
    const NULLABLE: bool = false;

    fn to_value(&self) -> PropertyValue;

    fn from_value(value: &PropertyValue) -> Result<Self>;

    /// Invariant key string
    fn to_key(&self) -> Result<String> {
        self.to_value().to_key_string()
    }

    fn from_key(key: &str) -> Result<Self> {
        Self::from_value(&PropertyValue::parse_key(Self::KIND, key)?)
    }
}

fn mismatch(expected: ValueKind, got: &PropertyValue) -> Error {
    match got.kind() {
        Some(kind) => Error::Serialization(format!("expected {} value, found {}", expected, kind)),
        None => Error::Serialization(format!("expected {} value, found null", expected)),
    }
}

impl EntityField for String {
    const KIND: ValueKind = ValueKind::String;

    fn to_value(&self) -> PropertyValue {
        PropertyValue::String(self.clone())
    }

    fn from_value(value: &PropertyValue) -> Result<Self> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| mismatch(Self::KIND, value))
    }
}

impl EntityField for Vec<u8> {
    const KIND: ValueKind = ValueKind::Binary;

    fn to_value(&self) -> PropertyValue {
        PropertyValue::Binary(self.clone())
    }

    fn from_value(value: &PropertyValue) -> Result<Self> {
        match value {
            PropertyValue::Binary(b) => Ok(b.clone()),
            other => Err(mismatch(Self::KIND, other)),
        }
    }
}

impl EntityField for i32 {
    const KIND: ValueKind = ValueKind::Int32;

    fn to_value(&self) -> PropertyValue {
        PropertyValue::Int32(*self)
    }

    fn from_value(value: &PropertyValue) -> Result<Self> {
        let wide = value.as_i64().ok_or_else(|| mismatch(Self::KIND, value))?;
        i32::try_from(wide)
            .map_err(|_| Error::Serialization(format!("{} does not fit in int32", wide)))
    }
}

impl EntityField for i64 {
    const KIND: ValueKind = ValueKind::Int64;

    fn to_value(&self) -> PropertyValue {
        PropertyValue::Int64(*self)
    }

    fn from_value(value: &PropertyValue) -> Result<Self> {
        value.as_i64().ok_or_else(|| mismatch(Self::KIND, value))
    }
}

impl EntityField for f64 {
    const KIND: ValueKind = ValueKind::Double;

    fn to_value(&self) -> PropertyValue {
        PropertyValue::Double(*self)
    }

    fn from_value(value: &PropertyValue) -> Result<Self> {
        value.as_f64().ok_or_else(|| mismatch(Self::KIND, value))
    }
}

impl EntityField for bool {
    const KIND: ValueKind = ValueKind::Boolean;

    fn to_value(&self) -> PropertyValue {
        PropertyValue::Boolean(*self)
    }

    fn from_value(value: &PropertyValue) -> Result<Self> {
        value.as_bool().ok_or_else(|| mismatch(Self::KIND, value))
    }
}

impl EntityField for DateTime<Utc> {
    const KIND: ValueKind = ValueKind::DateTime;

    fn to_value(&self) -> PropertyValue {
        PropertyValue::DateTime(*self)
    }

    fn from_value(value: &PropertyValue) -> Result<Self> {
        match value {
            PropertyValue::DateTime(dt) => Ok(*dt),
            other => Err(mismatch(Self::KIND, other)),
        }
    }
}

impl EntityField for Uuid {
    const KIND: ValueKind = ValueKind::Guid;

    fn to_value(&self) -> PropertyValue {
        PropertyValue::Guid(*self)
    }

    fn from_value(value: &PropertyValue) -> Result<Self> {
        match value {
            PropertyValue::Guid(g) => Ok(*g),
            PropertyValue::String(s) => Uuid::parse_str(s)
                .map_err(|e| Error::Serialization(format!("invalid guid '{}': {}", s, e))),
            other => Err(mismatch(Self::KIND, other)),
        }
    }
}

/// Decimals are stored as doubles.
///
/// Conversion goes through the shortest decimal text of the double, so any
/// decimal with up to 15 significant digits reads back exactly.
impl EntityField for Decimal {
    const KIND: ValueKind = ValueKind::Double;

    fn to_value(&self) -> PropertyValue {
        let double = f64::from_str(&self.to_string())
            .ok()
            .or_else(|| self.to_f64())
            .unwrap_or_default();
        PropertyValue::Double(double)
    }

    fn from_value(value: &PropertyValue) -> Result<Self> {
        match value {
            PropertyValue::Double(d) => Decimal::from_str(&format!("{}", d))
                .ok()
                .or_else(|| Decimal::from_f64_retain(*d))
                .ok_or_else(|| {
                    Error::Serialization(format!("{} is out of range for a decimal", d))
                }),
            PropertyValue::Int32(n) => Ok(Decimal::from(*n)),
            PropertyValue::Int64(n) => Ok(Decimal::from(*n)),
            other => Err(mismatch(Self::KIND, other)),
        }
    }

    fn to_key(&self) -> Result<String> {
        Ok(self.normalize().to_string())
    }

    fn from_key(key: &str) -> Result<Self> {
        Decimal::from_str(key)
            .map_err(|e| Error::Serialization(format!("cannot parse key '{}' as decimal: {}", key, e)))
    }
}

impl<F: EntityField> EntityField for Option<F> {
    const KIND: ValueKind = F::KIND;
    const NULLABLE: bool = true;

    fn to_value(&self) -> PropertyValue {
        match self {
            Some(inner) => inner.to_value(),
            None => PropertyValue::Null,
        }
    }

    fn from_value(value: &PropertyValue) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            F::from_value(value).map(Some)
        }
    }

    fn to_key(&self) -> Result<String> {
        match self {
            Some(inner) => inner.to_key(),
            None => Err(Error::Serialization("null cannot be used as a key".to_string())),
        }
    }

    fn from_key(key: &str) -> Result<Self> {
        F::from_key(key).map(Some)
    }
}
