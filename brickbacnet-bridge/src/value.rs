//! Wire-level and decoded property values.

use std::fmt;

use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;

use crate::object::ObjectId;

/// An application-tagged value as it travels on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Null,
    Boolean(bool),
    Unsigned(u64),
    Integer(i64),
    Real(f32),
    Double(f64),
    OctetString(Vec<u8>),
    CharacterString(String),
    BitString(Vec<bool>),
    Enumerated(u32),
    Date(NaiveDate),
    Time(NaiveTime),
    ObjectIdentifier(ObjectId),
    /// Sequence of values, as returned for a whole-array read.
    Array(Vec<WireValue>),
}

impl WireValue {
    /// Tag name used in protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Unsigned(_) => "unsigned",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Double(_) => "double",
            Self::OctetString(_) => "octet-string",
            Self::CharacterString(_) => "character-string",
            Self::BitString(_) => "bit-string",
            Self::Enumerated(_) => "enumerated",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::ObjectIdentifier(_) => "object-identifier",
            Self::Array(_) => "array",
        }
    }
}

/// A decoded property value as handed to discovery, polling and the sink.
///
/// Unsigned and enumerated wire values both surface as [`PropertyValue::Integer`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f32),
    Double(f64),
    OctetString(Vec<u8>),
    CharacterString(String),
    BitString(Vec<bool>),
    Date(NaiveDate),
    Time(NaiveTime),
    ObjectIdentifier(ObjectId),
    Array(Vec<PropertyValue>),
}

impl PropertyValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_object_id(&self) -> Option<ObjectId> {
        match self {
            Self::ObjectIdentifier(id) => Some(*id),
            _ => None,
        }
    }

    /// Text form for metadata columns, `None` for null.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::CharacterString(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// JSON form stored in custom metadata fields.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Boolean(v) => write!(f, "{}", v),
            Self::Integer(v) => write!(f, "{}", v),
            Self::Real(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::OctetString(bytes) => {
                for b in bytes {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
            Self::CharacterString(s) => f.write_str(s),
            Self::BitString(bits) => {
                for bit in bits {
                    f.write_str(if *bit { "1" } else { "0" })?;
                }
                Ok(())
            }
            Self::Date(d) => write!(f, "{}", d),
            Self::Time(t) => write!(f, "{}", t),
            Self::ObjectIdentifier(id) => write!(f, "{}", id),
            Self::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectType;

    #[test]
    fn test_text_forms() {
        assert_eq!(PropertyValue::Null.to_text(), None);
        assert_eq!(
            PropertyValue::CharacterString("Zone Temp".into()).to_text().as_deref(),
            Some("Zone Temp")
        );
        assert_eq!(PropertyValue::BitString(vec![true, false, false, true]).to_string(), "1001");
        assert_eq!(PropertyValue::OctetString(vec![0x0a, 0xff]).to_string(), "0aff");
    }

    #[test]
    fn test_json_form() {
        let value = PropertyValue::Array(vec![
            PropertyValue::Real(21.5),
            PropertyValue::Null,
            PropertyValue::ObjectIdentifier(ObjectId::new(ObjectType::AnalogInput, 1)),
        ]);
        assert_eq!(
            value.to_json(),
            serde_json::json!([21.5, null, "analog-input:1"])
        );
    }
}
