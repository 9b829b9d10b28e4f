//! Property datatype registry and value coercion.
//!
//! Every read and write is typed by the declared datatype of the
//! (object type, property) pair. Reads turn wire values into
//! [`PropertyValue`]s; writes turn user literals into [`WireValue`]s.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};

use crate::error::{Error, Result};
use crate::object::{ObjectId, ObjectType, PropertyId};
use crate::value::{PropertyValue, WireValue};

/// Primitive application datatypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicType {
    Null,
    Boolean,
    Unsigned,
    Integer,
    Real,
    Double,
    OctetString,
    CharacterString,
    BitString,
    Enumerated,
    Date,
    Time,
    ObjectIdentifier,
}

impl AtomicType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Unsigned => "unsigned",
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Double => "double",
            Self::OctetString => "octet-string",
            Self::CharacterString => "character-string",
            Self::BitString => "bit-string",
            Self::Enumerated => "enumerated",
            Self::Date => "date",
            Self::Time => "time",
            Self::ObjectIdentifier => "object-identifier",
        }
    }
}

/// Element type of an array property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    Atomic(AtomicType),
    /// A constructed type such as `PriorityValue`; read-only through this codec.
    Constructed(&'static str),
}

/// Declared datatype of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    Atomic(AtomicType),
    /// The value carries its own tag; writes need a [`TypeCode`].
    AnyAtomic,
    Array(ElementType),
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atomic(a) => f.write_str(a.name()),
            Self::AnyAtomic => f.write_str("any-atomic"),
            Self::Array(ElementType::Atomic(a)) => write!(f, "array of {}", a.name()),
            Self::Array(ElementType::Constructed(name)) => write!(f, "array of {}", name),
        }
    }
}

/// Short type codes naming the wire type of an any-atomic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCode {
    Boolean,
    Unsigned,
    Integer,
    Real,
    Double,
    OctetString,
    CharacterString,
    BitString,
    Date,
    Time,
    ObjectIdentifier,
}

impl TypeCode {
    pub fn atomic(self) -> AtomicType {
        match self {
            Self::Boolean => AtomicType::Boolean,
            Self::Unsigned => AtomicType::Unsigned,
            Self::Integer => AtomicType::Integer,
            Self::Real => AtomicType::Real,
            Self::Double => AtomicType::Double,
            Self::OctetString => AtomicType::OctetString,
            Self::CharacterString => AtomicType::CharacterString,
            Self::BitString => AtomicType::BitString,
            Self::Date => AtomicType::Date,
            Self::Time => AtomicType::Time,
            Self::ObjectIdentifier => AtomicType::ObjectIdentifier,
        }
    }
}

impl FromStr for TypeCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim() {
            "b" => Self::Boolean,
            "u" => Self::Unsigned,
            "i" => Self::Integer,
            "r" => Self::Real,
            "d" => Self::Double,
            "o" => Self::OctetString,
            "c" => Self::CharacterString,
            "bs" => Self::BitString,
            "date" => Self::Date,
            "time" => Self::Time,
            "id" => Self::ObjectIdentifier,
            other => {
                return Err(Error::type_mismatch(
                    "type code (b, u, i, r, d, o, c, bs, date, time, id)",
                    other,
                ));
            }
        })
    }
}

/// Datatype of the present value of an object type, if it has one.
pub fn present_value_type(object_type: ObjectType) -> Option<Datatype> {
    use AtomicType as A;
    use ObjectType as T;

    let atomic = match object_type {
        T::AnalogInput | T::AnalogOutput | T::AnalogValue | T::Loop | T::PulseConverter => A::Real,
        T::BinaryInput | T::BinaryOutput | T::BinaryValue => A::Enumerated,
        T::LifeSafetyPoint | T::LifeSafetyZone => A::Enumerated,
        T::MultiStateInput | T::MultiStateOutput | T::MultiStateValue => A::Unsigned,
        T::Accumulator | T::Command | T::PositiveIntegerValue => A::Unsigned,
        T::IntegerValue => A::Integer,
        T::LargeAnalogValue => A::Double,
        T::CharacterstringValue => A::CharacterString,
        T::OctetstringValue => A::OctetString,
        T::BitstringValue => A::BitString,
        T::DateValue => A::Date,
        T::TimeValue => A::Time,
        T::Calendar => A::Boolean,
        T::Schedule => return Some(Datatype::AnyAtomic),
        _ => return None,
    };
    Some(Datatype::Atomic(atomic))
}

/// Standard object types without a present value.
///
/// This is the default skip-set of the polling scheduler.
pub fn static_object_types() -> Vec<ObjectType> {
    ObjectType::standard()
        .filter(|t| present_value_type(*t).is_none())
        .collect()
}

fn is_commandable(object_type: ObjectType) -> bool {
    matches!(
        object_type,
        ObjectType::AnalogOutput
            | ObjectType::AnalogValue
            | ObjectType::BinaryOutput
            | ObjectType::BinaryValue
            | ObjectType::MultiStateOutput
            | ObjectType::MultiStateValue
    )
}

fn is_multi_state(object_type: ObjectType) -> bool {
    matches!(
        object_type,
        ObjectType::MultiStateInput | ObjectType::MultiStateOutput | ObjectType::MultiStateValue
    )
}

/// Look up the declared datatype of `property` on `object_type`.
///
/// `None` means the pair is not applicable; callers surface that as
/// [`Error::UnsupportedProperty`].
pub fn datatype(object_type: ObjectType, property: PropertyId) -> Option<Datatype> {
    use AtomicType as A;
    use ObjectType as T;
    use PropertyId as P;

    let has_value = present_value_type(object_type).is_some();
    let is_device = object_type == T::Device;
    let atomic = |a| Some(Datatype::Atomic(a));

    match property {
        P::ObjectIdentifier => atomic(A::ObjectIdentifier),
        P::ObjectName | P::Description | P::JciName => atomic(A::CharacterString),
        P::ObjectType => atomic(A::Enumerated),
        P::PresentValue => present_value_type(object_type),
        P::RelinquishDefault if is_commandable(object_type) => present_value_type(object_type),
        P::PriorityArray if is_commandable(object_type) => {
            Some(Datatype::Array(ElementType::Constructed("PriorityValue")))
        }
        P::StatusFlags if has_value => atomic(A::BitString),
        P::OutOfService if has_value => atomic(A::Boolean),
        P::Units
            if matches!(
                object_type,
                T::AnalogInput | T::AnalogOutput | T::AnalogValue | T::LargeAnalogValue
                    | T::IntegerValue | T::Accumulator | T::PulseConverter | T::Averaging
            ) =>
        {
            atomic(A::Enumerated)
        }
        P::DeviceType
            if matches!(
                object_type,
                T::AnalogInput | T::AnalogOutput | T::BinaryInput | T::BinaryOutput
                    | T::MultiStateInput | T::MultiStateOutput
            ) =>
        {
            atomic(A::CharacterString)
        }
        P::StateText if is_multi_state(object_type) => {
            Some(Datatype::Array(ElementType::Atomic(A::CharacterString)))
        }
        P::NumberOfStates if is_multi_state(object_type) => atomic(A::Unsigned),
        P::ObjectList if is_device => {
            Some(Datatype::Array(ElementType::Atomic(A::ObjectIdentifier)))
        }
        P::VendorName | P::ModelName | P::FirmwareRevision | P::Location if is_device => {
            atomic(A::CharacterString)
        }
        P::VendorIdentifier | P::MaxApduLengthAccepted if is_device => atomic(A::Unsigned),
        P::SegmentationSupported if is_device => atomic(A::Enumerated),
        // Vendor properties are not in the table; the acknowledgement tag decides.
        P::Other(_) => Some(Datatype::AnyAtomic),
        _ => None,
    }
}

fn require(object_type: ObjectType, property: PropertyId) -> Result<Datatype> {
    datatype(object_type, property).ok_or(Error::UnsupportedProperty {
        object_type,
        property,
    })
}

/// Decode a read acknowledgement according to the declared datatype.
///
/// For array properties, index 0 yields the element count, a positive index
/// yields one element and no index yields the whole array.
pub fn decode(
    object_type: ObjectType,
    property: PropertyId,
    index: Option<u32>,
    wire: WireValue,
) -> Result<PropertyValue> {
    match (require(object_type, property)?, index) {
        (Datatype::Array(_), Some(0)) => decode_atomic(AtomicType::Unsigned, wire),
        (Datatype::Array(element), Some(_)) => decode_element(element, wire),
        (Datatype::Array(element), None) => match wire {
            WireValue::Array(items) => items
                .into_iter()
                .map(|item| decode_element(element, item))
                .collect::<Result<Vec<_>>>()
                .map(PropertyValue::Array),
            other => Err(unexpected("array", &other)),
        },
        (Datatype::Atomic(atomic), _) => decode_atomic(atomic, wire),
        (Datatype::AnyAtomic, _) => decode_any(wire),
    }
}

fn decode_element(element: ElementType, wire: WireValue) -> Result<PropertyValue> {
    match element {
        ElementType::Atomic(atomic) => decode_atomic(atomic, wire),
        ElementType::Constructed(_) => decode_any(wire),
    }
}

fn decode_atomic(expected: AtomicType, wire: WireValue) -> Result<PropertyValue> {
    use AtomicType as A;

    Ok(match (expected, wire) {
        (_, WireValue::Null) => PropertyValue::Null,
        (A::Boolean, WireValue::Boolean(v)) => PropertyValue::Boolean(v),
        (A::Unsigned, WireValue::Unsigned(v)) => PropertyValue::Integer(
            i64::try_from(v).map_err(|_| Error::protocol(format!("unsigned {} out of range", v)))?,
        ),
        (A::Enumerated, WireValue::Enumerated(v)) => PropertyValue::Integer(i64::from(v)),
        (A::Integer, WireValue::Integer(v)) => PropertyValue::Integer(v),
        (A::Real, WireValue::Real(v)) => PropertyValue::Real(v),
        (A::Double, WireValue::Double(v)) => PropertyValue::Double(v),
        (A::OctetString, WireValue::OctetString(v)) => PropertyValue::OctetString(v),
        (A::CharacterString, WireValue::CharacterString(v)) => PropertyValue::CharacterString(v),
        (A::BitString, WireValue::BitString(v)) => PropertyValue::BitString(v),
        (A::Date, WireValue::Date(v)) => PropertyValue::Date(v),
        (A::Time, WireValue::Time(v)) => PropertyValue::Time(v),
        (A::ObjectIdentifier, WireValue::ObjectIdentifier(v)) => PropertyValue::ObjectIdentifier(v),
        (expected, other) => return Err(unexpected(expected.name(), &other)),
    })
}

fn decode_any(wire: WireValue) -> Result<PropertyValue> {
    let atomic = match &wire {
        WireValue::Null => return Ok(PropertyValue::Null),
        WireValue::Boolean(_) => AtomicType::Boolean,
        WireValue::Unsigned(_) => AtomicType::Unsigned,
        WireValue::Integer(_) => AtomicType::Integer,
        WireValue::Real(_) => AtomicType::Real,
        WireValue::Double(_) => AtomicType::Double,
        WireValue::OctetString(_) => AtomicType::OctetString,
        WireValue::CharacterString(_) => AtomicType::CharacterString,
        WireValue::BitString(_) => AtomicType::BitString,
        WireValue::Enumerated(_) => AtomicType::Enumerated,
        WireValue::Date(_) => AtomicType::Date,
        WireValue::Time(_) => AtomicType::Time,
        WireValue::ObjectIdentifier(_) => AtomicType::ObjectIdentifier,
        WireValue::Array(_) => return Err(unexpected("atomic value", &wire)),
    };
    decode_atomic(atomic, wire)
}

fn unexpected(expected: &str, got: &WireValue) -> Error {
    Error::protocol(format!(
        "malformed acknowledgement: expected {}, device returned {}",
        expected,
        got.kind()
    ))
}

/// Encode a write literal according to the declared datatype.
///
/// The literal `null` always encodes as a wire null, which relinquishes a
/// commanded priority slot.
pub fn encode(
    object_type: ObjectType,
    property: PropertyId,
    literal: &str,
    index: Option<u32>,
    type_code: Option<TypeCode>,
) -> Result<WireValue> {
    if literal == "null" {
        return Ok(WireValue::Null);
    }
    let datatype = require(object_type, property)?;

    match datatype {
        Datatype::Atomic(atomic) => parse_atomic(atomic, literal),
        Datatype::AnyAtomic => {
            let code = type_code.ok_or_else(|| {
                Error::type_mismatch("a type code for an any-atomic property", literal)
            })?;
            parse_atomic(code.atomic(), literal)
        }
        Datatype::Array(element) => match index {
            None => Err(Error::type_mismatch(
                format!("an array index for {}", datatype),
                literal,
            )),
            Some(0) => parse_atomic(AtomicType::Unsigned, literal),
            Some(_) => match element {
                ElementType::Atomic(atomic) => parse_atomic(atomic, literal),
                ElementType::Constructed(name) => Err(Error::type_mismatch(name, literal)),
            },
        },
    }
}

fn parse_atomic(atomic: AtomicType, literal: &str) -> Result<WireValue> {
    use AtomicType as A;

    let text = literal.trim();
    let mismatch = || Error::type_mismatch(atomic.name(), literal);

    Ok(match atomic {
        A::Null => match text {
            "null" => WireValue::Null,
            _ => return Err(mismatch()),
        },
        A::Boolean => WireValue::Boolean(parse_bool(text).ok_or_else(mismatch)?),
        A::Unsigned => WireValue::Unsigned(text.parse().map_err(|_| mismatch())?),
        A::Integer => WireValue::Integer(text.parse().map_err(|_| mismatch())?),
        A::Real => WireValue::Real(
            text.parse::<f32>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(mismatch)?,
        ),
        A::Double => WireValue::Double(
            text.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(mismatch)?,
        ),
        A::OctetString => WireValue::OctetString(parse_hex(text).ok_or_else(mismatch)?),
        A::CharacterString => WireValue::CharacterString(literal.to_string()),
        A::BitString => {
            if text.is_empty() || !text.chars().all(|c| c == '0' || c == '1') {
                return Err(mismatch());
            }
            WireValue::BitString(text.chars().map(|c| c == '1').collect())
        }
        A::Enumerated => WireValue::Enumerated(match text.to_ascii_lowercase().as_str() {
            "active" => 1,
            "inactive" => 0,
            other => other.parse().map_err(|_| mismatch())?,
        }),
        A::Date => WireValue::Date(
            NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| mismatch())?,
        ),
        A::Time => WireValue::Time(
            NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
                .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
                .map_err(|_| mismatch())?,
        ),
        A::ObjectIdentifier => {
            WireValue::ObjectIdentifier(text.parse::<ObjectId>().map_err(|_| mismatch())?)
        }
    })
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "1" | "active" | "on" => Some(true),
        "false" | "0" | "inactive" | "off" => Some(false),
        _ => None,
    }
}

fn parse_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| text.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}
