//! BACnet object identifiers, object types, property identifiers and
//! engineering units.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// BACnet object type.
///
/// Standard types carry their canonical kebab-case name; anything else is kept
/// as a raw code so vendor objects survive discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectType {
    AnalogInput,
    AnalogOutput,
    AnalogValue,
    BinaryInput,
    BinaryOutput,
    BinaryValue,
    Calendar,
    Command,
    Device,
    EventEnrollment,
    File,
    Group,
    Loop,
    MultiStateInput,
    MultiStateOutput,
    NotificationClass,
    Program,
    Schedule,
    Averaging,
    MultiStateValue,
    TrendLog,
    LifeSafetyPoint,
    LifeSafetyZone,
    Accumulator,
    PulseConverter,
    EventLog,
    TrendLogMultiple,
    StructuredView,
    BitstringValue,
    CharacterstringValue,
    DateValue,
    IntegerValue,
    LargeAnalogValue,
    OctetstringValue,
    PositiveIntegerValue,
    TimeValue,
    NetworkPort,
    /// Any code without a standard name.
    Proprietary(u16),
}

const OBJECT_TYPES: &[(ObjectType, u16, &str)] = &[
    (ObjectType::AnalogInput, 0, "analog-input"),
    (ObjectType::AnalogOutput, 1, "analog-output"),
    (ObjectType::AnalogValue, 2, "analog-value"),
    (ObjectType::BinaryInput, 3, "binary-input"),
    (ObjectType::BinaryOutput, 4, "binary-output"),
    (ObjectType::BinaryValue, 5, "binary-value"),
    (ObjectType::Calendar, 6, "calendar"),
    (ObjectType::Command, 7, "command"),
    (ObjectType::Device, 8, "device"),
    (ObjectType::EventEnrollment, 9, "event-enrollment"),
    (ObjectType::File, 10, "file"),
    (ObjectType::Group, 11, "group"),
    (ObjectType::Loop, 12, "loop"),
    (ObjectType::MultiStateInput, 13, "multi-state-input"),
    (ObjectType::MultiStateOutput, 14, "multi-state-output"),
    (ObjectType::NotificationClass, 15, "notification-class"),
    (ObjectType::Program, 16, "program"),
    (ObjectType::Schedule, 17, "schedule"),
    (ObjectType::Averaging, 18, "averaging"),
    (ObjectType::MultiStateValue, 19, "multi-state-value"),
    (ObjectType::TrendLog, 20, "trend-log"),
    (ObjectType::LifeSafetyPoint, 21, "life-safety-point"),
    (ObjectType::LifeSafetyZone, 22, "life-safety-zone"),
    (ObjectType::Accumulator, 23, "accumulator"),
    (ObjectType::PulseConverter, 24, "pulse-converter"),
    (ObjectType::EventLog, 25, "event-log"),
    (ObjectType::TrendLogMultiple, 27, "trend-log-multiple"),
    (ObjectType::StructuredView, 29, "structured-view"),
    (ObjectType::BitstringValue, 39, "bitstring-value"),
    (ObjectType::CharacterstringValue, 40, "characterstring-value"),
    (ObjectType::DateValue, 42, "date-value"),
    (ObjectType::IntegerValue, 45, "integer-value"),
    (ObjectType::LargeAnalogValue, 46, "large-analog-value"),
    (ObjectType::OctetstringValue, 47, "octetstring-value"),
    (ObjectType::PositiveIntegerValue, 48, "positive-integer-value"),
    (ObjectType::TimeValue, 50, "time-value"),
    (ObjectType::NetworkPort, 56, "network-port"),
];

impl ObjectType {
    /// Map a numeric object type code.
    pub fn from_code(code: u16) -> Self {
        OBJECT_TYPES
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(t, _, _)| *t)
            .unwrap_or(Self::Proprietary(code))
    }

    /// Numeric object type code.
    pub fn code(self) -> u16 {
        match self {
            Self::Proprietary(code) => code,
            known => OBJECT_TYPES
                .iter()
                .find(|(t, _, _)| *t == known)
                .map(|(_, c, _)| *c)
                .unwrap_or_default(),
        }
    }

    /// Every standard object type.
    pub fn standard() -> impl Iterator<Item = ObjectType> {
        OBJECT_TYPES.iter().map(|(t, _, _)| *t)
    }

    fn name(self) -> Option<&'static str> {
        OBJECT_TYPES
            .iter()
            .find(|(t, _, _)| *t == self)
            .map(|(_, _, n)| *n)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "proprietary-{}", self.code()),
        }
    }
}

impl FromStr for ObjectType {
    type Err = Error;

    /// Accepts `analog-input`, `analogInput`, `proprietary-513` or a bare code.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(code) = s.parse::<u16>() {
            return Ok(Self::from_code(code));
        }
        if let Some(code) = s.strip_prefix("proprietary-") {
            let code = code
                .parse::<u16>()
                .map_err(|_| Error::type_mismatch("object type", s))?;
            return Ok(Self::from_code(code));
        }

        let wanted = normalize(s);
        OBJECT_TYPES
            .iter()
            .find(|(_, _, name)| normalize(name) == wanted)
            .map(|(t, _, _)| *t)
            .ok_or_else(|| Error::type_mismatch("object type", s))
    }
}

impl Serialize for ObjectType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Object identifier: an object type plus instance number.
///
/// Text form is `analog-input:3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub object_type: ObjectType,
    pub instance: u32,
}

impl ObjectId {
    /// Largest valid instance number (22 bits).
    pub const MAX_INSTANCE: u32 = 0x3F_FFFF;

    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type,
            instance,
        }
    }

    /// Identifier of the device object of `device_id`.
    pub fn device(device_id: u32) -> Self {
        Self::new(ObjectType::Device, device_id)
    }

    /// Stable source identifier used in logs and the sink: `analog-input:3@1001`.
    pub fn source_id(&self, device_id: u32) -> String {
        format!("{}@{}", self, device_id)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.instance)
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (object_type, instance) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::type_mismatch("object identifier 'type:instance'", s))?;
        let instance = instance
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|i| *i <= Self::MAX_INSTANCE)
            .ok_or_else(|| Error::type_mismatch("object instance", s))?;
        Ok(Self::new(object_type.parse()?, instance))
    }
}

impl Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// BACnet property identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PropertyId {
    Description,
    FirmwareRevision,
    Location,
    MaxApduLengthAccepted,
    ModelName,
    NumberOfStates,
    ObjectIdentifier,
    ObjectList,
    ObjectName,
    ObjectType,
    OutOfService,
    PresentValue,
    PriorityArray,
    RelinquishDefault,
    SegmentationSupported,
    StateText,
    StatusFlags,
    DeviceType,
    Units,
    VendorIdentifier,
    VendorName,
    /// Johnson Controls vendor property carrying the controller's point name.
    JciName,
    /// Any other numeric property identifier.
    Other(u32),
}

const PROPERTIES: &[(PropertyId, u32, &str)] = &[
    (PropertyId::Description, 28, "description"),
    (PropertyId::DeviceType, 31, "deviceType"),
    (PropertyId::FirmwareRevision, 44, "firmwareRevision"),
    (PropertyId::Location, 58, "location"),
    (PropertyId::MaxApduLengthAccepted, 62, "maxApduLengthAccepted"),
    (PropertyId::ModelName, 70, "modelName"),
    (PropertyId::NumberOfStates, 74, "numberOfStates"),
    (PropertyId::ObjectIdentifier, 75, "objectIdentifier"),
    (PropertyId::ObjectList, 76, "objectList"),
    (PropertyId::ObjectName, 77, "objectName"),
    (PropertyId::ObjectType, 79, "objectType"),
    (PropertyId::OutOfService, 81, "outOfService"),
    (PropertyId::PresentValue, 85, "presentValue"),
    (PropertyId::PriorityArray, 87, "priorityArray"),
    (PropertyId::RelinquishDefault, 104, "relinquishDefault"),
    (PropertyId::SegmentationSupported, 107, "segmentationSupported"),
    (PropertyId::StateText, 110, "stateText"),
    (PropertyId::StatusFlags, 111, "statusFlags"),
    (PropertyId::Units, 117, "units"),
    (PropertyId::VendorIdentifier, 120, "vendorIdentifier"),
    (PropertyId::VendorName, 121, "vendorName"),
    (PropertyId::JciName, 2390, "jciName"),
];

impl PropertyId {
    pub fn from_code(code: u32) -> Self {
        PROPERTIES
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(p, _, _)| *p)
            .unwrap_or(Self::Other(code))
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Other(code) => code,
            known => PROPERTIES
                .iter()
                .find(|(p, _, _)| *p == known)
                .map(|(_, c, _)| *c)
                .unwrap_or_default(),
        }
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match PROPERTIES.iter().find(|(p, _, _)| p == self) {
            Some((_, _, name)) => f.write_str(name),
            None => write!(f, "property-{}", self.code()),
        }
    }
}

impl FromStr for PropertyId {
    type Err = Error;

    /// Accepts `presentValue`, `present-value`, `property-2390` or a bare code.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let numeric = s.strip_prefix("property-").unwrap_or(s);
        if let Ok(code) = numeric.parse::<u32>() {
            return Ok(Self::from_code(code));
        }

        let wanted = normalize(s);
        PROPERTIES
            .iter()
            .find(|(_, _, name)| normalize(name) == wanted)
            .map(|(p, _, _)| *p)
            .ok_or_else(|| Error::type_mismatch("property identifier", s))
    }
}

impl Serialize for PropertyId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PropertyId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

const UNITS: &[(i64, &str)] = &[
    (3, "amperes"),
    (5, "volts"),
    (19, "kilowatt-hours"),
    (29, "percent-relative-humidity"),
    (47, "watts"),
    (48, "kilowatts"),
    (53, "pascals"),
    (62, "degrees-celsius"),
    (64, "degrees-fahrenheit"),
    (72, "seconds"),
    (84, "cubic-feet-per-minute"),
    (87, "liters-per-second"),
    (95, "no-units"),
    (96, "parts-per-million"),
    (98, "percent"),
    (116, "inches-of-water"),
];

/// Name of an engineering-units code, falling back to the numeric code.
pub fn unit_name(code: i64) -> String {
    UNITS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, n)| n.to_string())
        .unwrap_or_else(|| code.to_string())
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_type_codes() {
        assert_eq!(ObjectType::from_code(0), ObjectType::AnalogInput);
        assert_eq!(ObjectType::from_code(19), ObjectType::MultiStateValue);
        assert_eq!(ObjectType::from_code(513), ObjectType::Proprietary(513));
        assert_eq!(ObjectType::Proprietary(513).code(), 513);
        assert_eq!(ObjectType::Device.code(), 8);
    }

    #[test]
    fn test_object_type_names() {
        assert_eq!(ObjectType::MultiStateInput.to_string(), "multi-state-input");
        assert_eq!(ObjectType::Proprietary(600).to_string(), "proprietary-600");

        for spelling in ["analog-value", "analogValue", "ANALOG_VALUE", "2"] {
            assert_eq!(spelling.parse::<ObjectType>().unwrap(), ObjectType::AnalogValue);
        }
        assert_eq!(
            "proprietary-600".parse::<ObjectType>().unwrap(),
            ObjectType::Proprietary(600)
        );
        assert!("thermostat".parse::<ObjectType>().is_err());
    }

    #[test]
    fn test_object_id_text_form() {
        let id: ObjectId = "analog-input:3".parse().unwrap();
        assert_eq!(id, ObjectId::new(ObjectType::AnalogInput, 3));
        assert_eq!(id.to_string(), "analog-input:3");
        assert_eq!(id.source_id(1001), "analog-input:3@1001");

        assert!("analog-input".parse::<ObjectId>().is_err());
        assert!("analog-input:x".parse::<ObjectId>().is_err());
        assert!("analog-input:4194304".parse::<ObjectId>().is_err());
    }

    #[test]
    fn test_object_id_serde() {
        let id = ObjectId::device(1001);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"device:1001\"");
        let back: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_property_ids() {
        assert_eq!("presentValue".parse::<PropertyId>().unwrap(), PropertyId::PresentValue);
        assert_eq!("present-value".parse::<PropertyId>().unwrap(), PropertyId::PresentValue);
        assert_eq!("jciName".parse::<PropertyId>().unwrap(), PropertyId::JciName);
        assert_eq!(PropertyId::JciName.code(), 2390);
        assert_eq!("4001".parse::<PropertyId>().unwrap(), PropertyId::Other(4001));
        assert_eq!(PropertyId::Other(4001).to_string(), "property-4001");
        assert!("colour".parse::<PropertyId>().is_err());
    }

    #[test]
    fn test_unit_names() {
        assert_eq!(unit_name(62), "degrees-celsius");
        assert_eq!(unit_name(9999), "9999");
    }
}
