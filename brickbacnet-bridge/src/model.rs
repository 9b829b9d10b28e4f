//! Metadata and timeseries records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::object::{ObjectId, ObjectType};
use crate::transport::Segmentation;
use crate::value::PropertyValue;

/// A discovered BACnet device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub device_id: u32,
    /// `a.b.c.d:port`
    pub address: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub vendor_id: u16,
    pub max_apdu: u32,
    pub segmentation: Segmentation,
    /// Number of entries in the device's object list, if it could be read.
    pub object_count: Option<u32>,
    /// Vendor-specific point name (`jciName`).
    pub vendor_name: Option<String>,
    pub uuid: Option<Uuid>,
}

/// A device row together with the instances of its stored points.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRecord {
    pub device: Device,
    pub version: String,
    pub instances: Vec<u32>,
}

/// One object on a device, as stored in the metadata store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPoint {
    pub device_id: u32,
    pub instance: u32,
    pub object_type: ObjectType,
    pub description: Option<String>,
    pub vendor_name: Option<String>,
    /// `deviceType` property, e.g. the sensor kind.
    pub sensor_type: Option<String>,
    pub unit: Option<String>,
    /// Configured extra properties; `null` where the read failed.
    pub custom_fields: BTreeMap<String, serde_json::Value>,
    pub uuid: Option<Uuid>,
}

impl DataPoint {
    pub fn object_id(&self) -> ObjectId {
        ObjectId::new(self.object_type, self.instance)
    }

    /// `analog-input:3@1001`
    pub fn source_id(&self) -> String {
        self.object_id().source_id(self.device_id)
    }
}

/// One polled present value.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub uuid: Uuid,
    pub object_type: ObjectType,
    pub timestamp: DateTime<Utc>,
    /// `None` when the object does not support a present value.
    pub value: Option<PropertyValue>,
}
