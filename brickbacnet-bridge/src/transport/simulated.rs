//! In-process BACnet network.
//!
//! Devices answer ReadProperty, WriteProperty and Who-Is from a property
//! table. Faults can be injected per property and array index, and every
//! frame the gateway sends is recorded in a [`RequestLog`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::link::{ErrorClass, ErrorCode, Incoming, Link, LinkChannels, Outgoing, ServiceRequest};
use super::{ReadRequest, Segmentation, WriteRequest};
use crate::address::{self, Mac};
use crate::codec;
use crate::config::{SimDeviceConfig, SimObjectConfig};
use crate::error::Result;
use crate::object::{ObjectId, PropertyId};
use crate::value::WireValue;

const CHANNEL_CAPACITY: usize = 64;

/// An injected failure.
#[derive(Debug, Clone, PartialEq)]
pub enum SimFault {
    /// Drop the request; the caller times out.
    NoResponse,
    Reject,
    Error(ErrorClass, ErrorCode),
}

/// A simulated device.
#[derive(Debug, Clone)]
pub struct SimDevice {
    device_id: u32,
    mac: Mac,
    max_apdu: u32,
    segmentation: Segmentation,
    vendor_id: u16,
    announce: bool,
    properties: HashMap<(ObjectId, PropertyId), WireValue>,
    faults: HashMap<(ObjectId, PropertyId, Option<u32>), SimFault>,
}

impl SimDevice {
    /// A device with only its device object.
    pub fn new(device_id: u32, address: &str) -> Result<Self> {
        let mut device = Self {
            device_id,
            mac: address::decode(address)?,
            max_apdu: 1476,
            segmentation: Segmentation::Both,
            vendor_id: 0,
            announce: true,
            properties: HashMap::new(),
            faults: HashMap::new(),
        };

        let oid = ObjectId::device(device_id);
        device.insert_object(oid, &format!("Device {}", device_id));
        device.properties.insert(
            (oid, PropertyId::ObjectList),
            WireValue::Array(vec![WireValue::ObjectIdentifier(oid)]),
        );
        device.properties.insert(
            (oid, PropertyId::VendorIdentifier),
            WireValue::Unsigned(0),
        );
        Ok(device)
    }

    /// Build a device from its configuration entry.
    pub fn from_config(config: &SimDeviceConfig) -> Result<Self> {
        let mut device = Self::new(config.device_id, &config.address)?
            .with_vendor(config.vendor_id)
            .with_segmentation(config.segmentation);
        device.max_apdu = config.max_apdu;
        device.announce = config.announce;

        let oid = ObjectId::device(config.device_id);
        if let Some(name) = &config.name {
            device = device.with_property(oid, PropertyId::ObjectName, WireValue::CharacterString(name.clone()));
        }
        if let Some(description) = &config.description {
            device = device.with_property(
                oid,
                PropertyId::Description,
                WireValue::CharacterString(description.clone()),
            );
        }
        device.apply_properties(oid, &config.properties)?;

        for object in &config.objects {
            device.apply_object(object)?;
        }
        Ok(device)
    }

    fn apply_object(&mut self, config: &SimObjectConfig) -> Result<()> {
        let id = config.id;
        let name = config.name.clone().unwrap_or_else(|| id.to_string());
        self.add_object(id, &name);

        if let Some(description) = &config.description {
            self.properties.insert(
                (id, PropertyId::Description),
                WireValue::CharacterString(description.clone()),
            );
        }
        if let Some(units) = config.units {
            self.properties
                .insert((id, PropertyId::Units), WireValue::Enumerated(units));
        }
        if !config.present_value.is_null() {
            let literal = json_literal(&config.present_value);
            let value = codec::encode(id.object_type, PropertyId::PresentValue, &literal, None, None)?;
            self.properties.insert((id, PropertyId::PresentValue), value);
        }
        self.apply_properties(id, &config.properties)
    }

    fn apply_properties(
        &mut self,
        object: ObjectId,
        properties: &BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        for (name, value) in properties {
            let property: PropertyId = name.parse()?;
            let wire = codec::encode(object.object_type, property, &json_literal(value), None, None)?;
            self.properties.insert((object, property), wire);
        }
        Ok(())
    }

    pub fn with_vendor(mut self, vendor_id: u16) -> Self {
        self.vendor_id = vendor_id;
        self.properties.insert(
            (ObjectId::device(self.device_id), PropertyId::VendorIdentifier),
            WireValue::Unsigned(u64::from(vendor_id)),
        );
        self
    }

    pub fn with_segmentation(mut self, segmentation: Segmentation) -> Self {
        self.segmentation = segmentation;
        self
    }

    /// Add an object to the device and its object list.
    pub fn with_object(mut self, object: ObjectId, name: &str) -> Self {
        self.add_object(object, name);
        self
    }

    pub fn with_property(mut self, object: ObjectId, property: PropertyId, value: WireValue) -> Self {
        self.properties.insert((object, property), value);
        self
    }

    /// Make requests for `property` (at `index`) fail.
    pub fn with_fault(
        mut self,
        object: ObjectId,
        property: PropertyId,
        index: Option<u32>,
        fault: SimFault,
    ) -> Self {
        self.faults.insert((object, property, index), fault);
        self
    }

    /// Stop answering Who-Is.
    pub fn silent(mut self) -> Self {
        self.announce = false;
        self
    }

    pub fn address(&self) -> String {
        address::encode(&self.mac).unwrap_or_default()
    }

    fn insert_object(&mut self, object: ObjectId, name: &str) {
        self.properties.insert(
            (object, PropertyId::ObjectIdentifier),
            WireValue::ObjectIdentifier(object),
        );
        self.properties.insert(
            (object, PropertyId::ObjectName),
            WireValue::CharacterString(name.to_string()),
        );
        self.properties.insert(
            (object, PropertyId::ObjectType),
            WireValue::Enumerated(u32::from(object.object_type.code())),
        );
    }

    fn add_object(&mut self, object: ObjectId, name: &str) {
        self.insert_object(object, name);
        let list_key = (ObjectId::device(self.device_id), PropertyId::ObjectList);
        if let Some(WireValue::Array(items)) = self.properties.get_mut(&list_key) {
            items.push(WireValue::ObjectIdentifier(object));
        }
    }

    fn has_object(&self, object: ObjectId) -> bool {
        self.properties
            .contains_key(&(object, PropertyId::ObjectIdentifier))
    }

    fn i_am(&self) -> Incoming {
        Incoming::IAm {
            source: self.mac,
            device_id: self.device_id,
            max_apdu: self.max_apdu,
            segmentation: self.segmentation,
            vendor_id: self.vendor_id,
        }
    }

    fn handle(&mut self, invoke_id: u8, request: &ServiceRequest) -> Option<Incoming> {
        let (object, property, index) = match request {
            ServiceRequest::ReadProperty(r) => (r.object, r.property, r.index),
            ServiceRequest::WriteProperty(w) => (w.object, w.property, w.index),
        };

        if let Some(fault) = self.faults.get(&(object, property, index)) {
            return match fault {
                SimFault::NoResponse => None,
                SimFault::Reject => Some(Incoming::Reject {
                    invoke_id,
                    reason: "simulated reject".to_string(),
                }),
                SimFault::Error(class, code) => Some(Incoming::Error {
                    invoke_id,
                    class: *class,
                    code: *code,
                }),
            };
        }

        let result = match request {
            ServiceRequest::ReadProperty(r) => self.read(r).map(|value| Incoming::ComplexAck { invoke_id, value }),
            ServiceRequest::WriteProperty(w) => self.write(w).map(|()| Incoming::SimpleAck { invoke_id }),
        };
        Some(result.unwrap_or_else(|(class, code)| Incoming::Error {
            invoke_id,
            class,
            code,
        }))
    }

    fn read(&self, request: &ReadRequest) -> std::result::Result<WireValue, (ErrorClass, ErrorCode)> {
        if !self.has_object(request.object) {
            return Err((ErrorClass::Object, ErrorCode::UnknownObject));
        }
        let value = self
            .properties
            .get(&(request.object, request.property))
            .ok_or((ErrorClass::Property, ErrorCode::UnknownProperty))?;

        match (value, request.index) {
            (value, None) => Ok(value.clone()),
            (WireValue::Array(items), Some(0)) => Ok(WireValue::Unsigned(items.len() as u64)),
            (WireValue::Array(items), Some(i)) => items
                .get(i as usize - 1)
                .cloned()
                .ok_or((ErrorClass::Property, ErrorCode::InvalidArrayIndex)),
            (_, Some(_)) => Err((ErrorClass::Property, ErrorCode::InvalidArrayIndex)),
        }
    }

    fn write(&mut self, request: &WriteRequest) -> std::result::Result<(), (ErrorClass, ErrorCode)> {
        if !self.has_object(request.object) {
            return Err((ErrorClass::Object, ErrorCode::UnknownObject));
        }
        let key = (request.object, request.property);
        let relinquish_default = self
            .properties
            .get(&(request.object, PropertyId::RelinquishDefault))
            .cloned();
        let slot = self
            .properties
            .get_mut(&key)
            .ok_or((ErrorClass::Property, ErrorCode::UnknownProperty))?;

        match (slot, request.index) {
            (WireValue::Array(items), Some(0)) => {
                let WireValue::Unsigned(len) = request.value else {
                    return Err((ErrorClass::Property, ErrorCode::InvalidDataType));
                };
                let len = usize::try_from(len).map_err(|_| (ErrorClass::Property, ErrorCode::ValueOutOfRange))?;
                items.resize(len, WireValue::Null);
            }
            (WireValue::Array(items), Some(i)) => {
                let item = items
                    .get_mut(i as usize - 1)
                    .ok_or((ErrorClass::Property, ErrorCode::InvalidArrayIndex))?;
                *item = request.value.clone();
            }
            (_, Some(_)) => return Err((ErrorClass::Property, ErrorCode::InvalidArrayIndex)),
            (slot, None) => {
                *slot = match (&request.value, request.property, relinquish_default) {
                    (WireValue::Null, PropertyId::PresentValue, Some(default)) => default,
                    (value, _, _) => value.clone(),
                };
            }
        }
        Ok(())
    }
}

/// Frames the gateway sent, in order.
#[derive(Debug, Clone, Default)]
pub struct RequestLog(Arc<Mutex<Vec<Outgoing>>>);

impl RequestLog {
    pub fn entries(&self) -> Vec<Outgoing> {
        self.0.lock().clone()
    }

    /// ReadProperty requests sent to `destination`.
    pub fn reads_to(&self, destination: &str) -> Vec<ReadRequest> {
        let Ok(mac) = address::decode(destination) else {
            return Vec::new();
        };
        self.0
            .lock()
            .iter()
            .filter_map(|frame| match frame {
                Outgoing::Confirmed {
                    destination,
                    request: ServiceRequest::ReadProperty(r),
                    ..
                } if *destination == mac => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    /// WriteProperty requests, in order.
    pub fn writes(&self) -> Vec<WriteRequest> {
        self.0
            .lock()
            .iter()
            .filter_map(|frame| match frame {
                Outgoing::Confirmed {
                    request: ServiceRequest::WriteProperty(w),
                    ..
                } => Some(w.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }

    fn record(&self, frame: &Outgoing) {
        self.0.lock().push(frame.clone());
    }
}

/// A set of simulated devices behind one link.
#[derive(Debug, Clone, Default)]
pub struct SimulatedNetwork {
    devices: BTreeMap<Mac, SimDevice>,
    extra_announcements: Vec<Incoming>,
    latency: Duration,
    log: RequestLog,
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a network from configured devices.
    pub fn from_config(devices: &[SimDeviceConfig]) -> Result<Self> {
        let mut network = Self::new();
        for config in devices {
            network = network.with_device(SimDevice::from_config(config)?);
        }
        Ok(network)
    }

    pub fn with_device(mut self, device: SimDevice) -> Self {
        self.devices.insert(device.mac, device);
        self
    }

    /// Answer every Who-Is with an extra I-Am for `device_id` from `address`,
    /// after the regular announcements.
    pub fn with_announcement(mut self, device_id: u32, address: &str, vendor_id: u16) -> Result<Self> {
        self.extra_announcements.push(Incoming::IAm {
            source: address::decode(address)?,
            device_id,
            max_apdu: 480,
            segmentation: Segmentation::None,
            vendor_id,
        });
        Ok(self)
    }

    /// Delay every reply by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Handle on the log of frames sent to this network.
    pub fn request_log(&self) -> RequestLog {
        self.log.clone()
    }

    async fn serve(mut self, mut requests: mpsc::Receiver<Outgoing>, replies: mpsc::Sender<Incoming>) {
        debug!(devices = self.devices.len(), "Simulated network attached");

        while let Some(frame) = requests.recv().await {
            self.log.record(&frame);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            let answers: Vec<Incoming> = match &frame {
                Outgoing::WhoIs => self
                    .devices
                    .values()
                    .filter(|d| d.announce)
                    .map(SimDevice::i_am)
                    .chain(self.extra_announcements.iter().cloned())
                    .collect(),
                Outgoing::Confirmed {
                    invoke_id,
                    destination,
                    request,
                } => match self.devices.get_mut(destination) {
                    Some(device) => device.handle(*invoke_id, request).into_iter().collect(),
                    None => {
                        trace!(?destination, "No simulated device at destination");
                        Vec::new()
                    }
                },
            };

            for answer in answers {
                if replies.send(answer).await.is_err() {
                    return;
                }
            }
        }
        debug!("Simulated network detached");
    }
}

impl Link for SimulatedNetwork {
    fn attach(self) -> LinkChannels {
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(self.serve(out_rx, in_tx));
        LinkChannels {
            outgoing: out_tx,
            incoming: in_rx,
        }
    }
}

fn json_literal(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
