//! Device and object discovery.
//!
//! Device discovery broadcasts Who-Is, collects I-Am announcements for a
//! fixed window and enriches each device with a few descriptive reads.
//! Object discovery walks a device's object list and describes every object.
//! Single-field read failures never abort either pass; the field is left
//! empty and a warning is logged.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{BacnetClient, pace};
use crate::config::DiscoveryConfig;
use crate::error::{Error, Result};
use crate::model::{DataPoint, Device};
use crate::object::{self, ObjectId, ObjectType, PropertyId};
use crate::store::MetadataStore;
use crate::transport::{IAm, Transport};
use crate::value::PropertyValue;

/// Progress of a device discovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Broadcasting,
    Collecting,
    Enriching,
    Done,
}

/// Finds devices on the network and records them in the metadata store.
pub struct DeviceDiscovery {
    client: BacnetClient,
    store: MetadataStore,
    window: Duration,
    read_timeout: Duration,
    state: watch::Sender<DiscoveryState>,
}

impl DeviceDiscovery {
    pub fn new(client: BacnetClient, store: MetadataStore, config: &DiscoveryConfig) -> Self {
        let (state, _) = watch::channel(DiscoveryState::Idle);
        Self {
            client,
            store,
            window: config.window(),
            read_timeout: config.read_timeout(),
            state,
        }
    }

    /// Override the I-Am collection window.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn state(&self) -> DiscoveryState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<DiscoveryState> {
        self.state.subscribe()
    }

    fn enter(&self, state: DiscoveryState) {
        debug!(?state, "Device discovery state");
        self.state.send_replace(state);
    }

    /// Run one discovery pass and persist every device found.
    pub async fn run(&self, ctx: &CancellationToken) -> Result<Vec<Device>> {
        self.enter(DiscoveryState::Broadcasting);
        let mut announcements = self.client.transport().who_is().await?;

        self.enter(DiscoveryState::Collecting);
        let mut found: BTreeMap<u32, IAm> = BTreeMap::new();
        let window = tokio::time::sleep(self.window);
        tokio::pin!(window);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Cancelled),
                _ = &mut window => break,
                iam = announcements.recv() => match iam {
                    Some(iam) => {
                        debug!(device = iam.device_id, address = %iam.address, "I-Am received");
                        let address = iam.address.clone();
                        if let Some(previous) = found.insert(iam.device_id, iam) {
                            if previous.address != address {
                                warn!(
                                    device = previous.device_id,
                                    previous = %previous.address,
                                    current = %address,
                                    "Device announced from a new address"
                                );
                            }
                        }
                    }
                    None => break,
                },
            }
        }
        drop(announcements);
        info!("Collected {} device announcement(s)", found.len());

        self.enter(DiscoveryState::Enriching);
        let mut devices = Vec::with_capacity(found.len());
        for iam in found.into_values() {
            devices.push(self.enrich(iam, ctx).await?);
        }

        self.enter(DiscoveryState::Done);
        for device in &devices {
            self.store.upsert_device(device).await?;
            info!(
                device = device.device_id,
                address = %device.address,
                objects = ?device.object_count,
                "Device recorded"
            );
        }
        Ok(devices)
    }

    async fn enrich(&self, iam: IAm, ctx: &CancellationToken) -> Result<Device> {
        let object = ObjectId::device(iam.device_id);
        let read = |property, index| {
            read_optional(&self.client, &iam.address, object, property, index, self.read_timeout, ctx)
        };

        let name = read(PropertyId::ObjectName, None).await?;
        let description = read(PropertyId::Description, None).await?;
        let object_count = read(PropertyId::ObjectList, Some(0)).await?;
        let vendor_name = read(PropertyId::JciName, None).await?;

        Ok(Device {
            device_id: iam.device_id,
            name: name.and_then(|v| v.to_text()),
            description: description.and_then(|v| v.to_text()),
            vendor_id: iam.vendor_id,
            max_apdu: iam.max_apdu,
            segmentation: iam.segmentation,
            object_count: object_count
                .and_then(|v| v.as_i64())
                .and_then(|n| u32::try_from(n).ok()),
            vendor_name: vendor_name.and_then(|v| v.to_text()),
            uuid: None,
            address: iam.address,
        })
    }
}

/// Enumerates and describes the objects of a device.
pub struct ObjectDiscovery {
    client: BacnetClient,
    store: MetadataStore,
    read_timeout: Duration,
    request_delay: Duration,
    custom_fields: Vec<(String, PropertyId)>,
}

impl ObjectDiscovery {
    pub fn new(client: BacnetClient, store: MetadataStore, config: &DiscoveryConfig) -> Result<Self> {
        Ok(Self {
            client,
            store,
            read_timeout: config.read_timeout(),
            request_delay: config.request_delay(),
            custom_fields: config.custom_fields()?,
        })
    }

    /// Walk the object list of `device` and persist one point per object.
    ///
    /// Returns the points recorded, by instance.
    pub async fn discover(&self, device: &Device, ctx: &CancellationToken) -> Result<Vec<DataPoint>> {
        let Some(count) = device.object_count.filter(|n| *n > 0) else {
            warn!(device = device.device_id, "Object count unknown or zero, skipping object discovery");
            return Ok(Vec::new());
        };

        let identifiers = self.enumerate(device, count, ctx).await?;

        let mut points: BTreeMap<u32, DataPoint> = BTreeMap::new();
        for id in identifiers {
            let point = self.describe(device, id, ctx).await?;
            self.store.upsert_object(&point).await?;
            if let Some(previous) = points.insert(point.instance, point) {
                warn!(
                    device = device.device_id,
                    instance = previous.instance,
                    "Duplicate object instance, keeping the later entry"
                );
            }
        }

        info!(
            device = device.device_id,
            points = points.len(),
            "Object discovery finished"
        );
        Ok(points.into_values().collect())
    }

    /// Read object-list entries 1..=count, skipping failed indices.
    async fn enumerate(&self, device: &Device, count: u32, ctx: &CancellationToken) -> Result<Vec<ObjectId>> {
        let list = ObjectId::device(device.device_id);
        let mut identifiers = Vec::with_capacity(count as usize);
        let mut seen = HashSet::new();

        for index in 1..=count {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let entry = self
                .client
                .read_property(&device.address, list, PropertyId::ObjectList, Some(index), self.read_timeout)
                .await
                .and_then(|value| {
                    value
                        .as_object_id()
                        .ok_or_else(|| Error::protocol(format!("object list entry is {}", value)))
                });

            match entry {
                Ok(id) => {
                    if !seen.insert(id) {
                        warn!(device = device.device_id, object = %id, index, "Duplicate object identifier");
                    }
                    identifiers.push(id);
                }
                Err(e) => warn!(
                    device = device.device_id,
                    index,
                    error = %e,
                    "Failed to read object list entry, skipping"
                ),
            }
            pace(ctx, self.request_delay).await?;
        }
        Ok(identifiers)
    }

    async fn describe(&self, device: &Device, id: ObjectId, ctx: &CancellationToken) -> Result<DataPoint> {
        let object_type = self
            .read(device, id, PropertyId::ObjectType, ctx)
            .await?
            .and_then(|v| v.as_i64())
            .and_then(|code| u16::try_from(code).ok())
            .map(ObjectType::from_code)
            .unwrap_or(id.object_type);

        let description = self.read(device, id, PropertyId::Description, ctx).await?;
        let vendor_name = self.read(device, id, PropertyId::JciName, ctx).await?;
        let sensor_type = self.read(device, id, PropertyId::DeviceType, ctx).await?;
        let unit = self.read(device, id, PropertyId::Units, ctx).await?;

        let mut custom_fields = BTreeMap::new();
        for (field, property) in &self.custom_fields {
            let value = self.read(device, id, *property, ctx).await?;
            custom_fields.insert(
                field.clone(),
                value.map_or(serde_json::Value::Null, |v| v.to_json()),
            );
        }

        Ok(DataPoint {
            device_id: device.device_id,
            instance: id.instance,
            object_type,
            description: description.and_then(|v| v.to_text()),
            vendor_name: vendor_name.and_then(|v| v.to_text()),
            sensor_type: sensor_type.and_then(|v| v.to_text()),
            unit: unit.map(|v| match v.as_i64() {
                Some(code) => object::unit_name(code),
                None => v.to_string(),
            }),
            custom_fields,
            uuid: None,
        })
    }

    async fn read(
        &self,
        device: &Device,
        id: ObjectId,
        property: PropertyId,
        ctx: &CancellationToken,
    ) -> Result<Option<PropertyValue>> {
        let value = read_optional(
            &self.client,
            &device.address,
            id,
            property,
            None,
            self.read_timeout,
            ctx,
        )
        .await?;
        pace(ctx, self.request_delay).await?;
        Ok(value)
    }
}

/// Read one descriptive field, degrading any failure to `None`.
///
/// Only cancellation is returned as an error.
async fn read_optional(
    client: &BacnetClient,
    address: &str,
    object: ObjectId,
    property: PropertyId,
    index: Option<u32>,
    timeout: Duration,
    ctx: &CancellationToken,
) -> Result<Option<PropertyValue>> {
    if ctx.is_cancelled() {
        return Err(Error::Cancelled);
    }

    match client.read_property(address, object, property, index, timeout).await {
        Ok(value) if value.is_null() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_unsupported_property() => {
            debug!(address, object = %object, property = %property, "Property not supported");
            Ok(None)
        }
        Err(e) => {
            warn!(
                address,
                object = %object,
                property = %property,
                error = %e,
                "Failed to read field, leaving it empty"
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::DEFAULT_VERSION;
    use crate::transport::{
        ReadRequest, RequestLog, SimDevice, SimFault, SimulatedNetwork, TransportClient,
    };
    use crate::value::WireValue;

    const ADDR: &str = "192.168.1.20:47808";

    fn config() -> DiscoveryConfig {
        DiscoveryConfig {
            window_secs: 1,
            read_timeout_ms: 100,
            request_delay_ms: 0,
            object_custom_fields: BTreeMap::from([("out_of_service".to_string(), "outOfService".to_string())]),
        }
    }

    fn ai(instance: u32) -> ObjectId {
        ObjectId::new(ObjectType::AnalogInput, instance)
    }

    async fn setup(network: SimulatedNetwork) -> (BacnetClient, MetadataStore, RequestLog) {
        let log = network.request_log();
        let client = BacnetClient::new(Arc::new(TransportClient::start(network)));
        let store = MetadataStore::in_memory(DEFAULT_VERSION).await.unwrap();
        (client, store, log)
    }

    fn ahu() -> SimDevice {
        let oid = ObjectId::device(1001);
        SimDevice::new(1001, ADDR)
            .unwrap()
            .with_vendor(5)
            .with_property(oid, PropertyId::ObjectName, WireValue::CharacterString("AHU-1".into()))
            .with_property(oid, PropertyId::JciName, WireValue::CharacterString("NAE-AHU-1".into()))
            .with_fault(oid, PropertyId::Description, None, SimFault::NoResponse)
    }

    fn stored_device(object_count: Option<u32>) -> Device {
        Device {
            device_id: 1001,
            address: ADDR.to_string(),
            name: None,
            description: None,
            vendor_id: 5,
            max_apdu: 1476,
            segmentation: crate::transport::Segmentation::Both,
            object_count,
            vendor_name: None,
            uuid: None,
        }
    }

    #[tokio::test]
    async fn test_device_discovery_enriches_and_persists() {
        let network = SimulatedNetwork::new()
            .with_device(ahu())
            .with_device(SimDevice::new(2002, "192.168.1.21:47808").unwrap());
        let (client, store, _log) = setup(network).await;

        let discovery = DeviceDiscovery::new(client, store.clone(), &config())
            .with_window(Duration::from_millis(200));
        assert_eq!(discovery.state(), DiscoveryState::Idle);

        let devices = discovery.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(discovery.state(), DiscoveryState::Done);
        assert_eq!(devices.len(), 2);

        let ahu = store.read_device(1001).await.unwrap().device;
        assert_eq!(ahu.name.as_deref(), Some("AHU-1"));
        assert_eq!(ahu.description, None);
        assert_eq!(ahu.vendor_name.as_deref(), Some("NAE-AHU-1"));
        assert_eq!(ahu.object_count, Some(1));
        assert_eq!(ahu.vendor_id, 5);

        let plain = store.read_device(2002).await.unwrap().device;
        assert_eq!(plain.name.as_deref(), Some("Device 2002"));
        assert_eq!(plain.vendor_name, None);
    }

    #[tokio::test]
    async fn test_last_announcement_wins() {
        let network = SimulatedNetwork::new()
            .with_device(ahu())
            .with_announcement(1001, "10.0.0.9:47809", 7)
            .unwrap();
        let (client, store, _log) = setup(network).await;

        let discovery = DeviceDiscovery::new(client, store.clone(), &config())
            .with_window(Duration::from_millis(200));
        discovery.run(&CancellationToken::new()).await.unwrap();

        let device = store.read_device(1001).await.unwrap().device;
        assert_eq!(device.address, "10.0.0.9:47809");
        assert_eq!(device.vendor_id, 7);
        // Nothing answers at the new address.
        assert_eq!(device.name, None);
    }

    #[tokio::test]
    async fn test_device_discovery_cancels() {
        let (client, store, _log) = setup(SimulatedNetwork::new().with_device(ahu())).await;
        let discovery = DeviceDiscovery::new(client, store.clone(), &config())
            .with_window(Duration::from_secs(60));

        let ctx = CancellationToken::new();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), discovery.run(&ctx)).await;
        assert!(matches!(result, Ok(Err(Error::Cancelled))));
        assert!(store.list_devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_object_list_failure_skips_one_index() {
        let mut device = SimDevice::new(1001, ADDR).unwrap();
        for instance in 1..=9 {
            device = device.with_object(ai(instance), &format!("AI-{}", instance));
        }
        // Entry 1 is the device itself; entry 7 is analog-input:6.
        let device = device.with_fault(
            ObjectId::device(1001),
            PropertyId::ObjectList,
            Some(7),
            SimFault::NoResponse,
        );
        let (client, store, log) = setup(SimulatedNetwork::new().with_device(device)).await;
        store.upsert_device(&stored_device(Some(10))).await.unwrap();

        let discovery = ObjectDiscovery::new(client, store.clone(), &config()).unwrap();
        let points = discovery
            .discover(&stored_device(Some(10)), &CancellationToken::new())
            .await
            .unwrap();

        let instances: Vec<u32> = points
            .iter()
            .filter(|p| p.object_type == ObjectType::AnalogInput)
            .map(|p| p.instance)
            .collect();
        assert_eq!(instances, vec![1, 2, 3, 4, 5, 7, 8, 9]);

        let indices: Vec<u32> = log
            .reads_to(ADDR)
            .into_iter()
            .filter(|r| r.property == PropertyId::ObjectList)
            .filter_map(|r: ReadRequest| r.index)
            .collect();
        assert_eq!(indices, (1..=10).collect::<Vec<_>>());

        assert_eq!(store.read_device(1001).await.unwrap().instances.len(), 9);
    }

    #[tokio::test]
    async fn test_missing_object_count_skips_device() {
        let (client, store, log) = setup(SimulatedNetwork::new().with_device(ahu())).await;
        let discovery = ObjectDiscovery::new(client, store, &config()).unwrap();

        for count in [None, Some(0)] {
            let points = discovery
                .discover(&stored_device(count), &CancellationToken::new())
                .await
                .unwrap();
            assert!(points.is_empty());
        }
        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_object_descriptors() {
        let bo = ObjectId::new(ObjectType::BinaryOutput, 3);
        let device = SimDevice::new(1001, ADDR)
            .unwrap()
            .with_object(ai(1), "ZN-T")
            .with_property(ai(1), PropertyId::Description, WireValue::CharacterString("Zone temp".into()))
            .with_property(ai(1), PropertyId::Units, WireValue::Enumerated(62))
            .with_property(ai(1), PropertyId::DeviceType, WireValue::CharacterString("thermistor".into()))
            .with_property(ai(1), PropertyId::OutOfService, WireValue::Boolean(true))
            .with_object(bo, "FAN-CMD")
            .with_fault(bo, PropertyId::ObjectType, None, SimFault::Reject);
        let (client, store, _log) = setup(SimulatedNetwork::new().with_device(device)).await;
        store.upsert_device(&stored_device(Some(3))).await.unwrap();

        let discovery = ObjectDiscovery::new(client, store.clone(), &config()).unwrap();
        let points = discovery
            .discover(&stored_device(Some(3)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(points.len(), 3);

        let sensor = points.iter().find(|p| p.object_id() == ai(1)).unwrap();
        assert_eq!(sensor.description.as_deref(), Some("Zone temp"));
        assert_eq!(sensor.unit.as_deref(), Some("degrees-celsius"));
        assert_eq!(sensor.sensor_type.as_deref(), Some("thermistor"));
        assert_eq!(sensor.custom_fields["out_of_service"], serde_json::json!(true));
        assert_eq!(sensor.uuid, None);

        // Type tag read was rejected; the identifier's type is used.
        let fan = points.iter().find(|p| p.instance == 3).unwrap();
        assert_eq!(fan.object_type, ObjectType::BinaryOutput);
        assert_eq!(fan.unit, None);
        assert_eq!(fan.custom_fields["out_of_service"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_vendor_property_custom_field() {
        let device = SimDevice::new(1001, ADDR)
            .unwrap()
            .with_object(ai(1), "ZN-T")
            .with_property(ai(1), PropertyId::Other(4001), WireValue::CharacterString("Room 101".into()));
        let (client, store, log) = setup(SimulatedNetwork::new().with_device(device)).await;
        store.upsert_device(&stored_device(Some(2))).await.unwrap();

        let mut config = config();
        config.object_custom_fields.insert("room".to_string(), "property-4001".to_string());
        let discovery = ObjectDiscovery::new(client, store.clone(), &config).unwrap();
        let points = discovery
            .discover(&stored_device(Some(2)), &CancellationToken::new())
            .await
            .unwrap();

        let sensor = points.iter().find(|p| p.object_id() == ai(1)).unwrap();
        assert_eq!(sensor.custom_fields["room"], serde_json::json!("Room 101"));
        let device = points.iter().find(|p| p.object_type == ObjectType::Device).unwrap();
        assert_eq!(device.custom_fields["room"], serde_json::Value::Null);

        let vendor_reads = log
            .reads_to(ADDR)
            .into_iter()
            .filter(|r| r.property == PropertyId::Other(4001))
            .count();
        assert_eq!(vendor_reads, 2);

        let stored = store
            .read_object(crate::store::ObjectKey::Instance { device_id: 1001, instance: 1 })
            .await
            .unwrap();
        assert_eq!(stored.custom_fields["room"], serde_json::json!("Room 101"));
    }

    #[tokio::test]
    async fn test_duplicate_identifiers_overwrite() {
        let device = SimDevice::new(1001, ADDR)
            .unwrap()
            .with_object(ai(1), "ZN-T")
            .with_object(ai(1), "ZN-T");
        let (client, store, _log) = setup(SimulatedNetwork::new().with_device(device)).await;
        store.upsert_device(&stored_device(Some(3))).await.unwrap();

        let discovery = ObjectDiscovery::new(client, store.clone(), &config()).unwrap();
        let points = discovery
            .discover(&stored_device(Some(3)), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(points.iter().filter(|p| p.instance == 1).count(), 1);
        assert_eq!(store.read_device(1001).await.unwrap().instances, vec![1, 1001]);
    }
}
