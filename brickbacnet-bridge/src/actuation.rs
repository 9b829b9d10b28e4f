//! Point actuation by UUID.

use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use crate::client::{BacnetClient, WriteCommand};
use crate::codec::TypeCode;
use crate::error::Result;
use crate::object::PropertyId;
use crate::store::{MetadataStore, ObjectKey};
use crate::value::PropertyValue;

/// A write addressed to a point by its UUID.
#[derive(Debug, Clone)]
pub struct PointWrite {
    pub uuid: Uuid,
    pub property: PropertyId,
    pub literal: String,
    pub index: Option<u32>,
    pub priority: Option<u8>,
    pub type_code: Option<TypeCode>,
}

impl PointWrite {
    /// Write `literal` to the present value.
    pub fn present_value(uuid: Uuid, literal: impl Into<String>) -> Self {
        Self {
            uuid,
            property: PropertyId::PresentValue,
            literal: literal.into(),
            index: None,
            priority: None,
            type_code: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Resolves UUIDs through the metadata store and writes to the owning device.
pub struct Actuator {
    client: BacnetClient,
    store: MetadataStore,
    timeout: Duration,
}

impl Actuator {
    pub fn new(client: BacnetClient, store: MetadataStore, timeout: Duration) -> Self {
        Self {
            client,
            store,
            timeout,
        }
    }

    pub async fn write(&self, request: &PointWrite) -> Result<()> {
        let point = self.store.read_object(ObjectKey::Uuid(request.uuid)).await?;
        let device = self.store.read_device(point.device_id).await?.device;

        let command = WriteCommand {
            object: point.object_id(),
            property: request.property,
            literal: request.literal.clone(),
            index: request.index,
            priority: request.priority,
            type_code: request.type_code,
        };
        self.client
            .write_property(&device.address, &command, self.timeout)
            .await?;

        info!(
            uuid = %request.uuid,
            source = %point.source_id(),
            property = %request.property,
            value = %request.literal,
            "Point written"
        );
        Ok(())
    }

    /// Read one property of the point identified by `uuid`.
    pub async fn read(&self, uuid: Uuid, property: PropertyId, index: Option<u32>) -> Result<PropertyValue> {
        let point = self.store.read_object(ObjectKey::Uuid(uuid)).await?;
        let device = self.store.read_device(point.device_id).await?.device;
        self.client
            .read_property(&device.address, point.object_id(), property, index, self.timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::error::Error;
    use crate::model::{DataPoint, Device};
    use crate::object::{ObjectId, ObjectType};
    use crate::store::DEFAULT_VERSION;
    use crate::transport::{RequestLog, Segmentation, SimDevice, SimulatedNetwork, TransportClient};
    use crate::value::WireValue;

    const ADDR: &str = "192.168.1.20:47808";

    fn damper() -> ObjectId {
        ObjectId::new(ObjectType::AnalogOutput, 4)
    }

    async fn setup(uuid: Uuid) -> (Actuator, RequestLog) {
        let network = SimulatedNetwork::new().with_device(
            SimDevice::new(1001, ADDR)
                .unwrap()
                .with_object(damper(), "DMPR-CMD")
                .with_property(damper(), PropertyId::PresentValue, WireValue::Real(0.0))
                .with_property(damper(), PropertyId::RelinquishDefault, WireValue::Real(20.0)),
        );
        let log = network.request_log();
        let client = BacnetClient::new(Arc::new(TransportClient::start(network)));

        let store = MetadataStore::in_memory(DEFAULT_VERSION).await.unwrap();
        store
            .upsert_device(&Device {
                device_id: 1001,
                address: ADDR.to_string(),
                name: None,
                description: None,
                vendor_id: 0,
                max_apdu: 1476,
                segmentation: Segmentation::Both,
                object_count: Some(2),
                vendor_name: None,
                uuid: None,
            })
            .await
            .unwrap();
        store
            .upsert_object(&DataPoint {
                device_id: 1001,
                instance: 4,
                object_type: ObjectType::AnalogOutput,
                description: None,
                vendor_name: None,
                sensor_type: None,
                unit: None,
                custom_fields: BTreeMap::new(),
                uuid: Some(uuid),
            })
            .await
            .unwrap();

        (Actuator::new(client, store, Duration::from_millis(500)), log)
    }

    #[tokio::test]
    async fn test_write_by_uuid() {
        let uuid = Uuid::new_v4();
        let (actuator, log) = setup(uuid).await;

        actuator
            .write(&PointWrite::present_value(uuid, "55").with_priority(8))
            .await
            .unwrap();
        let value = actuator.read(uuid, PropertyId::PresentValue, None).await.unwrap();
        assert_eq!(value, PropertyValue::Real(55.0));
        assert_eq!(log.writes()[0].priority, Some(8));

        actuator.write(&PointWrite::present_value(uuid, "null")).await.unwrap();
        let value = actuator.read(uuid, PropertyId::PresentValue, None).await.unwrap();
        assert_eq!(value, PropertyValue::Real(20.0));
    }

    #[tokio::test]
    async fn test_unknown_uuid() {
        let (actuator, log) = setup(Uuid::new_v4()).await;
        let result = actuator.write(&PointWrite::present_value(Uuid::new_v4(), "1")).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert!(log.entries().is_empty());
    }
}
