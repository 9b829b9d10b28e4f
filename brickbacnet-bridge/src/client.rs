//! Typed property access on top of a [`Transport`].

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{self, TypeCode};
use crate::error::{Error, Result};
use crate::object::{ObjectId, PropertyId};
use crate::transport::{ReadRequest, Transport, WriteRequest};
use crate::value::PropertyValue;

/// A property write expressed as a user literal.
#[derive(Debug, Clone)]
pub struct WriteCommand {
    pub object: ObjectId,
    pub property: PropertyId,
    pub literal: String,
    pub index: Option<u32>,
    /// Command priority, 1 (highest) to 16.
    pub priority: Option<u8>,
    /// Wire type for any-atomic properties.
    pub type_code: Option<TypeCode>,
}

/// Reads and writes properties with datatype checking.
#[derive(Clone)]
pub struct BacnetClient {
    transport: Arc<dyn Transport>,
}

impl BacnetClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Read and decode one property.
    ///
    /// Pairs without a datatype mapping fail with
    /// [`Error::UnsupportedProperty`] before anything is sent.
    pub async fn read_property(
        &self,
        address: &str,
        object: ObjectId,
        property: PropertyId,
        index: Option<u32>,
        timeout: Duration,
    ) -> Result<PropertyValue> {
        if codec::datatype(object.object_type, property).is_none() {
            return Err(Error::UnsupportedProperty {
                object_type: object.object_type,
                property,
            });
        }

        let request = ReadRequest {
            object,
            property,
            index,
        };
        let wire = self.transport.read(address, request, timeout).await?;
        codec::decode(object.object_type, property, index, wire)
    }

    /// Encode a literal and write it.
    pub async fn write_property(
        &self,
        address: &str,
        command: &WriteCommand,
        timeout: Duration,
    ) -> Result<()> {
        if let Some(priority) = command.priority.filter(|p| !(1..=16).contains(p)) {
            return Err(Error::type_mismatch("priority between 1 and 16", priority.to_string()));
        }

        let value = codec::encode(
            command.object.object_type,
            command.property,
            &command.literal,
            command.index,
            command.type_code,
        )?;

        debug!(
            address,
            object = %command.object,
            property = %command.property,
            value = ?value,
            priority = ?command.priority,
            "Writing property"
        );

        let request = WriteRequest {
            object: command.object,
            property: command.property,
            value,
            index: command.index,
            priority: command.priority,
        };
        self.transport.write(address, request, timeout).await
    }
}

/// Wait `delay` between requests, returning early with
/// [`Error::Cancelled`] if `ctx` fires.
pub async fn pace(ctx: &CancellationToken, delay: Duration) -> Result<()> {
    if ctx.is_cancelled() {
        return Err(Error::Cancelled);
    }
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = ctx.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectType;
    use crate::transport::{SimDevice, SimulatedNetwork, TransportClient};
    use crate::value::WireValue;

    const ADDR: &str = "192.168.1.20:47808";
    const TIMEOUT: Duration = Duration::from_millis(500);

    fn ao() -> ObjectId {
        ObjectId::new(ObjectType::AnalogOutput, 1)
    }

    fn client() -> (BacnetClient, crate::transport::RequestLog) {
        let network = SimulatedNetwork::new().with_device(
            SimDevice::new(1001, ADDR)
                .unwrap()
                .with_object(ao(), "SAT-SP")
                .with_property(ao(), PropertyId::PresentValue, WireValue::Real(13.0)),
        );
        let log = network.request_log();
        (BacnetClient::new(Arc::new(TransportClient::start(network))), log)
    }

    fn command(literal: &str) -> WriteCommand {
        WriteCommand {
            object: ao(),
            property: PropertyId::PresentValue,
            literal: literal.to_string(),
            index: None,
            priority: Some(8),
            type_code: None,
        }
    }

    #[tokio::test]
    async fn test_unsupported_read_sends_nothing() {
        let (client, log) = client();
        let result = client
            .read_property(ADDR, ObjectId::device(1001), PropertyId::PresentValue, None, TIMEOUT)
            .await;
        assert!(result.unwrap_err().is_unsupported_property());
        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let (client, _log) = client();
        client.write_property(ADDR, &command("14.5"), TIMEOUT).await.unwrap();

        let value = client
            .read_property(ADDR, ao(), PropertyId::PresentValue, None, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(value, PropertyValue::Real(14.5));
    }

    #[tokio::test]
    async fn test_bad_literal_sends_nothing() {
        let (client, log) = client();
        let result = client.write_property(ADDR, &command("cold"), TIMEOUT).await;
        assert!(matches!(result, Err(Error::TypeMismatch { .. })));
        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_priority_range() {
        let (client, log) = client();
        let mut cmd = command("14.5");
        cmd.priority = Some(17);
        assert!(matches!(
            client.write_property(ADDR, &cmd, TIMEOUT).await,
            Err(Error::TypeMismatch { .. })
        ));
        assert!(log.writes().is_empty());
    }

    #[tokio::test]
    async fn test_pace_cancels() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        assert!(matches!(pace(&ctx, Duration::from_secs(60)).await, Err(Error::Cancelled)));
    }
}
