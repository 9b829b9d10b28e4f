//! Error types for the BACnet gateway.

use std::time::Duration;

use thiserror::Error;

use crate::object::{ObjectType, PropertyId};

/// Result type alias using the gateway [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the gateway core.
#[derive(Debug, Error)]
pub enum Error {
    /// No response arrived within the request's bounded wait.
    #[error("Transport timeout after {0:?}")]
    TransportTimeout(Duration),

    /// Malformed or unexpected acknowledgement, device error, or a stopped transport.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No datatype mapping exists for this object-type/property pair.
    #[error("Property '{property}' is not supported by object type '{object_type}'")]
    UnsupportedProperty {
        object_type: ObjectType,
        property: PropertyId,
    },

    /// A literal could not be coerced to the declared wire type.
    #[error("Type mismatch: expected {expected}, got '{value}'")]
    TypeMismatch { expected: String, value: String },

    /// Metadata lookup miss.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Persistence failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Address is not a 6-byte B/IP address or a `a.b.c.d:port` string.
    #[error("Malformed address: {0}")]
    MalformedAddress(String),

    /// A polled point has no UUID assigned yet.
    #[error("No UUID assigned to object {instance} of device {device_id}")]
    UnassignedUuid { device_id: u32, instance: u32 },

    /// Timeseries sink rejected or failed a batch.
    #[error("Sink error: {0}")]
    Sink(String),

    /// Invalid gateway configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The cancellation signal fired.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a type mismatch error.
    pub fn type_mismatch(expected: impl Into<String>, value: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            value: value.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether this is the "property not applicable to this object type" class.
    pub fn is_unsupported_property(&self) -> bool {
        matches!(self, Self::UnsupportedProperty { .. })
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(format!("JSON column: {}", err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Sink(err.to_string())
    }
}
