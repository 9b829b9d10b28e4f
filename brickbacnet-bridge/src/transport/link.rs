//! Frame-level boundary between the transport task and a network.

use std::fmt;

use tokio::sync::mpsc;

use super::{ReadRequest, Segmentation, WriteRequest};
use crate::address::Mac;
use crate::value::WireValue;

/// A confirmed service request.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceRequest {
    ReadProperty(ReadRequest),
    WriteProperty(WriteRequest),
}

/// Frames sent towards the network.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Confirmed {
        invoke_id: u8,
        destination: Mac,
        request: ServiceRequest,
    },
    /// Global Who-Is broadcast.
    WhoIs,
}

/// Frames received from the network.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    ComplexAck {
        invoke_id: u8,
        value: WireValue,
    },
    SimpleAck {
        invoke_id: u8,
    },
    Error {
        invoke_id: u8,
        class: ErrorClass,
        code: ErrorCode,
    },
    Reject {
        invoke_id: u8,
        reason: String,
    },
    Abort {
        invoke_id: u8,
        reason: String,
    },
    IAm {
        source: Mac,
        device_id: u32,
        max_apdu: u32,
        segmentation: Segmentation,
        vendor_id: u16,
    },
}

impl Incoming {
    /// Invoke id of a confirmed-service reply.
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Self::ComplexAck { invoke_id, .. }
            | Self::SimpleAck { invoke_id }
            | Self::Error { invoke_id, .. }
            | Self::Reject { invoke_id, .. }
            | Self::Abort { invoke_id, .. } => Some(*invoke_id),
            Self::IAm { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Device,
    Object,
    Property,
    Resources,
    Security,
    Services,
    Communication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    UnknownObject,
    UnknownProperty,
    InvalidArrayIndex,
    WriteAccessDenied,
    ValueOutOfRange,
    InvalidDataType,
    Other(u16),
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "error-code-{}", code),
            known => fmt::Debug::fmt(known, f),
        }
    }
}

/// Channels of an attached link.
pub struct LinkChannels {
    pub outgoing: mpsc::Sender<Outgoing>,
    pub incoming: mpsc::Receiver<Incoming>,
}

/// A datagram network the transport can own.
///
/// Attaching consumes the link; the link runs until the outgoing sender is
/// dropped.
pub trait Link: Send + 'static {
    fn attach(self) -> LinkChannels;
}
