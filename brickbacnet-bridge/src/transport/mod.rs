//! Confirmed-request transport.
//!
//! [`Transport`] is the seam between the gateway and a BACnet network. The
//! production implementation is [`TransportClient`], which owns a [`Link`]
//! from a dedicated I/O task and correlates acknowledgements by invoke id.

mod client;
mod link;
mod simulated;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::object::{ObjectId, PropertyId};
use crate::value::WireValue;

pub use client::TransportClient;
pub use link::{ErrorClass, ErrorCode, Incoming, Link, LinkChannels, Outgoing, ServiceRequest};
pub use simulated::{RequestLog, SimDevice, SimFault, SimulatedNetwork};

/// Segmentation support announced in an I-Am.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Segmentation {
    Both,
    Transmit,
    Receive,
    #[default]
    None,
}

impl Segmentation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Both => "segmented-both",
            Self::Transmit => "segmented-transmit",
            Self::Receive => "segmented-receive",
            Self::None => "no-segmentation",
        }
    }

    /// Parse the form produced by [`as_str`](Self::as_str).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "segmented-both" => Some(Self::Both),
            "segmented-transmit" => Some(Self::Transmit),
            "segmented-receive" => Some(Self::Receive),
            "no-segmentation" => Some(Self::None),
            _ => None,
        }
    }
}

impl fmt::Display for Segmentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device announcement received in reply to Who-Is.
#[derive(Debug, Clone, PartialEq)]
pub struct IAm {
    /// Sender address in `a.b.c.d:port` form.
    pub address: String,
    pub device_id: u32,
    pub max_apdu: u32,
    pub segmentation: Segmentation,
    pub vendor_id: u16,
}

/// A ReadProperty request.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRequest {
    pub object: ObjectId,
    pub property: PropertyId,
    pub index: Option<u32>,
}

impl ReadRequest {
    pub fn new(object: ObjectId, property: PropertyId) -> Self {
        Self {
            object,
            property,
            index: None,
        }
    }

    pub fn at(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }
}

/// A WriteProperty request.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub object: ObjectId,
    pub property: PropertyId,
    pub value: WireValue,
    pub index: Option<u32>,
    pub priority: Option<u8>,
}

/// Confirmed-request transport to BACnet devices.
///
/// Every request is bounded by `timeout`; expiry surfaces as
/// [`Error::TransportTimeout`](crate::Error::TransportTimeout).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Read one property. Device errors for unknown properties surface as
    /// [`Error::UnsupportedProperty`](crate::Error::UnsupportedProperty).
    async fn read(&self, address: &str, request: ReadRequest, timeout: Duration) -> Result<WireValue>;

    /// Write one property and wait for the simple acknowledgement.
    async fn write(&self, address: &str, request: WriteRequest, timeout: Duration) -> Result<()>;

    /// Broadcast a global Who-Is. Announcements arrive on the returned
    /// channel until the receiver is dropped.
    async fn who_is(&self) -> Result<mpsc::Receiver<IAm>>;
}
