//! BACnet metadata and ingestion gateway.
//!
//! Discovers BACnet devices and their objects, caches descriptive metadata in
//! SQLite and polls present values on a schedule, forwarding readings to a
//! timeseries sink.
//!
//! # Source identifiers
//!
//! ```text
//! <object-type>:<instance>@<device-id>
//! ```
//!
//! e.g. `analog-input:3@1001`.

pub mod actuation;
pub mod address;
pub mod client;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod model;
pub mod object;
pub mod poller;
pub mod sink;
pub mod store;
pub mod transport;
pub mod value;

pub use error::{Error, Result};
pub use gateway::Gateway;
