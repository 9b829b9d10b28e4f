//! Configuration for the BACnet gateway.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use brickbacnet_bridge_framework::{BridgeConfig, BridgeError, LoggingConfig};

use crate::address;
use crate::codec;
use crate::error::{Error, Result};
use crate::object::{ObjectId, ObjectType, PropertyId};
use crate::store::DEFAULT_VERSION;
use crate::transport::Segmentation;

/// Complete gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// BACnet-side settings
    pub bacnet: BacnetConfig,

    /// Timeseries sink
    #[serde(default)]
    pub sink: SinkConfig,
}

/// BACnet network, discovery and polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacnetConfig {
    /// SQLite metadata database path (default: "brickbacnet.db")
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Dataset version label (default: "v1")
    #[serde(default = "default_version")]
    pub version: String,

    /// Network the transport attaches to
    pub network: NetworkConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub polling: PollingConfig,
}

fn default_database() -> PathBuf {
    PathBuf::from("brickbacnet.db")
}

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

/// Network link selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NetworkConfig {
    /// In-process simulated devices
    Simulated {
        #[serde(default)]
        devices: Vec<SimDeviceConfig>,
        /// Reply latency in milliseconds
        #[serde(default)]
        latency_ms: u64,
    },
}

/// A simulated device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimDeviceConfig {
    pub device_id: u32,
    /// `a.b.c.d:port`
    pub address: String,
    #[serde(default)]
    pub vendor_id: u16,
    #[serde(default = "default_max_apdu")]
    pub max_apdu: u32,
    #[serde(default)]
    pub segmentation: Segmentation,
    /// Answer Who-Is (default: true)
    #[serde(default = "default_true")]
    pub announce: bool,
    pub name: Option<String>,
    pub description: Option<String>,
    /// Extra device-object properties, by property name
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub objects: Vec<SimObjectConfig>,
}

/// An object on a simulated device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimObjectConfig {
    /// Object identifier, e.g. "analog-input:1"
    pub id: ObjectId,
    pub name: Option<String>,
    pub description: Option<String>,
    /// Engineering units code
    pub units: Option<u32>,
    /// Initial present value, coerced to the object's declared type
    #[serde(default)]
    pub present_value: serde_json::Value,
    /// Extra properties, by property name
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

fn default_max_apdu() -> u32 {
    1476
}

fn default_true() -> bool {
    true
}

/// Device and object discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// I-Am collection window in seconds (default: 5)
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Per-read timeout in milliseconds (default: 5000)
    #[serde(default = "default_discovery_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Delay between object reads in milliseconds (default: 50)
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    /// Extra object properties to store as custom fields: field name -> property name
    #[serde(default)]
    pub object_custom_fields: BTreeMap<String, String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            read_timeout_ms: default_discovery_timeout_ms(),
            request_delay_ms: default_request_delay_ms(),
            object_custom_fields: BTreeMap::new(),
        }
    }
}

fn default_window_secs() -> u64 {
    5
}

fn default_discovery_timeout_ms() -> u64 {
    5000
}

fn default_request_delay_ms() -> u64 {
    50
}

impl DiscoveryConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    /// Resolve the custom field map to property identifiers.
    pub fn custom_fields(&self) -> Result<Vec<(String, PropertyId)>> {
        self.object_custom_fields
            .iter()
            .map(|(field, property)| {
                let property = property.parse::<PropertyId>().map_err(|_| {
                    Error::Config(format!(
                        "custom field '{}': unknown property '{}'",
                        field, property
                    ))
                })?;
                Ok((field.clone(), property))
            })
            .collect()
    }
}

/// What a sweep does when a polled point has no UUID.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingUuidPolicy {
    /// Abort the device sweep
    #[default]
    Abort,
    /// Drop the reading and continue
    Skip,
}

/// Present-value polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Device ids to poll
    #[serde(default)]
    pub devices: Vec<u32>,

    /// Minimum time between sweep starts in seconds (default: 120)
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,

    /// Readings per sink call (default: 20)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Delay between reads in milliseconds (default: 50)
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    /// Per-read timeout in milliseconds (default: 3000)
    #[serde(default = "default_polling_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Object types never polled (default: types without a present value)
    #[serde(default)]
    pub skip_object_types: Option<Vec<String>>,

    /// Upper bound on concurrently running sweeps (default: 10)
    #[serde(default = "default_max_concurrent_sweeps")]
    pub max_concurrent_sweeps: usize,

    #[serde(default)]
    pub missing_uuid: MissingUuidPolicy,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            min_interval_secs: default_min_interval_secs(),
            batch_size: default_batch_size(),
            request_delay_ms: default_request_delay_ms(),
            read_timeout_ms: default_polling_timeout_ms(),
            skip_object_types: None,
            max_concurrent_sweeps: default_max_concurrent_sweeps(),
            missing_uuid: MissingUuidPolicy::default(),
        }
    }
}

fn default_min_interval_secs() -> u64 {
    120
}

fn default_batch_size() -> usize {
    20
}

fn default_polling_timeout_ms() -> u64 {
    3000
}

fn default_max_concurrent_sweeps() -> usize {
    10
}

impl PollingConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Object types skipped by sweeps.
    pub fn skip_set(&self) -> Result<HashSet<ObjectType>> {
        match &self.skip_object_types {
            None => Ok(codec::static_object_types().into_iter().collect()),
            Some(names) => names
                .iter()
                .map(|name| {
                    name.parse::<ObjectType>()
                        .map_err(|_| Error::Config(format!("unknown object type '{}'", name)))
                })
                .collect(),
        }
    }
}

/// Timeseries sink selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    /// POST batches to a timeseries HTTP endpoint
    Http {
        url: String,
        /// Bearer token
        #[serde(default)]
        token: Option<String>,
        #[serde(default = "default_sink_timeout_secs")]
        timeout_secs: u64,
        /// Object type -> value column (default: numeric types to "number")
        #[serde(default)]
        value_columns: Option<BTreeMap<String, String>>,
    },
    /// Write readings to the log
    #[default]
    Log,
}

fn default_sink_timeout_secs() -> u64 {
    10
}

/// Default object type to value column mapping.
pub fn default_value_columns() -> HashMap<ObjectType, String> {
    use ObjectType as T;

    let numeric = [
        T::AnalogInput,
        T::AnalogOutput,
        T::AnalogValue,
        T::BinaryInput,
        T::BinaryOutput,
        T::BinaryValue,
        T::MultiStateInput,
        T::MultiStateOutput,
        T::MultiStateValue,
        T::Accumulator,
        T::PulseConverter,
        T::Loop,
        T::IntegerValue,
        T::LargeAnalogValue,
        T::PositiveIntegerValue,
    ];

    numeric
        .into_iter()
        .map(|t| (t, "number".to_string()))
        .chain([(T::CharacterstringValue, "text".to_string())])
        .collect()
}

/// Resolve a configured value column map.
pub fn parse_value_columns(
    columns: Option<&BTreeMap<String, String>>,
) -> Result<HashMap<ObjectType, String>> {
    let Some(columns) = columns else {
        return Ok(default_value_columns());
    };

    columns
        .iter()
        .map(|(object_type, column)| {
            let object_type = object_type
                .parse::<ObjectType>()
                .map_err(|_| Error::Config(format!("unknown object type '{}'", object_type)))?;
            if column.trim().is_empty() {
                return Err(Error::Config(format!("empty value column for '{}'", object_type)));
            }
            Ok((object_type, column.clone()))
        })
        .collect()
}

impl BridgeConfig for GatewayConfig {
    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn validate(&self) -> brickbacnet_bridge_framework::Result<()> {
        self.check().map_err(|e| BridgeError::validation(e.to_string()))
    }
}

impl GatewayConfig {
    fn check(&self) -> Result<()> {
        let bacnet = &self.bacnet;

        if bacnet.version.trim().is_empty() {
            return Err(Error::Config("version cannot be empty".to_string()));
        }

        let polling = &bacnet.polling;
        if polling.devices.is_empty() {
            return Err(Error::Config(
                "At least one polling device must be configured".to_string(),
            ));
        }
        if polling.batch_size == 0 {
            return Err(Error::Config("polling.batch_size must be > 0".to_string()));
        }
        if polling.max_concurrent_sweeps == 0 {
            return Err(Error::Config(
                "polling.max_concurrent_sweeps must be > 0".to_string(),
            ));
        }
        polling.skip_set()?;

        for field in bacnet.discovery.object_custom_fields.keys() {
            if field.trim().is_empty() {
                return Err(Error::Config("custom field names cannot be empty".to_string()));
            }
        }
        bacnet.discovery.custom_fields()?;

        match &bacnet.network {
            NetworkConfig::Simulated { devices, .. } => {
                let mut seen = HashSet::new();
                for device in devices {
                    if !seen.insert(device.device_id) {
                        return Err(Error::Config(format!(
                            "Device {}: configured more than once",
                            device.device_id
                        )));
                    }
                    address::decode(&device.address).map_err(|e| {
                        Error::Config(format!("Device {}: {}", device.device_id, e))
                    })?;
                }
            }
        }

        if let SinkConfig::Http {
            url, value_columns, ..
        } = &self.sink
        {
            if url.trim().is_empty() {
                return Err(Error::Config("sink url cannot be empty".to_string()));
            }
            parse_value_columns(value_columns.as_ref())?;
        }

        Ok(())
    }
}
