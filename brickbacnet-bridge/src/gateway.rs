//! Wires the transport, metadata store and sink together from configuration.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::actuation::Actuator;
use crate::client::BacnetClient;
use crate::config::{BacnetConfig, GatewayConfig, NetworkConfig};
use crate::discovery::{DeviceDiscovery, ObjectDiscovery};
use crate::error::{Error, Result};
use crate::model::Device;
use crate::poller::PollingScheduler;
use crate::sink::{self, TimeseriesSink};
use crate::store::MetadataStore;
use crate::transport::{SimulatedNetwork, TransportClient};

/// A configured gateway instance.
pub struct Gateway {
    config: BacnetConfig,
    client: BacnetClient,
    store: MetadataStore,
    sink: Arc<dyn TimeseriesSink>,
}

impl Gateway {
    /// Open the store, attach the network and build the sink.
    pub async fn from_config(config: &GatewayConfig) -> Result<Self> {
        let bacnet = &config.bacnet;
        let store = MetadataStore::open(&bacnet.database, bacnet.version.clone()).await?;

        let transport = match &bacnet.network {
            NetworkConfig::Simulated { devices, latency_ms } => {
                info!("Attaching simulated network with {} device(s)", devices.len());
                let network = SimulatedNetwork::from_config(devices)?
                    .with_latency(Duration::from_millis(*latency_ms));
                TransportClient::start(network)
            }
        };

        let sink = sink::from_config(&config.sink)?;
        Ok(Self::new(
            bacnet.clone(),
            BacnetClient::new(Arc::new(transport)),
            store,
            sink,
        ))
    }

    pub fn new(
        config: BacnetConfig,
        client: BacnetClient,
        store: MetadataStore,
        sink: Arc<dyn TimeseriesSink>,
    ) -> Self {
        Self {
            config,
            client,
            store,
            sink,
        }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    /// Discover devices, then the objects of each device found.
    pub async fn discover(&self, ctx: &CancellationToken) -> Result<Vec<Device>> {
        let discovery = &self.config.discovery;
        let devices = DeviceDiscovery::new(self.client.clone(), self.store.clone(), discovery)
            .run(ctx)
            .await?;

        let objects = ObjectDiscovery::new(self.client.clone(), self.store.clone(), discovery)?;
        for device in &devices {
            let points = objects.discover(device, ctx).await?;
            info!(
                "Device {} ({}): {} point(s) recorded",
                device.device_id,
                device.name.as_deref().unwrap_or("unnamed"),
                points.len()
            );
        }
        Ok(devices)
    }

    /// Assign UUIDs to `device_id`, or to every stored device.
    pub async fn assign_uuids(&self, device_id: Option<u32>) -> Result<usize> {
        let devices = match device_id {
            Some(id) => vec![id],
            None => self
                .store
                .list_devices()
                .await?
                .into_iter()
                .map(|d| d.device_id)
                .collect(),
        };

        let mut assigned = 0;
        for id in devices {
            assigned += self.store.assign_missing_uuids(id).await?;
        }
        Ok(assigned)
    }

    pub fn scheduler(&self) -> Result<PollingScheduler> {
        PollingScheduler::new(
            self.client.clone(),
            self.store.clone(),
            Arc::clone(&self.sink),
            self.config.polling.clone(),
        )
    }

    /// Poll the configured devices until cancelled.
    pub async fn poll(&self, ctx: CancellationToken) -> Result<()> {
        for &device_id in &self.config.polling.devices {
            match self.store.read_device(device_id).await {
                Ok(_) => {}
                Err(Error::NotFound(_)) => warn!(
                    device = device_id,
                    "Device not in metadata store; run discovery first"
                ),
                Err(e) => return Err(e),
            }
        }
        Arc::new(self.scheduler()?).run(ctx).await
    }

    /// Discover, then poll until cancelled.
    pub async fn run(&self, ctx: CancellationToken) -> Result<()> {
        match self.discover(&ctx).await {
            Ok(_) => {}
            Err(Error::Cancelled) => return Ok(()),
            Err(e) => return Err(e),
        }
        self.poll(ctx).await
    }

    pub fn actuator(&self) -> Actuator {
        Actuator::new(
            self.client.clone(),
            self.store.clone(),
            self.config.discovery.read_timeout(),
        )
    }
}
