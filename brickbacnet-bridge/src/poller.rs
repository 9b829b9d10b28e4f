//! Present-value polling and timeseries forwarding.
//!
//! Every configured device gets its own sweep loop. A sweep reads the
//! present value of each stored point in batches, forwards each batch to the
//! sink in one call and then waits out the rest of the minimum interval.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{BacnetClient, pace};
use crate::config::{MissingUuidPolicy, PollingConfig};
use crate::error::{Error, Result};
use crate::model::{DataPoint, Reading};
use crate::object::{ObjectType, PropertyId};
use crate::sink::TimeseriesSink;
use crate::store::MetadataStore;

/// Pause before restarting a device task that panicked.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Outcome of one device sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sink calls made.
    pub batches: usize,
    pub readings: usize,
    /// Readings forwarded without a value.
    pub nulls: usize,
    /// Points not polled (skip-set or missing UUID).
    pub skipped: usize,
}

/// Time left to wait before the next sweep may start.
pub fn next_sweep_delay(elapsed: Duration, min_interval: Duration) -> Duration {
    min_interval.saturating_sub(elapsed)
}

/// Runs batched present-value sweeps for the configured devices.
pub struct PollingScheduler {
    client: BacnetClient,
    store: MetadataStore,
    sink: Arc<dyn TimeseriesSink>,
    config: PollingConfig,
    skip: HashSet<ObjectType>,
    permits: Semaphore,
}

impl PollingScheduler {
    pub fn new(
        client: BacnetClient,
        store: MetadataStore,
        sink: Arc<dyn TimeseriesSink>,
        config: PollingConfig,
    ) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::Config("batch size must be > 0".to_string()));
        }
        let skip = config.skip_set()?;
        let permits = Semaphore::new(config.max_concurrent_sweeps.max(1));

        Ok(Self {
            client,
            store,
            sink,
            config,
            skip,
            permits,
        })
    }

    /// Run one sweep over every stored point of `device_id`.
    ///
    /// Unsupported present values become null readings. Any other read
    /// failure aborts the sweep and discards the batch in progress. The point
    /// UUID is looked up only once its read has succeeded.
    pub async fn sweep(&self, device_id: u32, ctx: &CancellationToken) -> Result<SweepReport> {
        let device = self.store.read_device(device_id).await?.device;
        let points = self.store.read_objects(device_id).await?;
        let mut report = SweepReport::default();

        debug!(device = device_id, points = points.len(), "Sweep started");

        for batch in points.chunks(self.config.batch_size) {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let mut readings = Vec::with_capacity(batch.len());
            for point in batch {
                if self.skip.contains(&point.object_type) {
                    report.skipped += 1;
                    continue;
                }

                if ctx.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let read = self.client.read_property(
                    &device.address,
                    point.object_id(),
                    PropertyId::PresentValue,
                    None,
                    self.config.read_timeout(),
                );
                let outcome = tokio::select! {
                    _ = ctx.cancelled() => return Err(Error::Cancelled),
                    outcome = read => outcome,
                };
                let value = match outcome {
                    Ok(value) => Some(value).filter(|v| !v.is_null()),
                    Err(e) if e.is_unsupported_property() => {
                        warn!(
                            device = device_id,
                            instance = point.instance,
                            object_type = %point.object_type,
                            "Present value not supported, recording null"
                        );
                        None
                    }
                    Err(e) => {
                        error!(
                            device = device_id,
                            instance = point.instance,
                            error = %e,
                            "Read failed, aborting sweep"
                        );
                        return Err(e);
                    }
                };

                pace(ctx, self.config.request_delay()).await?;

                let Some(uuid) = self.resolve_uuid(point)? else {
                    report.skipped += 1;
                    continue;
                };

                if value.is_none() {
                    report.nulls += 1;
                }
                readings.push(Reading {
                    uuid,
                    object_type: point.object_type,
                    timestamp: Utc::now(),
                    value,
                });
            }

            if readings.is_empty() {
                continue;
            }
            report.readings += readings.len();
            report.batches += 1;
            if let Err(e) = self.sink.put_readings(&readings).await {
                error!(
                    device = device_id,
                    readings = readings.len(),
                    error = %e,
                    "Sink rejected batch"
                );
            }
        }

        Ok(report)
    }

    fn resolve_uuid(&self, point: &DataPoint) -> Result<Option<Uuid>> {
        match (point.uuid, self.config.missing_uuid) {
            (Some(uuid), _) => Ok(Some(uuid)),
            (None, MissingUuidPolicy::Abort) => Err(Error::UnassignedUuid {
                device_id: point.device_id,
                instance: point.instance,
            }),
            (None, MissingUuidPolicy::Skip) => {
                warn!(
                    device = point.device_id,
                    instance = point.instance,
                    "No UUID assigned, skipping point"
                );
                Ok(None)
            }
        }
    }

    /// Sweep `device_id` until cancelled, pacing sweep starts by the minimum
    /// interval. A failed sweep is logged; the next sweep is the retry.
    pub async fn run_device(&self, device_id: u32, ctx: &CancellationToken) {
        let min_interval = self.config.min_interval();
        info!(
            "Starting sweep loop for device {} (min interval: {}s)",
            device_id,
            min_interval.as_secs()
        );

        loop {
            let started = Instant::now();
            let outcome = {
                let _permit = tokio::select! {
                    _ = ctx.cancelled() => break,
                    permit = self.permits.acquire() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                self.sweep(device_id, ctx).await
            };

            match outcome {
                Ok(report) => info!(
                    device = device_id,
                    batches = report.batches,
                    readings = report.readings,
                    nulls = report.nulls,
                    skipped = report.skipped,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Sweep finished"
                ),
                Err(Error::Cancelled) => break,
                Err(e) => error!(device = device_id, error = %e, "Sweep aborted"),
            }

            let delay = next_sweep_delay(started.elapsed(), min_interval);
            debug!(device = device_id, delay_ms = delay.as_millis() as u64, "Next sweep scheduled");
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Sweep loop for device {} stopped", device_id);
    }

    /// Run one supervised sweep loop per configured device until cancelled.
    pub async fn run(self: Arc<Self>, ctx: CancellationToken) -> Result<()> {
        let mut tasks = JoinSet::new();
        for &device_id in &self.config.devices {
            tasks.spawn(Arc::clone(&self).supervise(device_id, ctx.clone()));
        }

        info!("Polling {} device(s)", self.config.devices.len());
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    /// Restart the device loop if it panics.
    async fn supervise(self: Arc<Self>, device_id: u32, ctx: CancellationToken) {
        loop {
            let this = Arc::clone(&self);
            let token = ctx.clone();
            let handle = tokio::spawn(async move { this.run_device(device_id, &token).await });

            match handle.await {
                Ok(()) => return,
                Err(e) if e.is_panic() && !ctx.is_cancelled() => {
                    error!(device = device_id, "Sweep task panicked, restarting");
                    if pace(&ctx, RESTART_DELAY).await.is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::model::Device;
    use crate::object::ObjectId;
    use crate::store::DEFAULT_VERSION;
    use crate::transport::{
        ErrorClass, ErrorCode, RequestLog, Segmentation, SimDevice, SimFault, SimulatedNetwork,
        TransportClient,
    };
    use crate::sink::MemorySink;
    use crate::value::{PropertyValue, WireValue};

    const ADDR: &str = "192.168.1.20:47808";

    fn ai(instance: u32) -> ObjectId {
        ObjectId::new(ObjectType::AnalogInput, instance)
    }

    fn config() -> PollingConfig {
        PollingConfig {
            devices: vec![1001],
            min_interval_secs: 120,
            batch_size: 20,
            request_delay_ms: 0,
            read_timeout_ms: 100,
            ..PollingConfig::default()
        }
    }

    fn sim_device(count: u32) -> SimDevice {
        let mut device = SimDevice::new(1001, ADDR).unwrap();
        for instance in 1..=count {
            device = device
                .with_object(ai(instance), &format!("AI-{}", instance))
                .with_property(ai(instance), PropertyId::PresentValue, WireValue::Real(instance as f32));
        }
        device
    }

    fn point(object_type: ObjectType, instance: u32, uuid: Option<Uuid>) -> DataPoint {
        DataPoint {
            device_id: 1001,
            instance,
            object_type,
            description: None,
            vendor_name: None,
            sensor_type: None,
            unit: None,
            custom_fields: BTreeMap::new(),
            uuid,
        }
    }

    async fn store_with(points: &[DataPoint]) -> MetadataStore {
        let store = MetadataStore::in_memory(DEFAULT_VERSION).await.unwrap();
        add_device(&store, 1001, ADDR, points).await;
        store
    }

    async fn add_device(store: &MetadataStore, device_id: u32, address: &str, points: &[DataPoint]) {
        store
            .upsert_device(&Device {
                device_id,
                address: address.to_string(),
                name: None,
                description: None,
                vendor_id: 5,
                max_apdu: 1476,
                segmentation: Segmentation::Both,
                object_count: Some(points.len() as u32),
                vendor_name: None,
                uuid: None,
            })
            .await
            .unwrap();
        for p in points {
            store.upsert_object(p).await.unwrap();
        }
    }

    fn analog_points(count: u32) -> Vec<DataPoint> {
        (1..=count)
            .map(|i| point(ObjectType::AnalogInput, i, Some(Uuid::new_v4())))
            .collect()
    }

    async fn scheduler(
        device: SimDevice,
        points: &[DataPoint],
        sink: Arc<dyn TimeseriesSink>,
        config: PollingConfig,
    ) -> (PollingScheduler, RequestLog) {
        let network = SimulatedNetwork::new().with_device(device);
        let log = network.request_log();
        let client = BacnetClient::new(Arc::new(TransportClient::start(network)));
        let store = store_with(points).await;
        (PollingScheduler::new(client, store, sink, config).unwrap(), log)
    }

    #[test]
    fn test_next_sweep_delay() {
        let interval = Duration::from_secs(120);
        assert_eq!(next_sweep_delay(Duration::from_secs(40), interval), Duration::from_secs(80));
        assert_eq!(next_sweep_delay(Duration::from_secs(150), interval), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_batches_flush_separately() {
        let sink = MemorySink::new();
        let (scheduler, _log) =
            scheduler(sim_device(45), &analog_points(45), Arc::new(sink.clone()), config()).await;

        let report = scheduler.sweep(1001, &CancellationToken::new()).await.unwrap();

        let sizes: Vec<usize> = sink.batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![20, 20, 5]);
        assert_eq!(report.batches, 3);
        assert_eq!(report.readings, 45);
        assert_eq!(report.nulls, 0);

        let first = &sink.batches()[0][0];
        assert_eq!(first.object_type, ObjectType::AnalogInput);
        assert_eq!(first.value, Some(PropertyValue::Real(1.0)));
    }

    #[tokio::test]
    async fn test_unsupported_present_value_is_null() {
        let device = sim_device(20).with_fault(
            ai(5),
            PropertyId::PresentValue,
            None,
            SimFault::Error(ErrorClass::Property, ErrorCode::UnknownProperty),
        );
        let sink = MemorySink::new();
        let (scheduler, _log) =
            scheduler(device, &analog_points(20), Arc::new(sink.clone()), config()).await;

        let report = scheduler.sweep(1001, &CancellationToken::new()).await.unwrap();

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 20);
        assert_eq!(batches[0][4].value, None);
        assert_eq!(batches[0][5].value, Some(PropertyValue::Real(6.0)));
        assert_eq!(report.nulls, 1);
    }

    #[tokio::test]
    async fn test_read_failure_aborts_sweep() {
        let device = sim_device(25).with_fault(ai(23), PropertyId::PresentValue, None, SimFault::NoResponse);
        let sink = MemorySink::new();
        let (scheduler, _log) =
            scheduler(device, &analog_points(25), Arc::new(sink.clone()), config()).await;

        let result = scheduler.sweep(1001, &CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::TransportTimeout(_))));

        // The first batch was flushed, the partial second one discarded.
        let sizes: Vec<usize> = sink.batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![20]);
    }

    #[tokio::test]
    async fn test_missing_uuid_policy() {
        let mut points = analog_points(3);
        points[1].uuid = None;

        let sink = MemorySink::new();
        let (abort, log) =
            scheduler(sim_device(3), &points, Arc::new(sink.clone()), config()).await;
        let result = abort.sweep(1001, &CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(Error::UnassignedUuid { device_id: 1001, instance: 2 })
        ));
        assert!(sink.batches().is_empty());
        // The unassigned point is read before its UUID is checked.
        assert_eq!(log.reads_to(ADDR).len(), 2);

        let skipping = PollingConfig {
            missing_uuid: MissingUuidPolicy::Skip,
            ..config()
        };
        let sink = MemorySink::new();
        let (skip, _log) = scheduler(sim_device(3), &points, Arc::new(sink.clone()), skipping).await;
        let report = skip.sweep(1001, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.readings, 2);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_skip_set_types_are_not_read() {
        let mut points = analog_points(2);
        points.push(point(ObjectType::Device, 1001, Some(Uuid::new_v4())));

        let sink = MemorySink::new();
        let (scheduler, log) =
            scheduler(sim_device(2), &points, Arc::new(sink.clone()), config()).await;
        let report = scheduler.sweep(1001, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.readings, 2);
        assert!(log.reads_to(ADDR).iter().all(|r| r.object.object_type == ObjectType::AnalogInput));
    }

    struct FailingSink(AtomicUsize);

    #[async_trait]
    impl TimeseriesSink for FailingSink {
        async fn put_readings(&self, _readings: &[Reading]) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(Error::Sink("backend unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_stop_sweep() {
        let sink = Arc::new(FailingSink(AtomicUsize::new(0)));
        let (scheduler, _log) =
            scheduler(sim_device(45), &analog_points(45), sink.clone(), config()).await;

        let report = scheduler.sweep(1001, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.batches, 3);
        assert_eq!(sink.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_sweep_sends_nothing() {
        let sink = MemorySink::new();
        let (scheduler, log) =
            scheduler(sim_device(5), &analog_points(5), Arc::new(sink.clone()), config()).await;

        let ctx = CancellationToken::new();
        ctx.cancel();
        assert!(matches!(scheduler.sweep(1001, &ctx).await, Err(Error::Cancelled)));
        assert!(log.entries().is_empty());
        assert!(sink.batches().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let sink = MemorySink::new();
        let (scheduler, _log) =
            scheduler(sim_device(5), &analog_points(5), Arc::new(sink.clone()), config()).await;
        let scheduler = Arc::new(scheduler);

        let ctx = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&scheduler).run(ctx.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        ctx.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));

        // One sweep, then waiting out the two-minute interval.
        assert_eq!(sink.batches().len(), 1);
    }

    const ADDR_2: &str = "192.168.1.21:47808";

    fn second_device(count: u32) -> SimDevice {
        let mut device = SimDevice::new(2002, ADDR_2).unwrap();
        for instance in 1..=count {
            device = device
                .with_object(ai(instance), &format!("AI-{}", instance))
                .with_property(ai(instance), PropertyId::PresentValue, WireValue::Real(0.5));
        }
        device
    }

    fn second_points(count: u32) -> Vec<DataPoint> {
        analog_points(count)
            .into_iter()
            .map(|p| DataPoint { device_id: 2002, ..p })
            .collect()
    }

    async fn two_device_scheduler(
        second: SimDevice,
        sink: Arc<dyn TimeseriesSink>,
        config: PollingConfig,
    ) -> (Arc<PollingScheduler>, HashSet<Uuid>, HashSet<Uuid>) {
        let network = SimulatedNetwork::new().with_device(sim_device(2)).with_device(second);
        let client = BacnetClient::new(Arc::new(TransportClient::start(network)));

        let first_points = analog_points(2);
        let second_points = second_points(2);
        let store = MetadataStore::in_memory(DEFAULT_VERSION).await.unwrap();
        add_device(&store, 1001, ADDR, &first_points).await;
        add_device(&store, 2002, ADDR_2, &second_points).await;

        let uuids = |points: &[DataPoint]| points.iter().filter_map(|p| p.uuid).collect::<HashSet<_>>();
        let config = PollingConfig {
            devices: vec![1001, 2002],
            min_interval_secs: 0,
            ..config
        };
        let scheduler = PollingScheduler::new(client, store, sink, config).unwrap();
        (Arc::new(scheduler), uuids(&first_points), uuids(&second_points))
    }

    #[tokio::test]
    async fn test_stalled_device_does_not_block_others() {
        let stalled = second_device(2).with_fault(ai(1), PropertyId::PresentValue, None, SimFault::NoResponse);
        let sink = MemorySink::new();
        let config = PollingConfig {
            read_timeout_ms: 5_000,
            ..config()
        };
        let (scheduler, healthy, stuck) =
            two_device_scheduler(stalled, Arc::new(sink.clone()), config).await;

        let ctx = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(ctx.clone()));
        tokio::time::sleep(Duration::from_millis(300)).await;

        let readings = sink.readings();
        assert!(sink.batches().len() >= 3);
        assert!(readings.iter().all(|r| healthy.contains(&r.uuid)));
        assert!(!readings.iter().any(|r| stuck.contains(&r.uuid)));

        // The stalled read is abandoned on cancel rather than timed out.
        ctx.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    /// Sink that records how many batches it handles at once.
    #[derive(Default)]
    struct OverlapSink {
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: parking_lot::Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl TimeseriesSink for OverlapSink {
        async fn put_readings(&self, readings: &[Reading]) -> Result<()> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            self.calls.lock().extend(readings.iter().map(|r| r.uuid));
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn peak_overlap(max_concurrent_sweeps: usize) -> (usize, Vec<Uuid>, HashSet<Uuid>, HashSet<Uuid>) {
        let sink = Arc::new(OverlapSink::default());
        let config = PollingConfig {
            max_concurrent_sweeps,
            ..config()
        };
        let (scheduler, first, second) = two_device_scheduler(second_device(2), sink.clone(), config).await;

        let ctx = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(ctx.clone()));
        tokio::time::sleep(Duration::from_millis(300)).await;
        ctx.cancel();
        handle.await.unwrap().unwrap();

        let calls = sink.calls.lock().clone();
        (sink.peak.load(Ordering::SeqCst), calls, first, second)
    }

    #[tokio::test]
    async fn test_sweeps_limited_by_permits() {
        let (peak, calls, first, second) = peak_overlap(1).await;
        assert_eq!(peak, 1);
        assert!(calls.iter().any(|uuid| first.contains(uuid)));
        assert!(calls.iter().any(|uuid| second.contains(uuid)));

        let (peak, _, _, _) = peak_overlap(2).await;
        assert_eq!(peak, 2);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_stalled_read() {
        let device = sim_device(2).with_fault(ai(1), PropertyId::PresentValue, None, SimFault::NoResponse);
        let config = PollingConfig {
            read_timeout_ms: 5_000,
            ..config()
        };
        let (scheduler, _log) =
            scheduler(device, &analog_points(2), Arc::new(MemorySink::new()), config).await;

        let ctx = CancellationToken::new();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        assert!(matches!(scheduler.sweep(1001, &ctx).await, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
