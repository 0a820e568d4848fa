//! Service orchestration.
//!
//! [`Service`] owns every pipeline component and wires them together
//! from a [`Config`]: storage layers, the buffer queue and profile map
//! actors, the profile manager, the writer, and the health metrics
//! server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, StorageBackend, WriterBackend};
use crate::export::HealthMetrics;
use crate::map::PersistentMap;
use crate::merge::PopSize;
use crate::profile::{
    FlushReport, ManagerOptions, MeasurementRecord, ProfileEntry, ProfileKey, ProfileManager,
    StampedRecord,
};
use crate::queue::PersistentQueue;
use crate::store::{JsonCodec, MemoryMapLayer, MemoryQueueLayer, SqliteMapLayer, SqliteQueueLayer};
use crate::writer::{FileWriter, MemoryWriter, ProfileWriter, Writer};

/// Buffer queue database filename under `storage.dir`.
const QUEUE_DB: &str = "buffer.sqlite";
/// Profile map database filename under `storage.dir`.
const MAP_DB: &str = "profiles.sqlite";
/// Cadence of the queue depth and map size gauge updates.
const DEPTH_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// The aggregoor service: owns all pipeline components and wires them
/// together.
pub struct Service {
    cfg: Config,
    health: Arc<HealthMetrics>,
    manager: Option<ProfileManager<Writer>>,
    cancel: CancellationToken,
}

impl Service {
    /// Creates a new service from the given configuration.
    pub fn new(cfg: Config) -> Result<Self> {
        let health = Arc::new(HealthMetrics::new(&cfg.health.addr)?);

        Ok(Self {
            cfg,
            health,
            manager: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Starts all components in dependency order.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Start the health metrics server (if enabled) so probes
        // respond while storage opens.
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        // 2. Open the storage layers and spawn the queue and map actors.
        let (queue, map) = self.open_stores().context("opening storage")?;

        // 3. Build the profile writer.
        let writer = Arc::new(self.build_writer());
        info!(writer = writer.name(), "profile writer configured");

        // 4. Build and start the profile manager.
        let opts = ManagerOptions {
            unit: self.cfg.window.unit,
            rotation_interval: self.cfg.window.rotation_interval,
            merge_interval: self.cfg.merge.interval,
            merge_debounce: self.cfg.merge.debounce,
            merge_batch: self.cfg.merge.batch,
        };
        let mut manager =
            ProfileManager::new(queue, map, writer, opts, Some(Arc::clone(&self.health)));
        manager.start().await.context("starting profile manager")?;

        // 5. Start the depth monitor feeding the queue and map gauges.
        self.spawn_depth_monitor(manager.queue().clone(), manager.map().clone());

        self.manager = Some(manager);

        info!("service fully started");
        Ok(())
    }

    /// Stops all components in reverse order.
    pub async fn stop(&mut self) -> Result<()> {
        info!("stopping service");

        // Stop the depth monitor first so gauge polls cannot race the
        // actors winding down.
        self.cancel.cancel();

        // Manager shutdown runs the final merge and flush.
        if let Some(manager) = &self.manager {
            if let Err(e) = manager.stop().await {
                warn!(error = %e, "error stopping profile manager");
            }
        }

        if self.cfg.health.enabled {
            if let Err(e) = self.health.stop().await {
                warn!(error = %e, "error stopping health metrics server");
            }
        }

        info!("service stopped");
        Ok(())
    }

    /// Durably buffers one measurement record.
    pub async fn buffer(&self, record: MeasurementRecord) -> Result<()> {
        self.require_manager()?.buffer(record).await
    }

    /// Requests a merge pass and waits for it to finish.
    pub async fn merge_buffered(&self, limit: Option<PopSize>) -> Result<()> {
        self.require_manager()?.merge_buffered(limit).await
    }

    /// Merges and flushes out of band, outside the rotation cadence.
    pub async fn flush(&self) -> Result<FlushReport> {
        self.require_manager()?.flush().await
    }

    fn require_manager(&self) -> Result<&ProfileManager<Writer>> {
        self.manager.as_ref().context("service is not started")
    }

    fn open_stores(
        &self,
    ) -> Result<(
        PersistentQueue<StampedRecord>,
        PersistentMap<ProfileKey, ProfileEntry>,
    )> {
        match self.cfg.storage.backend {
            StorageBackend::Memory => {
                info!("using in-memory storage; buffered data will not survive restarts");
                Ok((
                    PersistentQueue::spawn(MemoryQueueLayer::new()),
                    PersistentMap::spawn(MemoryMapLayer::new()),
                ))
            }
            StorageBackend::Sqlite => {
                let dir = &self.cfg.storage.dir;
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating storage directory {}", dir.display()))?;

                let queue_path = dir.join(QUEUE_DB);
                let queue_layer: SqliteQueueLayer<StampedRecord> =
                    SqliteQueueLayer::open(&queue_path, JsonCodec).with_context(|| {
                        format!("opening queue database {}", queue_path.display())
                    })?;

                let map_path = dir.join(MAP_DB);
                let map_layer: SqliteMapLayer<ProfileKey, ProfileEntry> =
                    SqliteMapLayer::open(&map_path, JsonCodec)
                        .with_context(|| format!("opening map database {}", map_path.display()))?;

                info!(dir = %dir.display(), "sqlite storage opened");
                Ok((
                    PersistentQueue::spawn(queue_layer),
                    PersistentMap::spawn(map_layer),
                ))
            }
        }
    }

    fn build_writer(&self) -> Writer {
        match self.cfg.writer.backend {
            WriterBackend::File => Writer::File(FileWriter::new(self.cfg.writer.dir.clone())),
            WriterBackend::Memory => Writer::Memory(MemoryWriter::new()),
        }
    }

    /// Spawns a task that periodically publishes queue depth and map
    /// size to the health gauges.
    fn spawn_depth_monitor(
        &self,
        queue: PersistentQueue<StampedRecord>,
        map: PersistentMap<ProfileKey, ProfileEntry>,
    ) {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);

        tokio::spawn(async move {
            let mut ticker = interval(DEPTH_POLL_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        match queue.size().await {
                            Ok(depth) => health.queue_depth.set(depth as f64),
                            Err(e) => warn!(error = %e, "queue depth poll failed"),
                        }
                        match map.size().await {
                            Ok(profiles) => health.map_profiles.set(profiles as f64),
                            Err(e) => warn!(error = %e, "map size poll failed"),
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::config::{HealthConfig, MergeConfig, StorageConfig, WindowConfig, WriterConfig};
    use crate::profile::WindowUnit;

    fn test_config(
        storage: StorageBackend,
        storage_dir: PathBuf,
        writer: WriterBackend,
        writer_dir: PathBuf,
    ) -> Config {
        let cfg = Config {
            log_level: "info".to_string(),
            storage: StorageConfig {
                backend: storage,
                dir: storage_dir,
            },
            window: WindowConfig {
                unit: WindowUnit::Hour,
                rotation_interval: Duration::from_secs(300),
            },
            // Long tickers keep background cadences out of the way;
            // tests drive merges and flushes explicitly.
            merge: MergeConfig {
                interval: Duration::from_secs(3600),
                debounce: Duration::from_millis(20),
                batch: PopSize::All,
            },
            writer: WriterConfig {
                backend: writer,
                dir: writer_dir,
            },
            health: HealthConfig {
                enabled: false,
                addr: ":9090".to_string(),
            },
        };
        assert!(cfg.validate().is_ok());
        cfg
    }

    fn record(latency_ms: f64) -> MeasurementRecord {
        MeasurementRecord {
            tenant_id: "acme".to_string(),
            dataset_id: "checkout".to_string(),
            tags: vec![("region".to_string(), "eu-west".to_string())],
            timestamp: Utc.with_ymd_and_hms(2026, 3, 14, 10, 15, 0).unwrap(),
            values: BTreeMap::from([("latency_ms".to_string(), latency_ms)]),
        }
    }

    #[tokio::test]
    async fn test_buffer_before_start_is_an_error() {
        let cfg = test_config(
            StorageBackend::Memory,
            PathBuf::new(),
            WriterBackend::Memory,
            PathBuf::new(),
        );
        let svc = Service::new(cfg).unwrap();

        let err = svc.buffer(record(1.0)).await.unwrap_err();
        assert!(err.to_string().contains("not started"));
    }

    #[tokio::test]
    async fn test_memory_service_full_cycle() {
        let cfg = test_config(
            StorageBackend::Memory,
            PathBuf::new(),
            WriterBackend::Memory,
            PathBuf::new(),
        );
        let mut svc = Service::new(cfg).unwrap();
        svc.start().await.unwrap();

        svc.buffer(record(120.0)).await.unwrap();
        svc.buffer(record(80.0)).await.unwrap();

        // Both records share tenant, dataset, tags and window.
        let report = svc.flush().await.unwrap();
        assert_eq!(
            report,
            FlushReport {
                written: 1,
                failed: 0
            }
        );

        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_service_writes_profile_files() {
        let data_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let cfg = test_config(
            StorageBackend::Sqlite,
            data_dir.path().to_path_buf(),
            WriterBackend::File,
            out_dir.path().to_path_buf(),
        );
        let mut svc = Service::new(cfg).unwrap();
        svc.start().await.unwrap();

        svc.buffer(record(42.0)).await.unwrap();
        let report = svc.flush().await.unwrap();
        assert_eq!(report.written, 1);

        let files: Vec<_> = std::fs::read_dir(out_dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);

        svc.stop().await.unwrap();
    }
}
