//! Windowed profile management on top of the merge engine.
//!
//! The [`ProfileManager`] owns the full pipeline for measurement
//! records: stamping each record with its session and window identity at
//! buffer time, merging buffered records into per-window [`Rollup`]
//! accumulators, and rotating finished windows out to a
//! [`crate::writer::ProfileWriter`].
//!
//! Rotation is time-driven. A ticker aligned to the window-unit grid
//! merges whatever is still buffered and then flushes every profile in
//! the map; entries whose write fails stay in the map and ride along to
//! the next flush. [`ProfileManager::stop`] runs one final
//! merge-and-flush so a clean shutdown leaves nothing behind.

pub mod key;
pub mod record;
pub mod rollup;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use key::{ProfileKey, WindowUnit};
pub use record::{MeasurementRecord, StampedRecord};
pub use rollup::{FieldRollup, Rollup};

use crate::export::HealthMetrics;
use crate::map::PersistentMap;
use crate::merge::{BufferedMergeEngine, EngineOptions, PopSize};
use crate::queue::PersistentQueue;
use crate::writer::ProfileWriter;

/// Map value for one profile window: identity fields the writer needs
/// plus the accumulator itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub tenant_id: String,
    pub dataset_id: String,
    pub rollup: Rollup,
}

impl ProfileEntry {
    pub fn for_key(key: &ProfileKey) -> Self {
        Self {
            tenant_id: key.tenant_id.clone(),
            dataset_id: key.dataset_id.clone(),
            rollup: Rollup::default(),
        }
    }
}

/// Result of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Profiles written and dropped from the map.
    pub written: usize,
    /// Profiles whose write failed and were retained.
    pub failed: usize,
}

/// Tuning for a [`ProfileManager`]. Intervals must be nonzero.
#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    /// Window granularity for profile bucketing.
    pub unit: WindowUnit,
    /// Cadence of rotation flushes, aligned to the window-unit grid.
    pub rotation_interval: Duration,
    /// Cadence of background merge requests, covering records that were
    /// restored from a durable queue with no ingestion to nudge them.
    pub merge_interval: Duration,
    /// Debounce applied to merge requests.
    pub merge_debounce: Duration,
    /// Pop size for merge passes.
    pub merge_batch: PopSize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            unit: WindowUnit::Hour,
            rotation_interval: Duration::from_secs(300),
            merge_interval: Duration::from_secs(30),
            merge_debounce: Duration::from_secs(1),
            merge_batch: PopSize::All,
        }
    }
}

type ProfileEngine = BufferedMergeEngine<StampedRecord, ProfileKey, ProfileEntry>;

struct FlushRequest {
    done: oneshot::Sender<Result<FlushReport>>,
}

/// Owns the buffer-merge-rotate pipeline for one session.
pub struct ProfileManager<W: ProfileWriter> {
    engine: ProfileEngine,
    writer: Arc<W>,
    opts: ManagerOptions,
    session_start: DateTime<Utc>,
    metrics: Option<Arc<HealthMetrics>>,
    flush_tx: mpsc::Sender<FlushRequest>,
    flush_rx: Option<mpsc::Receiver<FlushRequest>>,
    cancel: CancellationToken,
    run_task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl<W: ProfileWriter> ProfileManager<W> {
    /// Wires the manager onto a queue/map pair. The session start is
    /// stamped once, here, and carried by every record this manager
    /// buffers.
    pub fn new(
        queue: PersistentQueue<StampedRecord>,
        map: PersistentMap<ProfileKey, ProfileEntry>,
        writer: Arc<W>,
        opts: ManagerOptions,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let engine = BufferedMergeEngine::spawn(
            queue,
            map,
            |stamped: &StampedRecord| stamped.profile_key(),
            ProfileEntry::for_key,
            |entry: &mut ProfileEntry, stamped: StampedRecord| entry.rollup.track(&stamped.record),
            EngineOptions {
                debounce: opts.merge_debounce,
                pop_size: opts.merge_batch,
            },
            metrics.clone(),
        );
        let (flush_tx, flush_rx) = mpsc::channel(16);
        Self {
            engine,
            writer,
            opts,
            session_start: Utc::now(),
            metrics,
            flush_tx,
            flush_rx: Some(flush_rx),
            cancel: CancellationToken::new(),
            run_task: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Starts the rotation loop.
    pub async fn start(&mut self) -> Result<()> {
        let flush_rx = self.flush_rx.take().expect("start called more than once");
        let handle = tokio::spawn(run_loop(
            self.engine.clone(),
            Arc::clone(&self.writer),
            self.opts,
            self.metrics.clone(),
            self.cancel.clone(),
            flush_rx,
        ));
        *self.run_task.lock().await = Some(handle);
        info!(
            unit = self.opts.unit.as_str(),
            rotation_interval = ?self.opts.rotation_interval,
            writer = self.writer.name(),
            "profile manager started"
        );
        Ok(())
    }

    /// Stops the rotation loop, merging and flushing whatever remains.
    pub async fn stop(&self) -> Result<()> {
        info!("stopping profile manager");
        self.cancel.cancel();
        let handle = self.run_task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "profile manager task join failed");
            }
        }
        Ok(())
    }

    /// Durably buffers one measurement record.
    ///
    /// The record's window is computed here, from the record's own
    /// timestamp, so late merges cannot shift it into a newer window.
    pub async fn buffer(&self, record: MeasurementRecord) -> Result<()> {
        let window_start = self.opts.unit.truncate(record.timestamp);
        let stamped = StampedRecord {
            record,
            session_start: self.session_start,
            window_start,
        };
        self.engine.buffer(stamped).await?;
        if let Some(metrics) = &self.metrics {
            metrics.records_buffered_total.inc();
        }
        Ok(())
    }

    /// Requests a merge pass and waits for it to finish.
    pub async fn merge_buffered(&self, limit: Option<PopSize>) -> Result<()> {
        self.engine.merge_buffered(limit).await
    }

    /// Merges and flushes out of band, outside the rotation cadence.
    pub async fn flush(&self) -> Result<FlushReport> {
        if self.flush_rx.is_some() {
            bail!("profile manager is not started");
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.flush_tx
            .send(FlushRequest { done: done_tx })
            .await
            .map_err(|_| anyhow!("profile manager is not running"))?;
        done_rx
            .await
            .map_err(|_| anyhow!("profile manager dropped the flush reply"))?
    }

    /// Snapshot of every profile currently accumulating.
    pub async fn profiles(&self) -> Result<HashMap<ProfileKey, ProfileEntry>> {
        self.engine.map().get_all().await
    }

    pub fn session_start(&self) -> DateTime<Utc> {
        self.session_start
    }

    pub fn queue(&self) -> &PersistentQueue<StampedRecord> {
        self.engine.queue()
    }

    pub fn map(&self) -> &PersistentMap<ProfileKey, ProfileEntry> {
        self.engine.map()
    }
}

async fn run_loop<W: ProfileWriter>(
    engine: ProfileEngine,
    writer: Arc<W>,
    opts: ManagerOptions,
    metrics: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
    mut flush_rx: mpsc::Receiver<FlushRequest>,
) {
    let mut current_window = opts.unit.truncate(Utc::now());

    // First rotation lands on the cadence grid aligned to the window
    // unit, so hourly windows flush just past the top of the hour.
    let initial_delay = first_rotation_delay(Utc::now(), opts.unit, opts.rotation_interval);
    let mut rotation_ticker = interval_at(Instant::now() + initial_delay, opts.rotation_interval);
    rotation_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut merge_ticker = interval(opts.merge_interval);
    merge_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = engine.merge_buffered(None).await {
                    warn!(error = %e, "final merge failed, flushing what is already merged");
                }
                match flush_once(&engine, writer.as_ref(), &metrics).await {
                    Ok(report) => info!(
                        written = report.written,
                        failed = report.failed,
                        "final flush complete"
                    ),
                    Err(e) => warn!(error = %e, "final flush failed"),
                }
                return;
            }
            Some(req) = flush_rx.recv() => {
                let result = rotate(&engine, writer.as_ref(), &opts, &metrics, &mut current_window).await;
                let _ = req.done.send(result);
            }
            _ = merge_ticker.tick() => {
                engine.request_merge(None);
            }
            _ = rotation_ticker.tick() => {
                if let Err(e) = rotate(&engine, writer.as_ref(), &opts, &metrics, &mut current_window).await {
                    warn!(error = %e, "rotation flush failed");
                }
            }
        }
    }
}

/// One rotation: merge everything buffered, flush every profile, advance
/// the current window.
async fn rotate<W: ProfileWriter>(
    engine: &ProfileEngine,
    writer: &W,
    opts: &ManagerOptions,
    metrics: &Option<Arc<HealthMetrics>>,
    current_window: &mut DateTime<Utc>,
) -> Result<FlushReport> {
    if let Err(e) = engine.merge_buffered(None).await {
        warn!(error = %e, "pre-flush merge failed, flushing what is already merged");
    }
    let report = flush_once(engine, writer, metrics).await?;

    let new_window = opts.unit.truncate(Utc::now());
    if new_window != *current_window {
        info!(from = %current_window, to = %new_window, "window advanced");
        *current_window = new_window;
    }
    if let Some(metrics) = metrics {
        metrics.rotations.inc();
    }
    Ok(report)
}

/// Writes every profile in the map, dropping each entry only after its
/// write succeeded. Failed writes leave the entry for the next flush.
async fn flush_once<W: ProfileWriter>(
    engine: &ProfileEngine,
    writer: &W,
    metrics: &Option<Arc<HealthMetrics>>,
) -> Result<FlushReport> {
    let entries = engine.map().get_all().await?;
    if entries.is_empty() {
        debug!("no profiles to flush");
        return Ok(FlushReport::default());
    }

    let started = Instant::now();
    let mut report = FlushReport::default();
    for (key, entry) in entries {
        match writer.write(&key, &entry).await {
            Ok(location) => {
                debug!(
                    tenant = %key.tenant_id,
                    dataset = %key.dataset_id,
                    window = %key.window_start,
                    location = %location,
                    "profile flushed"
                );
                // Drop the entry only if it is unchanged; records merged
                // in while the write ran stay for the next flush.
                let written = entry;
                if let Err(e) = engine
                    .map()
                    .set(key, move |current| async move {
                        Ok(match current {
                            Some(live) if live == written => None,
                            other => other,
                        })
                    })
                    .await
                {
                    warn!(error = %e, "failed to drop flushed profile, it may flush again");
                }
                report.written += 1;
            }
            Err(e) => {
                warn!(
                    tenant = %key.tenant_id,
                    dataset = %key.dataset_id,
                    error = %e,
                    "profile write failed, retaining for retry"
                );
                report.failed += 1;
            }
        }
    }

    if let Some(metrics) = metrics {
        metrics.profiles_flushed.inc_by(report.written as f64);
        metrics.flush_failures.inc_by(report.failed as f64);
        metrics.flush_duration.observe(started.elapsed().as_secs_f64());
    }
    info!(
        written = report.written,
        failed = report.failed,
        "flush pass complete"
    );
    Ok(report)
}

/// Delay until the next rotation tick, chosen so ticks land on multiples
/// of the cadence counted from the current window's start.
fn first_rotation_delay(now: DateTime<Utc>, unit: WindowUnit, every: Duration) -> Duration {
    let since_window = now
        .signed_duration_since(unit.truncate(now))
        .to_std()
        .unwrap_or_default();
    let every_secs = every.as_secs().max(1);
    let into_cadence = since_window.as_secs() % every_secs;
    Duration::from_secs(every_secs - into_cadence)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::store::{MemoryMapLayer, MemoryQueueLayer};
    use crate::writer::MemoryWriter;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn quiet_options() -> ManagerOptions {
        // Tickers far in the future so tests drive merges and flushes
        // explicitly.
        ManagerOptions {
            unit: WindowUnit::Hour,
            rotation_interval: Duration::from_secs(3600),
            merge_interval: Duration::from_secs(3600),
            merge_debounce: Duration::from_millis(20),
            merge_batch: PopSize::All,
        }
    }

    fn memory_manager<W: ProfileWriter>(writer: Arc<W>) -> ProfileManager<W> {
        ProfileManager::new(
            PersistentQueue::spawn(MemoryQueueLayer::new()),
            PersistentMap::spawn(MemoryMapLayer::new()),
            writer,
            quiet_options(),
            None,
        )
    }

    fn record_at(timestamp: DateTime<Utc>, tags: Vec<(String, String)>) -> MeasurementRecord {
        let mut values = BTreeMap::new();
        values.insert("latency_ms".to_string(), 10.0);
        MeasurementRecord {
            tenant_id: "acme".to_string(),
            dataset_id: "api".to_string(),
            tags,
            timestamp,
            values,
        }
    }

    #[tokio::test]
    async fn test_records_in_same_window_share_one_profile() {
        let manager = memory_manager(Arc::new(MemoryWriter::new()));
        manager
            .buffer(record_at(ts("2025-03-14T09:10:00Z"), Vec::new()))
            .await
            .unwrap();
        manager
            .buffer(record_at(ts("2025-03-14T09:50:00Z"), Vec::new()))
            .await
            .unwrap();
        manager.merge_buffered(None).await.unwrap();

        let profiles = manager.profiles().await.unwrap();
        assert_eq!(profiles.len(), 1);
        let entry = profiles.values().next().unwrap();
        assert_eq!(entry.rollup.record_count, 2);
        assert_eq!(entry.rollup.fields["latency_ms"].sum, 20.0);
    }

    #[tokio::test]
    async fn test_records_an_hour_apart_get_separate_profiles() {
        let manager = memory_manager(Arc::new(MemoryWriter::new()));
        manager
            .buffer(record_at(ts("2025-03-14T09:10:00Z"), Vec::new()))
            .await
            .unwrap();
        manager
            .buffer(record_at(ts("2025-03-14T10:10:00Z"), Vec::new()))
            .await
            .unwrap();
        manager.merge_buffered(None).await.unwrap();

        let profiles = manager.profiles().await.unwrap();
        assert_eq!(profiles.len(), 2);
        let mut windows: Vec<_> = profiles.keys().map(|k| k.window_start).collect();
        windows.sort();
        assert_eq!(windows, vec![ts("2025-03-14T09:00:00Z"), ts("2025-03-14T10:00:00Z")]);
    }

    #[tokio::test]
    async fn test_window_is_stamped_from_record_timestamp_at_buffer_time() {
        let manager = memory_manager(Arc::new(MemoryWriter::new()));
        // A record carrying an old timestamp lands in that old window, no
        // matter when it is buffered or merged.
        manager
            .buffer(record_at(ts("2020-01-01T05:42:00Z"), Vec::new()))
            .await
            .unwrap();
        manager.merge_buffered(None).await.unwrap();

        let profiles = manager.profiles().await.unwrap();
        let key = profiles.keys().next().unwrap();
        assert_eq!(key.window_start, ts("2020-01-01T05:00:00Z"));
        assert_eq!(key.session_start, manager.session_start());
    }

    #[tokio::test]
    async fn test_tag_sets_separate_profiles_but_order_does_not() {
        let manager = memory_manager(Arc::new(MemoryWriter::new()));
        let when = ts("2025-03-14T09:10:00Z");
        let env = ("env".to_string(), "prod".to_string());
        let region = ("region".to_string(), "eu".to_string());

        manager
            .buffer(record_at(when, vec![env.clone(), region.clone()]))
            .await
            .unwrap();
        manager
            .buffer(record_at(when, vec![region, env]))
            .await
            .unwrap();
        manager.buffer(record_at(when, Vec::new())).await.unwrap();
        manager.merge_buffered(None).await.unwrap();

        let profiles = manager.profiles().await.unwrap();
        // Both tagged records share a profile; the untagged one is apart.
        assert_eq!(profiles.len(), 2);
        let tagged = profiles
            .iter()
            .find(|(key, _)| !key.tags.is_empty())
            .map(|(_, entry)| entry)
            .unwrap();
        assert_eq!(tagged.rollup.record_count, 2);
    }

    #[tokio::test]
    async fn test_flush_writes_profiles_and_clears_map() {
        let writer = Arc::new(MemoryWriter::new());
        let mut manager = memory_manager(Arc::clone(&writer));
        manager.start().await.unwrap();

        manager
            .buffer(record_at(ts("2025-03-14T09:10:00Z"), Vec::new()))
            .await
            .unwrap();
        let report = manager.flush().await.unwrap();

        assert_eq!(report, FlushReport { written: 1, failed: 0 });
        assert_eq!(writer.written_count(), 1);
        assert!(manager.profiles().await.unwrap().is_empty());

        let written = writer.take_written();
        assert_eq!(written[0].tenant_id, "acme");
        assert_eq!(written[0].window_start, ts("2025-03-14T09:00:00Z"));
        assert_eq!(written[0].rollup.record_count, 1);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_with_nothing_merged_calls_writer_zero_times() {
        let writer = Arc::new(MemoryWriter::new());
        let mut manager = memory_manager(Arc::clone(&writer));
        manager.start().await.unwrap();

        let report = manager.flush().await.unwrap();
        assert_eq!(report, FlushReport::default());
        assert_eq!(writer.written_count(), 0);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_before_start_is_an_error() {
        let manager = memory_manager(Arc::new(MemoryWriter::new()));
        let err = manager.flush().await.unwrap_err();
        assert!(err.to_string().contains("not started"));
    }

    struct FlakyWriter {
        inner: MemoryWriter,
        fail: AtomicBool,
    }

    impl ProfileWriter for FlakyWriter {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn write(&self, key: &ProfileKey, entry: &ProfileEntry) -> Result<String> {
            if self.fail.load(Ordering::SeqCst) {
                bail!("writer offline");
            }
            self.inner.write(key, entry).await
        }
    }

    #[tokio::test]
    async fn test_failed_writes_retain_profiles_until_success() {
        let writer = Arc::new(FlakyWriter {
            inner: MemoryWriter::new(),
            fail: AtomicBool::new(true),
        });
        let mut manager = memory_manager(Arc::clone(&writer));
        manager.start().await.unwrap();

        manager
            .buffer(record_at(ts("2025-03-14T09:10:00Z"), Vec::new()))
            .await
            .unwrap();

        let report = manager.flush().await.unwrap();
        assert_eq!(report, FlushReport { written: 0, failed: 1 });
        assert_eq!(manager.profiles().await.unwrap().len(), 1);
        assert_eq!(writer.inner.written_count(), 0);

        writer.fail.store(false, Ordering::SeqCst);
        let report = manager.flush().await.unwrap();
        assert_eq!(report, FlushReport { written: 1, failed: 0 });
        assert!(manager.profiles().await.unwrap().is_empty());
        assert_eq!(writer.inner.written_count(), 1);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_flushes_remaining_profiles() {
        let writer = Arc::new(MemoryWriter::new());
        let mut manager = memory_manager(Arc::clone(&writer));
        manager.start().await.unwrap();

        // Buffered but never explicitly merged; stop must pick it up.
        manager
            .buffer(record_at(ts("2025-03-14T09:10:00Z"), Vec::new()))
            .await
            .unwrap();
        manager.stop().await.unwrap();

        assert_eq!(writer.written_count(), 1);
    }

    #[test]
    fn test_first_rotation_delay_lands_on_cadence_grid() {
        let every = Duration::from_secs(300);
        // 17m30s into the hour: next five-minute mark is 2m30s away.
        let delay =
            first_rotation_delay(ts("2025-03-14T09:17:30Z"), WindowUnit::Hour, every);
        assert_eq!(delay, Duration::from_secs(150));

        // Exactly on a mark: the next tick is a full cadence away.
        let delay =
            first_rotation_delay(ts("2025-03-14T09:20:00Z"), WindowUnit::Hour, every);
        assert_eq!(delay, every);
    }
}
