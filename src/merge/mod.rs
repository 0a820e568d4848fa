//! Debounced merge passes from a queue into a map.
//!
//! The [`BufferedMergeEngine`] ties one [`PersistentQueue`] to one
//! [`PersistentMap`]: items buffered into the queue are later folded into
//! keyed accumulators in the map by a merge pass. Passes are requested,
//! not run inline. A dedicated worker absorbs every request that arrives
//! inside a short debounce window and runs a single pass for the whole
//! burst, so a storm of small buffers does not become a storm of passes.
//!
//! The fold itself happens inside the queue's pop consumer. A pass that
//! fails midway therefore leaves the affected batch at the head of the
//! queue, and a later pass retries it.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::export::HealthMetrics;
use crate::map::PersistentMap;
use crate::queue::{PersistentQueue, PopOutcome};

/// How much of the queue a single pop of a merge pass takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopSize {
    /// Everything currently buffered.
    All,
    /// At most this many items per pop.
    Count(usize),
}

impl PopSize {
    fn per_pop_limit(self) -> usize {
        match self {
            PopSize::All => usize::MAX,
            PopSize::Count(n) => n,
        }
    }

    /// The size that satisfies both requests: a pass that drains more
    /// subsumes one that drains less.
    fn coalesce(self, other: PopSize) -> PopSize {
        match (self, other) {
            (PopSize::All, _) | (_, PopSize::All) => PopSize::All,
            (PopSize::Count(a), PopSize::Count(b)) => PopSize::Count(a.max(b)),
        }
    }
}

impl<'de> Deserialize<'de> for PopSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PopSizeVisitor;

        impl de::Visitor<'_> for PopSizeVisitor {
            type Value = PopSize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("\"all\" or a positive item count")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<PopSize, E> {
                if v.eq_ignore_ascii_case("all") {
                    Ok(PopSize::All)
                } else {
                    Err(E::invalid_value(de::Unexpected::Str(v), &self))
                }
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<PopSize, E> {
                let count = usize::try_from(v)
                    .ok()
                    .filter(|&n| n > 0)
                    .ok_or_else(|| E::invalid_value(de::Unexpected::Unsigned(v), &self))?;
                Ok(PopSize::Count(count))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<PopSize, E> {
                if v <= 0 {
                    return Err(E::invalid_value(de::Unexpected::Signed(v), &self));
                }
                self.visit_u64(v as u64)
            }
        }

        deserializer.deserialize_any(PopSizeVisitor)
    }
}

/// Tuning for a [`BufferedMergeEngine`].
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Debounce window applied before a requested pass runs.
    pub debounce: Duration,
    /// Pop size used when a request does not name one.
    pub pop_size: PopSize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
            pop_size: PopSize::All,
        }
    }
}

type KeyFn<T, K> = Arc<dyn Fn(&T) -> K + Send + Sync>;
type DefaultFn<K, V> = Arc<dyn Fn(&K) -> V + Send + Sync>;
type MergeFn<T, V> = Arc<dyn Fn(&mut V, T) + Send + Sync>;

struct MergeRequest {
    limit: Option<PopSize>,
    done: Option<oneshot::Sender<()>>,
}

/// Handle to a queue/map pair with a merge worker between them.
pub struct BufferedMergeEngine<T, K, V> {
    queue: PersistentQueue<T>,
    map: PersistentMap<K, V>,
    merge_tx: mpsc::UnboundedSender<MergeRequest>,
}

// Not derived: handles clone for any `T`/`K`/`V`.
impl<T, K, V> Clone for BufferedMergeEngine<T, K, V> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            map: self.map.clone(),
            merge_tx: self.merge_tx.clone(),
        }
    }
}

impl<T, K, V> BufferedMergeEngine<T, K, V>
where
    T: Send + 'static,
    K: Clone + Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    /// Wires `queue` and `map` together and spawns the merge worker.
    ///
    /// `key_fn` names the accumulator an item belongs to, `default_fn`
    /// builds a fresh accumulator for a key seen for the first time, and
    /// `merge_fn` folds one item into an accumulator.
    pub fn spawn(
        queue: PersistentQueue<T>,
        map: PersistentMap<K, V>,
        key_fn: impl Fn(&T) -> K + Send + Sync + 'static,
        default_fn: impl Fn(&K) -> V + Send + Sync + 'static,
        merge_fn: impl Fn(&mut V, T) + Send + Sync + 'static,
        opts: EngineOptions,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let (merge_tx, merge_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            queue: queue.clone(),
            map: map.clone(),
            key_fn: Arc::new(key_fn),
            default_fn: Arc::new(default_fn),
            merge_fn: Arc::new(merge_fn),
            opts,
            metrics,
        };
        tokio::spawn(worker.run(merge_rx));
        Self {
            queue,
            map,
            merge_tx,
        }
    }

    /// Durably buffers one item and requests a (debounced) merge pass.
    pub async fn buffer(&self, item: T) -> Result<()> {
        self.queue.push(vec![item]).await?;
        self.request_merge(None);
        Ok(())
    }

    /// Requests a merge pass without waiting for it.
    pub fn request_merge(&self, limit: Option<PopSize>) {
        let _ = self.merge_tx.send(MergeRequest { limit, done: None });
    }

    /// Requests a merge pass and waits until it (or a pass that subsumed
    /// it) has finished. Pass failures are logged by the worker; the
    /// affected items stay buffered either way.
    pub async fn merge_buffered(&self, limit: Option<PopSize>) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.merge_tx
            .send(MergeRequest {
                limit,
                done: Some(done_tx),
            })
            .map_err(|_| anyhow!("merge worker is gone"))?;
        done_rx
            .await
            .map_err(|_| anyhow!("merge worker dropped the signal"))?;
        Ok(())
    }

    pub fn queue(&self) -> &PersistentQueue<T> {
        &self.queue
    }

    pub fn map(&self) -> &PersistentMap<K, V> {
        &self.map
    }
}

struct Worker<T, K, V> {
    queue: PersistentQueue<T>,
    map: PersistentMap<K, V>,
    key_fn: KeyFn<T, K>,
    default_fn: DefaultFn<K, V>,
    merge_fn: MergeFn<T, V>,
    opts: EngineOptions,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<T, K, V> Worker<T, K, V>
where
    T: Send + 'static,
    K: Clone + Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    async fn run(self, mut rx: mpsc::UnboundedReceiver<MergeRequest>) {
        while let Some(first) = rx.recv().await {
            let mut limit = first.limit.unwrap_or(self.opts.pop_size);
            let mut signals: Vec<oneshot::Sender<()>> = first.done.into_iter().collect();
            let mut closed = false;

            // Absorb every request arriving inside the debounce window so
            // a burst of buffers turns into a single pass.
            let deadline = Instant::now() + self.opts.debounce;
            loop {
                match timeout_at(deadline, rx.recv()).await {
                    Ok(Some(req)) => {
                        limit = limit.coalesce(req.limit.unwrap_or(self.opts.pop_size));
                        signals.extend(req.done);
                    }
                    Ok(None) => {
                        closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }

            let started = Instant::now();
            match self.run_pass(limit).await {
                Ok(merged) => {
                    debug!(
                        items = merged,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "merge pass complete"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.merge_passes_total.inc();
                        metrics
                            .merge_pass_duration
                            .observe(started.elapsed().as_secs_f64());
                    }
                }
                Err(e) => {
                    warn!(error = %e, "merge pass failed, items remain buffered");
                    if let Some(metrics) = &self.metrics {
                        metrics.merge_failures_total.inc();
                    }
                }
            }
            for done in signals {
                let _ = done.send(());
            }
            if closed {
                break;
            }
        }
        debug!("merge worker exiting, all handles dropped");
    }

    /// Pops batches until the queue reports empty, folding each batch
    /// into the map inside the pop consumer.
    async fn run_pass(&self, limit: PopSize) -> Result<u64> {
        let per_pop = limit.per_pop_limit();
        let mut total = 0u64;
        loop {
            let map = self.map.clone();
            let key_fn = Arc::clone(&self.key_fn);
            let default_fn = Arc::clone(&self.default_fn);
            let merge_fn = Arc::clone(&self.merge_fn);
            let outcome = self
                .queue
                .pop(per_pop, move |items| {
                    merge_batch(map, key_fn, default_fn, merge_fn, items)
                })
                .await?;
            match outcome {
                PopOutcome::Empty => break,
                PopOutcome::Consumed(n) => {
                    total += n as u64;
                    if let Some(metrics) = &self.metrics {
                        metrics.records_merged_total.inc_by(n as f64);
                    }
                }
            }
        }
        Ok(total)
    }
}

async fn merge_batch<T, K, V>(
    map: PersistentMap<K, V>,
    key_fn: KeyFn<T, K>,
    default_fn: DefaultFn<K, V>,
    merge_fn: MergeFn<T, V>,
    items: Vec<T>,
) -> Result<()>
where
    T: Send + 'static,
    K: Clone + Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    // Group per key, preserving arrival order within each group.
    let mut order: Vec<K> = Vec::new();
    let mut groups: HashMap<K, Vec<T>> = HashMap::new();
    for item in items {
        let key = key_fn(&item);
        match groups.entry(key) {
            Entry::Occupied(mut occupied) => occupied.get_mut().push(item),
            Entry::Vacant(vacant) => {
                order.push(vacant.key().clone());
                vacant.insert(vec![item]);
            }
        }
    }

    for key in order {
        let group = groups.remove(&key).unwrap_or_default();
        let default_fn = Arc::clone(&default_fn);
        let merge_fn = Arc::clone(&merge_fn);
        let fold_key = key.clone();
        map.set(key, move |current| async move {
            let mut acc = match current {
                Some(value) => value,
                None => default_fn(&fold_key),
            };
            for item in group {
                merge_fn(&mut acc, item);
            }
            Ok(Some(acc))
        })
        .await?;
    }
    Ok(())
}
