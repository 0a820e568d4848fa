//! Keyed store actor with callback-driven updates.
//!
//! Like the queue, a [`PersistentMap`] is a handle around a single worker
//! task that owns the storage layer. Because every operation flows
//! through that worker, a `set` is an atomic read-modify-write: the
//! caller's async update closure sees the current value, and nothing else
//! touches the map until the new value (or removal) has been applied.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::store::MapLayer;

/// Hard ceiling on any single map round trip, update callback included.
pub const OP_TIMEOUT: Duration = Duration::from_secs(10);

const MAILBOX_CAPACITY: usize = 1024;

type UpdateFuture<V> = Pin<Box<dyn Future<Output = Result<Option<V>>> + Send>>;
type UpdateFn<V> = Box<dyn FnOnce(Option<V>) -> UpdateFuture<V> + Send>;

type ResetFuture<K, V> = Pin<Box<dyn Future<Output = Result<Option<HashMap<K, V>>>> + Send>>;
type ResetFn<K, V> = Box<dyn FnOnce(HashMap<K, V>) -> ResetFuture<K, V> + Send>;

enum Command<K, V> {
    Get {
        key: K,
        reply: oneshot::Sender<Result<Option<V>>>,
    },
    Set {
        key: K,
        update: UpdateFn<V>,
        reply: oneshot::Sender<Result<()>>,
    },
    Reset {
        update: ResetFn<K, V>,
        reply: oneshot::Sender<Result<()>>,
    },
    Remove {
        key: K,
        reply: oneshot::Sender<Result<()>>,
    },
    GetAll {
        reply: oneshot::Sender<Result<HashMap<K, V>>>,
    },
    Size {
        reply: oneshot::Sender<Result<u64>>,
    },
    Clear {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle to a storage-backed key/value map.
///
/// Cloning is cheap; all clones talk to the same worker, which exits once
/// every handle has been dropped.
pub struct PersistentMap<K, V> {
    tx: mpsc::Sender<Command<K, V>>,
}

// Not derived: the sender clones for any `K`/`V`.
impl<K, V> Clone for PersistentMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<K, V> PersistentMap<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    /// Spawns the worker task for `layer` and returns a handle.
    pub fn spawn<L>(layer: L) -> Self
    where
        L: MapLayer<K, V>,
    {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        tokio::spawn(run_worker(Arc::new(layer), rx));
        Self { tx }
    }

    pub async fn get(&self, key: K) -> Result<Option<V>> {
        self.request(|reply| Command::Get { key, reply }).await
    }

    /// Atomically updates the value under `key`.
    ///
    /// `update` receives the current value (or `None`) and decides the
    /// outcome: `Some(v)` stores `v`, `None` removes the key. If the
    /// callback fails, nothing is written and the error is returned.
    pub async fn set<F, Fut>(&self, key: K, update: F) -> Result<()>
    where
        F: FnOnce(Option<V>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>>> + Send + 'static,
    {
        let update: UpdateFn<V> = Box::new(move |current| Box::pin(update(current)));
        self.request(|reply| Command::Set { key, update, reply })
            .await
    }

    /// Atomically replaces the full contents.
    ///
    /// `update` receives a snapshot of every entry. Returning `Some(map)`
    /// installs `map` as the new contents; returning `None` declares the
    /// snapshot unchanged and skips the write entirely.
    pub async fn reset<F, Fut>(&self, update: F) -> Result<()>
    where
        F: FnOnce(HashMap<K, V>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<HashMap<K, V>>>> + Send + 'static,
    {
        let update: ResetFn<K, V> = Box::new(move |snapshot| Box::pin(update(snapshot)));
        self.request(|reply| Command::Reset { update, reply }).await
    }

    pub async fn remove(&self, key: K) -> Result<()> {
        self.request(|reply| Command::Remove { key, reply }).await
    }

    /// Snapshot of every entry.
    pub async fn get_all(&self) -> Result<HashMap<K, V>> {
        self.request(|reply| Command::GetAll { reply }).await
    }

    pub async fn size(&self) -> Result<u64> {
        self.request(|reply| Command::Size { reply }).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.request(|reply| Command::Clear { reply }).await
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<R>>) -> Command<K, V>,
    ) -> Result<R> {
        let op = async {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.tx
                .send(make(reply_tx))
                .await
                .map_err(|_| anyhow!("map worker is gone"))?;
            reply_rx
                .await
                .map_err(|_| anyhow!("map worker dropped the reply"))?
        };
        tokio::time::timeout(OP_TIMEOUT, op)
            .await
            .map_err(|_| anyhow!("map operation timed out after {OP_TIMEOUT:?}"))?
    }
}

async fn run_worker<K, V, L>(layer: Arc<L>, mut rx: mpsc::Receiver<Command<K, V>>)
where
    K: Send + 'static,
    V: Send + 'static,
    L: MapLayer<K, V>,
{
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Get { key, reply } => {
                let _ = reply.send(layer.get(&key).context("map get"));
            }
            Command::Set { key, update, reply } => {
                let _ = reply.send(apply_set(layer.as_ref(), key, update).await);
            }
            Command::Reset { update, reply } => {
                let _ = reply.send(apply_reset(layer.as_ref(), update).await);
            }
            Command::Remove { key, reply } => {
                let _ = reply.send(layer.remove(&key).context("map remove"));
            }
            Command::GetAll { reply } => {
                let _ = reply.send(layer.get_all().context("map read"));
            }
            Command::Size { reply } => {
                let _ = reply.send(layer.size().context("map size"));
            }
            Command::Clear { reply } => {
                let _ = reply.send(layer.clear().context("map clear"));
            }
        }
    }
    debug!("map worker exiting, all handles dropped");
}

async fn apply_set<K, V, L>(layer: &L, key: K, update: UpdateFn<V>) -> Result<()>
where
    L: MapLayer<K, V>,
{
    let current = layer.get(&key).context("map get")?;
    // A failing callback leaves the stored value untouched.
    let next = update(current).await.context("map update callback")?;
    match next {
        Some(value) => layer.set(key, value).context("map set"),
        None => layer.remove(&key).context("map remove"),
    }
}

async fn apply_reset<K, V, L>(layer: &L, update: ResetFn<K, V>) -> Result<()>
where
    L: MapLayer<K, V>,
{
    let snapshot = layer.get_all().context("map read")?;
    let next = update(snapshot).await.context("map reset callback")?;
    match next {
        // None means "unchanged": skip the rewrite entirely.
        Some(entries) => layer.reset(entries).context("map reset"),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryMapLayer;

    fn counter_map() -> PersistentMap<String, u64> {
        PersistentMap::spawn(MemoryMapLayer::new())
    }

    #[tokio::test]
    async fn test_set_reads_current_value() {
        let map = counter_map();
        map.set("k".to_string(), |current| async move {
            assert_eq!(current, None);
            Ok(Some(1))
        })
        .await
        .unwrap();

        map.set("k".to_string(), |current| async move {
            Ok(Some(current.unwrap_or(0) + 10))
        })
        .await
        .unwrap();

        assert_eq!(map.get("k".to_string()).await.unwrap(), Some(11));
    }

    #[tokio::test]
    async fn test_concurrent_increments_never_lose_updates() {
        for tasks in [2usize, 10, 100] {
            let map = counter_map();
            let mut handles = Vec::new();
            for _ in 0..tasks {
                let map = map.clone();
                handles.push(tokio::spawn(async move {
                    map.set("counter".to_string(), |current| async move {
                        Ok(Some(current.unwrap_or(0) + 1))
                    })
                    .await
                    .unwrap();
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }
            assert_eq!(
                map.get("counter".to_string()).await.unwrap(),
                Some(tasks as u64),
                "lost an increment with {tasks} concurrent writers"
            );
        }
    }

    #[tokio::test]
    async fn test_set_returning_none_removes_key() {
        let map = counter_map();
        map.set("gone".to_string(), |_| async { Ok(Some(5)) })
            .await
            .unwrap();
        map.set("gone".to_string(), |_| async { Ok(None) })
            .await
            .unwrap();
        assert_eq!(map.get("gone".to_string()).await.unwrap(), None);
        assert_eq!(map.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_update_leaves_value_untouched() {
        let map = counter_map();
        map.set("k".to_string(), |_| async { Ok(Some(7)) })
            .await
            .unwrap();

        let err = map
            .set("k".to_string(), |_| async {
                Err(anyhow!("update exploded"))
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("map update callback"));
        assert_eq!(map.get("k".to_string()).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_reset_replaces_contents() {
        let map = counter_map();
        map.set("a".to_string(), |_| async { Ok(Some(1)) })
            .await
            .unwrap();
        map.set("b".to_string(), |_| async { Ok(Some(2)) })
            .await
            .unwrap();

        map.reset(|snapshot| async move {
            assert_eq!(snapshot.len(), 2);
            let mut next = HashMap::new();
            next.insert("sum".to_string(), snapshot.values().sum());
            Ok(Some(next))
        })
        .await
        .unwrap();

        assert_eq!(map.get("sum".to_string()).await.unwrap(), Some(3));
        assert_eq!(map.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reset_returning_none_changes_nothing() {
        let map = counter_map();
        map.set("keep".to_string(), |_| async { Ok(Some(42)) })
            .await
            .unwrap();

        map.reset(|_snapshot| async { Ok(None) }).await.unwrap();

        assert_eq!(map.get("keep".to_string()).await.unwrap(), Some(42));
        assert_eq!(map.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clear_empties_map() {
        let map = counter_map();
        map.set("x".to_string(), |_| async { Ok(Some(1)) })
            .await
            .unwrap();
        map.clear().await.unwrap();
        assert!(map.get_all().await.unwrap().is_empty());
    }
}
