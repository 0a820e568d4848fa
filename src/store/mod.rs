//! Storage layers beneath the queue and map primitives.
//!
//! A layer is a dumb synchronous store: it persists items and entries but
//! performs no concurrency handling of its own. Atomicity of the
//! peek/consume/discard and read/update/write cycles is owned entirely by
//! the actor tasks in [`crate::queue`] and [`crate::map`], which are the
//! only callers.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use memory::{MemoryMapLayer, MemoryQueueLayer};
pub use sqlite::{SqliteMapLayer, SqliteQueueLayer};

/// Errors surfaced by storage layers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying sqlite failure.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Stored bytes could not be encoded or decoded.
    #[error("codec: {0}")]
    Codec(String),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Converts stored values to and from opaque byte strings.
///
/// Durable layers know nothing about the domain types passing through
/// them; the codec is injected at construction.
pub trait Codec<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> StoreResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> StoreResult<T>;
}

/// JSON codec for any serde-serializable type.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| StoreError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> StoreResult<T> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Codec(e.to_string()))
    }
}

/// Storage contract beneath a [`crate::queue::PersistentQueue`].
///
/// Head order is insertion order: `peek` and `pop` always address the
/// oldest items first.
pub trait QueueLayer<T>: Send + Sync + 'static {
    /// Appends items at the tail, preserving their relative order. For
    /// durable layers the items must be on disk before this returns.
    fn push(&self, items: Vec<T>) -> StoreResult<()>;

    /// Returns up to `n` items from the head without removing them.
    fn peek(&self, n: usize) -> StoreResult<Vec<T>>;

    /// Removes the first `n` items from the head.
    fn pop(&self, n: usize) -> StoreResult<()>;

    /// Number of buffered items.
    fn size(&self) -> StoreResult<u64>;

    /// Whether the layer tolerates a push and a peek/pop executing at the
    /// same time. When true the owning queue runs separate append and
    /// consume lanes; when false everything shares one lane.
    fn concurrent_reads_writes(&self) -> bool;
}

/// Storage contract beneath a [`crate::map::PersistentMap`].
pub trait MapLayer<K, V>: Send + Sync + 'static {
    fn get(&self, key: &K) -> StoreResult<Option<V>>;

    fn set(&self, key: K, value: V) -> StoreResult<()>;

    fn remove(&self, key: &K) -> StoreResult<()>;

    /// Snapshot of every entry.
    fn get_all(&self) -> StoreResult<HashMap<K, V>>;

    /// Replaces the full contents with `entries`.
    fn reset(&self, entries: HashMap<K, V>) -> StoreResult<()>;

    fn size(&self) -> StoreResult<u64>;

    fn clear(&self) -> StoreResult<()>;
}
