//! Process-local storage layers. Contents are lost when the process
//! exits; useful for tests and ephemeral deployments.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use parking_lot::Mutex;

use super::{MapLayer, QueueLayer, StoreResult};

/// In-memory FIFO backed by a `VecDeque`.
#[derive(Debug, Default)]
pub struct MemoryQueueLayer<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> MemoryQueueLayer<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> QueueLayer<T> for MemoryQueueLayer<T>
where
    T: Clone + Send + 'static,
{
    fn push(&self, items: Vec<T>) -> StoreResult<()> {
        self.items.lock().extend(items);
        Ok(())
    }

    fn peek(&self, n: usize) -> StoreResult<Vec<T>> {
        Ok(self.items.lock().iter().take(n).cloned().collect())
    }

    fn pop(&self, n: usize) -> StoreResult<()> {
        let mut items = self.items.lock();
        let n = n.min(items.len());
        items.drain(..n);
        Ok(())
    }

    fn size(&self) -> StoreResult<u64> {
        Ok(self.items.lock().len() as u64)
    }

    fn concurrent_reads_writes(&self) -> bool {
        // A single mutex guards the deque, so interleaving push and pop
        // lanes would only serialize on it anyway.
        false
    }
}

/// In-memory key/value store backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryMapLayer<K, V> {
    entries: Mutex<HashMap<K, V>>,
}

impl<K, V> MemoryMapLayer<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> MapLayer<K, V> for MemoryMapLayer<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    fn get(&self, key: &K) -> StoreResult<Option<V>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: K, value: V) -> StoreResult<()> {
        self.entries.lock().insert(key, value);
        Ok(())
    }

    fn remove(&self, key: &K) -> StoreResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn get_all(&self) -> StoreResult<HashMap<K, V>> {
        Ok(self.entries.lock().clone())
    }

    fn reset(&self, entries: HashMap<K, V>) -> StoreResult<()> {
        *self.entries.lock() = entries;
        Ok(())
    }

    fn size(&self) -> StoreResult<u64> {
        Ok(self.entries.lock().len() as u64)
    }

    fn clear(&self) -> StoreResult<()> {
        self.entries.lock().clear();
        Ok(())
    }
}
