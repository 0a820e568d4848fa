//! Durable storage layers backed by embedded sqlite.
//!
//! Each store owns one database file. Connections run in WAL mode with
//! `synchronous=FULL` so an item acknowledged as pushed survives process
//! crashes, and a busy timeout so the append and consume connections of a
//! queue can make progress against each other.

use std::hash::Hash;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::{Codec, JsonCodec, MapLayer, QueueLayer, StoreResult};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Deleted-row count after which the file is compacted with VACUUM.
const DEFAULT_VACUUM_AFTER_DELETES: u64 = 4096;

const QUEUE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS queue_items (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    item BLOB NOT NULL
);
";

const MAP_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS map_entries (
    key   BLOB PRIMARY KEY,
    value BLOB NOT NULL
);
";

fn open_connection(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
    Ok(conn)
}

/// Durable FIFO store.
///
/// Holds two connections to the same file: one reserved for appends, one
/// for peeks and deletes. WAL mode lets the two proceed concurrently, so
/// the layer reports `concurrent_reads_writes = true` and the owning
/// queue runs separate push and pop lanes.
///
/// The `id` column is AUTOINCREMENT so head ids are never reused after
/// deletes; insertion order and id order stay identical for the lifetime
/// of the file.
pub struct SqliteQueueLayer<T, C = JsonCodec> {
    append: Mutex<Connection>,
    consume: Mutex<Connection>,
    deleted_rows: AtomicU64,
    vacuum_after_deletes: u64,
    codec: C,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C> SqliteQueueLayer<T, C>
where
    C: Codec<T>,
{
    pub fn open(path: impl AsRef<Path>, codec: C) -> StoreResult<Self> {
        let path = path.as_ref();
        let append = open_connection(path)?;
        append.execute_batch(QUEUE_SCHEMA)?;
        let consume = open_connection(path)?;
        Ok(Self {
            append: Mutex::new(append),
            consume: Mutex::new(consume),
            deleted_rows: AtomicU64::new(0),
            vacuum_after_deletes: DEFAULT_VACUUM_AFTER_DELETES,
            codec,
            _marker: PhantomData,
        })
    }

    fn note_deletes(&self, deleted: u64) -> StoreResult<()> {
        let total = self.deleted_rows.fetch_add(deleted, Ordering::Relaxed) + deleted;
        if total < self.vacuum_after_deletes {
            return Ok(());
        }
        self.deleted_rows.store(0, Ordering::Relaxed);
        // VACUUM cannot run inside a transaction; it briefly contends with
        // the append connection, which the busy timeout absorbs.
        self.consume.lock().execute_batch("VACUUM;")?;
        Ok(())
    }
}

impl<T, C> QueueLayer<T> for SqliteQueueLayer<T, C>
where
    T: Send + 'static,
    C: Codec<T>,
{
    fn push(&self, items: Vec<T>) -> StoreResult<()> {
        let mut conn = self.append.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached("INSERT INTO queue_items (item) VALUES (?1)")?;
            for item in &items {
                stmt.execute(params![self.codec.encode(item)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn peek(&self, n: usize) -> StoreResult<Vec<T>> {
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let conn = self.consume.lock();
        let mut stmt =
            conn.prepare_cached("SELECT item FROM queue_items ORDER BY id LIMIT ?1")?;
        let mut rows = stmt.query(params![limit])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            let bytes: Vec<u8> = row.get(0)?;
            items.push(self.codec.decode(&bytes)?);
        }
        Ok(items)
    }

    fn pop(&self, n: usize) -> StoreResult<()> {
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let deleted = {
            let conn = self.consume.lock();
            conn.execute(
                "DELETE FROM queue_items
                 WHERE id IN (SELECT id FROM queue_items ORDER BY id LIMIT ?1)",
                params![limit],
            )?
        };
        self.note_deletes(deleted as u64)
    }

    fn size(&self) -> StoreResult<u64> {
        let conn = self.consume.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM queue_items", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn concurrent_reads_writes(&self) -> bool {
        true
    }
}

/// Durable key/value store.
///
/// Keys are stored as their encoded bytes, so the codec must be
/// deterministic: two keys that compare equal must encode to identical
/// bytes, or the same logical key would occupy multiple rows.
pub struct SqliteMapLayer<K, V, C = JsonCodec> {
    conn: Mutex<Connection>,
    deleted_rows: AtomicU64,
    vacuum_after_deletes: u64,
    codec: C,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, C> SqliteMapLayer<K, V, C>
where
    C: Codec<K> + Codec<V>,
{
    pub fn open(path: impl AsRef<Path>, codec: C) -> StoreResult<Self> {
        let conn = open_connection(path.as_ref())?;
        conn.execute_batch(MAP_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            deleted_rows: AtomicU64::new(0),
            vacuum_after_deletes: DEFAULT_VACUUM_AFTER_DELETES,
            codec,
            _marker: PhantomData,
        })
    }

    fn note_deletes(&self, deleted: u64) -> StoreResult<()> {
        let total = self.deleted_rows.fetch_add(deleted, Ordering::Relaxed) + deleted;
        if total < self.vacuum_after_deletes {
            return Ok(());
        }
        self.deleted_rows.store(0, Ordering::Relaxed);
        self.conn.lock().execute_batch("VACUUM;")?;
        Ok(())
    }
}

impl<K, V, C> MapLayer<K, V> for SqliteMapLayer<K, V, C>
where
    K: Eq + Hash + Send + 'static,
    V: Send + 'static,
    C: Codec<K> + Codec<V>,
{
    fn get(&self, key: &K) -> StoreResult<Option<V>> {
        let key_bytes = self.codec.encode(key)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT value FROM map_entries WHERE key = ?1")?;
        let bytes: Option<Vec<u8>> = stmt
            .query_row(params![key_bytes], |row| row.get(0))
            .optional()?;
        match bytes {
            Some(bytes) => Ok(Some(self.codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: K, value: V) -> StoreResult<()> {
        let key_bytes = self.codec.encode(&key)?;
        let value_bytes = self.codec.encode(&value)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO map_entries (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )?;
        stmt.execute(params![key_bytes, value_bytes])?;
        Ok(())
    }

    fn remove(&self, key: &K) -> StoreResult<()> {
        let key_bytes = self.codec.encode(key)?;
        let deleted = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached("DELETE FROM map_entries WHERE key = ?1")?;
            stmt.execute(params![key_bytes])?
        };
        self.note_deletes(deleted as u64)
    }

    fn get_all(&self) -> StoreResult<std::collections::HashMap<K, V>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT key, value FROM map_entries")?;
        let mut rows = stmt.query([])?;
        let mut entries = std::collections::HashMap::new();
        while let Some(row) = rows.next()? {
            let key_bytes: Vec<u8> = row.get(0)?;
            let value_bytes: Vec<u8> = row.get(1)?;
            entries.insert(self.codec.decode(&key_bytes)?, self.codec.decode(&value_bytes)?);
        }
        Ok(entries)
    }

    fn reset(&self, entries: std::collections::HashMap<K, V>) -> StoreResult<()> {
        let deleted = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let deleted = tx.execute("DELETE FROM map_entries", [])?;
            {
                let mut stmt =
                    tx.prepare_cached("INSERT INTO map_entries (key, value) VALUES (?1, ?2)")?;
                for (key, value) in &entries {
                    stmt.execute(params![self.codec.encode(key)?, self.codec.encode(value)?])?;
                }
            }
            tx.commit()?;
            deleted
        };
        self.note_deletes(deleted as u64)
    }

    fn size(&self) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM map_entries", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn clear(&self) -> StoreResult<()> {
        let deleted = {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM map_entries", [])?
        };
        self.note_deletes(deleted as u64)
    }
}
