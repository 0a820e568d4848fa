//! Destinations for flushed profiles.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::profile::{ProfileEntry, ProfileKey, Rollup};

/// Attempts per profile before a write is reported failed.
const WRITE_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Destination for flushed profiles.
///
/// A write must be atomic from the caller's point of view: either the
/// profile landed and a location comes back, or it failed and the caller
/// keeps the entry for a later flush.
pub trait ProfileWriter: Send + Sync + 'static {
    /// Writer name for logs.
    fn name(&self) -> &str;

    /// Writes one profile. Returns the destination (a path or URI).
    fn write(
        &self,
        key: &ProfileKey,
        entry: &ProfileEntry,
    ) -> impl Future<Output = Result<String>> + Send;
}

/// JSON document written for one flushed profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushedProfile {
    pub tenant_id: String,
    pub dataset_id: String,
    pub tags: Vec<(String, String)>,
    pub session_start: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub rollup: Rollup,
}

impl FlushedProfile {
    pub fn from_parts(key: &ProfileKey, entry: &ProfileEntry) -> Self {
        Self {
            tenant_id: key.tenant_id.clone(),
            dataset_id: key.dataset_id.clone(),
            tags: key.tags.clone(),
            session_start: key.session_start,
            window_start: key.window_start,
            rollup: entry.rollup.clone(),
        }
    }
}

/// Writes each profile as a JSON file under a base directory.
///
/// Filenames are `<tenant>_<dataset>_<window-start>_<seq>.json`. Names
/// are claimed with `create_new`, so repeat flushes of one window get
/// fresh sequence numbers and files left by earlier runs are never
/// replaced.
pub struct FileWriter {
    dir: PathBuf,
    seq: AtomicU64,
}

impl FileWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seq: AtomicU64::new(0),
        }
    }

    async fn write_once(&self, profile: &FlushedProfile) -> Result<String> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating profile directory {}", self.dir.display()))?;

        let body = serde_json::to_vec_pretty(profile).context("encoding profile")?;

        // The sequence counter restarts at zero with the process, so the
        // name is claimed with create_new and taken names are skipped
        // rather than truncated.
        loop {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let filename = format!(
                "{}_{}_{}_{seq:06}.json",
                sanitize(&profile.tenant_id),
                sanitize(&profile.dataset_id),
                profile.window_start.format("%Y%m%dT%H%M%SZ"),
            );
            let path = self.dir.join(filename);

            let mut file = match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e).with_context(|| format!("creating {}", path.display())),
            };

            file.write_all(&body)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            file.flush()
                .await
                .with_context(|| format!("flushing {}", path.display()))?;

            return Ok(path.display().to_string());
        }
    }
}

impl ProfileWriter for FileWriter {
    fn name(&self) -> &str {
        "file"
    }

    async fn write(&self, key: &ProfileKey, entry: &ProfileEntry) -> Result<String> {
        let profile = FlushedProfile::from_parts(key, entry);
        let mut attempt = 1;
        loop {
            match self.write_once(&profile).await {
                Ok(location) => {
                    debug!(location = %location, "profile file written");
                    return Ok(location);
                }
                Err(e) if attempt < WRITE_ATTEMPTS => {
                    warn!(
                        attempt,
                        error = %e,
                        tenant = %profile.tenant_id,
                        "profile write attempt failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Keeps flushed profiles in memory.
///
/// Used by tests and by embedders that drain profiles programmatically
/// instead of shipping them anywhere.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    written: Mutex<Vec<FlushedProfile>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written_count(&self) -> usize {
        self.written.lock().len()
    }

    /// Removes and returns everything written so far.
    pub fn take_written(&self) -> Vec<FlushedProfile> {
        std::mem::take(&mut *self.written.lock())
    }
}

impl ProfileWriter for MemoryWriter {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write(&self, key: &ProfileKey, entry: &ProfileEntry) -> Result<String> {
        let profile = FlushedProfile::from_parts(key, entry);
        let location = format!("memory://{}/{}", profile.tenant_id, profile.dataset_id);
        self.written.lock().push(profile);
        Ok(location)
    }
}

/// Destination selection, fixed at startup from config.
///
/// Uses enum dispatch rather than trait objects so each write stays a
/// plain async call (no `Pin<Box<dyn Future>>` per profile).
pub enum Writer {
    File(FileWriter),
    Memory(MemoryWriter),
}

impl ProfileWriter for Writer {
    fn name(&self) -> &str {
        match self {
            Writer::File(w) => w.name(),
            Writer::Memory(w) => w.name(),
        }
    }

    async fn write(&self, key: &ProfileKey, entry: &ProfileEntry) -> Result<String> {
        match self {
            Writer::File(w) => w.write(key, entry).await,
            Writer::Memory(w) => w.write(key, entry).await,
        }
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
