use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::merge::PopSize;
use crate::profile::WindowUnit;

/// Top-level configuration for the aggregoor daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Buffer and profile storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Profile window configuration.
    #[serde(default)]
    pub window: WindowConfig,

    /// Merge pass configuration.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Flushed profile destination configuration.
    #[serde(default)]
    pub writer: WriterConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Buffer and profile storage configuration.
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Storage backend (memory, sqlite). Default: sqlite.
    #[serde(default)]
    pub backend: StorageBackend,

    /// Directory holding the database files. Default: "data".
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
}

/// Available storage backends for the record buffer and profile map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process-local storage; buffered data is lost on restart.
    Memory,
    /// One sqlite file per store under `storage.dir`.
    Sqlite,
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::Sqlite
    }
}

/// Profile window configuration.
#[derive(Debug, Deserialize)]
pub struct WindowConfig {
    /// Window granularity (hour, day). Default: hour.
    #[serde(default = "default_window_unit")]
    pub unit: WindowUnit,

    /// How often rotation flushes run. Must be whole seconds and divide
    /// the window unit evenly so ticks stay on the unit grid. Default: 5m.
    #[serde(default = "default_rotation_interval", with = "humantime_serde")]
    pub rotation_interval: Duration,
}

/// Merge pass configuration.
#[derive(Debug, Deserialize)]
pub struct MergeConfig {
    /// How often a background merge pass is requested. Default: 30s.
    #[serde(default = "default_merge_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// How long a requested pass waits to absorb further requests.
    /// Default: 1s.
    #[serde(default = "default_merge_debounce", with = "humantime_serde")]
    pub debounce: Duration,

    /// Records a single queue pop consumes during a pass: "all" or a
    /// positive count. Default: all.
    #[serde(default = "default_merge_batch")]
    pub batch: PopSize,
}

/// Flushed profile destination configuration.
#[derive(Debug, Deserialize)]
pub struct WriterConfig {
    /// Destination backend (file, memory). Default: file.
    #[serde(default)]
    pub backend: WriterBackend,

    /// Directory receiving profile JSON documents. Default: "profiles".
    #[serde(default = "default_writer_dir")]
    pub dir: PathBuf,
}

/// Available profile writer backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterBackend {
    /// One JSON document per flushed profile under `writer.dir`.
    File,
    /// Flushed profiles are held in memory for programmatic draining.
    Memory,
}

impl Default for WriterBackend {
    fn default() -> Self {
        Self::File
    }
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_window_unit() -> WindowUnit {
    WindowUnit::Hour
}

fn default_rotation_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_merge_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_merge_debounce() -> Duration {
    Duration::from_secs(1)
}

fn default_merge_batch() -> PopSize {
    PopSize::All
}

fn default_writer_dir() -> PathBuf {
    PathBuf::from("profiles")
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            storage: StorageConfig::default(),
            window: WindowConfig::default(),
            merge: MergeConfig::default(),
            writer: WriterConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            dir: default_storage_dir(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            unit: default_window_unit(),
            rotation_interval: default_rotation_interval(),
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            interval: default_merge_interval(),
            debounce: default_merge_debounce(),
            batch: default_merge_batch(),
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            backend: WriterBackend::default(),
            dir: default_writer_dir(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.storage.backend == StorageBackend::Sqlite && self.storage.dir.as_os_str().is_empty()
        {
            bail!("storage.dir is required for the sqlite backend");
        }

        let rotation = self.window.rotation_interval;
        if rotation.is_zero() {
            bail!("window.rotation_interval must be positive");
        }
        if rotation.subsec_nanos() != 0 {
            bail!("window.rotation_interval must be whole seconds");
        }

        let unit_secs = u64::try_from(self.window.unit.seconds()).unwrap_or(u64::MAX);
        if rotation.as_secs() > unit_secs {
            bail!(
                "window.rotation_interval {:?} must not exceed the {} window",
                rotation,
                self.window.unit.as_str()
            );
        }
        if unit_secs % rotation.as_secs() != 0 {
            bail!(
                "window.rotation_interval {:?} must divide the {} window evenly",
                rotation,
                self.window.unit.as_str()
            );
        }

        if self.merge.interval.is_zero() {
            bail!("merge.interval must be positive");
        }
        if self.merge.debounce >= self.merge.interval {
            bail!(
                "merge.debounce {:?} must be shorter than merge.interval {:?}",
                self.merge.debounce,
                self.merge.interval
            );
        }

        if self.writer.backend == WriterBackend::File && self.writer.dir.as_os_str().is_empty() {
            bail!("writer.dir is required for the file writer");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when health.enabled=true");
        }

        Ok(())
    }
}
