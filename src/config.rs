//! Engine configuration.
//!
//! Mirrors the option table of the storage engine: a directory path, block sizing knobs, the
//! durability (`data_sync_delay`) and compaction (`stale_data_threshold`, `compact_delay`) policy,
//! an optional cache-field projection list, and an optional error callback. Options are validated
//! once, at [`EngineConfigBuilder::build`], rather than scattered across call sites.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::BuildError;

/// Reserved file extension for live block files.
pub const BLOCK_EXTENSION: &str = ".block";

/// Default soft cap per block: 8 MiB.
pub const DEFAULT_MAX_BLOCK_SIZE: u64 = 8 * 1024 * 1024;

/// Default throttled-sync interval.
pub const DEFAULT_DATA_SYNC_DELAY: Duration = Duration::from_millis(1000);

/// Default fraction of `max_block_size` above which a block becomes compaction-eligible.
pub const DEFAULT_STALE_DATA_THRESHOLD: f64 = 0.1;

/// Default interval between compaction sweeps: 24 hours.
pub const DEFAULT_COMPACT_DELAY: Duration = Duration::from_millis(86_400_000);

/// Callback invoked when an asynchronous append or flush fails.
///
/// Invoked from the engine's background tasks; must not block for long, and must not panic.
pub type ErrorHook = Arc<dyn Fn(&crate::error::StorageError) + Send + Sync>;

/// Validated engine configuration. Construct via [`EngineConfigBuilder`].
#[derive(Clone)]
pub struct EngineConfig {
    pub(crate) dir_path: PathBuf,
    pub(crate) max_block_size: u64,
    pub(crate) data_sync_delay: Duration,
    pub(crate) sync_every_write: bool,
    pub(crate) stale_data_threshold: f64,
    pub(crate) compact_delay: Duration,
    pub(crate) cached_fields: Vec<String>,
    pub(crate) on_error: Option<ErrorHook>,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("dir_path", &self.dir_path)
            .field("max_block_size", &self.max_block_size)
            .field("data_sync_delay", &self.data_sync_delay)
            .field("sync_every_write", &self.sync_every_write)
            .field("stale_data_threshold", &self.stale_data_threshold)
            .field("compact_delay", &self.compact_delay)
            .field("cached_fields", &self.cached_fields)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl EngineConfig {
    pub fn dir_path(&self) -> &Path {
        &self.dir_path
    }

    pub fn max_block_size(&self) -> u64 {
        self.max_block_size
    }

    pub fn cached_fields(&self) -> &[String] {
        &self.cached_fields
    }

    pub fn compaction_disabled(&self) -> bool {
        self.stale_data_threshold <= 0.0
    }

    pub(crate) fn stale_threshold_bytes(&self) -> u64 {
        (self.max_block_size as f64 * self.stale_data_threshold).floor() as u64
    }
}

/// Builder for [`EngineConfig`].
#[derive(Clone)]
pub struct EngineConfigBuilder {
    dir_path: PathBuf,
    max_block_size: Option<u64>,
    data_sync_delay_ms: Option<i64>,
    stale_data_threshold: Option<f64>,
    compact_delay: Option<Duration>,
    cached_fields: Vec<String>,
    on_error: Option<ErrorHook>,
}

impl EngineConfigBuilder {
    /// Starts a builder rooted at `dir_path`, the only required option.
    pub fn new<P: AsRef<Path>>(dir_path: P) -> Self {
        Self {
            dir_path: dir_path.as_ref().to_path_buf(),
            max_block_size: None,
            data_sync_delay_ms: None,
            stale_data_threshold: None,
            compact_delay: None,
            cached_fields: Vec::new(),
            on_error: None,
        }
    }

    /// Sets the soft per-block size cap, in bytes. Must be a multiple of 1024, at least 1024.
    ///
    /// Defaults to 8 MiB.
    pub fn max_block_size(mut self, bytes: u64) -> Self {
        self.max_block_size = Some(bytes);
        self
    }

    /// Sets the durability policy: `0` syncs every write inline, `n > 0` throttles syncs to at
    /// most one per `n` milliseconds per block.
    ///
    /// Defaults to 1000ms.
    pub fn data_sync_delay_ms(mut self, ms: i64) -> Self {
        self.data_sync_delay_ms = Some(ms);
        self
    }

    /// Sets the fraction of `max_block_size`, in `[0.0, 1.0]`, above which a block's stale bytes
    /// make it eligible for compaction. `0.0` disables compaction entirely.
    ///
    /// Defaults to 0.1.
    pub fn stale_data_threshold(mut self, fraction: f64) -> Self {
        self.stale_data_threshold = Some(fraction);
        self
    }

    /// Sets the interval between background compaction sweeps.
    ///
    /// Defaults to 24 hours.
    pub fn compact_delay(mut self, interval: Duration) -> Self {
        self.compact_delay = Some(interval);
        self
    }

    /// Adds a field name to project into the in-memory cache on load.
    pub fn cached_field<S: Into<String>>(mut self, field: S) -> Self {
        self.cached_fields.push(field.into());
        self
    }

    /// Sets the full list of cache-projected field names, replacing any previously added.
    pub fn cached_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cached_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Registers a callback invoked whenever a background append/flush fails.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&crate::error::StorageError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Validates all options and produces an [`EngineConfig`].
    pub fn build(self) -> Result<EngineConfig, BuildError> {
        if self.dir_path.as_os_str().is_empty() {
            return Err(BuildError::InvalidParameter {
                param_name: "dir_path",
                reason: "must not be empty".to_string(),
            });
        }

        let max_block_size = self.max_block_size.unwrap_or(DEFAULT_MAX_BLOCK_SIZE);
        if max_block_size < 1024 || max_block_size % 1024 != 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "max_block_size",
                reason: "must be a multiple of 1024 and at least 1024".to_string(),
            });
        }

        let (data_sync_delay, sync_every_write) = match self.data_sync_delay_ms {
            None => (DEFAULT_DATA_SYNC_DELAY, false),
            Some(ms) if ms == 0 => (Duration::from_millis(0), true),
            Some(ms) if ms > 0 => (Duration::from_millis(ms as u64), false),
            Some(_) => {
                return Err(BuildError::InvalidParameter {
                    param_name: "data_sync_delay_ms",
                    reason: "must not be negative".to_string(),
                });
            }
        };

        let stale_data_threshold = self
            .stale_data_threshold
            .unwrap_or(DEFAULT_STALE_DATA_THRESHOLD);
        if !(0.0..=1.0).contains(&stale_data_threshold) {
            return Err(BuildError::InvalidParameter {
                param_name: "stale_data_threshold",
                reason: "must be within [0.0, 1.0]".to_string(),
            });
        }

        let compact_delay = self.compact_delay.unwrap_or(DEFAULT_COMPACT_DELAY);

        Ok(EngineConfig {
            dir_path: self.dir_path,
            max_block_size,
            data_sync_delay,
            sync_every_write,
            stale_data_threshold,
            compact_delay,
            cached_fields: self.cached_fields,
            on_error: self.on_error,
        })
    }
}
