//! # Config - Engine Settings
//!
//! Tunables for an ArborKV engine. Every field has a default; the same values
//! can be supplied through environment variables:
//!
//! ```text
//! ARBOR_MAX_LOG_MB        transaction log switch size in MiB   (default: 64)
//! ARBOR_SYNC              fsync on every commit                (default: "true")
//! ARBOR_COMPRESS_MIN      compress values of at least N bytes  (default: 0 = off)
//! ARBOR_BG_COMPACTION     run the background compactor         (default: "true")
//! ```

use anyhow::{bail, Context, Result};

/// Default size at which the active transaction log is switched (64 MiB).
pub const DEFAULT_MAX_TR_LOG_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// Smallest accepted log size. Keeps the compaction threshold above its
/// per-file noise floor.
pub const MIN_MAX_TR_LOG_FILE_SIZE: u64 = 4 * 1024;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Once the active log grows past this many bytes a new one is started.
    /// Also bounds compaction: a pass only runs when total waste reaches a
    /// quarter of it, and one pass rewrites at most this many bytes.
    pub max_tr_log_file_size: u64,

    /// If `true`, every commit is fsynced before it becomes visible.
    pub sync_on_commit: bool,

    /// Stored values of at least this many bytes are snappy-compressed when
    /// that makes them smaller. `0` disables compression.
    pub compression_threshold: usize,

    /// Whether the engine owns a background compaction thread.
    pub background_compaction: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_tr_log_file_size: DEFAULT_MAX_TR_LOG_FILE_SIZE,
            sync_on_commit: true,
            compression_threshold: 0,
            background_compaction: true,
        }
    }
}

impl Config {
    /// Sets the log switch size in bytes.
    #[must_use]
    pub fn max_tr_log_file_size(mut self, bytes: u64) -> Self {
        self.max_tr_log_file_size = bytes;
        self
    }

    #[must_use]
    pub fn sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    #[must_use]
    pub fn compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = bytes;
        self
    }

    #[must_use]
    pub fn background_compaction(mut self, enabled: bool) -> Self {
        self.background_compaction = enabled;
        self
    }

    /// Checks that the settings can be honoured.
    ///
    /// Value offsets are 32-bit, so no file may grow beyond `u32::MAX` bytes.
    pub fn validate(&self) -> Result<()> {
        if self.max_tr_log_file_size < MIN_MAX_TR_LOG_FILE_SIZE {
            bail!(
                "max_tr_log_file_size must be at least {} bytes (got {})",
                MIN_MAX_TR_LOG_FILE_SIZE,
                self.max_tr_log_file_size
            );
        }
        if self.max_tr_log_file_size > u64::from(u32::MAX) / 2 {
            bail!(
                "max_tr_log_file_size must not exceed {} bytes (got {})",
                u32::MAX / 2,
                self.max_tr_log_file_size
            );
        }
        Ok(())
    }

    /// Builds a config from `ARBOR_*` environment variables, falling back to
    /// the defaults for unset ones.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Config::default();
        if let Some(v) = lookup("ARBOR_MAX_LOG_MB") {
            let mb: u64 = v
                .trim()
                .parse()
                .with_context(|| format!("invalid ARBOR_MAX_LOG_MB: {v:?}"))?;
            cfg.max_tr_log_file_size = match mb.checked_mul(1024 * 1024) {
                Some(bytes) => bytes,
                None => bail!("ARBOR_MAX_LOG_MB out of range: {mb}"),
            };
        }
        if let Some(v) = lookup("ARBOR_SYNC") {
            cfg.sync_on_commit = parse_bool("ARBOR_SYNC", &v)?;
        }
        if let Some(v) = lookup("ARBOR_COMPRESS_MIN") {
            cfg.compression_threshold = v
                .trim()
                .parse()
                .with_context(|| format!("invalid ARBOR_COMPRESS_MIN: {v:?}"))?;
        }
        if let Some(v) = lookup("ARBOR_BG_COMPACTION") {
            cfg.background_compaction = parse_bool("ARBOR_BG_COMPACTION", &v)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("invalid {name}: {value:?} (expected true/false)"),
    }
}
