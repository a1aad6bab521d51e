use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::primitives::blocks::{DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Smallest accepted `keep_alive`.
pub const MIN_KEEP_ALIVE: u32 = 2;
/// Smallest accepted readlock timeout, in hours.
pub const MIN_READLOCK_TIMEOUT_HOURS: u64 = 1;
/// Upper bound for a blocking write-lock wait.
pub const MAX_LOCK_WAIT: Duration = Duration::from_secs(60);
/// Name of the optional configuration file inside a database directory.
pub const CONFIG_FILE_NAME: &str = "lineage.toml";

/// Options recognised by the session engine.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Live ancestors kept above the chain tip; an ancestor is retired only
    /// once it is at least this many generations above the tip.
    pub keep_alive: u32,
    /// Age in hours after which a readlock marker is treated as orphaned.
    pub readlock_timeout_hours: u64,
    /// Use lock-file existence instead of kernel advisory locks.
    pub suppress_kernel_lock: bool,
    /// Sync the block store and superblock on every commit.
    pub sync_write: bool,
    /// How long `acquire` may wait for the write lock; zero fails fast.
    pub lock_wait_ms: u64,
    /// Period of the readlock self-check, in seconds.
    pub readlock_check_secs: u64,
    /// Maximum time between autosaves in seconds; zero disables autosave.
    pub autosave_secs: u64,
    /// Idle time required before an autosave, in seconds.
    pub autosave_idle_secs: u64,
    /// Block size used when creating a database.
    pub block_size: usize,
    /// Open databases written with a different schema version.
    pub allow_schema_mismatch: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive: MIN_KEEP_ALIVE,
            readlock_timeout_hours: 8,
            suppress_kernel_lock: false,
            sync_write: true,
            lock_wait_ms: 0,
            readlock_check_secs: 300,
            autosave_secs: 0,
            autosave_idle_secs: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            allow_schema_mismatch: false,
        }
    }
}

impl SessionConfig {
    /// Loads `<dir>/lineage.toml`, falling back to defaults when the file is
    /// absent.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = dir.as_ref().join(CONFIG_FILE_NAME);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        let parsed: SessionConfig =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
        parsed.validated()
    }

    /// Writes the configuration to `<dir>/lineage.toml`.
    pub fn persist_to_dir(&self, dir: impl AsRef<Path>) -> Result<PathBuf, ConfigError> {
        let target = dir.as_ref().join(CONFIG_FILE_NAME);
        let serialized =
            toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })?;
        fs::write(&target, serialized).map_err(|source| ConfigError::Write {
            path: target.clone(),
            source,
        })?;
        Ok(target)
    }

    /// Clamps values below their documented minimum and rejects values that
    /// cannot be repaired.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        if self.keep_alive < MIN_KEEP_ALIVE {
            warn!(
                requested = self.keep_alive,
                min = MIN_KEEP_ALIVE,
                "config.keep_alive.clamped"
            );
            self.keep_alive = MIN_KEEP_ALIVE;
        }
        if self.readlock_timeout_hours < MIN_READLOCK_TIMEOUT_HOURS {
            warn!(
                requested = self.readlock_timeout_hours,
                min = MIN_READLOCK_TIMEOUT_HOURS,
                "config.readlock_timeout.clamped"
            );
            self.readlock_timeout_hours = MIN_READLOCK_TIMEOUT_HOURS;
        }
        if self.block_size < MIN_BLOCK_SIZE || !self.block_size.is_power_of_two() {
            return Err(ConfigError::InvalidBlockSize {
                value: self.block_size,
            });
        }
        if self.autosave_secs == 0 && self.autosave_idle_secs != 0 {
            return Err(ConfigError::IdleWithoutAutosave);
        }
        Ok(self)
    }

    /// Readlock timeout as a duration.
    pub fn readlock_timeout(&self) -> Duration {
        Duration::from_secs(self.readlock_timeout_hours * 3600)
    }

    /// Write-lock wait, or `None` for fail-fast acquisition.
    pub fn lock_wait(&self) -> Option<Duration> {
        match self.lock_wait_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms).min(MAX_LOCK_WAIT)),
        }
    }

    /// Period of the readlock self-check.
    pub fn readlock_check_interval(&self) -> Duration {
        Duration::from_secs(self.readlock_check_secs.max(1))
    }

    /// Autosave intervals `(save, idle)`; `None` when autosave is off.
    pub fn autosave(&self) -> Option<(Duration, Duration)> {
        match self.autosave_secs {
            0 => None,
            secs => Some((
                Duration::from_secs(secs),
                Duration::from_secs(self.autosave_idle_secs),
            )),
        }
    }
}

/// Failure to load or store the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Config file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`SessionConfig`].
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Config file path.
        path: PathBuf,
        /// TOML decoder error.
        source: toml::de::Error,
    },
    /// The configuration could not be rendered as TOML.
    #[error("failed to serialize config: {source}")]
    Serialize {
        /// TOML encoder error.
        source: toml::ser::Error,
    },
    /// The file could not be written.
    #[error("failed to write config {path}: {source}")]
    Write {
        /// Config file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// `block_size` is too small or not a power of two.
    #[error("block size {value} is not a power of two >= 512")]
    InvalidBlockSize {
        /// Rejected block size.
        value: usize,
    },
    /// An idle interval was given without a save interval.
    #[error("autosave_idle_secs requires autosave_secs")]
    IdleWithoutAutosave,
}
