// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Run configuration.
//!
//! Resolution order: built-in defaults, then an optional JSON config file,
//! then command line flags (applied by the binary).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::convert::{
    DEFAULT_CONVERT_WORKERS, DEFAULT_OUTPUT_DIR, DEFAULT_WARP_PROGRAM, DEFAULT_WARP_TIMEOUT,
};
use crate::error::ConfigError;
use crate::verify::{DEFAULT_CHECKER, DEFAULT_CHECK_TIMEOUT};

/// Config file picked up from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "rasterpull.json";

/// Capacity of the transfer -> verification hand-off queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 3;

/// Timeout for establishing a fetch and for each chunk read.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// GeoJSON tile index
    pub catalog: PathBuf,
    /// Where tiles are stored
    pub download_dir: PathBuf,
    /// Progress ledger snapshot
    pub ledger: PathBuf,
    /// Append-only failure log
    pub error_log: PathBuf,
    /// Hand-off queue capacity between transfer and verification
    pub queue_capacity: usize,
    /// Fetch timeout in seconds
    pub fetch_timeout_secs: u64,
    /// Structural checker program
    pub checker: String,
    /// Structural check timeout in seconds
    pub checker_timeout_secs: u64,
    /// Abort if the checker is not installed instead of falling back to
    /// size-only checks
    pub require_checker: bool,
    /// Where `convert` writes reprojected tiles
    pub wgs84_dir: PathBuf,
    /// Concurrent `gdalwarp` processes
    pub convert_workers: usize,
    /// Reprojection program
    pub warp_program: String,
    /// Per-file reprojection timeout in seconds
    pub warp_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            catalog: PathBuf::from("kaartbladindex.json"),
            download_dir: PathBuf::from("downloads"),
            ledger: PathBuf::from("download_progress.json"),
            error_log: PathBuf::from("download_errors.log"),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            checker: DEFAULT_CHECKER.to_string(),
            checker_timeout_secs: DEFAULT_CHECK_TIMEOUT.as_secs(),
            require_checker: false,
            wgs84_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            convert_workers: DEFAULT_CONVERT_WORKERS,
            warp_program: DEFAULT_WARP_PROGRAM.to_string(),
            warp_timeout_secs: DEFAULT_WARP_TIMEOUT.as_secs(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// With an explicit `path` the file must exist. Without one,
    /// [`DEFAULT_CONFIG_FILE`] is used if present, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        if !path.exists() {
            if required {
                return Err(ConfigError::ConfigInvalid {
                    path,
                    reason: "file does not exist".into(),
                });
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).map_err(|e| ConfigError::ConfigInvalid {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let config: Config = serde_json::from_str(&content).map_err(|e| ConfigError::ConfigInvalid {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        tracing::debug!(path = %path.display(), "Loaded config file");
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidSetting(
                "queue capacity must be at least 1".into(),
            ));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::InvalidSetting(
                "fetch timeout must be at least 1 second".into(),
            ));
        }
        if self.checker_timeout_secs == 0 {
            return Err(ConfigError::InvalidSetting(
                "checker timeout must be at least 1 second".into(),
            ));
        }
        if self.convert_workers == 0 {
            return Err(ConfigError::InvalidSetting(
                "convert workers must be at least 1".into(),
            ));
        }
        if self.warp_timeout_secs == 0 {
            return Err(ConfigError::InvalidSetting(
                "warp timeout must be at least 1 second".into(),
            ));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn checker_timeout(&self) -> Duration {
        Duration::from_secs(self.checker_timeout_secs)
    }

    pub fn warp_timeout(&self) -> Duration {
        Duration::from_secs(self.warp_timeout_secs)
    }
}
