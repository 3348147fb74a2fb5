// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for rasterpull.
//!
//! Item-level failures ([`TransferError`]) are recorded in the ledger and the
//! run continues. [`LedgerError`] is logged and retried, never fatal mid-run.
//! [`ConfigError`] aborts before any work starts and is rendered for the
//! user with [`ErrorBuilder`].

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Hint appended to every formatted fatal error.
pub const HELP_HINT: &str = "Run `rasterpull --help` for the available options.";

/// Failure while fetching one catalog item.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("server returned HTTP {0}")]
    BadStatus(u16),

    #[error("server returned an empty body")]
    EmptyBody,

    #[error("body truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },

    #[error("I/O error writing {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TransferError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            TransferError::BadStatus(status.as_u16())
        } else {
            TransferError::Network(e.to_string())
        }
    }
}

/// Failure reading, writing or locking the ledger file.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to read ledger {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write ledger {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize ledger: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("timed out after {timeout:?} waiting for lock {path:?}; another rasterpull run may own this ledger")]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("failed to lock {path:?}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fatal problem with the inputs of a run.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("catalog not found: {0:?}")]
    CatalogMissing(PathBuf),

    #[error("failed to read catalog {path:?}: {source}")]
    CatalogUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalog {path:?}: {reason}")]
    CatalogInvalid { path: PathBuf, reason: String },

    #[error("failed to parse config file {path:?}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("integrity checker `{0}` is not available")]
    CheckerUnavailable(String),

    #[error("GDAL tool `{0}` is not available")]
    ToolUnavailable(String),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ConfigError {
    /// Render the error with likely causes and fixes for the console.
    pub fn to_user_message(&self) -> String {
        let builder = ErrorBuilder::new(self.to_string());
        match self {
            ConfigError::CatalogMissing(_) | ConfigError::CatalogUnreadable { .. } => builder
                .cause("The tile index has not been downloaded yet")
                .cause("The working directory is not the project directory")
                .fix("Pass the index explicitly: rasterpull --catalog path/to/kaartbladindex.json"),
            ConfigError::CatalogInvalid { .. } => builder
                .cause("The index file is truncated or not a GeoJSON FeatureCollection")
                .cause("A feature lacks `kaartbladNr` or `url`")
                .fix("Download the tile index again"),
            ConfigError::ConfigInvalid { .. } => builder
                .cause("The config file is not valid JSON or has a misspelled key")
                .fix("Fix or remove the config file"),
            ConfigError::CheckerUnavailable(_) => builder
                .cause("GDAL is not installed or not on PATH")
                .fix("Install GDAL so that `gdalinfo --version` works")
                .fix("Or drop --require-checker to fall back to size-only checks"),
            ConfigError::ToolUnavailable(_) => builder
                .cause("GDAL is not installed or not on PATH")
                .fix("Install GDAL so that `gdalwarp --version` and `gdalinfo --version` work")
                .fix("Or point --checker and the config's warp_program at the installed tools"),
            ConfigError::InvalidSetting(_) => builder.fix("Check the command line flags"),
            ConfigError::Ledger(LedgerError::LockTimeout { .. }) => builder
                .cause("Another rasterpull run is using the same ledger")
                .fix("Wait for the other run to finish, or point --ledger elsewhere"),
            ConfigError::Ledger(_) => builder
                .cause("The ledger directory is not writable")
                .fix("Check permissions of the ledger path"),
        }
        .build()
    }
}

/// Formats an error message with title, causes, fixes, and a help hint.
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = String::new();

    output.push_str(&format!("[✗] {}\n\n", title));

    if !causes.is_empty() {
        output.push_str("Possible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
        output.push('\n');
    }

    if !fixes.is_empty() {
        output.push_str("Try these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
        output.push('\n');
    }

    output.push_str(HELP_HINT);

    output
}

/// Builder for constructing formatted error messages.
///
/// # Example
///
/// ```
/// use rasterpull::error::ErrorBuilder;
///
/// let error = ErrorBuilder::new("Failed to load catalog")
///     .cause("File missing")
///     .fix("Pass --catalog")
///     .build();
/// assert!(error.contains("Failed to load catalog"));
/// ```
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    title: String,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorBuilder {
    /// Create a new error builder with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    /// Add a possible cause.
    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    /// Add a suggested fix.
    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    /// Build the formatted error message.
    pub fn build(self) -> String {
        let causes: Vec<&str> = self.causes.iter().map(|s| s.as_str()).collect();
        let fixes: Vec<&str> = self.fixes.iter().map(|s| s.as_str()).collect();
        format_error(&self.title, &causes, &fixes)
    }
}

impl fmt::Display for ErrorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.clone().build())
    }
}
