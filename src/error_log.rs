// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Append-only failure log.
//!
//! One line per failed item, readable without tooling:
//! `2024-01-15 10:23:45 | TRANSFER  | 37EN2 | server returned HTTP 404`
//!
//! Writing is best-effort. A failed append is reported through `tracing`
//! and never interrupts the pipeline.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Local, Utc};

/// Pipeline stage that produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Transfer,
    Verify,
    Reconcile,
    Convert,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transfer => "TRANSFER",
            Self::Verify => "VERIFY",
            Self::Reconcile => "RECONCILE",
            Self::Convert => "CONVERT",
        }
    }
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Format one log line.
fn format_line(timestamp: DateTime<Utc>, stage: FailureStage, id: &str, reason: &str) -> String {
    let local_time: DateTime<Local> = timestamp.into();
    // Keep each entry on one line.
    let reason: String = reason
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    format!(
        "{} | {:<9} | {} | {}",
        local_time.format("%Y-%m-%d %H:%M:%S"),
        stage.as_str(),
        id,
        reason
    )
}

/// Append-only, human-readable failure log.
#[derive(Debug)]
pub struct ErrorLog {
    log_path: PathBuf,
    write_lock: Mutex<()>,
}

impl ErrorLog {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Append a failure. Errors are logged, never returned.
    pub fn record(&self, stage: FailureStage, id: &str, reason: &str) {
        let line = format_line(Utc::now(), stage, id, reason);
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Err(e) = self.append(&line) {
            tracing::warn!(
                path = %self.log_path.display(),
                error = %e,
                "Failed to append to error log"
            );
        }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.log_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{}", line)
    }

    /// All lines written so far.
    pub fn read_all_entries(&self) -> std::io::Result<Vec<String>> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.log_path)?;
        Ok(content.lines().map(String::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_line_format() {
        let line = format_line(Utc::now(), FailureStage::Transfer, "37EN2", "HTTP 404\nNot Found");
        assert!(line.contains("| TRANSFER  | 37EN2 | HTTP 404 Not Found"));
        assert_eq!(line.lines().count(), 1);
    }

    #[test]
    fn test_appends_across_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("errors.log");

        ErrorLog::new(&path).record(FailureStage::Verify, "A", "bad header");
        let log = ErrorLog::new(&path);
        log.record(FailureStage::Reconcile, "B", "file missing");

        let entries = log.read_all_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].contains("VERIFY"));
        assert!(entries[1].contains("| B |"));
    }

    #[test]
    fn test_unwritable_log_does_not_panic() {
        let dir = TempDir::new().unwrap();
        // The log path is a directory, so every append fails.
        let log = ErrorLog::new(dir.path());
        log.record(FailureStage::Transfer, "A", "timeout");
    }
}
