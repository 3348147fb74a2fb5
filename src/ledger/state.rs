// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Serializable ledger state and its on-disk format.
//!
//! Loading accepts both the current layout (maps keyed by identifier) and
//! the older one where `completed` is a list of identifiers and `failed` a
//! list of `{kaartbladNr, error, timestamp}` records with repeats.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::LedgerError;

/// Current on-disk format version.
pub const LEDGER_VERSION: u32 = 2;

/// A verified download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedEntry {
    /// Bytes on disk; `None` for entries carried over from the old format
    #[serde(default)]
    pub bytes: Option<u64>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A transfer or verification failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntry {
    pub error: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Aggregate counters, kept equal to the cardinalities of the maps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    #[serde(default)]
    pub total_files: u64,
    #[serde(default)]
    pub completed_count: u64,
    #[serde(default)]
    pub failed_count: u64,
    #[serde(default)]
    pub total_bytes_downloaded: u64,
}

/// Full ledger contents, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawSnapshot")]
pub struct LedgerSnapshot {
    pub version: u32,
    pub completed: BTreeMap<String, CompletedEntry>,
    pub failed: BTreeMap<String, FailedEntry>,
    pub last_updated: Option<DateTime<Utc>>,
    pub stats: LedgerStats,
}

impl Default for LedgerSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerSnapshot {
    /// Empty ledger with zeroed counters.
    pub fn new() -> Self {
        Self {
            version: LEDGER_VERSION,
            completed: BTreeMap::new(),
            failed: BTreeMap::new(),
            last_updated: None,
            stats: LedgerStats::default(),
        }
    }

    /// Recompute the derived counters from the maps.
    pub fn recompute_stats(&mut self) {
        self.stats.completed_count = self.completed.len() as u64;
        self.stats.failed_count = self.failed.len() as u64;
        self.stats.total_bytes_downloaded = self
            .completed
            .values()
            .map(|entry| entry.bytes.unwrap_or(0))
            .sum();
    }

    /// True when the stored counters agree with the maps.
    pub fn stats_consistent(&self) -> bool {
        let mut derived = self.clone();
        derived.recompute_stats();
        derived.stats == self.stats
    }

    /// Read the snapshot at `path`.
    ///
    /// `Ok(None)` means there is no file yet.
    pub fn read_from(path: &Path) -> Result<Option<Self>, LedgerError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(LedgerError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let snapshot: LedgerSnapshot = serde_json::from_str(&content)?;
        Ok(Some(snapshot))
    }

    /// Write the snapshot to `path` through a temp file and an atomic rename,
    /// so a crash mid-write leaves the previous snapshot intact.
    pub fn write_atomic(&mut self, path: &Path) -> Result<(), LedgerError> {
        let write_err = |source: std::io::Error| LedgerError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(write_err)?;
            }
        }

        self.last_updated = Some(Utc::now());
        let content = serde_json::to_string_pretty(self)?;

        let temp_path = path.with_extension("tmp");
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .map_err(write_err)?;

            temp_file.write_all(content.as_bytes()).map_err(write_err)?;
            temp_file.sync_all().map_err(write_err)?;
        }

        fs::rename(&temp_path, path).map_err(|source| {
            let _ = fs::remove_file(&temp_path);
            write_err(source)
        })
    }
}

/// Accepts RFC 3339 as well as the naive local ISO timestamps the older
/// format wrote. Anything else becomes `None` rather than failing the load.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|ts| ts.with_timezone(&Utc))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCompleted {
    Map(BTreeMap<String, CompletedEntry>),
    List(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct LegacyFailure {
    #[serde(rename = "kaartbladNr")]
    id: String,
    #[serde(default)]
    error: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFailed {
    Map(BTreeMap<String, FailedEntry>),
    List(Vec<LegacyFailure>),
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    #[serde(default)]
    completed: Option<RawCompleted>,
    #[serde(default)]
    failed: Option<RawFailed>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    stats: LedgerStats,
}

impl From<RawSnapshot> for LedgerSnapshot {
    fn from(raw: RawSnapshot) -> Self {
        let completed = match raw.completed {
            Some(RawCompleted::Map(map)) => map,
            Some(RawCompleted::List(ids)) => ids
                .into_iter()
                .map(|id| {
                    (
                        id,
                        CompletedEntry {
                            bytes: None,
                            completed_at: None,
                        },
                    )
                })
                .collect(),
            None => BTreeMap::new(),
        };

        let mut failed = match raw.failed {
            Some(RawFailed::Map(map)) => map,
            // Repeated failures of one tile collapse to the latest record.
            Some(RawFailed::List(records)) => records
                .into_iter()
                .map(|r| {
                    (
                        r.id,
                        FailedEntry {
                            error: r.error,
                            timestamp: r.timestamp,
                        },
                    )
                })
                .collect(),
            None => BTreeMap::new(),
        };

        // A tile that failed once and later verified is completed.
        failed.retain(|id, _| !completed.contains_key(id));

        let mut snapshot = LedgerSnapshot {
            version: LEDGER_VERSION,
            completed,
            failed,
            last_updated: raw.last_updated,
            stats: LedgerStats {
                total_files: raw.stats.total_files,
                ..LedgerStats::default()
            },
        };
        snapshot.recompute_stats();
        snapshot
    }
}
