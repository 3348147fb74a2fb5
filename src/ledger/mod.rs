// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable progress ledger.
//!
//! Records which catalog items are completed (downloaded and verified) and
//! which failed. Anything in neither map is pending. Every mutation is
//! applied under one write lock and persisted before the lock is released,
//! so the file on disk never shows a state the in-memory counters have not
//! also reached.
//!
//! # Ownership
//!
//! A run opens the ledger with [`Ledger::open`], which holds an exclusive
//! advisory lock on `<ledger>.lock` until the ledger is dropped. The handle
//! is shared as `Arc<Ledger>` between reconciliation and both pipeline
//! workers.

pub mod state;

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;

use crate::error::LedgerError;
use crate::locks::{
    acquire_exclusive_lock_with_timeout, acquire_shared_lock_with_timeout, resilient_read,
    resilient_write, LOCK_TIMEOUT,
};

pub use state::{CompletedEntry, FailedEntry, LedgerSnapshot, LedgerStats, LEDGER_VERSION};

/// Status of one catalog item as seen by the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Completed { bytes: Option<u64> },
    Failed { reason: String },
}

/// Thread-safe, persisted progress record.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    state: RwLock<LedgerSnapshot>,
    /// Held for the lifetime of the ledger; released on drop.
    _owner_lock: Option<File>,
}

impl Ledger {
    /// Open the ledger at `path` for a run, taking ownership of it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        Self::open_with_timeout(path, LOCK_TIMEOUT)
    }

    /// Open with a custom timeout for the ownership lock.
    pub fn open_with_timeout(path: impl Into<PathBuf>, timeout: Duration) -> Result<Self, LedgerError> {
        let path = path.into();
        let owner_lock = acquire_exclusive_lock_with_timeout(&Self::lock_path_for(&path), timeout)?;
        let state = Self::load(&path);

        Ok(Self {
            path,
            state: RwLock::new(state),
            _owner_lock: Some(owner_lock),
        })
    }

    /// Read the last persisted snapshot without owning the ledger. Safe while
    /// a run is active because snapshots are replaced by atomic rename.
    pub fn read_only(path: &Path) -> Result<LedgerSnapshot, LedgerError> {
        Ok(LedgerSnapshot::read_from(path)?.unwrap_or_default())
    }

    /// True if a run currently owns the ledger at `path`.
    pub fn owner_active(path: &Path) -> bool {
        matches!(
            acquire_shared_lock_with_timeout(&Self::lock_path_for(path), Duration::ZERO),
            Err(LedgerError::LockTimeout { .. })
        )
    }

    /// Load the snapshot at `path`.
    ///
    /// Never fails: a missing file yields an empty ledger, and an unreadable
    /// or corrupt one forfeits prior progress. A corrupt file is moved aside
    /// to `<ledger>.corrupt` so it is not silently overwritten.
    pub fn load(path: &Path) -> LedgerSnapshot {
        match LedgerSnapshot::read_from(path) {
            Ok(Some(snapshot)) => {
                tracing::info!(
                    path = %path.display(),
                    completed = snapshot.stats.completed_count,
                    failed = snapshot.stats.failed_count,
                    "Loaded ledger"
                );
                snapshot
            }
            Ok(None) => LedgerSnapshot::new(),
            Err(LedgerError::Serialize(e)) => {
                let aside = path.with_extension("corrupt");
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    moved_to = %aside.display(),
                    "Ledger is corrupt; starting with no prior progress"
                );
                if let Err(e) = fs::rename(path, &aside) {
                    tracing::warn!(error = %e, "Failed to move corrupt ledger aside");
                }
                LedgerSnapshot::new()
            }
            Err(e) => {
                tracing::error!(error = %e, "Ledger unreadable; starting with no prior progress");
                LedgerSnapshot::new()
            }
        }
    }

    fn lock_path_for(path: &Path) -> PathBuf {
        path.with_extension("lock")
    }

    /// Location of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `mutate` under the write lock, recompute the counters and
    /// persist, all before the lock is released.
    fn mutate<R>(&self, mutate: impl FnOnce(&mut LedgerSnapshot) -> R) -> R {
        let mut state = resilient_write(&self.state);
        let result = mutate(&mut state);
        state.recompute_stats();
        self.persist_locked(&mut state);
        result
    }

    /// Write under the caller's lock, retrying once. A second failure is
    /// logged and the run carries on with the in-memory state.
    fn persist_locked(&self, state: &mut LedgerSnapshot) -> bool {
        match state.write_atomic(&self.path) {
            Ok(()) => true,
            Err(first) => {
                tracing::warn!(error = %first, "Ledger write failed; retrying");
                match state.write_atomic(&self.path) {
                    Ok(()) => true,
                    Err(second) => {
                        tracing::error!(
                            path = %self.path.display(),
                            error = %second,
                            "LEDGER NOT SAVED: continuing with in-memory progress; \
                             the most recent changes may be lost if the process stops"
                        );
                        false
                    }
                }
            }
        }
    }

    /// Write the full current state to disk.
    pub fn persist(&self) -> Result<(), LedgerError> {
        let mut state = resilient_write(&self.state);
        state.recompute_stats();
        if let Err(first) = state.write_atomic(&self.path) {
            tracing::warn!(error = %first, "Ledger write failed; retrying");
            state.write_atomic(&self.path)?;
        }
        Ok(())
    }

    /// Record a verified download of `bytes` bytes.
    pub fn mark_completed(&self, id: &str, bytes: u64) {
        self.mutate(|state| {
            state.failed.remove(id);
            state.completed.insert(
                id.to_string(),
                CompletedEntry {
                    bytes: Some(bytes),
                    completed_at: Some(Utc::now()),
                },
            );
        });
    }

    /// Record a failure with a human-readable reason.
    pub fn mark_failed(&self, id: &str, reason: &str) {
        self.mutate(|state| {
            state.completed.remove(id);
            state.failed.insert(
                id.to_string(),
                FailedEntry {
                    error: reason.to_string(),
                    timestamp: Some(Utc::now()),
                },
            );
        });
    }

    /// Return a completed item to pending. Returns false if it was not
    /// completed.
    pub fn demote(&self, id: &str) -> bool {
        self.mutate(|state| state.completed.remove(id).is_some())
    }

    /// Fill in the byte count of a completed entry that lacks one.
    pub fn backfill_bytes(&self, id: &str, bytes: u64) {
        let needed = matches!(
            resilient_read(&self.state).completed.get(id),
            Some(CompletedEntry { bytes: None, .. })
        );
        if needed {
            self.mutate(|state| {
                if let Some(entry) = state.completed.get_mut(id) {
                    entry.bytes.get_or_insert(bytes);
                }
            });
        }
    }

    /// Record the catalog size.
    pub fn set_total_files(&self, total: u64) {
        self.mutate(|state| state.stats.total_files = total);
    }

    pub fn is_completed(&self, id: &str) -> bool {
        resilient_read(&self.state).completed.contains_key(id)
    }

    pub fn status(&self, id: &str) -> ItemStatus {
        let state = resilient_read(&self.state);
        if let Some(entry) = state.completed.get(id) {
            ItemStatus::Completed { bytes: entry.bytes }
        } else if let Some(entry) = state.failed.get(id) {
            ItemStatus::Failed {
                reason: entry.error.clone(),
            }
        } else {
            ItemStatus::Pending
        }
    }

    /// Identifiers currently marked completed, in sorted order.
    pub fn completed_ids(&self) -> Vec<String> {
        resilient_read(&self.state).completed.keys().cloned().collect()
    }

    pub fn stats(&self) -> LedgerStats {
        resilient_read(&self.state).stats
    }

    /// Copy of the full state.
    pub fn snapshot(&self) -> LedgerSnapshot {
        resilient_read(&self.state).clone()
    }
}
