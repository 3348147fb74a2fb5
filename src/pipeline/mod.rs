// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download/verification pipeline.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  TransferResult  ┌─────────────────┐
//! │ Transfer worker │─────────────────▶│ Verification    │
//! │ (HTTP -> .part) │  bounded queue   │ worker          │
//! └────────┬────────┘   (FIFO, 3)      └────────┬────────┘
//!          │ failures                           │ completed / failed
//!          ▼                                    ▼
//! ┌──────────────────────────────────────────────────────┐
//! │ Ledger (one write lock, persisted on every change)   │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! The [`Coordinator`] runs reconciliation first, then the two workers, and
//! shuts down by draining: on cancellation the transfer worker stops after
//! its in-flight item, the queue is closed, and everything already queued
//! is still verified.

pub mod cancel;
pub mod coordinator;
pub mod transfer;
pub mod verification;

use std::path::PathBuf;
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::error_log::ErrorLog;
use crate::ledger::Ledger;
use crate::progress::Reporter;

pub use cancel::CancelSignal;
pub use coordinator::{Coordinator, PipelineSettings, RunOutcome, RunSummary};
pub use transfer::Fetcher;

/// A file ready for verification; the payload of the hand-off queue.
///
/// Only successful transfers are queued. Each one is consumed exactly once
/// by the verification worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub id: String,
    pub path: PathBuf,
    pub bytes: u64,
}

impl TransferResult {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>, bytes: u64) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            bytes,
        }
    }
}

/// State shared by both workers.
#[derive(Debug)]
pub(crate) struct PipelineContext {
    pub catalog: Arc<Catalog>,
    pub ledger: Arc<Ledger>,
    pub error_log: Arc<ErrorLog>,
    pub download_dir: PathBuf,
    pub reporter: Reporter,
}
