// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Run orchestration: reconcile, start both workers, shut down cleanly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use super::transfer::{run_transfers, Fetcher, TransferStats};
use super::verification::{run_verifications, VerificationStats};
use super::{CancelSignal, PipelineContext};
use crate::catalog::Catalog;
use crate::config::{Config, DEFAULT_QUEUE_CAPACITY};
use crate::error_log::ErrorLog;
use crate::ledger::{ItemStatus, Ledger, LedgerStats};
use crate::progress::Reporter;
use crate::reconcile::{reconcile, ReconcileSummary};
use crate::verify::IntegrityVerifier;

/// Knobs the coordinator needs from the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub download_dir: PathBuf,
    pub queue_capacity: usize,
    pub fetch_timeout: Duration,
}

impl PipelineSettings {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            fetch_timeout: Duration::from_secs(crate::config::DEFAULT_FETCH_TIMEOUT_SECS),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            download_dir: config.download_dir.clone(),
            queue_capacity: config.queue_capacity,
            fetch_timeout: config.fetch_timeout(),
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}

/// How a run ended, used for the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every catalog item is completed
    AllCompleted,
    /// The run finished but some items are failed or still pending
    Incomplete,
    /// Stopped by cancellation; a later run resumes
    Interrupted,
}

/// Everything reported at the end of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub total: usize,
    /// Completed before any transfer started (after reconciliation)
    pub already_completed: usize,
    /// Failed in an earlier run and retried in this one
    pub previously_failed: usize,
    pub reconcile: ReconcileSummary,
    pub transfer: TransferStats,
    pub verification: VerificationStats,
    /// Ledger counters after the final persist
    pub stats: LedgerStats,
    /// Catalog items neither completed nor failed at the end
    pub pending: usize,
    /// Catalog items failed at the end
    pub failed: usize,
    pub dry_run: bool,
}

impl RunSummary {
    pub fn remaining_at_start(&self) -> usize {
        self.total.saturating_sub(self.already_completed)
    }

    pub fn outcome(&self) -> RunOutcome {
        if self.transfer.interrupted {
            RunOutcome::Interrupted
        } else if self.pending == 0 && self.failed == 0 {
            RunOutcome::AllCompleted
        } else {
            RunOutcome::Incomplete
        }
    }
}

/// Owns one run of the pipeline.
pub struct Coordinator {
    ctx: Arc<PipelineContext>,
    verifier: IntegrityVerifier,
    fetcher: Fetcher,
    queue_capacity: usize,
    cancel: CancelSignal,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("download_dir", &self.ctx.download_dir)
            .field("catalog_items", &self.ctx.catalog.len())
            .field("checker", &self.verifier.check_name())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

impl Coordinator {
    pub fn new(
        catalog: Catalog,
        ledger: Arc<Ledger>,
        verifier: IntegrityVerifier,
        error_log: ErrorLog,
        settings: PipelineSettings,
    ) -> Result<Self> {
        let fetcher = Fetcher::new(settings.fetch_timeout).context("Failed to build HTTP client")?;
        Ok(Self {
            ctx: Arc::new(PipelineContext {
                catalog: Arc::new(catalog),
                ledger,
                error_log: Arc::new(error_log),
                download_dir: settings.download_dir,
                reporter: Reporter::hidden(),
            }),
            verifier,
            fetcher,
            queue_capacity: settings.queue_capacity.max(1),
            cancel: CancelSignal::new(),
        })
    }

    /// Show progress bars through `reporter`. Call before running.
    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        if let Some(ctx) = Arc::get_mut(&mut self.ctx) {
            ctx.reporter = reporter;
        }
        self
    }

    /// Use an externally owned cancellation signal, e.g. one set by Ctrl-C.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ctx.ledger
    }

    /// Re-verify completed items on the blocking pool. Stops early when the
    /// cancel signal fires.
    pub async fn reconcile(&self) -> Result<ReconcileSummary> {
        let ctx = self.ctx.clone();
        let verifier = self.verifier.clone();
        let cancel = self.cancel.clone();
        tokio::task::spawn_blocking(move || {
            reconcile(
                &ctx.catalog,
                &ctx.ledger,
                &verifier,
                &ctx.download_dir,
                &ctx.error_log,
                &ctx.reporter,
                &cancel,
            )
        })
        .await
        .context("Reconciliation task failed")
    }

    /// Run the whole pipeline. With `dry_run` only reconciliation and the
    /// start-of-run counts happen; nothing is fetched.
    pub async fn run(&self, dry_run: bool) -> Result<RunSummary> {
        let ctx = &self.ctx;
        tokio::fs::create_dir_all(&ctx.download_dir)
            .await
            .with_context(|| format!("Failed to create download directory {:?}", ctx.download_dir))?;

        ctx.ledger.set_total_files(ctx.catalog.len() as u64);

        let reconcile = self.reconcile().await?;

        let (already_completed, previously_failed) = self.count_statuses();
        let total = ctx.catalog.len();
        tracing::info!(
            total,
            completed = already_completed,
            previously_failed,
            remaining = total - already_completed,
            "Starting run"
        );

        let mut summary = RunSummary {
            total,
            already_completed,
            previously_failed,
            reconcile,
            transfer: TransferStats::default(),
            verification: VerificationStats::default(),
            stats: LedgerStats::default(),
            pending: 0,
            failed: 0,
            dry_run,
        };

        if dry_run {
            tracing::info!("Dry run; no transfers started");
        } else if already_completed == total {
            tracing::info!("All items already completed");
        } else if self.cancel.is_cancelled() {
            summary.transfer.interrupted = true;
        } else {
            let (transfer, verification) = self.run_workers().await?;
            summary.transfer = transfer;
            summary.verification = verification;
        }

        if let Err(e) = ctx.ledger.persist() {
            tracing::error!(error = %e, "Final ledger save failed");
        }

        let (completed, failed) = self.count_statuses();
        summary.failed = failed;
        summary.pending = total - completed - failed;
        summary.stats = ctx.ledger.stats();
        Ok(summary)
    }

    async fn run_workers(&self) -> Result<(TransferStats, VerificationStats)> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        let verifier_task = tokio::spawn(run_verifications(
            self.ctx.clone(),
            self.verifier.clone(),
            rx,
            self.cancel.clone(),
        ));

        // Returning drops `tx`, which closes the queue once it is drained.
        let transfer = run_transfers(&self.ctx, &self.fetcher, tx, &self.cancel).await;

        let verification = verifier_task.await.context("Verification worker panicked")?;
        tracing::debug!(?transfer, ?verification, "Workers finished");
        Ok((transfer, verification))
    }

    /// (completed, failed) counts over catalog items only.
    fn count_statuses(&self) -> (usize, usize) {
        let mut completed = 0;
        let mut failed = 0;
        for item in self.ctx.catalog.iter() {
            match self.ctx.ledger.status(&item.id) {
                ItemStatus::Completed { .. } => completed += 1,
                ItemStatus::Failed { .. } => failed += 1,
                ItemStatus::Pending => {}
            }
        }
        (completed, failed)
    }
}
