// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Verification worker: drains the hand-off queue in FIFO order and records
//! the final status of every item it receives.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::{CancelSignal, PipelineContext, TransferResult};
use crate::error_log::FailureStage;
use crate::reconcile::remove_artifact;
use crate::verify::IntegrityVerifier;

/// Counts from one verification pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerificationStats {
    pub completed: usize,
    pub failed: usize,
}

/// Consume results until the queue is closed and empty.
///
/// Cancellation does not stop this loop: anything already queued is still
/// verified, so no finished transfer is lost on shutdown.
pub(crate) async fn run_verifications(
    ctx: Arc<PipelineContext>,
    verifier: IntegrityVerifier,
    mut rx: mpsc::Receiver<TransferResult>,
    cancel: CancelSignal,
) -> VerificationStats {
    let mut stats = VerificationStats::default();
    let mut draining = false;

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(result) = received else { break };
                if process(&ctx, &verifier, result).await {
                    stats.completed += 1;
                } else {
                    stats.failed += 1;
                }
            }
            _ = cancel.cancelled(), if !draining => {
                draining = true;
                tracing::info!(queued = rx.len(), "Cancellation requested; finishing queued verifications");
            }
        }
    }

    tracing::debug!(?stats, "Verification worker finished");
    stats
}

/// Verify one result and record it. Returns true when the item completed.
///
/// The check, artifact removal and ledger writes all block, so they run
/// together on the blocking pool.
async fn process(ctx: &Arc<PipelineContext>, verifier: &IntegrityVerifier, result: TransferResult) -> bool {
    let spinner = ctx.reporter.spinner(&format!("Verifying {}", result.id));
    let task = {
        let ctx = ctx.clone();
        let verifier = verifier.clone();
        let result = result.clone();
        tokio::task::spawn_blocking(move || settle(&ctx, &verifier, &result))
    };
    let completed = match task.await {
        Ok(completed) => completed,
        Err(e) => {
            tracing::error!(id = %result.id, error = %e, "Verification task failed");
            let reason = format!("verification failed: task failed: {e}");
            let ctx = ctx.clone();
            let recorded = tokio::task::spawn_blocking(move || record_failure(&ctx, &result, &reason)).await;
            if let Err(e) = recorded {
                tracing::error!(error = %e, "Could not record verification failure");
            }
            false
        }
    };
    spinner.finish_and_clear();
    completed
}

fn settle(ctx: &PipelineContext, verifier: &IntegrityVerifier, result: &TransferResult) -> bool {
    let Some(expected) = ctx.catalog.get(&result.id).map(|item| item.expected_size) else {
        tracing::warn!(id = %result.id, "Queued item is not in the catalog");
        ctx.ledger.mark_failed(&result.id, "not in catalog");
        return false;
    };

    let verdict = verifier.verify(&result.path, expected);
    if verdict.is_ok() {
        tracing::info!(id = %result.id, bytes = result.bytes, "Verified and completed");
        ctx.ledger.mark_completed(&result.id, result.bytes);
        return true;
    }

    tracing::warn!(id = %result.id, path = %result.path.display(), reason = %verdict, "Verification failed");
    record_failure(ctx, result, &format!("verification failed: {verdict}"));
    false
}

fn record_failure(ctx: &PipelineContext, result: &TransferResult, reason: &str) {
    remove_artifact(&result.path);
    ctx.ledger.mark_failed(&result.id, reason);
    ctx.error_log.record(FailureStage::Verify, &result.id, reason);
}
