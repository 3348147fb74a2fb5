// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transfer worker: walks the catalog, fetches pending items and hands them
//! to verification.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use indicatif::ProgressBar;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use super::{CancelSignal, PipelineContext, TransferResult};
use crate::error::TransferError;
use crate::error_log::FailureStage;
use crate::reconcile::remove_artifact;

const USER_AGENT: &str = concat!("rasterpull/", env!("CARGO_PKG_VERSION"));

/// Path of the in-progress file for `dest`: `<dest>.part`.
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

/// HTTP client that streams one URL into one file.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl Fetcher {
    /// `timeout` bounds connecting, the response head and every body chunk.
    /// A slow but steady transfer never times out.
    pub fn new(timeout: Duration) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client, timeout })
    }

    /// Stream `url` into `<dest>.part`, fsync it and rename it to `dest`.
    ///
    /// Returns the number of bytes written. On any error the partial file is
    /// removed and `dest` is untouched.
    pub async fn fetch_to_file(&self, url: &str, dest: &Path, bar: &ProgressBar) -> Result<u64, TransferError> {
        let part = part_path(dest);
        match self.stream_into(url, &part, bar).await {
            Ok(bytes) => {
                tokio::fs::rename(&part, dest)
                    .await
                    .map_err(|e| TransferError::io(dest, e))?;
                Ok(bytes)
            }
            Err(e) => {
                remove_artifact(&part);
                Err(e)
            }
        }
    }

    async fn stream_into(&self, url: &str, part: &Path, bar: &ProgressBar) -> Result<u64, TransferError> {
        let response = tokio::time::timeout(self.timeout, self.client.get(url).send())
            .await
            .map_err(|_| TransferError::Timeout(self.timeout))??;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::BadStatus(status.as_u16()));
        }

        let announced = response.content_length();
        if let Some(len) = announced {
            bar.set_length(len);
        }

        let mut file = tokio::fs::File::create(part)
            .await
            .map_err(|e| TransferError::io(part, e))?;
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;

        loop {
            let next = tokio::time::timeout(self.timeout, stream.next())
                .await
                .map_err(|_| TransferError::Timeout(self.timeout))?;
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| match announced {
                // The connection closed before the announced length arrived.
                Some(expected) if received < expected => {
                    tracing::debug!(error = %e, received, expected, "Body ended early");
                    TransferError::Truncated { expected, received }
                }
                _ => TransferError::from(e),
            })?;
            file.write_all(&chunk).await.map_err(|e| TransferError::io(part, e))?;
            received += chunk.len() as u64;
            bar.inc(chunk.len() as u64);
        }

        file.flush().await.map_err(|e| TransferError::io(part, e))?;
        file.sync_all().await.map_err(|e| TransferError::io(part, e))?;
        drop(file);

        if received == 0 {
            return Err(TransferError::EmptyBody);
        }
        if let Some(expected) = announced {
            if received != expected {
                return Err(TransferError::Truncated { expected, received });
            }
        }
        Ok(received)
    }
}

/// Counts from one transfer pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Fetched over the network and queued
    pub fetched: usize,
    /// Already on disk at the expected size and queued without fetching
    pub reused: usize,
    pub failed: usize,
    /// Stopped early because cancellation was requested
    pub interrupted: bool,
}

/// Walk the catalog in order and queue every item that is not completed.
///
/// Cancellation is checked between items only; an in-flight transfer always
/// runs to success or failure. Returns when the catalog is exhausted, when
/// cancelled, or when the verification side has gone away. Dropping `tx` on
/// return closes the queue.
pub(crate) async fn run_transfers(
    ctx: &PipelineContext,
    fetcher: &Fetcher,
    tx: mpsc::Sender<TransferResult>,
    cancel: &CancelSignal,
) -> TransferStats {
    let mut stats = TransferStats::default();

    for item in ctx.catalog.iter() {
        if cancel.is_cancelled() {
            tracing::info!("Cancellation requested; no further transfers will start");
            stats.interrupted = true;
            break;
        }
        if ctx.ledger.is_completed(&item.id) {
            continue;
        }

        let dest = item.local_path(&ctx.download_dir);

        let result = match reuse_existing(&dest, item.expected_size).await {
            Some(bytes) => {
                tracing::info!(id = %item.id, "File already present at expected size; queued for verification");
                stats.reused += 1;
                TransferResult::new(&item.id, &dest, bytes)
            }
            None => {
                tracing::debug!(id = %item.id, url = %item.url, "Fetching");
                let bar = ctx.reporter.transfer_bar(&item.id, item.expected_size);
                let outcome = fetcher.fetch_to_file(&item.url, &dest, &bar).await;
                bar.finish_and_clear();

                match outcome {
                    Ok(bytes) => {
                        tracing::info!(id = %item.id, bytes, "Transfer finished");
                        stats.fetched += 1;
                        TransferResult::new(&item.id, &dest, bytes)
                    }
                    Err(e) => {
                        let reason = format!("transfer failed: {e}");
                        tracing::warn!(id = %item.id, error = %e, "Transfer failed");
                        ctx.ledger.mark_failed(&item.id, &reason);
                        ctx.error_log.record(FailureStage::Transfer, &item.id, &reason);
                        stats.failed += 1;
                        continue;
                    }
                }
            }
        };

        // Blocks while the queue is full; the verification side keeps draining.
        if tx.send(result).await.is_err() {
            tracing::error!("Verification worker stopped; halting transfers");
            stats.interrupted = true;
            break;
        }
    }

    stats
}

/// Size of an existing target if it matches `expected`. A target of any
/// other size is deleted so it gets fetched again.
async fn reuse_existing(dest: &Path, expected: u64) -> Option<u64> {
    match tokio::fs::metadata(dest).await {
        Ok(meta) if meta.is_file() && meta.len() == expected && expected > 0 => Some(meta.len()),
        Ok(meta) => {
            tracing::debug!(path = %dest.display(), size = meta.len(), expected, "Discarding stale file");
            remove_artifact(dest);
            None
        }
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(path = %dest.display(), error = %e, "Cannot inspect existing file");
            None
        }
    }
}
