// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Startup reconciliation of the ledger against the disk.
//!
//! Every item the ledger calls completed is verified again before any new
//! download starts. Items that no longer verify lose their file and go back
//! to pending, so afterwards every completed item is known to be intact.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::catalog::Catalog;
use crate::error_log::{ErrorLog, FailureStage};
use crate::ledger::Ledger;
use crate::pipeline::CancelSignal;
use crate::progress::Reporter;
use crate::verify::{IntegrityVerifier, Verdict};

/// Counts from one reconciliation pass. Reporting only; not persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub checked: usize,
    pub ok: usize,
    pub missing: usize,
    pub size_mismatch: usize,
    pub invalid: usize,
    /// Completed in the ledger but absent from the catalog; left untouched
    pub skipped: usize,
    /// Not reached because the pass was cancelled; still completed, unverified
    pub unchecked: usize,
}

impl ReconcileSummary {
    /// Items returned to pending.
    pub fn demoted(&self) -> usize {
        self.missing + self.size_mismatch + self.invalid
    }
}

/// Remove `path`, treating an already missing file as success.
pub(crate) fn remove_artifact(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Deleted artifact"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to delete artifact"),
    }
}

/// Re-verify every completed item and demote the ones that fail.
///
/// Must finish before the pipeline starts. Cancellation is honoured between
/// items; the items not reached are counted as `unchecked` and no transfer
/// may start after a cancelled pass.
pub fn reconcile(
    catalog: &Catalog,
    ledger: &Ledger,
    verifier: &IntegrityVerifier,
    download_dir: &Path,
    error_log: &ErrorLog,
    reporter: &Reporter,
    cancel: &CancelSignal,
) -> ReconcileSummary {
    let completed = ledger.completed_ids();
    let total = completed.len();
    let mut summary = ReconcileSummary {
        checked: total,
        ..ReconcileSummary::default()
    };

    if completed.is_empty() {
        tracing::info!("No completed downloads to re-verify");
        return summary;
    }

    tracing::info!(count = completed.len(), checker = verifier.check_name(), "Re-verifying completed downloads");
    let bar = reporter.files_bar("Verifying", completed.len() as u64);

    for (index, id) in completed.into_iter().enumerate() {
        if cancel.is_cancelled() {
            summary.unchecked = total - index;
            summary.checked = index;
            tracing::info!(unchecked = summary.unchecked, "Cancellation requested; re-verification stopped");
            break;
        }

        let Some(item) = catalog.get(&id) else {
            tracing::warn!(id = %id, "Completed item not in catalog; leaving it as is");
            summary.skipped += 1;
            bar.inc(1);
            continue;
        };

        let path = item.local_path(download_dir);
        let verdict = verifier.verify(&path, item.expected_size);

        match &verdict {
            Verdict::Ok => {
                summary.ok += 1;
                ledger.backfill_bytes(&id, item.expected_size);
                bar.inc(1);
                continue;
            }
            Verdict::Missing => summary.missing += 1,
            Verdict::SizeMismatch { .. } => summary.size_mismatch += 1,
            Verdict::StructurallyInvalid(_) => summary.invalid += 1,
        }

        tracing::warn!(id = %id, path = %path.display(), reason = %verdict, "Completed download failed re-verification");
        remove_artifact(&path);
        ledger.demote(&id);
        error_log.record(FailureStage::Reconcile, &id, &verdict.to_string());
        bar.inc(1);
    }

    bar.finish_and_clear();

    if summary.demoted() > 0 {
        tracing::warn!(count = summary.demoted(), "Items returned to pending and will be downloaded again");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogItem;
    use crate::ledger::ItemStatus;
    use crate::verify::{CheckOutcome, SizeOnlyCheck, StructuralCheck};
    use tempfile::TempDir;

    struct RejectNamed(&'static str);

    impl StructuralCheck for RejectNamed {
        fn check(&self, path: &Path) -> CheckOutcome {
            if path.file_name().and_then(|n| n.to_str()) == Some(self.0) {
                CheckOutcome::fail("not a GeoTIFF")
            } else {
                CheckOutcome::pass()
            }
        }

        fn name(&self) -> &str {
            "reject-named"
        }
    }

    fn item(id: &str, size: u64) -> CatalogItem {
        CatalogItem {
            id: id.into(),
            url: format!("http://tiles.test/{id}.tif"),
            expected_size: size,
            name: format!("{id}.tif"),
        }
    }

    struct Fixture {
        dir: TempDir,
        catalog: Catalog,
        ledger: Ledger,
        error_log: ErrorLog,
    }

    impl Fixture {
        fn new(items: Vec<CatalogItem>) -> Self {
            let dir = TempDir::new().unwrap();
            fs::create_dir_all(dir.path().join("dl")).unwrap();
            let ledger = Ledger::open(dir.path().join("progress.json")).unwrap();
            let error_log = ErrorLog::new(dir.path().join("errors.log"));
            Self {
                catalog: Catalog::from_items(items),
                ledger,
                error_log,
                dir,
            }
        }

        fn download_dir(&self) -> std::path::PathBuf {
            self.dir.path().join("dl")
        }

        fn put(&self, name: &str, len: usize) {
            fs::write(self.download_dir().join(name), vec![1u8; len]).unwrap();
        }

        fn run(&self, verifier: &IntegrityVerifier) -> ReconcileSummary {
            reconcile(
                &self.catalog,
                &self.ledger,
                verifier,
                &self.download_dir(),
                &self.error_log,
                &Reporter::hidden(),
                &CancelSignal::new(),
            )
        }
    }

    #[test]
    fn test_all_ok_leaves_ledger_unchanged() {
        let fx = Fixture::new(vec![item("A", 10), item("B", 5)]);
        fx.put("A.tif", 10);
        fx.put("B.tif", 5);
        fx.ledger.mark_completed("A", 10);
        fx.ledger.mark_completed("B", 5);

        let summary = fx.run(&IntegrityVerifier::new(SizeOnlyCheck));

        assert_eq!(summary.checked, 2);
        assert_eq!(summary.ok, 2);
        assert_eq!(summary.demoted(), 0);
        assert_eq!(fx.ledger.stats().completed_count, 2);
    }

    #[test]
    fn test_each_failure_kind_is_demoted_and_deleted() {
        let fx = Fixture::new(vec![item("M", 10), item("S", 10), item("I", 10), item("K", 10)]);
        fx.put("S.tif", 0);
        fx.put("I.tif", 10);
        fx.put("K.tif", 10);
        for id in ["M", "S", "I", "K"] {
            fx.ledger.mark_completed(id, 10);
        }

        let summary = fx.run(&IntegrityVerifier::new(RejectNamed("I.tif")));

        assert_eq!(
            summary,
            ReconcileSummary {
                checked: 4,
                ok: 1,
                missing: 1,
                size_mismatch: 1,
                invalid: 1,
                skipped: 0,
                unchecked: 0,
            }
        );
        for id in ["M", "S", "I"] {
            assert_eq!(fx.ledger.status(id), ItemStatus::Pending);
        }
        assert!(!fx.download_dir().join("S.tif").exists());
        assert!(!fx.download_dir().join("I.tif").exists());
        assert!(fx.download_dir().join("K.tif").exists());

        let snapshot = fx.ledger.snapshot();
        assert_eq!(snapshot.stats.completed_count, 1);
        assert_eq!(snapshot.stats.total_bytes_downloaded, 10);
        assert_eq!(fx.error_log.read_all_entries().unwrap().len(), 3);
    }

    #[test]
    fn test_unknown_ids_are_skipped() {
        let fx = Fixture::new(vec![item("A", 1)]);
        fx.ledger.mark_completed("GONE", 1);

        let summary = fx.run(&IntegrityVerifier::new(SizeOnlyCheck));
        assert_eq!(summary.skipped, 1);
        assert!(fx.ledger.is_completed("GONE"));
    }

    #[test]
    fn test_legacy_entries_get_bytes_backfilled() {
        let fx = Fixture::new(vec![item("A", 10)]);
        fx.put("A.tif", 10);
        fs::write(
            fx.dir.path().join("progress.json"),
            r#"{"completed": ["A"], "failed": []}"#,
        )
        .unwrap();
        drop(fx.ledger);
        let ledger = Ledger::open(fx.dir.path().join("progress.json")).unwrap();

        reconcile(
            &fx.catalog,
            &ledger,
            &IntegrityVerifier::new(SizeOnlyCheck),
            &fx.dir.path().join("dl"),
            &fx.error_log,
            &Reporter::hidden(),
            &CancelSignal::new(),
        );
        assert_eq!(ledger.stats().total_bytes_downloaded, 10);
    }

    /// Cancels the run from inside the first structural check.
    struct CancelOnCheck(CancelSignal);

    impl StructuralCheck for CancelOnCheck {
        fn check(&self, _path: &Path) -> CheckOutcome {
            self.0.cancel();
            CheckOutcome::pass()
        }

        fn name(&self) -> &str {
            "cancel-on-check"
        }
    }

    #[test]
    fn test_cancellation_stops_between_items() {
        let fx = Fixture::new(vec![item("A", 2), item("B", 2), item("C", 2)]);
        for id in ["A", "B", "C"] {
            fx.put(&format!("{id}.tif"), 2);
            fx.ledger.mark_completed(id, 2);
        }

        let cancel = CancelSignal::new();
        let summary = reconcile(
            &fx.catalog,
            &fx.ledger,
            &IntegrityVerifier::new(CancelOnCheck(cancel.clone())),
            &fx.download_dir(),
            &fx.error_log,
            &Reporter::hidden(),
            &cancel,
        );

        assert_eq!(summary.checked, 1);
        assert_eq!(summary.ok, 1);
        assert_eq!(summary.unchecked, 2);
        assert_eq!(summary.demoted(), 0);
        for id in ["A", "B", "C"] {
            assert!(fx.ledger.is_completed(id));
        }
    }

    #[test]
    fn test_cancelled_before_start_checks_nothing() {
        let fx = Fixture::new(vec![item("A", 2)]);
        fx.ledger.mark_completed("A", 2);

        let cancel = CancelSignal::new();
        cancel.cancel();
        let summary = reconcile(
            &fx.catalog,
            &fx.ledger,
            &IntegrityVerifier::new(SizeOnlyCheck),
            &fx.download_dir(),
            &fx.error_log,
            &Reporter::hidden(),
            &cancel,
        );

        assert_eq!(summary.unchecked, 1);
        assert_eq!(summary.missing, 0);
        assert!(fx.ledger.is_completed("A"));
    }
}
