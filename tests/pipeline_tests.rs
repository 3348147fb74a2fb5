// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end pipeline tests against a mock tile server.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rasterpull::{
    Catalog, CatalogItem, CheckOutcome, Coordinator, ErrorLog, IntegrityVerifier, ItemStatus,
    Ledger, LedgerStats, PipelineSettings, RunOutcome, SizeOnlyCheck, StructuralCheck,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    dir: TempDir,
    server: MockServer,
}

impl Harness {
    async fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            server: MockServer::start().await,
        }
    }

    fn download_dir(&self) -> PathBuf {
        self.dir.path().join("downloads")
    }

    fn ledger_path(&self) -> PathBuf {
        self.dir.path().join("download_progress.json")
    }

    fn error_log(&self) -> ErrorLog {
        ErrorLog::new(self.dir.path().join("download_errors.log"))
    }

    fn tile(&self, id: &str) -> PathBuf {
        self.download_dir().join(format!("{id}.tif"))
    }

    fn item(&self, id: &str, expected_size: u64) -> CatalogItem {
        CatalogItem {
            id: id.to_string(),
            url: format!("{}/{id}.tif", self.server.uri()),
            expected_size,
            name: format!("{id}.tif"),
        }
    }

    /// Serve `body` for `id`, expecting exactly `calls` requests.
    async fn serve(&self, id: &str, body: Vec<u8>, calls: u64) {
        self.serve_with(id, ResponseTemplate::new(200).set_body_bytes(body), calls).await;
    }

    async fn serve_with(&self, id: &str, response: ResponseTemplate, calls: u64) {
        Mock::given(method("GET"))
            .and(path(format!("/{id}.tif")))
            .respond_with(response)
            .expect(calls)
            .mount(&self.server)
            .await;
    }

    fn coordinator(&self, items: Vec<CatalogItem>) -> Coordinator {
        self.coordinator_with(items, PipelineSettings::new(self.download_dir()))
    }

    fn coordinator_with(&self, items: Vec<CatalogItem>, settings: PipelineSettings) -> Coordinator {
        self.coordinator_checked_by(items, settings, IntegrityVerifier::new(SizeOnlyCheck))
    }

    fn coordinator_checked_by(
        &self,
        items: Vec<CatalogItem>,
        settings: PipelineSettings,
        verifier: IntegrityVerifier,
    ) -> Coordinator {
        let ledger = Ledger::open(self.ledger_path()).unwrap();
        Coordinator::new(
            Catalog::from_items(items),
            Arc::new(ledger),
            verifier,
            self.error_log(),
            settings.with_fetch_timeout(Duration::from_secs(5)),
        )
        .unwrap()
    }
}

/// Structural check that rejects files whose first byte is `0xFF`, the way
/// `gdalinfo` rejects a file that is not a raster.
struct RejectsGarbageHeader;

impl StructuralCheck for RejectsGarbageHeader {
    fn check(&self, path: &Path) -> CheckOutcome {
        match std::fs::read(path) {
            Ok(bytes) if bytes.first() == Some(&0xFF) => {
                CheckOutcome::fail("ERROR 4: not recognized as a supported file format")
            }
            Ok(_) => CheckOutcome::pass(),
            Err(e) => CheckOutcome::fail(e.to_string()),
        }
    }

    fn name(&self) -> &str {
        "rejects-garbage-header"
    }
}

#[tokio::test]
async fn test_short_file_fails_verification_others_complete() {
    let h = Harness::new().await;
    h.serve("A", vec![1; 8], 1).await;
    h.serve("B", vec![2; 4], 1).await;
    h.serve("C", vec![3; 6], 1).await;

    let coordinator = h.coordinator(vec![h.item("A", 8), h.item("B", 5), h.item("C", 6)]);
    let summary = coordinator.run(false).await.unwrap();

    assert_eq!(coordinator.ledger().status("A"), ItemStatus::Completed { bytes: Some(8) });
    assert_eq!(coordinator.ledger().status("C"), ItemStatus::Completed { bytes: Some(6) });
    match coordinator.ledger().status("B") {
        ItemStatus::Failed { reason } => assert!(reason.contains("size mismatch"), "{reason}"),
        other => panic!("B should have failed, got {other:?}"),
    }
    assert!(!h.tile("B").exists());
    assert!(h.tile("A").exists() && h.tile("C").exists());

    assert_eq!(
        summary.stats,
        LedgerStats {
            total_files: 3,
            completed_count: 2,
            failed_count: 1,
            total_bytes_downloaded: 14,
        }
    );
    assert_eq!(summary.outcome(), RunOutcome::Incomplete);

    let persisted = Ledger::read_only(&h.ledger_path()).unwrap();
    assert_eq!(persisted.stats, summary.stats);

    let log = h.error_log().read_all_entries().unwrap();
    assert_eq!(log.len(), 1);
    assert!(log[0].contains("| VERIFY    | B |"), "{}", log[0]);
}

#[tokio::test]
async fn test_second_run_fetches_nothing() {
    let h = Harness::new().await;
    h.serve("A", vec![1; 8], 1).await;
    h.serve("B", vec![2; 5], 1).await;
    let items = vec![h.item("A", 8), h.item("B", 5)];

    let first = h.coordinator(items.clone());
    let summary = first.run(false).await.unwrap();
    assert_eq!(summary.outcome(), RunOutcome::AllCompleted);
    drop(first);

    let second = h.coordinator(items);
    let summary = second.run(false).await.unwrap();

    assert_eq!(summary.outcome(), RunOutcome::AllCompleted);
    assert_eq!(summary.already_completed, 2);
    assert_eq!(summary.remaining_at_start(), 0);
    assert_eq!(summary.reconcile.ok, 2);
    assert_eq!(summary.transfer.fetched, 0);
    assert_eq!(summary.stats.total_bytes_downloaded, 13);
}

#[tokio::test]
async fn test_zero_byte_completed_file_is_downloaded_again() {
    let h = Harness::new().await;
    h.serve("X", vec![9; 10], 1).await;

    std::fs::create_dir_all(h.download_dir()).unwrap();
    {
        let ledger = Ledger::open(h.ledger_path()).unwrap();
        ledger.mark_completed("X", 10);
    }
    std::fs::write(h.tile("X"), b"").unwrap();

    let coordinator = h.coordinator(vec![h.item("X", 10)]);
    let summary = coordinator.run(false).await.unwrap();

    assert_eq!(summary.reconcile.size_mismatch, 1);
    assert_eq!(summary.already_completed, 0);
    assert_eq!(summary.transfer.fetched, 1);
    assert_eq!(coordinator.ledger().status("X"), ItemStatus::Completed { bytes: Some(10) });
    assert_eq!(std::fs::metadata(h.tile("X")).unwrap().len(), 10);
    assert_eq!(summary.outcome(), RunOutcome::AllCompleted);

    let log = h.error_log().read_all_entries().unwrap();
    assert!(log.iter().any(|line| line.contains("| RECONCILE | X |")));
}

#[tokio::test]
async fn test_http_error_marks_failed_and_run_continues() {
    let h = Harness::new().await;
    h.serve_with("A", ResponseTemplate::new(404), 1).await;
    h.serve("B", vec![2; 5], 1).await;

    let coordinator = h.coordinator(vec![h.item("A", 8), h.item("B", 5)]);
    let summary = coordinator.run(false).await.unwrap();

    match coordinator.ledger().status("A") {
        ItemStatus::Failed { reason } => assert!(reason.contains("404"), "{reason}"),
        other => panic!("A should have failed, got {other:?}"),
    }
    assert_eq!(coordinator.ledger().status("B"), ItemStatus::Completed { bytes: Some(5) });
    assert_eq!(summary.transfer.failed, 1);
    assert!(!h.tile("A").exists());
    assert!(!h.download_dir().join("A.tif.part").exists());

    let log = h.error_log().read_all_entries().unwrap();
    assert!(log.iter().any(|line| line.contains("| TRANSFER  | A |")));
}

#[tokio::test]
async fn test_previous_failure_is_retried() {
    let h = Harness::new().await;
    h.serve("A", vec![1; 3], 1).await;
    {
        let ledger = Ledger::open(h.ledger_path()).unwrap();
        ledger.mark_failed("A", "transfer failed: timed out");
    }

    let coordinator = h.coordinator(vec![h.item("A", 3)]);
    let summary = coordinator.run(false).await.unwrap();

    assert_eq!(summary.previously_failed, 1);
    assert_eq!(coordinator.ledger().status("A"), ItemStatus::Completed { bytes: Some(3) });
    assert_eq!(summary.stats.failed_count, 0);
}

#[tokio::test]
async fn test_existing_file_at_expected_size_is_not_fetched() {
    let h = Harness::new().await;
    h.serve("A", vec![1; 4], 0).await;
    std::fs::create_dir_all(h.download_dir()).unwrap();
    std::fs::write(h.tile("A"), [5u8; 4]).unwrap();

    let coordinator = h.coordinator(vec![h.item("A", 4)]);
    let summary = coordinator.run(false).await.unwrap();

    assert_eq!(summary.transfer.reused, 1);
    assert_eq!(summary.transfer.fetched, 0);
    assert_eq!(coordinator.ledger().status("A"), ItemStatus::Completed { bytes: Some(4) });
}

#[tokio::test]
async fn test_dry_run_fetches_nothing() {
    let h = Harness::new().await;
    h.serve("A", vec![1; 4], 0).await;
    h.serve("B", vec![1; 4], 0).await;

    let coordinator = h.coordinator(vec![h.item("A", 4), h.item("B", 4)]);
    let summary = coordinator.run(true).await.unwrap();

    assert!(summary.dry_run);
    assert_eq!(summary.total, 2);
    assert_eq!(summary.remaining_at_start(), 2);
    assert_eq!(summary.pending, 2);
    assert_eq!(coordinator.ledger().stats().total_files, 2);
}

#[tokio::test]
async fn test_cancel_before_start_is_resumable() {
    let h = Harness::new().await;
    h.serve("A", vec![1; 4], 0).await;

    let coordinator = h.coordinator(vec![h.item("A", 4)]);
    coordinator.cancel_signal().cancel();
    let summary = coordinator.run(false).await.unwrap();

    assert_eq!(summary.outcome(), RunOutcome::Interrupted);
    assert_eq!(coordinator.ledger().status("A"), ItemStatus::Pending);
    assert_eq!(summary.pending, 1);
}

#[tokio::test]
async fn test_cancel_finishes_in_flight_item_then_stops() {
    let h = Harness::new().await;
    h.serve_with(
        "A",
        ResponseTemplate::new(200)
            .set_body_bytes(vec![1; 16])
            .set_delay(Duration::from_millis(500)),
        1,
    )
    .await;
    h.serve("B", vec![2; 16], 0).await;
    h.serve("C", vec![3; 16], 0).await;

    let coordinator = h.coordinator(vec![h.item("A", 16), h.item("B", 16), h.item("C", 16)]);
    let cancel = coordinator.cancel_signal();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let summary = coordinator.run(false).await.unwrap();

    assert_eq!(summary.outcome(), RunOutcome::Interrupted);
    assert_eq!(coordinator.ledger().status("A"), ItemStatus::Completed { bytes: Some(16) });
    assert_eq!(coordinator.ledger().status("B"), ItemStatus::Pending);
    assert_eq!(coordinator.ledger().status("C"), ItemStatus::Pending);
    assert_eq!(summary.verification.completed, 1);
}

#[tokio::test]
async fn test_single_slot_queue_completes_everything() {
    let h = Harness::new().await;
    let ids = ["T1", "T2", "T3", "T4", "T5", "T6"];
    for id in ids {
        h.serve(id, vec![7; 32], 1).await;
    }

    let items = ids.iter().map(|id| h.item(id, 32)).collect();
    let settings = PipelineSettings::new(h.download_dir()).with_queue_capacity(1);
    let coordinator = h.coordinator_with(items, settings);
    let summary = coordinator.run(false).await.unwrap();

    assert_eq!(summary.outcome(), RunOutcome::AllCompleted);
    assert_eq!(summary.verification.completed, ids.len());
    assert_eq!(summary.stats.total_bytes_downloaded, 32 * ids.len() as u64);
    for id in ids {
        assert!(!h.download_dir().join(format!("{id}.tif.part")).exists());
    }
}

#[tokio::test]
async fn test_structurally_invalid_download_is_deleted_failed_and_logged() {
    let h = Harness::new().await;
    h.serve("A", vec![0x49; 8], 1).await;
    h.serve("B", vec![0xFF; 8], 1).await;

    let coordinator = h.coordinator_checked_by(
        vec![h.item("A", 8), h.item("B", 8)],
        PipelineSettings::new(h.download_dir()),
        IntegrityVerifier::new(RejectsGarbageHeader),
    );
    let summary = coordinator.run(false).await.unwrap();

    assert_eq!(summary.outcome(), RunOutcome::Incomplete);
    assert_eq!(summary.verification.completed, 1);
    assert_eq!(summary.verification.failed, 1);
    assert_eq!(coordinator.ledger().status("A"), ItemStatus::Completed { bytes: Some(8) });
    match coordinator.ledger().status("B") {
        ItemStatus::Failed { reason } => {
            assert!(reason.contains("structurally invalid"), "{reason}");
            assert!(reason.contains("not recognized"), "{reason}");
        }
        other => panic!("B should have failed, got {other:?}"),
    }
    assert!(!h.tile("B").exists());
    assert!(!h.download_dir().join("B.tif.part").exists());

    let log = h.error_log().read_all_entries().unwrap();
    assert_eq!(log.len(), 1);
    assert!(log[0].contains("| VERIFY    | B |"), "{}", log[0]);
    assert!(log[0].contains("structurally invalid"), "{}", log[0]);
}

#[tokio::test]
async fn test_items_sharing_a_base_name_each_get_their_own_file() {
    let h = Harness::new().await;
    h.serve("A", vec![1; 4], 1).await;
    h.serve("B", vec![2; 4], 1).await;

    let mut a = h.item("A", 4);
    a.name = "tile.tif".into();
    let mut b = h.item("B", 4);
    b.name = "sub/tile.tif".into();

    let coordinator = h.coordinator(vec![a, b]);
    let summary = coordinator.run(false).await.unwrap();

    assert_eq!(summary.outcome(), RunOutcome::AllCompleted);
    assert_eq!(summary.transfer.fetched, 2);
    assert_eq!(summary.transfer.reused, 0);
    assert_eq!(std::fs::read(h.download_dir().join("tile.tif")).unwrap(), vec![1; 4]);
    assert_eq!(std::fs::read(h.tile("B")).unwrap(), vec![2; 4]);
}
