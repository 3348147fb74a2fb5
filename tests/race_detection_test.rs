// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Race Detection Tests for rasterpull
//!
//! The transfer and verification workers both write to the ledger. These
//! tests hammer it from many threads and check that no update is lost and
//! that the persisted counters always match the entry maps.
//!
//! # Running with ThreadSanitizer
//!
//! ```bash
//! RUSTFLAGS="-Z sanitizer=thread" cargo +nightly test --target x86_64-unknown-linux-gnu --test race_detection_test
//! ```

use std::sync::{Arc, Barrier};
use std::thread;

use rasterpull::{ItemStatus, Ledger, LedgerSnapshot};
use tempfile::TempDir;

// Test configuration
const WRITERS_PER_KIND: usize = 4;
const ITEMS_PER_WRITER: usize = 25;

fn open_ledger(dir: &TempDir) -> Arc<Ledger> {
    Arc::new(Ledger::open(dir.path().join("progress.json")).expect("open ledger"))
}

fn assert_counters_consistent(snapshot: &LedgerSnapshot) {
    assert_eq!(snapshot.stats.completed_count as usize, snapshot.completed.len());
    assert_eq!(snapshot.stats.failed_count as usize, snapshot.failed.len());
    let bytes: u64 = snapshot.completed.values().filter_map(|e| e.bytes).sum();
    assert_eq!(snapshot.stats.total_bytes_downloaded, bytes);
    for id in snapshot.completed.keys() {
        assert!(!snapshot.failed.contains_key(id), "{id} is both completed and failed");
    }
}

// =============================================================================
// CONCURRENT WRITER TESTS
// =============================================================================

/// A failure recorded for A while B completes must keep both updates.
#[test]
fn test_failure_racing_completion_loses_neither() {
    for _ in 0..20 {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let barrier = Arc::new(Barrier::new(2));

        let failer = {
            let ledger = ledger.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                ledger.mark_failed("A", "transfer failed: server returned HTTP 503");
            })
        };
        let completer = {
            let ledger = ledger.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                ledger.mark_completed("B", 1024);
            })
        };
        failer.join().unwrap();
        completer.join().unwrap();

        assert!(matches!(ledger.status("A"), ItemStatus::Failed { .. }));
        assert_eq!(ledger.status("B"), ItemStatus::Completed { bytes: Some(1024) });

        let on_disk = Ledger::read_only(ledger.path()).unwrap();
        assert!(on_disk.failed.contains_key("A"));
        assert!(on_disk.completed.contains_key("B"));
        assert_counters_consistent(&on_disk);
    }
}

/// Many writers on disjoint ids: every update survives in memory and on disk.
#[test]
fn test_many_writers_no_lost_updates() {
    let dir = TempDir::new().unwrap();
    let ledger = open_ledger(&dir);
    let barrier = Arc::new(Barrier::new(WRITERS_PER_KIND * 2));

    let mut handles = Vec::new();
    for writer in 0..WRITERS_PER_KIND {
        let completer_ledger = ledger.clone();
        let completer_barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            completer_barrier.wait();
            for i in 0..ITEMS_PER_WRITER {
                completer_ledger.mark_completed(&format!("C{writer}-{i}"), 10);
            }
        }));

        let failer_ledger = ledger.clone();
        let failer_barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            failer_barrier.wait();
            for i in 0..ITEMS_PER_WRITER {
                failer_ledger.mark_failed(&format!("F{writer}-{i}"), "verification failed");
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let expected = (WRITERS_PER_KIND * ITEMS_PER_WRITER) as u64;
    let stats = ledger.stats();
    assert_eq!(stats.completed_count, expected);
    assert_eq!(stats.failed_count, expected);
    assert_eq!(stats.total_bytes_downloaded, expected * 10);

    let on_disk = Ledger::read_only(ledger.path()).unwrap();
    assert_eq!(on_disk.completed.len() as u64, expected);
    assert_eq!(on_disk.failed.len() as u64, expected);
    assert_counters_consistent(&on_disk);
}

/// Writers flipping the same ids between failed and completed never leave an
/// id in both maps.
#[test]
fn test_same_id_flip_keeps_single_status() {
    let dir = TempDir::new().unwrap();
    let ledger = open_ledger(&dir);
    let ids: Vec<String> = (0..10).map(|i| format!("X{i}")).collect();
    let barrier = Arc::new(Barrier::new(2));

    let completer = {
        let ledger = ledger.clone();
        let ids = ids.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            for round in 0..20u64 {
                for id in &ids {
                    ledger.mark_completed(id, round + 1);
                }
            }
        })
    };
    let failer = {
        let ledger = ledger.clone();
        let ids = ids.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..20 {
                for id in &ids {
                    ledger.mark_failed(id, "size mismatch");
                }
            }
        })
    };
    completer.join().unwrap();
    failer.join().unwrap();

    let snapshot = ledger.snapshot();
    assert_eq!(snapshot.completed.len() + snapshot.failed.len(), ids.len());
    assert_counters_consistent(&snapshot);
    assert_counters_consistent(&Ledger::read_only(ledger.path()).unwrap());
}

/// Readers never observe counters that disagree with the maps.
#[test]
fn test_readers_see_consistent_snapshots() {
    let dir = TempDir::new().unwrap();
    let ledger = open_ledger(&dir);

    let writer = {
        let ledger = ledger.clone();
        thread::spawn(move || {
            for i in 0..200 {
                ledger.mark_completed(&format!("T{i}"), 3);
                if i % 3 == 0 {
                    ledger.demote(&format!("T{i}"));
                }
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let ledger = ledger.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    assert_counters_consistent(&ledger.snapshot());
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_counters_consistent(&Ledger::read_only(ledger.path()).unwrap());
}
