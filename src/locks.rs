// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock helpers.
//!
//! Two kinds of locking protect the ledger:
//!
//! - In-process: the ledger's `RwLock`, acquired through [`resilient_read`]
//!   and [`resilient_write`]. A worker that panics while holding the lock
//!   poisons it; we recover the guard instead of taking the other worker down
//!   with it. The ledger is persisted only after a mutation completes, so the
//!   recovered state is the last consistent one.
//! - Cross-process: an advisory `fs2` lock on `<ledger>.lock`, acquired with
//!   a timeout by [`acquire_exclusive_lock_with_timeout`] (a run) or
//!   [`acquire_shared_lock_with_timeout`] (read-only status queries).

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::LedgerError;

/// Default timeout for acquiring file locks.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "rasterpull::locks",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned; a worker panicked while holding it. Recovering."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "rasterpull::locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned; a worker panicked while holding it. Recovering."
            );
            poisoned.into_inner()
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File, LedgerError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| LedgerError::Lock {
                path: path.to_path_buf(),
                source,
            })?;
        }
    }

    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|source| LedgerError::Lock {
            path: path.to_path_buf(),
            source,
        })
}

fn retry_until<F>(path: &Path, timeout: Duration, mut attempt: F) -> Result<(), LedgerError>
where
    F: FnMut() -> std::io::Result<()>,
{
    let start = Instant::now();

    loop {
        match attempt() {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    return Err(LedgerError::LockTimeout {
                        path: path.to_path_buf(),
                        timeout,
                    });
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(source) => {
                return Err(LedgerError::Lock {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
}

/// Acquire an exclusive lock on `path`, creating the file if needed.
///
/// The lock is released when the returned handle is dropped.
pub fn acquire_exclusive_lock_with_timeout(
    path: &Path,
    timeout: Duration,
) -> Result<File, LedgerError> {
    let file = open_lock_file(path)?;
    retry_until(path, timeout, || FileExt::try_lock_exclusive(&file))?;
    Ok(file)
}

/// Acquire a shared lock on `path`, creating the file if needed.
pub fn acquire_shared_lock_with_timeout(path: &Path, timeout: Duration) -> Result<File, LedgerError> {
    let file = open_lock_file(path)?;
    retry_until(path, timeout, || FileExt::try_lock_shared(&file))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_resilient_write_poisoned() {
        let lock = Arc::new(RwLock::new(42));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let _guard = lock_clone.write().unwrap();
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();

        let mut guard = resilient_write(&lock);
        *guard = 100;
        drop(guard);

        assert_eq!(*resilient_read(&lock), 100);
    }

    #[test]
    fn test_exclusive_lock_blocks_second_owner() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = temp_dir.path().join("ledger.lock");

        let first = acquire_exclusive_lock_with_timeout(&lock_path, Duration::from_secs(1));
        assert!(first.is_ok(), "First exclusive lock should succeed");

        let second = acquire_exclusive_lock_with_timeout(&lock_path, Duration::from_millis(100));
        assert!(matches!(second, Err(LedgerError::LockTimeout { .. })));

        drop(first);

        let third = acquire_exclusive_lock_with_timeout(&lock_path, Duration::from_secs(1));
        assert!(third.is_ok(), "Lock should succeed after previous lock released");
    }

    #[test]
    fn test_exclusive_lock_blocks_shared() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = temp_dir.path().join("ledger.lock");

        let _exclusive = acquire_exclusive_lock_with_timeout(&lock_path, Duration::from_secs(1))
            .expect("Exclusive lock should succeed");

        let shared = acquire_shared_lock_with_timeout(&lock_path, Duration::from_millis(100));
        assert!(shared.is_err(), "Shared lock should fail while exclusive is held");
    }

    #[test]
    fn test_shared_locks_coexist() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = temp_dir.path().join("ledger.lock");

        let a = acquire_shared_lock_with_timeout(&lock_path, Duration::from_secs(1));
        let b = acquire_shared_lock_with_timeout(&lock_path, Duration::from_secs(1));
        assert!(a.is_ok() && b.is_ok());
    }

    #[test]
    fn test_exclusive_lock_serializes_threads() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = Arc::new(temp_dir.path().join("ledger.lock"));
        let holders = Arc::new(AtomicUsize::new(0));
        let max_holders = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock_path = Arc::clone(&lock_path);
                let holders = Arc::clone(&holders);
                let max_holders = Arc::clone(&max_holders);
                thread::spawn(move || {
                    for _ in 0..5 {
                        let _guard =
                            acquire_exclusive_lock_with_timeout(&lock_path, Duration::from_secs(10))
                                .expect("lock");
                        let current = holders.fetch_add(1, Ordering::SeqCst) + 1;
                        max_holders.fetch_max(current, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(5));
                        holders.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("Thread panicked");
        }

        assert_eq!(max_holders.load(Ordering::SeqCst), 1);
    }
}
