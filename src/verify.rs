// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Integrity verification of downloaded tiles.
//!
//! [`IntegrityVerifier::verify`] checks, in order, that the file exists,
//! that its size matches the catalog exactly, and that a [`StructuralCheck`]
//! accepts it. It never mutates anything and may be called concurrently.
//!
//! The structural check is pluggable: [`ExternalCheck`] runs a program such
//! as `gdalinfo`, [`SizeOnlyCheck`] accepts everything, and tests inject
//! scripted fakes.

use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::process;

/// Default program used for structural checks.
pub const DEFAULT_CHECKER: &str = "gdalinfo";

/// Default time a structural check may take before the file is rejected.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of verifying one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    Missing,
    SizeMismatch { expected: u64, actual: u64 },
    StructurallyInvalid(String),
}

impl Verdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, Verdict::Ok)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Ok => write!(f, "ok"),
            Verdict::Missing => write!(f, "file missing"),
            Verdict::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch: expected {} bytes, found {}", expected, actual)
            }
            Verdict::StructurallyInvalid(detail) => write!(f, "structurally invalid: {}", detail),
        }
    }
}

/// Outcome of a structural check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub passed: bool,
    pub diagnostic: String,
}

impl CheckOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            diagnostic: String::new(),
        }
    }

    pub fn fail(diagnostic: impl Into<String>) -> Self {
        Self {
            passed: false,
            diagnostic: diagnostic.into(),
        }
    }
}

/// A synchronous, possibly slow, structural validity check of one file.
///
/// Implementations must turn every failure (including their own errors)
/// into a failed [`CheckOutcome`]; they must not panic.
pub trait StructuralCheck: Send + Sync {
    fn check(&self, path: &Path) -> CheckOutcome;

    /// Short name for logs.
    fn name(&self) -> &str;
}

/// Accepts every file. Used when no external checker is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct SizeOnlyCheck;

impl StructuralCheck for SizeOnlyCheck {
    fn check(&self, _path: &Path) -> CheckOutcome {
        CheckOutcome::pass()
    }

    fn name(&self) -> &str {
        "size-only"
    }
}

/// Runs `<program> [args...] <path>`; exit status 0 means valid.
///
/// The run is bounded by the check timeout, output collection included.
#[derive(Debug, Clone)]
pub struct ExternalCheck {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ExternalCheck {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the program can be run at all (`<program> --version`).
    pub fn is_available(&self) -> bool {
        match process::block_on(process::tool_version(&self.program, self.timeout)) {
            Ok(Some(version)) => {
                tracing::info!(checker = %self.program, version = %version, "Integrity checker found");
                true
            }
            Ok(None) => {
                tracing::warn!(checker = %self.program, "Integrity checker not runnable");
                false
            }
            Err(e) => {
                tracing::warn!(checker = %self.program, error = %e, "Could not start checker runtime");
                false
            }
        }
    }

    async fn run(&self, path: &Path) -> CheckOutcome {
        let args = self
            .args
            .iter()
            .map(OsStr::new)
            .chain(std::iter::once(path.as_os_str()));
        let run = process::run_tool(&self.program, args, self.timeout).await;
        match run.failure(&self.program, self.timeout) {
            None => CheckOutcome::pass(),
            Some(diagnostic) => CheckOutcome::fail(diagnostic),
        }
    }
}

impl StructuralCheck for ExternalCheck {
    fn check(&self, path: &Path) -> CheckOutcome {
        match process::block_on(self.run(path)) {
            Ok(outcome) => outcome,
            Err(e) => CheckOutcome::fail(format!("failed to run {}: {}", self.program, e)),
        }
    }

    fn name(&self) -> &str {
        &self.program
    }
}

/// Existence, size and structural verification.
#[derive(Clone)]
pub struct IntegrityVerifier {
    check: Arc<dyn StructuralCheck>,
}

impl fmt::Debug for IntegrityVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrityVerifier")
            .field("check", &self.check.name())
            .finish()
    }
}

impl IntegrityVerifier {
    pub fn new(check: impl StructuralCheck + 'static) -> Self {
        Self {
            check: Arc::new(check),
        }
    }

    /// Name of the structural check in use.
    pub fn check_name(&self) -> &str {
        self.check.name()
    }

    /// Verify the file at `path` against `expected_size`.
    pub fn verify(&self, path: &Path, expected_size: u64) -> Verdict {
        let actual = match fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Verdict::Missing,
            Err(e) if e.kind() == ErrorKind::NotFound => return Verdict::Missing,
            Err(e) => return Verdict::StructurallyInvalid(format!("cannot stat file: {}", e)),
        };

        if actual != expected_size {
            return Verdict::SizeMismatch {
                expected: expected_size,
                actual,
            };
        }

        let outcome = self.check.check(path);
        if outcome.passed {
            Verdict::Ok
        } else {
            tracing::debug!(path = %path.display(), diagnostic = %outcome.diagnostic, "Structural check failed");
            Verdict::StructurallyInvalid(outcome.diagnostic)
        }
    }
}
