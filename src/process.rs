// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bounded runs of external GDAL tools.
//!
//! Every child is spawned with `kill_on_drop(true)` and awaited under a
//! single `tokio::time::timeout` covering both exit and output collection,
//! so a tool that hangs (or leaves a grandchild holding its pipes open)
//! never outlives its limit.

use std::ffi::OsStr;
use std::future::Future;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::Command;

/// Longest diagnostic kept from a tool's stderr.
const MAX_DIAGNOSTIC_LEN: usize = 300;

/// How a bounded tool run ended.
#[derive(Debug)]
pub(crate) enum ToolRun {
    Exited {
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
    TimedOut,
    SpawnFailed(io::Error),
    WaitFailed(io::Error),
}

impl ToolRun {
    /// `None` on success, otherwise a one-line reason naming `program`.
    pub(crate) fn failure(&self, program: &str, limit: Duration) -> Option<String> {
        match self {
            ToolRun::Exited { status, .. } if status.success() => None,
            ToolRun::Exited { status, stderr, .. } => {
                let stderr = tail(stderr.trim(), MAX_DIAGNOSTIC_LEN);
                Some(if stderr.is_empty() {
                    format!("{program} exited with {status}")
                } else {
                    format!("{program} exited with {status}: {stderr}")
                })
            }
            ToolRun::TimedOut => Some(format!("{program} timed out after {limit:?}")),
            ToolRun::SpawnFailed(e) => Some(format!("failed to run {program}: {e}")),
            ToolRun::WaitFailed(e) => Some(format!("failed waiting for {program}: {e}")),
        }
    }
}

/// Run `program args...` with stdin closed, capturing stdout and stderr.
pub(crate) async fn run_tool<I, S>(program: &str, args: I, limit: Duration) -> ToolRun
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return ToolRun::SpawnFailed(e),
    };

    // On timeout the dropped future drops the child, which kills it.
    match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => ToolRun::Exited {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        },
        Ok(Err(e)) => ToolRun::WaitFailed(e),
        Err(_) => ToolRun::TimedOut,
    }
}

/// `<program> --version`, trimmed, if the tool runs and succeeds.
pub(crate) async fn tool_version(program: &str, limit: Duration) -> Option<String> {
    match run_tool(program, ["--version"], limit).await {
        ToolRun::Exited { status, stdout, .. } if status.success() => {
            Some(stdout.trim().to_string())
        }
        run => {
            tracing::debug!(program, reason = ?run.failure(program, limit), "Tool not usable");
            None
        }
    }
}

/// Drive `fut` to completion from synchronous code.
///
/// Inside a runtime (e.g. on a `spawn_blocking` thread) the current handle
/// is reused; elsewhere a throwaway current-thread runtime is built. Must
/// not be called from an async task itself.
pub(crate) fn block_on<F: Future>(fut: F) -> io::Result<F::Output> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(fut)),
        Err(_) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            Ok(runtime.block_on(fut))
        }
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        text.to_string()
    } else {
        let skipped: String = text.chars().skip(count - max_chars).collect();
        format!("...{}", skipped)
    }
}
