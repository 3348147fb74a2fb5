// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Logging initialization.
//!
//! Logs and progress bars share stderr; log lines are written through the
//! [`Reporter`]'s writer, which hides the bars for the duration of each line.
//! Summaries go to stdout. `RUST_LOG` takes precedence over the verbosity flags, e.g.
//! `RUST_LOG=rasterpull::pipeline=debug`.

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::progress::Reporter;

/// Console verbosity chosen on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Warnings and errors only
    Quiet,
    #[default]
    Normal,
    /// Debug output from this crate
    Verbose,
}

impl Verbosity {
    pub fn from_flags(quiet: bool, verbose: bool) -> Self {
        match (quiet, verbose) {
            (_, true) => Verbosity::Verbose,
            (true, false) => Verbosity::Quiet,
            (false, false) => Verbosity::Normal,
        }
    }

    fn default_directive(self) -> String {
        match self {
            Verbosity::Quiet => Level::WARN.to_string().to_lowercase(),
            Verbosity::Normal => format!("warn,rasterpull={}", Level::INFO.to_string().to_lowercase()),
            Verbosity::Verbose => format!("info,rasterpull={}", Level::DEBUG.to_string().to_lowercase()),
        }
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_logging(verbosity: Verbosity, reporter: &Reporter) -> Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.trim().is_empty() => {
            EnvFilter::try_new(directives).context("Failed to parse RUST_LOG")?
        }
        _ => EnvFilter::try_new(verbosity.default_directive())
            .context("Failed to build default log filter")?,
    };

    let reporter = reporter.clone();
    let fmt_layer = fmt::layer()
        .with_writer(move || reporter.log_writer())
        .with_target(verbosity == Verbosity::Verbose);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(())
}
