// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Console progress bars.

use std::io::{self, Write};
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

const TRANSFER_TEMPLATE: &str =
    "{msg:>14} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} eta {eta}";
const FILES_TEMPLATE: &str = "{msg:>14} [{bar:30.green/white}] {pos}/{len} files";
const SPINNER_TEMPLATE: &str = "{spinner:.cyan} {msg}";

/// Creates bars for transfers and file passes; everything is hidden when
/// output is disabled (quiet mode, tests).
#[derive(Debug, Clone)]
pub struct Reporter {
    multi: MultiProgress,
    enabled: bool,
}

impl Default for Reporter {
    fn default() -> Self {
        Self::hidden()
    }
}

impl Reporter {
    pub fn new(enabled: bool) -> Self {
        let multi = if enabled {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        Self { multi, enabled }
    }

    pub fn hidden() -> Self {
        Self::new(false)
    }

    fn style(template: &str, fallback: ProgressStyle) -> ProgressStyle {
        ProgressStyle::with_template(template)
            .map(|s| s.progress_chars("=> "))
            .unwrap_or(fallback)
    }

    /// Byte bar for one transfer. `total` of 0 means unknown.
    pub fn transfer_bar(&self, label: &str, total: u64) -> ProgressBar {
        if !self.enabled {
            return ProgressBar::hidden();
        }
        let bar = self.multi.add(ProgressBar::new(total));
        bar.set_style(Self::style(TRANSFER_TEMPLATE, ProgressStyle::default_bar()));
        bar.set_message(label.to_string());
        bar
    }

    /// Counting bar for a pass over many files.
    pub fn files_bar(&self, label: &str, total: u64) -> ProgressBar {
        if !self.enabled {
            return ProgressBar::hidden();
        }
        let bar = self.multi.add(ProgressBar::new(total));
        bar.set_style(Self::style(FILES_TEMPLATE, ProgressStyle::default_bar()));
        bar.set_message(label.to_string());
        bar
    }

    /// Spinner for work of unknown length, e.g. a structural check.
    pub fn spinner(&self, message: &str) -> ProgressBar {
        if !self.enabled {
            return ProgressBar::hidden();
        }
        let spinner = self.multi.add(ProgressBar::new_spinner());
        spinner.set_style(Self::style(SPINNER_TEMPLATE, ProgressStyle::default_spinner()));
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(80));
        spinner
    }

    /// Writer for log output that clears the bars while a line is written,
    /// so log lines and bars sharing stderr do not tear each other.
    pub fn log_writer(&self) -> LogWriter {
        LogWriter {
            multi: self.enabled.then(|| self.multi.clone()),
        }
    }
}

/// stderr writer that suspends the progress bars around each write.
#[derive(Debug)]
pub struct LogWriter {
    multi: Option<MultiProgress>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.multi {
            Some(multi) => multi.suspend(|| io::stderr().write(buf)),
            None => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}
