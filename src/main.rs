// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use rasterpull::logging::{init_logging, Verbosity};
use rasterpull::progress::{format_bytes, Reporter};
use rasterpull::{
    CancelSignal, Catalog, Config, ConfigError, ConvertSettings, ConvertSummary, Converter,
    Coordinator, ErrorLog, ExternalCheck, IntegrityVerifier, Ledger, PipelineSettings,
    ReconcileSummary, RunOutcome, RunSummary, SizeOnlyCheck,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Every catalog item is completed
    pub const SUCCESS: i32 = 0;
    /// Unexpected error
    pub const ERROR: i32 = 1;
    /// Run finished with failed or pending items
    pub const DATA_ERR: i32 = 65;
    /// Interrupted; run again to resume
    pub const TEMP_FAIL: i32 = 75;
    /// Configuration error - bad catalog, config file, or ledger in use
    pub const CONFIG: i32 = 78;
    /// Second Ctrl-C
    pub const ABORTED: i32 = 130;
}

use exit_codes::*;

/// rasterpull - resumable bulk downloader for raster tile catalogs.
#[derive(Parser)]
#[command(name = "rasterpull")]
#[command(version = VERSION)]
#[command(about = "Resumable bulk downloader for raster tile catalogs with integrity verification.")]
#[command(long_about = "rasterpull - resumable bulk downloader for raster tile catalogs\n\n\
    Download everything:   rasterpull\n\
    Preview the work:      rasterpull run --dry-run\n\
    Re-check downloads:    rasterpull verify\n\
    Reproject to WGS84:    rasterpull convert\n\
    Show progress:         rasterpull status\n\n\
    Ctrl-C stops after the current file and keeps all progress.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (JSON). Defaults to ./rasterpull.json when present
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// GeoJSON tile index
    #[arg(long, global = true, value_name = "FILE")]
    catalog: Option<PathBuf>,

    /// Directory tiles are stored in
    #[arg(long, global = true, value_name = "DIR")]
    download_dir: Option<PathBuf>,

    /// Progress ledger file
    #[arg(long, global = true, value_name = "FILE")]
    ledger: Option<PathBuf>,

    /// Failure log file
    #[arg(long, global = true, value_name = "FILE")]
    error_log: Option<PathBuf>,

    /// Finished transfers that may wait for verification
    #[arg(long, global = true, value_name = "N")]
    queue_capacity: Option<usize>,

    /// Network timeout in seconds (connect, response and each chunk)
    #[arg(long, global = true, value_name = "SECS")]
    timeout: Option<u64>,

    /// Structural checker program
    #[arg(long, global = true, value_name = "PROGRAM")]
    checker: Option<String>,

    /// Fail instead of falling back to size-only checks when the checker is missing
    #[arg(long, global = true)]
    require_checker: bool,

    /// Quiet mode: warnings and errors only, no progress bars
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Verbose mode: debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download and verify every pending tile (default)
    Run {
        /// Reconcile and report counts without downloading
        #[arg(long)]
        dry_run: bool,
    },
    /// Re-verify completed tiles and demote broken ones
    Verify,
    /// Reproject downloaded tiles to WGS84 with gdalwarp
    Convert {
        /// List what would be converted without converting
        #[arg(long)]
        dry_run: bool,

        /// Concurrent gdalwarp processes
        #[arg(long, value_name = "N")]
        workers: Option<usize>,
    },
    /// Show ledger counters and failed tiles
    Status,
}

impl Cli {
    /// Defaults, then the config file, then flags.
    fn resolve_config(&self) -> Result<Config, ConfigError> {
        let mut config = Config::load(self.config.as_deref())?;

        if let Some(path) = &self.catalog {
            config.catalog = path.clone();
        }
        if let Some(dir) = &self.download_dir {
            config.download_dir = dir.clone();
        }
        if let Some(path) = &self.ledger {
            config.ledger = path.clone();
        }
        if let Some(path) = &self.error_log {
            config.error_log = path.clone();
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }
        if let Some(secs) = self.timeout {
            config.fetch_timeout_secs = secs;
        }
        if let Some(checker) = &self.checker {
            config.checker = checker.clone();
        }
        if self.require_checker {
            config.require_checker = true;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Failure that ends the process with a specific exit code.
enum Fatal {
    Config(ConfigError),
    Other(anyhow::Error),
}

impl From<ConfigError> for Fatal {
    fn from(e: ConfigError) -> Self {
        Fatal::Config(e)
    }
}

impl From<anyhow::Error> for Fatal {
    fn from(e: anyhow::Error) -> Self {
        Fatal::Other(e)
    }
}

fn main() {
    let cli = Cli::parse();
    let verbosity = Verbosity::from_flags(cli.quiet, cli.verbose);
    let reporter = Reporter::new(verbosity != Verbosity::Quiet);

    if let Err(e) = init_logging(verbosity, &reporter) {
        eprintln!("{} {e:#}", "[!]".yellow());
    }

    let code = match dispatch(&cli, reporter) {
        Ok(code) => code,
        Err(Fatal::Config(e)) => {
            eprintln!("{}", e.to_user_message().red());
            CONFIG
        }
        Err(Fatal::Other(e)) => {
            tracing::error!(error = ?e, "Unexpected error");
            eprintln!("{} {e:#}", "[✗]".red().bold());
            ERROR
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: &Cli, reporter: Reporter) -> Result<i32, Fatal> {
    let config = cli.resolve_config()?;

    match cli.command {
        None => run(&config, reporter, false),
        Some(Commands::Run { dry_run }) => run(&config, reporter, dry_run),
        Some(Commands::Verify) => verify(&config, reporter),
        Some(Commands::Convert { dry_run, workers }) => convert(&config, reporter, dry_run, workers),
        Some(Commands::Status) => status(&config),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")
}

/// Pick the structural check: the configured program if it runs, otherwise
/// size-only checks unless the checker is required.
fn build_verifier(config: &Config) -> Result<IntegrityVerifier, ConfigError> {
    let external = ExternalCheck::new(&config.checker).with_timeout(config.checker_timeout());
    if external.is_available() {
        tracing::info!(checker = %config.checker, "Structural checks enabled");
        return Ok(IntegrityVerifier::new(external));
    }
    if config.require_checker {
        return Err(ConfigError::CheckerUnavailable(config.checker.clone()));
    }
    tracing::warn!(
        checker = %config.checker,
        "Checker not available; falling back to existence and size checks only"
    );
    Ok(IntegrityVerifier::new(SizeOnlyCheck))
}

fn build_coordinator(config: &Config, reporter: Reporter) -> Result<Coordinator, Fatal> {
    let catalog = Catalog::load(&config.catalog)?;
    let verifier = build_verifier(config)?;
    let ledger = Ledger::open(&config.ledger).map_err(ConfigError::from)?;
    let error_log = ErrorLog::new(&config.error_log);

    let coordinator = Coordinator::new(
        catalog,
        Arc::new(ledger),
        verifier,
        error_log,
        PipelineSettings::from_config(config),
    )?
    .with_reporter(reporter);
    Ok(coordinator)
}

/// First Ctrl-C drains gracefully, the second exits immediately.
fn install_interrupt_handler(cancel: CancelSignal) {
    let presses = AtomicUsize::new(0);
    let result = ctrlc::set_handler(move || {
        if presses.fetch_add(1, Ordering::SeqCst) == 0 {
            eprintln!(
                "\n{} Stopping after the current file. Press Ctrl-C again to quit immediately.",
                "[!]".yellow()
            );
            cancel.cancel();
        } else {
            eprintln!("{} Aborted. Progress up to the last finished file is saved.", "[✗]".red());
            std::process::exit(ABORTED);
        }
    });
    if let Err(e) = result {
        tracing::warn!(error = %e, "Failed to install Ctrl-C handler");
    }
}

fn run(config: &Config, reporter: Reporter, dry_run: bool) -> Result<i32, Fatal> {
    let coordinator = build_coordinator(config, reporter)?;
    install_interrupt_handler(coordinator.cancel_signal());

    let summary = runtime()?.block_on(coordinator.run(dry_run))?;
    print_run_summary(&summary, config);

    Ok(match summary.outcome() {
        _ if dry_run => SUCCESS,
        RunOutcome::AllCompleted => SUCCESS,
        RunOutcome::Incomplete => DATA_ERR,
        RunOutcome::Interrupted => TEMP_FAIL,
    })
}

fn verify(config: &Config, reporter: Reporter) -> Result<i32, Fatal> {
    let coordinator = build_coordinator(config, reporter)?;
    install_interrupt_handler(coordinator.cancel_signal());

    let summary = runtime()?.block_on(coordinator.reconcile())?;
    if let Err(e) = coordinator.ledger().persist() {
        tracing::error!(error = %e, "Ledger save failed");
    }

    print_reconcile_summary(&summary);
    Ok(if summary.unchecked > 0 {
        TEMP_FAIL
    } else if summary.demoted() == 0 {
        SUCCESS
    } else {
        DATA_ERR
    })
}

fn convert(config: &Config, reporter: Reporter, dry_run: bool, workers: Option<usize>) -> Result<i32, Fatal> {
    let mut settings = ConvertSettings::from_config(config);
    if let Some(workers) = workers {
        if workers == 0 {
            return Err(ConfigError::InvalidSetting("convert workers must be at least 1".into()).into());
        }
        settings = settings.with_workers(workers);
    }

    let converter = Converter::new(settings, ErrorLog::new(&config.error_log)).with_reporter(reporter);
    install_interrupt_handler(converter.cancel_signal());

    let runtime = runtime()?;
    runtime.block_on(converter.ensure_tools())?;
    let summary = runtime.block_on(converter.run(dry_run))?;
    print_convert_summary(&summary, config);

    Ok(if dry_run {
        SUCCESS
    } else if summary.interrupted() {
        TEMP_FAIL
    } else if summary.failed.is_empty() {
        SUCCESS
    } else {
        DATA_ERR
    })
}

fn status(config: &Config) -> Result<i32, Fatal> {
    let snapshot = Ledger::read_only(&config.ledger).map_err(ConfigError::from)?;
    let stats = snapshot.stats;

    println!();
    println!("{}", "Ledger".bold());
    println!("  File:        {}", config.ledger.display());
    if Ledger::owner_active(&config.ledger) {
        println!("  State:       {}", "run in progress".yellow());
    }
    if let Some(updated) = snapshot.last_updated {
        println!("  Updated:     {}", updated.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!("  Total:       {}", stats.total_files);
    println!("  Completed:   {}", stats.completed_count.to_string().green());
    println!("  Failed:      {}", colour_failed(stats.failed_count));
    println!(
        "  Pending:     {}",
        stats
            .total_files
            .saturating_sub(stats.completed_count + stats.failed_count)
    );
    println!("  Downloaded:  {}", format_bytes(stats.total_bytes_downloaded));

    if !snapshot.failed.is_empty() {
        println!();
        println!("{}", "Failed items".bold());
        for (id, entry) in &snapshot.failed {
            let when = entry
                .timestamp
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".repeat(19));
            println!(
                "  {} {}  {}",
                when,
                id.red(),
                entry.error.dimmed()
            );
        }
    }
    println!();
    Ok(SUCCESS)
}

fn colour_failed(count: u64) -> colored::ColoredString {
    if count == 0 {
        count.to_string().normal()
    } else {
        count.to_string().red()
    }
}

fn print_reconcile_summary(summary: &ReconcileSummary) {
    println!();
    println!("{}", "Re-verification".bold());
    println!("  Checked:         {}", summary.checked);
    println!("  Intact:          {}", summary.ok.to_string().green());
    if summary.demoted() > 0 {
        println!("  Missing:         {}", summary.missing.to_string().yellow());
        println!("  Size mismatch:   {}", summary.size_mismatch.to_string().yellow());
        println!("  Invalid:         {}", summary.invalid.to_string().yellow());
        println!("  Back to pending: {}", summary.demoted().to_string().yellow().bold());
    }
    if summary.skipped > 0 {
        println!("  Not in catalog:  {}", summary.skipped);
    }
    if summary.unchecked > 0 {
        println!("  Not reached:     {}", summary.unchecked.to_string().yellow());
    }
}

fn print_convert_summary(summary: &ConvertSummary, config: &Config) {
    println!();
    println!("{}", "Conversion".bold());
    println!("  Source tiles:      {}", summary.sources);
    println!("  Already converted: {}", summary.already_valid);
    if summary.invalid_existing > 0 {
        println!("  Invalid outputs:   {}", summary.invalid_existing.to_string().yellow());
    }
    println!("  To convert:        {}", summary.planned.len());

    if summary.dry_run {
        for name in summary.planned.iter().take(10) {
            println!("    {name}");
        }
        if summary.planned.len() > 10 {
            println!("    ... and {} more", summary.planned.len() - 10);
        }
        println!();
        println!("{} Dry run; nothing was converted.", "[i]".cyan());
        return;
    }
    if summary.planned.is_empty() {
        println!();
        println!("{} All tiles are already converted and verified.", "[✓]".green().bold());
        return;
    }

    println!("  Converted:         {}", summary.converted.to_string().green());
    println!("  Failed:            {}", colour_failed(summary.failed.len() as u64));
    if summary.skipped > 0 {
        println!("  Not started:       {}", summary.skipped.to_string().yellow());
    }
    for (name, reason) in &summary.failed {
        println!("    {} {}", name.red(), reason.dimmed());
    }
    println!();

    if summary.interrupted() {
        println!("{} Interrupted. Run convert again to finish.", "[!]".yellow().bold());
    } else if summary.failed.is_empty() {
        println!(
            "{} Reprojected tiles are in {}.",
            "[✓]".green().bold(),
            config.wgs84_dir.display()
        );
    } else {
        println!(
            "{} {} conversions failed. Details in {}.",
            "[!]".yellow().bold(),
            summary.failed.len(),
            config.error_log.display()
        );
    }
}

fn print_run_summary(summary: &RunSummary, config: &Config) {
    if summary.reconcile.checked > 0 {
        print_reconcile_summary(&summary.reconcile);
    }

    println!();
    println!("{}", "Catalog".bold());
    println!("  Total:              {}", summary.total);
    println!("  Already completed:  {}", summary.already_completed);
    println!("  Previously failed:  {}", summary.previously_failed);
    println!("  Remaining:          {}", summary.remaining_at_start());

    if summary.dry_run {
        println!();
        println!("{} Dry run; nothing was downloaded.", "[i]".cyan());
        return;
    }

    let stats = summary.stats;
    println!();
    println!("{}", "Result".bold());
    println!("  Transferred:   {}", summary.transfer.fetched);
    if summary.transfer.reused > 0 {
        println!("  Reused:        {}", summary.transfer.reused);
    }
    println!("  Completed:     {}", stats.completed_count.to_string().green());
    println!("  Failed:        {}", colour_failed(stats.failed_count));
    println!("  Pending:       {}", summary.pending);
    println!("  Downloaded:    {}", format_bytes(stats.total_bytes_downloaded));
    println!();

    match summary.outcome() {
        RunOutcome::AllCompleted => {
            println!("{} All {} tiles downloaded and verified.", "[✓]".green().bold(), summary.total);
        }
        RunOutcome::Incomplete => {
            println!(
                "{} {} failed, {} pending. Details in {}. Run again to retry.",
                "[!]".yellow().bold(),
                summary.failed,
                summary.pending,
                config.error_log.display()
            );
        }
        RunOutcome::Interrupted => {
            println!(
                "{} Interrupted. Progress is saved; run again to resume.",
                "[!]".yellow().bold()
            );
        }
    }
}
