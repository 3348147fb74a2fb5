// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Reprojection of downloaded tiles to WGS84.
//!
//! Every `*.tif` in the download directory is warped with
//! `gdalwarp -t_srs EPSG:4326 -r bilinear` into the output directory by a
//! small pool of concurrent workers. Outputs that already exist are checked
//! against their source first and only invalid or missing ones are redone,
//! so a run can be repeated until everything is converted.
//!
//! A conversion is accepted when the output opens with `gdalinfo`, has
//! non-zero dimensions, the same band count as the source, a WGS84
//! coordinate system, and dimensions within a factor two of the source.

use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt};
use regex::Regex;
use serde::Deserialize;

use crate::config::Config;
use crate::error::ConfigError;
use crate::error_log::{ErrorLog, FailureStage};
use crate::pipeline::transfer::part_path;
use crate::pipeline::CancelSignal;
use crate::process::{self, ToolRun};
use crate::progress::Reporter;
use crate::reconcile::remove_artifact;
use crate::verify::DEFAULT_CHECKER;

pub const DEFAULT_WARP_PROGRAM: &str = "gdalwarp";
pub const DEFAULT_OUTPUT_DIR: &str = "downloads_wgs84";
pub const DEFAULT_CONVERT_WORKERS: usize = 4;
pub const DEFAULT_WARP_TIMEOUT: Duration = Duration::from_secs(600);

const TARGET_CRS: &str = "EPSG:4326";
const RESAMPLING: &str = "bilinear";

/// Outputs may shrink or grow by at most this factor per axis.
const MAX_SIZE_RATIO: f64 = 2.0;

/// Pulls an EPSG code out of WKT, e.g. `ID["EPSG",28992]`.
static EPSG_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)EPSG["',\s]*(\d+)"#).expect("EPSG regex is valid"));

/// A GDAL command line tool, optionally run through a wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GdalTool {
    program: String,
    leading_args: Vec<String>,
}

impl GdalTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Arguments placed before the tool's own ones.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn run(&self, args: Vec<OsString>, limit: Duration) -> ToolRun {
        let all = self
            .leading_args
            .iter()
            .map(OsString::from)
            .chain(args);
        process::run_tool(&self.program, all, limit).await
    }

    async fn version(&self, limit: Duration) -> Option<String> {
        match self.run(vec!["--version".into()], limit).await {
            ToolRun::Exited { status, stdout, .. } if status.success() => {
                Some(stdout.trim().to_string())
            }
            _ => None,
        }
    }
}

/// Where and how conversion runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertSettings {
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub workers: usize,
    pub warp: GdalTool,
    pub info: GdalTool,
    pub warp_timeout: Duration,
    pub info_timeout: Duration,
}

impl ConvertSettings {
    pub fn new(source_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            output_dir: output_dir.into(),
            workers: DEFAULT_CONVERT_WORKERS,
            warp: GdalTool::new(DEFAULT_WARP_PROGRAM),
            info: GdalTool::new(DEFAULT_CHECKER),
            warp_timeout: DEFAULT_WARP_TIMEOUT,
            info_timeout: crate::verify::DEFAULT_CHECK_TIMEOUT,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            source_dir: config.download_dir.clone(),
            output_dir: config.wgs84_dir.clone(),
            workers: config.convert_workers,
            warp: GdalTool::new(&config.warp_program),
            info: GdalTool::new(&config.checker),
            warp_timeout: config.warp_timeout(),
            info_timeout: config.checker_timeout(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_tools(mut self, warp: GdalTool, info: GdalTool) -> Self {
        self.warp = warp;
        self.info = info;
        self
    }
}

#[derive(Debug, Deserialize)]
struct GdalInfoJson {
    #[serde(default)]
    size: Vec<u64>,
    #[serde(default)]
    bands: Vec<GdalBand>,
    #[serde(rename = "coordinateSystem", default)]
    coordinate_system: Option<GdalCoordinateSystem>,
}

#[derive(Debug, Deserialize)]
struct GdalBand {
    #[serde(rename = "type")]
    data_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GdalCoordinateSystem {
    #[serde(default)]
    wkt: String,
}

/// The parts of `gdalinfo -json` conversion checks look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterInfo {
    pub size_x: u64,
    pub size_y: u64,
    pub bands: usize,
    pub data_type: Option<String>,
    pub crs_wkt: String,
}

impl RasterInfo {
    pub fn from_gdalinfo_json(json: &str) -> Result<Self, String> {
        let info: GdalInfoJson =
            serde_json::from_str(json).map_err(|e| format!("unreadable gdalinfo output: {e}"))?;
        Ok(Self {
            size_x: info.size.first().copied().unwrap_or(0),
            size_y: info.size.get(1).copied().unwrap_or(0),
            bands: info.bands.len(),
            data_type: info.bands.first().and_then(|b| b.data_type.clone()),
            crs_wkt: info.coordinate_system.map(|c| c.wkt).unwrap_or_default(),
        })
    }

    pub fn is_wgs84(&self) -> bool {
        self.crs_wkt.contains("WGS 84") || self.crs_wkt.contains("4326")
    }

    /// EPSG code of the outermost CRS, e.g. `EPSG:28992`.
    pub fn epsg(&self) -> Option<String> {
        if let Some(code) = EPSG_CODE
            .captures_iter(&self.crs_wkt)
            .last()
            .and_then(|c| c.get(1))
        {
            return Some(format!("EPSG:{}", code.as_str()));
        }
        self.crs_wkt
            .contains("Amersfoort")
            .then(|| "EPSG:28992".to_string())
    }
}

/// Accept `output` as a conversion of `source`, or say why not.
pub fn check_conversion(source: &RasterInfo, output: &RasterInfo) -> Result<(), String> {
    if output.size_x == 0 || output.size_y == 0 {
        return Err("output has zero dimensions".into());
    }
    if source.size_x == 0 || source.size_y == 0 {
        return Err("source has zero dimensions".into());
    }
    if source.bands != output.bands {
        return Err(format!("band count mismatch: {} vs {}", source.bands, output.bands));
    }
    if source.data_type != output.data_type {
        tracing::warn!(from = ?source.data_type, to = ?output.data_type, "Data type changed by conversion");
    }
    if !output.is_wgs84() {
        return Err("output CRS is not WGS84".into());
    }

    let ratio_x = output.size_x as f64 / source.size_x as f64;
    let ratio_y = output.size_y as f64 / source.size_y as f64;
    let within = |r: f64| (1.0 / MAX_SIZE_RATIO..=MAX_SIZE_RATIO).contains(&r);
    if !within(ratio_x) || !within(ratio_y) {
        return Err(format!(
            "dimensions changed drastically: {}x{} -> {}x{}",
            source.size_x, source.size_y, output.size_x, output.size_y
        ));
    }
    Ok(())
}

/// Counts and failures from one conversion run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertSummary {
    /// `*.tif` files in the source directory
    pub sources: usize,
    /// Outputs that already existed and passed the check
    pub already_valid: usize,
    /// Outputs that existed but failed the check
    pub invalid_existing: usize,
    /// Files planned for conversion (new + invalid)
    pub planned: Vec<String>,
    pub converted: usize,
    /// (file name, reason) per failed conversion
    pub failed: Vec<(String, String)>,
    /// Planned but not started because of cancellation
    pub skipped: usize,
    pub dry_run: bool,
}

impl ConvertSummary {
    pub fn interrupted(&self) -> bool {
        self.skipped > 0
    }
}

enum Conversion {
    Converted,
    Failed(String),
    Skipped,
}

/// Runs one conversion pass.
pub struct Converter {
    settings: ConvertSettings,
    error_log: Arc<ErrorLog>,
    reporter: Reporter,
    cancel: CancelSignal,
}

impl Converter {
    pub fn new(settings: ConvertSettings, error_log: ErrorLog) -> Self {
        Self {
            settings,
            error_log: Arc::new(error_log),
            reporter: Reporter::hidden(),
            cancel: CancelSignal::new(),
        }
    }

    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Both GDAL tools must answer `--version`.
    pub async fn ensure_tools(&self) -> Result<(), ConfigError> {
        let limit = self.settings.info_timeout;
        for tool in [&self.settings.info, &self.settings.warp] {
            match tool.version(limit).await {
                Some(version) => tracing::info!(tool = tool.program(), %version, "GDAL tool found"),
                None => return Err(ConfigError::ToolUnavailable(tool.program().to_string())),
            }
        }
        Ok(())
    }

    /// Convert every source without a valid output. With `dry_run` only the
    /// plan is computed.
    pub async fn run(&self, dry_run: bool) -> Result<ConvertSummary> {
        let settings = &self.settings;
        let sources = list_tifs(&settings.source_dir)
            .with_context(|| format!("Failed to list {:?}", settings.source_dir))?;
        tokio::fs::create_dir_all(&settings.output_dir)
            .await
            .with_context(|| format!("Failed to create output directory {:?}", settings.output_dir))?;
        let existing = list_tifs(&settings.output_dir)
            .with_context(|| format!("Failed to list {:?}", settings.output_dir))?;

        let mut summary = ConvertSummary {
            sources: sources.len(),
            dry_run,
            ..ConvertSummary::default()
        };

        let valid = self.check_existing(&existing).await;
        summary.already_valid = valid.len();
        summary.invalid_existing = existing.len() - valid.len();
        summary.planned = sources.into_iter().filter(|name| !valid.contains(name)).collect();

        tracing::info!(
            sources = summary.sources,
            already_valid = summary.already_valid,
            invalid_existing = summary.invalid_existing,
            to_convert = summary.planned.len(),
            "Conversion plan"
        );

        if dry_run || summary.planned.is_empty() {
            return Ok(summary);
        }

        let bar = self.reporter.files_bar("Converting", summary.planned.len() as u64);
        let progress = &bar;
        let outcomes: Vec<(String, Conversion)> = stream::iter(summary.planned.clone())
            .map(|name| async move {
                let outcome = self.convert_one(&name).await;
                progress.inc(1);
                (name, outcome)
            })
            .buffer_unordered(settings.workers.max(1))
            .collect()
            .await;
        bar.finish_and_clear();

        for (name, outcome) in outcomes {
            match outcome {
                Conversion::Converted => summary.converted += 1,
                Conversion::Skipped => summary.skipped += 1,
                Conversion::Failed(reason) => summary.failed.push((name, reason)),
            }
        }
        summary.failed.sort();
        Ok(summary)
    }

    /// Names of existing outputs that pass the conversion check.
    async fn check_existing(&self, existing: &[String]) -> Vec<String> {
        if existing.is_empty() {
            return Vec::new();
        }
        let bar = self.reporter.files_bar("Checking", existing.len() as u64);
        let progress = &bar;
        let checked: Vec<(String, Result<(), String>)> = stream::iter(existing.iter().cloned())
            .map(|name| async move {
                let verdict = self.check_existing_one(&name).await;
                progress.inc(1);
                (name, verdict)
            })
            .buffer_unordered(self.settings.workers.max(1))
            .collect()
            .await;
        bar.finish_and_clear();

        checked
            .into_iter()
            .filter_map(|(name, verdict)| match verdict {
                Ok(()) => Some(name),
                Err(reason) => {
                    tracing::warn!(file = %name, %reason, "Existing conversion is invalid");
                    None
                }
            })
            .collect()
    }

    async fn check_existing_one(&self, name: &str) -> Result<(), String> {
        let source = self.settings.source_dir.join(name);
        let output = self.settings.output_dir.join(name);
        let output_info = self.raster_info(&output).await?;

        match tokio::fs::metadata(&source).await {
            Ok(_) => check_conversion(&self.raster_info(&source).await?, &output_info),
            // Without a source only the output itself can be judged.
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if output_info.size_x == 0 || output_info.size_y == 0 {
                    Err("output has zero dimensions".into())
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(format!("cannot inspect source: {e}")),
        }
    }

    async fn convert_one(&self, name: &str) -> Conversion {
        if self.cancel.is_cancelled() {
            return Conversion::Skipped;
        }

        let source = self.settings.source_dir.join(name);
        let output = self.settings.output_dir.join(name);
        let part = part_path(&output);

        match self.warp(&source, &output, &part).await {
            Ok(()) => {
                tracing::info!(file = %name, "Converted");
                Conversion::Converted
            }
            Err(reason) => {
                tracing::warn!(file = %name, %reason, "Conversion failed");
                remove_artifact(&part);
                remove_artifact(&output);
                self.error_log.record(FailureStage::Convert, name, &reason);
                Conversion::Failed(reason)
            }
        }
    }

    /// Warp `source` into `part`, move it to `output` and check the result.
    async fn warp(&self, source: &Path, output: &Path, part: &Path) -> Result<(), String> {
        let source_info = self.raster_info(source).await?;
        tracing::debug!(
            source = %source.display(),
            crs = source_info.epsg().as_deref().unwrap_or("auto-detect"),
            "Warping"
        );

        let args: Vec<OsString> = vec![
            "-of".into(),
            "GTiff".into(),
            "-t_srs".into(),
            TARGET_CRS.into(),
            "-r".into(),
            RESAMPLING.into(),
            "-overwrite".into(),
            source.into(),
            part.into(),
        ];
        let warp = &self.settings.warp;
        let run = warp.run(args, self.settings.warp_timeout).await;
        if let Some(reason) = run.failure(warp.program(), self.settings.warp_timeout) {
            return Err(reason);
        }

        tokio::fs::rename(part, output)
            .await
            .map_err(|e| format!("failed to move {part:?} into place: {e}"))?;

        let output_info = self.raster_info(output).await?;
        check_conversion(&source_info, &output_info)
            .map_err(|reason| format!("integrity check failed: {reason}"))
    }

    async fn raster_info(&self, path: &Path) -> Result<RasterInfo, String> {
        let info = &self.settings.info;
        let limit = self.settings.info_timeout;
        let run = info
            .run(vec!["-json".into(), path.into()], limit)
            .await;
        if let Some(reason) = run.failure(info.program(), limit) {
            return Err(format!("cannot read {}: {reason}", path.display()));
        }
        match run {
            ToolRun::Exited { stdout, .. } => RasterInfo::from_gdalinfo_json(&stdout),
            _ => Err(format!("cannot read {}", path.display())),
        }
    }
}

/// Sorted names of the `*.tif` files directly inside `dir`.
fn list_tifs(dir: &Path) -> std::io::Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::warn!(dir = %dir.display(), "Directory does not exist");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(".tif") {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}
