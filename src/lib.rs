// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! rasterpull - resumable bulk downloader for raster tile catalogs
//!
//! Downloads every tile listed in a GeoJSON index, verifies each file after
//! transfer and keeps a durable ledger so a run can be interrupted and picked
//! up again days later.
//!
//! # Core Modules
//!
//! - [`catalog`] - Tile index loading
//! - [`ledger`] - Durable per-item progress record
//! - [`verify`] - Existence, size and structural checks
//! - [`reconcile`] - Startup audit of previously completed items
//! - [`pipeline`] - Transfer/verification workers and their coordinator
//! - [`convert`] - Reprojection of downloaded tiles to WGS84
//! - [`error_log`] - Append-only failure log
//! - [`config`] - Layered configuration
//! - [`error`] - Error types and user-facing formatting

pub mod catalog;
pub mod config;
pub mod convert;
pub mod error;
pub mod error_log;
pub mod ledger;
pub mod locks;
pub mod logging;
pub mod pipeline;
mod process;
pub mod progress;
pub mod reconcile;
pub mod verify;

pub use catalog::{Catalog, CatalogItem};
pub use config::Config;
pub use convert::{ConvertSettings, ConvertSummary, Converter, GdalTool, RasterInfo};
pub use error::{ConfigError, ErrorBuilder, LedgerError, TransferError};
pub use error_log::{ErrorLog, FailureStage};
pub use ledger::{ItemStatus, Ledger, LedgerSnapshot, LedgerStats};
pub use pipeline::{
    CancelSignal, Coordinator, Fetcher, PipelineSettings, RunOutcome, RunSummary, TransferResult,
};
pub use reconcile::{reconcile, ReconcileSummary};
pub use verify::{
    CheckOutcome, ExternalCheck, IntegrityVerifier, SizeOnlyCheck, StructuralCheck, Verdict,
};
