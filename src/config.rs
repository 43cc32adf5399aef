//! Per-item OCR configuration.
//!
//! The pipeline re-reads its configuration from the [`Settings`] collaborator
//! for every queue item it processes, so an operator can change PSM values or
//! preprocessing toggles while the worker pool is running. The one exception
//! is `worker_count`, which is read once when the pool starts; resizing the
//! pool requires a restart.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::prelude::*;

/// Speed/quality trade-off hint passed through to the OCR engine.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum PerformancePreset {
    /// Favor throughput over accuracy.
    Fast,
    /// Reasonable defaults for scanned documents.
    #[default]
    Balanced,
    /// Favor accuracy over throughput.
    Accurate,
}

/// An immutable configuration snapshot for one processing run.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct OcrConfig {
    /// Tesseract engine mode.
    pub oem: u8,

    /// Page segmentation mode for the first pass.
    pub psm_primary: u8,

    /// Page segmentation mode for the second pass.
    pub psm_secondary: u8,

    /// Whether to normalize images before OCR at all.
    pub preprocessing: bool,

    /// Upscale small images 2x before OCR.
    pub upscale: bool,

    /// Apply a light denoise blur before OCR.
    pub denoise: bool,

    /// Ask the engine to deskew the image. Deskewing happens on the engine
    /// side of the boundary, not in our local normalization.
    pub deskew: bool,

    /// Number of pool workers. Read once at pool start.
    pub worker_count: usize,

    /// Whether to consult the preprocessing cache.
    pub enable_cache: bool,

    /// Speed/quality hint for the engine.
    pub performance_preset: PerformancePreset,

    /// Upper bound on a single engine invocation, in seconds.
    pub engine_timeout_secs: u64,

    /// How long an idle worker sleeps before polling the queue again, in
    /// milliseconds.
    pub idle_backoff_ms: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            oem: 3,
            psm_primary: 6,
            psm_secondary: 3,
            preprocessing: true,
            upscale: false,
            denoise: false,
            deskew: false,
            worker_count: num_cpus::get(),
            enable_cache: true,
            performance_preset: PerformancePreset::default(),
            engine_timeout_secs: 120,
            idle_backoff_ms: 2000,
        }
    }
}

impl OcrConfig {
    /// The engine invocation timeout.
    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }

    /// How long an idle worker waits before polling again.
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }
}

/// Read-only access to the current OCR configuration.
///
/// This is the boundary with the excluded settings collaborator. The pipeline
/// fetches a fresh snapshot per queue item and never caches it.
#[async_trait::async_trait]
pub trait Settings: Send + Sync + 'static {
    /// Fetch the current configuration snapshot.
    async fn ocr_config(&self) -> Result<OcrConfig>;
}

/// A [`Settings`] implementation that always returns the same snapshot.
pub struct StaticSettings {
    config: OcrConfig,
}

impl StaticSettings {
    /// Wrap a fixed configuration.
    pub fn new(config: OcrConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl Settings for StaticSettings {
    async fn ocr_config(&self) -> Result<OcrConfig> {
        Ok(self.config.clone())
    }
}
