//! OCR engine interfaces.
//!
//! Two seams, mirroring how work is actually divided:
//!
//! - [`OcrImageEngine`] is the per-image contract the pipeline consumes: one
//!   call per image, both configuration passes in the reply. The subprocess
//!   engine implements this directly, because its wire protocol carries both
//!   PSM values in a single invocation.
//! - [`OcrPassEngine`] is the per-pass contract for engines that run one
//!   configuration at a time. [`dual::DualPassEngine`] adapts any of these to
//!   the per-image contract by running the two passes concurrently.

use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::async_utils::JoinWorker;
use crate::config::{OcrConfig, PerformancePreset};
use crate::consensus::{OcrPassResult, WordBox};
use crate::prelude::*;

pub mod dual;
pub mod script;

/// Configuration object serialized and handed to the external engine,
/// one invocation per image.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct EngineRequest {
    /// Engine mode.
    pub oem: u8,

    /// Page segmentation mode for the first pass.
    pub psm1: u8,

    /// Page segmentation mode for the second pass.
    pub psm2: u8,

    /// Whether the engine should normalize the image itself. Set when our
    /// local preprocessing (and cache) is disabled.
    pub preprocessing: bool,

    pub upscale: bool,
    pub denoise: bool,
    pub deskew: bool,

    #[serde(rename = "performancePreset")]
    pub performance_preset: PerformancePreset,

    #[serde(rename = "enableCache")]
    pub enable_cache: bool,
}

impl EngineRequest {
    /// Build a request from a configuration snapshot.
    ///
    /// `delegate_preprocessing` is set when the image handed to the engine is
    /// still raw, so the engine should apply its own normalization.
    pub fn from_config(config: &OcrConfig, delegate_preprocessing: bool) -> Self {
        Self {
            oem: config.oem,
            psm1: config.psm_primary,
            psm2: config.psm_secondary,
            preprocessing: delegate_preprocessing && config.preprocessing,
            upscale: config.upscale,
            denoise: config.denoise,
            deskew: config.deskew,
            performance_preset: config.performance_preset,
            enable_cache: config.enable_cache,
        }
    }
}

/// Structured reply from one engine invocation.
///
/// On success both pass slots are populated (with their historical names)
/// along with the engine's own merge, which callers treat as advisory. On
/// failure only `error` is meaningful. A non-zero exit code or unparsable
/// output from the external process is reported exactly like
/// `success: false`.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineReply {
    pub success: bool,

    #[serde(default)]
    pub pytesseract_text: String,
    #[serde(default)]
    pub pytesseract_confidence: u8,
    #[serde(default)]
    pub easyocr_text: String,
    #[serde(default)]
    pub easyocr_confidence: u8,

    #[serde(default)]
    pub consensus_text: String,
    #[serde(default)]
    pub consensus_source: String,

    /// Word boxes from the pass the engine itself preferred.
    #[serde(default)]
    pub bounding_boxes: Vec<WordBox>,

    /// Error description when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EngineReply {
    /// Build a failure reply.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Split a successful reply into its two passes.
    ///
    /// The engine's preferred bounding boxes are attached to whichever pass
    /// its own merge selected, since coordinates are pass-specific.
    pub fn into_passes(self) -> (OcrPassResult, OcrPassResult) {
        let boxes_belong_to_pass2 = self.consensus_source.contains("2")
            || self.easyocr_confidence > self.pytesseract_confidence;
        let (boxes1, boxes2) = if boxes_belong_to_pass2 {
            (vec![], self.bounding_boxes)
        } else {
            (self.bounding_boxes, vec![])
        };
        (
            OcrPassResult {
                text: self.pytesseract_text,
                confidence: self.pytesseract_confidence,
                word_boxes: boxes1,
            },
            OcrPassResult {
                text: self.easyocr_text,
                confidence: self.easyocr_confidence,
                word_boxes: boxes2,
            },
        )
    }
}

/// One-pass request for engines driven configuration-by-configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct PassRequest {
    pub oem: u8,
    pub psm: u8,
    pub preprocessing: bool,
    pub upscale: bool,
    pub denoise: bool,
    pub deskew: bool,
    pub performance_preset: PerformancePreset,
}

impl PassRequest {
    fn from_engine_request(request: &EngineRequest, psm: u8) -> Self {
        Self {
            oem: request.oem,
            psm,
            preprocessing: request.preprocessing,
            upscale: request.upscale,
            denoise: request.denoise,
            deskew: request.deskew,
            performance_preset: request.performance_preset,
        }
    }
}

/// An engine that runs a single OCR configuration per call.
#[async_trait::async_trait]
pub trait OcrPassEngine: Send + Sync + 'static {
    /// Recognize text in an already-normalized image with one configuration.
    async fn recognize_pass(
        &self,
        image: &Path,
        request: &PassRequest,
    ) -> Result<OcrPassResult>;
}

/// An engine that produces both passes for an image in one call.
///
/// This is the seam the pipeline consumes, and the one to fake in tests.
#[async_trait::async_trait]
pub trait OcrImageEngine: Send + Sync + 'static {
    /// Run both configuration passes against an image.
    async fn run(&self, image: &Path, request: &EngineRequest) -> Result<EngineReply>;
}

/// Build the engine for an external command line.
///
/// `command` is the program plus leading arguments (for example
/// `["python3", "ocr-service.py"]`); the image path and the JSON request
/// are appended per invocation.
pub fn engine_for_command(command: Vec<String>) -> Result<(Arc<dyn OcrImageEngine>, JoinWorker)> {
    let engine = script::ScriptOcrEngine::new(command)?;
    Ok((Arc::new(engine), JoinWorker::noop()))
}
