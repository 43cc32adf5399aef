//! Adapter that runs two single-configuration passes concurrently.

use std::sync::Arc;

use futures::future;

use crate::consensus;
use crate::prelude::*;

use super::{EngineReply, EngineRequest, OcrImageEngine, OcrPassEngine, PassRequest};

/// Wraps a per-pass engine and presents the per-image contract.
///
/// The two configurations run concurrently, so wall-clock latency is roughly
/// the slower of the two passes. If either pass errors, the whole run is an
/// execution failure; a pass that merely returns empty text is still a
/// success.
pub struct DualPassEngine {
    inner: Arc<dyn OcrPassEngine>,
}

impl DualPassEngine {
    pub fn new(inner: Arc<dyn OcrPassEngine>) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl OcrImageEngine for DualPassEngine {
    #[instrument(level = "debug", skip_all, fields(image = %image.display()))]
    async fn run(&self, image: &Path, request: &EngineRequest) -> Result<EngineReply> {
        let first = PassRequest::from_engine_request(request, request.psm1);
        let second = PassRequest::from_engine_request(request, request.psm2);

        let (pass1, pass2) = future::try_join(
            self.inner.recognize_pass(image, &first),
            self.inner.recognize_pass(image, &second),
        )
        .await?;

        // Fill the advisory merge fields from the same rule the pipeline
        // applies, so every engine reports a consistent reply shape.
        let merged = consensus::resolve(&pass1, &pass2);
        Ok(EngineReply {
            success: true,
            pytesseract_text: pass1.text,
            pytesseract_confidence: pass1.confidence,
            easyocr_text: pass2.text,
            easyocr_confidence: pass2.confidence,
            consensus_text: merged.consensus_text,
            consensus_source: serde_json::to_value(merged.consensus_source)?
                .as_str()
                .unwrap_or("none")
                .to_owned(),
            bounding_boxes: merged.bounding_boxes,
            error: None,
        })
    }
}
