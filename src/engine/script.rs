//! Subprocess OCR engine.
//!
//! Invokes an external executable once per image. The executable receives
//! the image path and the serialized [`EngineRequest`] as arguments, and must
//! print a single JSON [`EngineReply`] on standard output. Both passes are
//! produced by that one invocation; the executable owns its internal
//! concurrency.

use std::sync::Arc;

use tokio::process::Command;

use crate::async_utils::{DEFAULT_ERROR_REGEX, check_for_command_failure};
use crate::prelude::*;

use super::{EngineReply, EngineRequest, OcrImageEngine};

/// OCR engine wrapping an external command-line tool.
pub struct ScriptOcrEngine {
    /// Program plus leading arguments; image path and request JSON are
    /// appended per call.
    command: Vec<String>,
}

impl ScriptOcrEngine {
    /// Create a new engine for `command`.
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            anyhow::bail!("OCR engine command must not be empty");
        }
        Ok(Self { command })
    }

    /// Create a shared engine for `command`.
    pub fn shared(command: Vec<String>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self::new(command)?))
    }
}

#[async_trait::async_trait]
impl OcrImageEngine for ScriptOcrEngine {
    #[instrument(level = "debug", skip_all, fields(image = %image.display()))]
    async fn run(&self, image: &Path, request: &EngineRequest) -> Result<EngineReply> {
        let request_json =
            serde_json::to_string(request).context("cannot serialize engine request")?;

        let (program, leading_args) = self
            .command
            .split_first()
            .expect("command checked non-empty at construction");
        let output = Command::new(program)
            .args(leading_args)
            .arg(image)
            .arg(&request_json)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("cannot run OCR engine {:?}", program))?;

        // A non-zero exit is reported like `success: false`, not as a crash
        // of the adapter itself. Some OCR wrappers exit 0 after printing an
        // error, so standard error is also checked.
        if let Err(err) = check_for_command_failure(program, &output, Some(&DEFAULT_ERROR_REGEX)) {
            return Ok(EngineReply::failure(format!("{:#}", err)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match serde_json::from_str::<EngineReply>(stdout.trim()) {
            Ok(reply) => Ok(reply),
            Err(err) => Ok(EngineReply::failure(format!(
                "unparsable OCR engine output: {}",
                err
            ))),
        }
    }
}
