//! The `process` subcommand: one-shot OCR over a directory of images.

use std::sync::Arc;

use clap::Args;
use schemars::JsonSchema;
use serde::Serialize;

use crate::{
    cmd::write_output,
    config::{OcrConfig, PerformancePreset, StaticSettings},
    consensus::ConsensusResult,
    engine::engine_for_command,
    pipeline::Pipeline,
    prelude::*,
    preprocess::PreprocessCache,
    queue::QueueStatus,
    stores::{DirImageStore, MemoryResultStore},
};

/// Image extensions we pick up from the input directory.
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Process command line arguments.
#[derive(Debug, Args)]
pub struct ProcessOpts {
    /// Directory containing the images to OCR.
    #[clap(value_name = "IMAGE_DIR")]
    pub input_dir: PathBuf,

    /// The OCR engine command. The image path and a JSON request are
    /// appended to it for every invocation.
    #[clap(last = true, required = true, value_name = "ENGINE_CMD")]
    pub engine_command: Vec<String>,

    /// The output path to write JSONL results to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Number of worker tasks. Defaults to the number of CPUs.
    #[clap(short = 'j', long = "jobs")]
    pub jobs: Option<usize>,

    /// Tesseract engine mode.
    #[clap(long)]
    pub oem: Option<u8>,

    /// Page segmentation mode for the first pass.
    #[clap(long)]
    pub psm1: Option<u8>,

    /// Page segmentation mode for the second pass.
    #[clap(long)]
    pub psm2: Option<u8>,

    /// Skip image normalization entirely.
    #[clap(long)]
    pub no_preprocessing: bool,

    /// Upscale small images 2x before OCR.
    #[clap(long)]
    pub upscale: bool,

    /// Apply a light denoise blur before OCR.
    #[clap(long)]
    pub denoise: bool,

    /// Ask the engine to deskew images.
    #[clap(long)]
    pub deskew: bool,

    /// Speed/quality trade-off hint for the engine.
    #[clap(long, value_enum, default_value_t = PerformancePreset::Balanced)]
    pub preset: PerformancePreset,

    /// Disable the preprocessing cache.
    #[clap(long)]
    pub no_cache: bool,

    /// Directory for the preprocessing cache.
    #[clap(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Upper bound on a single engine invocation, in seconds.
    #[clap(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Requeue failed images up to this many extra rounds.
    #[clap(long, default_value = "0")]
    pub retries: u32,

    /// Fail the run if more than this fraction of images fail OCR.
    #[clap(long, default_value = "0.0")]
    pub allowed_failure_rate: f32,
}

impl ProcessOpts {
    fn to_config(&self) -> OcrConfig {
        let defaults = OcrConfig::default();
        OcrConfig {
            oem: self.oem.unwrap_or(defaults.oem),
            psm_primary: self.psm1.unwrap_or(defaults.psm_primary),
            psm_secondary: self.psm2.unwrap_or(defaults.psm_secondary),
            preprocessing: !self.no_preprocessing,
            upscale: self.upscale,
            denoise: self.denoise,
            deskew: self.deskew,
            worker_count: self.jobs.unwrap_or(defaults.worker_count),
            enable_cache: !self.no_cache,
            performance_preset: self.preset,
            engine_timeout_secs: self.timeout.unwrap_or(defaults.engine_timeout_secs),
            idle_backoff_ms: 100,
        }
    }
}

/// One output line per processed image.
#[derive(Clone, Debug, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ProcessRecord {
    /// Image id, which is the file name within the input directory.
    pub id: String,

    /// Terminal queue status of the image.
    pub status: QueueStatus,

    /// Failure description, for failed images.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Consensus OCR result, for completed images.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ConsensusResult>,
}

/// The `process` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_process(opts: &ProcessOpts) -> Result<()> {
    let config = opts.to_config();
    let image_ids = list_images(&opts.input_dir)?;
    if image_ids.is_empty() {
        anyhow::bail!("no images found in {:?}", opts.input_dir);
    }
    info!(count = image_ids.len(), dir = ?opts.input_dir, "Found images to process");

    let (engine, engine_worker) = engine_for_command(opts.engine_command.clone())?;
    let cache = if config.preprocessing && config.enable_cache {
        let cache_dir = opts
            .cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("dualscan-cache"));
        Some(Arc::new(PreprocessCache::new(cache_dir)?))
    } else {
        None
    };

    let results = Arc::new(MemoryResultStore::new());
    let pipeline = Pipeline::new(
        engine,
        Arc::new(DirImageStore::new(&opts.input_dir)),
        results.clone(),
        Arc::new(StaticSettings::new(config)),
        cache,
    );

    for id in &image_ids {
        pipeline.enqueue(id, 0);
    }
    pipeline.start().await?;
    wait_for_idle(&pipeline).await;

    // Optionally requeue failures for further rounds.
    for round in 1..=opts.retries {
        let failed: Vec<_> = pipeline
            .queue()
            .snapshot()
            .into_iter()
            .filter(|item| item.status == QueueStatus::Failed)
            .collect();
        if failed.is_empty() {
            break;
        }
        info!(round, count = failed.len(), "Retrying failed images");
        for item in failed {
            pipeline.retry(item.id);
        }
        wait_for_idle(&pipeline).await;
    }
    pipeline.stop().await?;

    // One JSONL record per image, in input order.
    let mut by_image: std::collections::HashMap<String, (QueueStatus, Option<String>)> =
        pipeline
            .queue()
            .snapshot()
            .into_iter()
            .map(|item| (item.image_id, (item.status, item.error_message)))
            .collect();
    let mut lines = String::new();
    let mut failed = 0usize;
    for id in &image_ids {
        let (status, error) = by_image
            .remove(id)
            .with_context(|| format!("no queue record for image {:?}", id))?;
        if status == QueueStatus::Failed {
            failed += 1;
        }
        let record = ProcessRecord {
            id: id.clone(),
            status,
            error,
            result: results.get(id),
        };
        lines.push_str(&serde_json::to_string(&record)?);
        lines.push('\n');
    }
    write_output(opts.output_path.as_deref(), &lines).await?;
    engine_worker.join().await?;

    let failure_rate = failed as f32 / image_ids.len() as f32;
    if failure_rate > opts.allowed_failure_rate {
        anyhow::bail!(
            "{} of {} images failed OCR (allowed failure rate {})",
            failed,
            image_ids.len(),
            opts.allowed_failure_rate,
        );
    }
    info!(
        completed = image_ids.len() - failed,
        failed, "Finished processing"
    );
    Ok(())
}

/// Wait until no item is pending or in flight, logging progress.
async fn wait_for_idle(pipeline: &Pipeline) {
    let mut last_logged = std::time::Instant::now();
    loop {
        let status = pipeline.status();
        if !status.queue.has_active_work() {
            return;
        }
        if last_logged.elapsed() >= std::time::Duration::from_secs(2) {
            info!(
                pending = status.queue.pending,
                processing = status.queue.processing,
                completed = status.queue.completed,
                failed = status.queue.failed,
                active_workers = status.active_workers,
                "Processing"
            );
            last_logged = std::time::Instant::now();
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

/// Collect image file names from `dir`, sorted for stable output order.
fn list_images(dir: &Path) -> Result<Vec<String>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read image directory {:?}", dir))?;
    let mut ids = vec![];
    for entry in entries {
        let entry = entry.context("cannot read directory entry")?;
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                IMAGE_EXTENSIONS
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            });
        if path.is_file() && is_image {
            if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                ids.push(name.to_owned());
            }
        }
    }
    ids.sort();
    Ok(ids)
}
