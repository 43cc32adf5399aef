//! The processing pipeline: a worker pool draining the work queue.
//!
//! The [`Pipeline`] owns its whole lifecycle: an idempotent `start`, a
//! cooperative `stop`, and the pool of independent worker loops in between.
//! Each worker repeatedly claims one queue item and runs it end to end
//! (settings snapshot, image fetch, normalization, dual-pass OCR, consensus,
//! result upsert) before claiming the next. Workers never share an item; the
//! queue's claim operation is the only synchronization point.
//!
//! A failure while processing an item marks that item failed and the worker
//! moves on. Nothing an item does can take down its worker or the pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use schemars::JsonSchema;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::async_utils::JoinWorker;
use crate::config::Settings;
use crate::consensus;
use crate::engine::{EngineRequest, OcrImageEngine};
use crate::preprocess::{self, PreprocessCache, PreprocessParams};
use crate::prelude::*;
use crate::queue::{QueueCounts, QueueItem, WorkQueue};
use crate::stores::{ImageStore, ResultStore};

/// Fallback idle backoff when the settings collaborator is unreachable.
const FALLBACK_IDLE_BACKOFF: Duration = Duration::from_secs(2);

/// A point-in-time view of the pipeline, for the status surface.
#[derive(Clone, Copy, Debug, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct PipelineStatus {
    /// Is the worker pool running?
    pub running: bool,

    /// Workers currently processing an item (as opposed to idle-polling).
    pub active_workers: usize,

    /// Queue item counts by status.
    pub queue: QueueCounts,
}

/// Everything a worker needs, shared across the pool.
struct WorkerContext {
    queue: Arc<WorkQueue>,
    engine: Arc<dyn OcrImageEngine>,
    images: Arc<dyn ImageStore>,
    results: Arc<dyn ResultStore>,
    settings: Arc<dyn Settings>,
    cache: Option<Arc<PreprocessCache>>,
    stopping: AtomicBool,
    active_workers: AtomicUsize,
}

/// The pipeline controller.
pub struct Pipeline {
    ctx: Arc<WorkerContext>,
    workers: std::sync::Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl Pipeline {
    /// Create a stopped pipeline over the given collaborators.
    pub fn new(
        engine: Arc<dyn OcrImageEngine>,
        images: Arc<dyn ImageStore>,
        results: Arc<dyn ResultStore>,
        settings: Arc<dyn Settings>,
        cache: Option<Arc<PreprocessCache>>,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkerContext {
                queue: Arc::new(WorkQueue::new()),
                engine,
                images,
                results,
                settings,
                cache,
                stopping: AtomicBool::new(false),
                active_workers: AtomicUsize::new(0),
            }),
            workers: std::sync::Mutex::new(vec![]),
        }
    }

    /// Submit an image for processing.
    pub fn enqueue(&self, image_id: &str, priority: i32) -> QueueItem {
        self.ctx.queue.enqueue(image_id, priority)
    }

    /// Reset a failed item to pending. This is the external retry action.
    pub fn retry(&self, id: uuid::Uuid) -> bool {
        let retried = self.ctx.queue.retry(id);
        if retried {
            if let Some(item) = self.ctx.queue.get(id) {
                debug!(item_id = %id, image_id = %item.image_id, attempts = item.attempts, "Requeued failed item");
            }
        }
        retried
    }

    /// The underlying queue, for status queries.
    pub fn queue(&self) -> &WorkQueue {
        &self.ctx.queue
    }

    /// Current pipeline status.
    pub fn status(&self) -> PipelineStatus {
        let workers = self.workers.lock().expect("lock poisoned");
        PipelineStatus {
            running: !workers.is_empty(),
            active_workers: self.ctx.active_workers.load(Ordering::SeqCst),
            queue: self.ctx.queue.counts(),
        }
    }

    /// Start the worker pool. Starting an already-running pool is a no-op.
    ///
    /// The worker count is read once from a fresh settings snapshot; changing
    /// it later requires a stop and start.
    pub async fn start(&self) -> Result<()> {
        let config = self.ctx.settings.ocr_config().await?;
        let worker_count = config.worker_count.max(1);

        let mut workers = self.workers.lock().expect("lock poisoned");
        if !workers.is_empty() {
            debug!("Worker pool already running, ignoring start");
            return Ok(());
        }
        self.ctx.stopping.store(false, Ordering::SeqCst);
        info!(worker_count, "Starting OCR worker pool");
        for worker_idx in 0..worker_count {
            let ctx = self.ctx.clone();
            workers.push(tokio::spawn(worker_loop(worker_idx, ctx)));
        }
        Ok(())
    }

    /// Stop the worker pool and wait for every worker to exit.
    ///
    /// Stopping is cooperative: a worker mid-item finishes that item first,
    /// and no new items are claimed after the stop flag is set.
    pub async fn stop(&self) -> Result<()> {
        self.ctx.stopping.store(true, Ordering::SeqCst);
        let handles = {
            let mut workers = self.workers.lock().expect("lock poisoned");
            std::mem::take(&mut *workers)
        };
        if handles.is_empty() {
            return Ok(());
        }
        info!("Stopping OCR worker pool");
        JoinWorker::from_handles(handles).join().await
    }
}

/// One worker's claim-process loop.
async fn worker_loop(worker_idx: usize, ctx: Arc<WorkerContext>) -> Result<()> {
    debug!(worker = worker_idx, "OCR worker started");
    loop {
        if ctx.stopping.load(Ordering::SeqCst) {
            break;
        }
        let Some(item) = ctx.queue.claim_next() else {
            let backoff = match ctx.settings.ocr_config().await {
                Ok(config) => config.idle_backoff(),
                Err(_) => FALLBACK_IDLE_BACKOFF,
            };
            tokio::time::sleep(backoff).await;
            continue;
        };

        let active = ctx.active_workers.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            worker = worker_idx,
            item_id = %item.id,
            image_id = %item.image_id,
            active_workers = active,
            "Claimed queue item"
        );

        // Catch everything per item so one bad scan cannot kill the worker.
        match process_item(&ctx, &item).await {
            Ok(()) => {
                ctx.queue.complete(item.id);
                debug!(item_id = %item.id, "Completed queue item");
            }
            Err(err) => {
                let message = format!("{:#}", err);
                error!(item_id = %item.id, error = %message, "Failed queue item");
                ctx.queue.fail(item.id, &message);
            }
        }
        ctx.active_workers.fetch_sub(1, Ordering::SeqCst);
    }
    debug!(worker = worker_idx, "OCR worker stopped");
    Ok(())
}

/// Process one claimed item end to end.
#[instrument(level = "debug", skip_all, fields(item_id = %item.id, image_id = %item.image_id))]
async fn process_item(ctx: &WorkerContext, item: &QueueItem) -> Result<()> {
    // Fresh snapshot per item, so reconfiguration applies without a restart.
    let config = ctx
        .settings
        .ocr_config()
        .await
        .context("cannot read OCR settings")?;

    // Missing prerequisite: fail before touching the engine.
    let bytes = ctx.images.load(&item.image_id).await?;

    // Normalize locally when the cache layer is in play; otherwise hand the
    // raw bytes over and let the engine do its own normalization.
    let normalize_locally = config.preprocessing && config.enable_cache;
    let prepared = if normalize_locally {
        let params = PreprocessParams::from_config(&config);
        preprocess::normalize_cached(ctx.cache.as_deref(), &bytes, &params)
            .context("cannot normalize image")?
    } else {
        bytes
    };

    // The temp artifact lives as long as this scope, including every error
    // path, and the directory is removed when it drops.
    let tmpdir =
        tempfile::TempDir::with_prefix("dualscan").context("cannot create temp dir")?;
    let image_path = tmpdir.path().join(if normalize_locally {
        "input.png"
    } else {
        "input.img"
    });
    tokio::fs::write(&image_path, &prepared)
        .await
        .context("cannot write temp image")?;

    let request = EngineRequest::from_config(&config, !normalize_locally);
    let reply = tokio::time::timeout(
        config.engine_timeout(),
        ctx.engine.run(&image_path, &request),
    )
    .await
    .map_err(|_| {
        anyhow!(
            "OCR engine timed out after {}s",
            config.engine_timeout_secs
        )
    })??;

    if !reply.success {
        let detail = reply
            .error
            .unwrap_or_else(|| "no error description".to_owned());
        return Err(anyhow!("OCR engine reported failure: {}", detail));
    }

    let (pass1, pass2) = reply.into_passes();
    let result = consensus::resolve(&pass1, &pass2);
    debug!(
        consensus_source = ?result.consensus_source,
        consensus_confidence = result.consensus_confidence,
        "Resolved consensus"
    );

    ctx.results
        .upsert(&item.image_id, result)
        .await
        .context("cannot persist consensus result")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::AtomicU32;

    use image::{DynamicImage, ImageFormat, RgbImage};

    use crate::config::{OcrConfig, StaticSettings};
    use crate::consensus::ConsensusSource;
    use crate::engine::EngineReply;
    use crate::queue::QueueStatus;
    use crate::stores::{MemoryImageStore, MemoryResultStore};

    use super::*;

    /// A deterministic engine whose replies are keyed by marker bytes the
    /// test plants in the "image".
    struct FakeEngine {
        invocations: AtomicU32,
        delay: Duration,
    }

    impl FakeEngine {
        fn new() -> Self {
            Self {
                invocations: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }

        fn reply_for(marker: &str) -> EngineReply {
            match marker {
                "fails" => EngineReply::failure("simulated engine crash"),
                "empty" => EngineReply {
                    success: true,
                    ..EngineReply::default()
                },
                _ => EngineReply {
                    success: true,
                    pytesseract_text: "pass one text".to_owned(),
                    pytesseract_confidence: 88,
                    easyocr_text: "pass two text".to_owned(),
                    easyocr_confidence: 91,
                    ..EngineReply::default()
                },
            }
        }
    }

    #[async_trait::async_trait]
    impl OcrImageEngine for FakeEngine {
        async fn run(&self, image: &Path, _request: &EngineRequest) -> Result<EngineReply> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let bytes = tokio::fs::read(image).await?;
            let marker = String::from_utf8_lossy(&bytes);
            Ok(Self::reply_for(marker.trim()))
        }
    }

    fn test_config() -> OcrConfig {
        OcrConfig {
            // Skip local normalization so tests can plant marker bytes.
            preprocessing: false,
            worker_count: 2,
            idle_backoff_ms: 10,
            engine_timeout_secs: 30,
            ..OcrConfig::default()
        }
    }

    struct Harness {
        pipeline: Pipeline,
        engine: Arc<FakeEngine>,
        images: Arc<MemoryImageStore>,
        results: Arc<MemoryResultStore>,
    }

    fn harness_with(config: OcrConfig, engine: FakeEngine) -> Harness {
        let engine = Arc::new(engine);
        let images = Arc::new(MemoryImageStore::new());
        let results = Arc::new(MemoryResultStore::new());
        let pipeline = Pipeline::new(
            engine.clone(),
            images.clone(),
            results.clone(),
            Arc::new(StaticSettings::new(config)),
            None,
        );
        Harness {
            pipeline,
            engine,
            images,
            results,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config(), FakeEngine::new())
    }

    /// Poll until `check` passes or a generous deadline expires.
    async fn wait_until(check: impl Fn() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn sample_png() -> Vec<u8> {
        let img = RgbImage::from_pixel(24, 24, image::Rgb([120, 130, 140]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[tokio::test]
    async fn processes_an_item_end_to_end() {
        let h = harness();
        h.images.insert("42", b"scanned page".to_vec());
        let item = h.pipeline.enqueue("42", 0);

        h.pipeline.start().await.unwrap();
        wait_until(|| h.pipeline.queue().counts().completed == 1).await;
        h.pipeline.stop().await.unwrap();

        let done = h.pipeline.queue().get(item.id).unwrap();
        assert_eq!(done.status, QueueStatus::Completed);
        assert_eq!(done.attempts, 0);

        let result = h.results.get("42").unwrap();
        assert_eq!(result.consensus_text, "pass two text");
        assert_eq!(result.consensus_confidence, 91);
        assert_eq!(result.consensus_source, ConsensusSource::Pass2);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let h = harness();
        h.pipeline.start().await.unwrap();
        h.pipeline.start().await.unwrap();
        assert!(h.pipeline.status().running);
        h.pipeline.stop().await.unwrap();
        assert!(!h.pipeline.status().running);
    }

    #[tokio::test]
    async fn missing_image_fails_without_invoking_the_engine() {
        let h = harness();
        let item = h.pipeline.enqueue("nowhere", 0);

        h.pipeline.start().await.unwrap();
        wait_until(|| h.pipeline.queue().counts().failed == 1).await;
        h.pipeline.stop().await.unwrap();

        let failed = h.pipeline.queue().get(item.id).unwrap();
        assert_eq!(failed.status, QueueStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert!(failed.error_message.unwrap().contains("nowhere"));
        assert_eq!(h.engine.invocations.load(Ordering::SeqCst), 0);
        assert!(h.results.is_empty());
    }

    #[tokio::test]
    async fn engine_failure_marks_the_item_failed() {
        let h = harness();
        h.images.insert("bad", b"fails".to_vec());
        let item = h.pipeline.enqueue("bad", 0);

        h.pipeline.start().await.unwrap();
        wait_until(|| h.pipeline.queue().counts().failed == 1).await;
        h.pipeline.stop().await.unwrap();

        let failed = h.pipeline.queue().get(item.id).unwrap();
        assert_eq!(failed.attempts, 1);
        assert!(
            failed
                .error_message
                .unwrap()
                .contains("simulated engine crash")
        );
        assert!(h.results.is_empty());
    }

    #[tokio::test]
    async fn a_bad_item_does_not_stop_the_pool() {
        let h = harness();
        h.images.insert("bad", b"fails".to_vec());
        h.images.insert("good", b"fine".to_vec());
        h.pipeline.enqueue("bad", 10);
        h.pipeline.enqueue("good", 0);

        h.pipeline.start().await.unwrap();
        wait_until(|| {
            let counts = h.pipeline.queue().counts();
            counts.failed == 1 && counts.completed == 1
        })
        .await;
        h.pipeline.stop().await.unwrap();

        assert!(h.results.get("good").is_some());
    }

    #[tokio::test]
    async fn empty_text_success_completes_with_no_result_source() {
        let h = harness();
        h.images.insert("blank", b"empty".to_vec());
        h.pipeline.enqueue("blank", 0);

        h.pipeline.start().await.unwrap();
        wait_until(|| h.pipeline.queue().counts().completed == 1).await;
        h.pipeline.stop().await.unwrap();

        let result = h.results.get("blank").unwrap();
        assert_eq!(result.consensus_text, "");
        assert_eq!(result.consensus_source, ConsensusSource::None);
    }

    #[tokio::test(start_paused = true)]
    async fn a_hung_engine_times_out_and_fails_the_item() {
        let config = OcrConfig {
            engine_timeout_secs: 1,
            ..test_config()
        };
        let engine = FakeEngine {
            invocations: AtomicU32::new(0),
            delay: Duration::from_secs(3600),
        };
        let h = harness_with(config, engine);
        h.images.insert("slow", b"anything".to_vec());
        let item = h.pipeline.enqueue("slow", 0);

        h.pipeline.start().await.unwrap();
        wait_until(|| h.pipeline.queue().counts().failed == 1).await;
        h.pipeline.stop().await.unwrap();

        let failed = h.pipeline.queue().get(item.id).unwrap();
        assert!(failed.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn stop_is_graceful_and_no_claims_happen_afterwards() {
        let h = harness();
        h.images.insert("one", b"fine".to_vec());
        h.pipeline.enqueue("one", 0);

        h.pipeline.start().await.unwrap();
        wait_until(|| !h.pipeline.queue().counts().has_active_work()).await;
        h.pipeline.stop().await.unwrap();

        // Everything in flight reached a terminal state before the workers
        // exited, and nothing enqueued after the stop is ever claimed.
        assert_eq!(h.pipeline.queue().counts().processing, 0);
        h.pipeline.enqueue("late", 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.pipeline.queue().counts().pending, 1);
        assert_eq!(h.pipeline.status().active_workers, 0);
    }

    #[tokio::test]
    async fn cache_on_and_off_yield_the_same_consensus() {
        async fn run_once(enable_cache: bool, cache: Option<Arc<PreprocessCache>>) -> String {
            let config = OcrConfig {
                preprocessing: true,
                enable_cache,
                worker_count: 1,
                idle_backoff_ms: 10,
                ..OcrConfig::default()
            };
            let h = {
                let engine = Arc::new(FakeEngine::new());
                let images = Arc::new(MemoryImageStore::new());
                let results = Arc::new(MemoryResultStore::new());
                let pipeline = Pipeline::new(
                    engine.clone(),
                    images.clone(),
                    results.clone(),
                    Arc::new(StaticSettings::new(config)),
                    cache,
                );
                Harness {
                    pipeline,
                    engine,
                    images,
                    results,
                }
            };
            h.images.insert("scan", sample_png());
            h.pipeline.enqueue("scan", 0);
            h.pipeline.start().await.unwrap();
            wait_until(|| h.pipeline.queue().counts().completed == 1).await;
            h.pipeline.stop().await.unwrap();
            h.results.get("scan").unwrap().consensus_text
        }

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(PreprocessCache::new(dir.path()).unwrap());

        let with_cache = run_once(true, Some(cache.clone())).await;
        let warm_cache = run_once(true, Some(cache)).await;
        let without_cache = run_once(false, None).await;
        assert_eq!(with_cache, warm_cache);
        assert_eq!(with_cache, without_cache);
    }

    #[tokio::test]
    async fn retry_requeues_a_failed_item_for_the_running_pool() {
        let h = harness();
        h.images.insert("flaky", b"fails".to_vec());
        let item = h.pipeline.enqueue("flaky", 0);

        h.pipeline.start().await.unwrap();
        wait_until(|| h.pipeline.queue().counts().failed == 1).await;

        // The external retry action: flip the payload to succeed, requeue.
        h.images.insert("flaky", b"fine".to_vec());
        assert!(h.pipeline.retry(item.id));
        wait_until(|| h.pipeline.queue().counts().completed == 1).await;
        h.pipeline.stop().await.unwrap();

        let done = h.pipeline.queue().get(item.id).unwrap();
        assert_eq!(done.status, QueueStatus::Completed);
        assert_eq!(done.attempts, 1);
    }
}
