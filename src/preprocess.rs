//! Image normalization and the preprocessing cache.
//!
//! Normalizing a scan (grayscale, upscale, denoise) is the most expensive
//! transform we run locally, and the same image is often reprocessed with the
//! same parameters. The cache is content-addressed: the key is derived from a
//! blake3 hash of the source bytes plus the canonical JSON of the parameters,
//! so a parameter change never serves a stale entry. Entries are immutable
//! once written and the store grows without bound; deleting the cache
//! directory is always safe.
//!
//! The cache is strictly a latency optimization. Every failure path falls
//! back to recomputing the transform, so cache outages cannot change OCR
//! output. Deskewing is not performed here; it is delegated to the OCR
//! engine via its request toggle.

use std::fs;
use std::io::Cursor;

use image::{ImageFormat, ImageReader, imageops::FilterType};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::OcrConfig;
use crate::prelude::*;

/// Maximum width the original upload path would accept without tiling.
const SPLIT_MAX_WIDTH: u32 = 2550;
/// Maximum height the original upload path would accept without tiling.
const SPLIT_MAX_HEIGHT: u32 = 3300;
/// Aspect ratio beyond which the original upload path would tile.
const SPLIT_ASPECT_RATIO: f64 = 5.0;

/// Parameters that affect the normalized output.
///
/// Anything that changes the transform must appear here, because the cache
/// key is derived from the serialized parameters.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct PreprocessParams {
    /// Upscale 2x with Lanczos resampling.
    pub upscale: bool,

    /// Apply a light Gaussian blur to suppress scanner noise.
    pub denoise: bool,
}

impl PreprocessParams {
    /// Derive the local transform parameters from a configuration snapshot.
    pub fn from_config(config: &OcrConfig) -> Self {
        Self {
            upscale: config.upscale,
            denoise: config.denoise,
        }
    }

    fn canonical_json(&self) -> String {
        serde_json::to_string(self).expect("params serialize to JSON")
    }
}

/// Hex blake3 hash of an image's raw bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Content-addressed store of normalized image buffers.
pub struct PreprocessCache {
    cache_dir: PathBuf,
}

impl PreprocessCache {
    /// Open (creating if needed) a cache rooted at `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir).with_context(|| {
            format!("cannot create preprocessing cache at {:?}", cache_dir)
        })?;
        Ok(Self { cache_dir })
    }

    fn entry_path(&self, hash: &str, params: &PreprocessParams) -> PathBuf {
        let key = blake3::hash(
            format!("image_hash={}&params={}", hash, params.canonical_json()).as_bytes(),
        );
        self.cache_dir.join(format!("{}.png", key.to_hex()))
    }

    /// Fetch a previously normalized buffer, or `None` on a miss.
    ///
    /// Read errors are logged and reported as misses so a damaged cache can
    /// never block processing.
    pub fn get(&self, hash: &str, params: &PreprocessParams) -> Option<Vec<u8>> {
        let path = self.entry_path(hash, params);
        if !path.exists() {
            return None;
        }
        match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(?path, error = %err, "Failed to read cache entry, treating as miss");
                None
            }
        }
    }

    /// Store a normalized buffer.
    ///
    /// The write goes to a temporary file first and is renamed into place, so
    /// concurrent writers of the same key race harmlessly and readers never
    /// observe a partial entry.
    pub fn put(&self, hash: &str, params: &PreprocessParams, bytes: &[u8]) -> Result<()> {
        let path = self.entry_path(hash, params);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.cache_dir)
            .context("cannot create temporary cache file")?;
        std::io::Write::write_all(&mut tmp, bytes)
            .context("cannot write temporary cache file")?;
        tmp.persist(&path)
            .with_context(|| format!("cannot persist cache entry {:?}", path))?;
        Ok(())
    }
}

/// Normalize raw image bytes for OCR, returning PNG bytes.
///
/// Applies grayscale always, then the optional transforms from `params`.
pub fn normalize(bytes: &[u8], params: &PreprocessParams) -> Result<Vec<u8>> {
    let decoded = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .context("cannot sniff image format")?
        .decode()
        .context("cannot decode image")?;

    let (width, height) = (decoded.width(), decoded.height());
    warn_if_oversized(width, height);

    let mut img = decoded.grayscale();
    if params.upscale {
        img = img.resize(width * 2, height * 2, FilterType::Lanczos3);
    }
    if params.denoise {
        img = img.blur(1.0);
    }

    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)
        .context("cannot encode normalized image")?;
    Ok(out.into_inner())
}

/// Normalize via the cache, computing and storing the entry on a miss.
///
/// Passing `None` for the cache always recomputes, which by construction
/// yields byte-identical output for the same input and parameters.
pub fn normalize_cached(
    cache: Option<&PreprocessCache>,
    bytes: &[u8],
    params: &PreprocessParams,
) -> Result<Vec<u8>> {
    let Some(cache) = cache else {
        return normalize(bytes, params);
    };
    let hash = content_hash(bytes);
    if let Some(cached) = cache.get(&hash, params) {
        trace!(hash = %hash, "Preprocessing cache hit");
        return Ok(cached);
    }
    let normalized = normalize(bytes, params)?;
    if let Err(err) = cache.put(&hash, params, &normalized) {
        // Concurrent misses may recompute redundantly; that is acceptable.
        warn!(error = %err, "Failed to store cache entry, continuing uncached");
    }
    Ok(normalized)
}

/// Log images that exceed the tiling thresholds of the original upload path.
fn warn_if_oversized(width: u32, height: u32) {
    let aspect = f64::from(width.max(height)) / f64::from(width.min(height).max(1));
    if width > SPLIT_MAX_WIDTH || height > SPLIT_MAX_HEIGHT || aspect > SPLIT_ASPECT_RATIO {
        warn!(
            width,
            height,
            "Image exceeds recommended dimensions; OCR quality may suffer without tiling"
        );
    }
}
