//! Boundaries with the image and result storage collaborators.
//!
//! The pipeline does not care how images or results are persisted; it talks
//! to these traits. The directory-backed image store is what the CLI uses;
//! the in-memory implementations back the CLI's one-shot runs and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::consensus::ConsensusResult;
use crate::prelude::*;

/// Read-only access to raw image bytes by id.
#[async_trait::async_trait]
pub trait ImageStore: Send + Sync + 'static {
    /// Fetch the raw bytes for `image_id`.
    ///
    /// A missing image is an error; the pipeline fails the queue item
    /// without invoking the OCR engine.
    async fn load(&self, image_id: &str) -> Result<Vec<u8>>;
}

/// Write access to the per-image consensus results.
#[async_trait::async_trait]
pub trait ResultStore: Send + Sync + 'static {
    /// Atomically replace-or-insert the result for `image_id`.
    ///
    /// Never produces more than one result per image.
    async fn upsert(&self, image_id: &str, result: ConsensusResult) -> Result<()>;
}

/// An [`ImageStore`] that maps image ids to files under a root directory.
pub struct DirImageStore {
    root: PathBuf,
}

impl DirImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait::async_trait]
impl ImageStore for DirImageStore {
    async fn load(&self, image_id: &str) -> Result<Vec<u8>> {
        let path = self.root.join(image_id);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("no image bytes for {:?} at {:?}", image_id, path))
    }
}

/// An in-memory [`ImageStore`].
#[cfg(test)]
#[derive(Default)]
pub struct MemoryImageStore {
    images: Mutex<HashMap<String, Vec<u8>>>,
}

#[cfg(test)]
impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register image bytes under an id.
    pub fn insert(&self, image_id: &str, bytes: Vec<u8>) {
        let mut images = self.images.lock().expect("lock poisoned");
        images.insert(image_id.to_owned(), bytes);
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl ImageStore for MemoryImageStore {
    async fn load(&self, image_id: &str) -> Result<Vec<u8>> {
        let images = self.images.lock().expect("lock poisoned");
        images
            .get(image_id)
            .cloned()
            .with_context(|| format!("no image bytes for {:?}", image_id))
    }
}

/// An in-memory [`ResultStore`] with upsert semantics.
#[derive(Default)]
pub struct MemoryResultStore {
    results: Mutex<HashMap<String, ConsensusResult>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the stored result for an image, if any.
    pub fn get(&self, image_id: &str) -> Option<ConsensusResult> {
        let results = self.results.lock().expect("lock poisoned");
        results.get(image_id).cloned()
    }

    /// Number of stored results.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        let results = self.results.lock().expect("lock poisoned");
        results.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl ResultStore for MemoryResultStore {
    async fn upsert(&self, image_id: &str, result: ConsensusResult) -> Result<()> {
        let mut results = self.results.lock().expect("lock poisoned");
        results.insert(image_id.to_owned(), result);
        Ok(())
    }
}
