//! The durable work queue.
//!
//! One [`QueueItem`] exists per submitted image. Claiming is the only place
//! in the whole pipeline that needs mutual exclusion: once a worker owns an
//! item in [`QueueStatus::Processing`], nothing else will touch it until the
//! worker completes or fails it. We hold the sync lock just for an instant
//! on each operation, so it is safe to call these methods from async code.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::Serialize;
use uuid::Uuid;

use crate::prelude::*;

/// Lifecycle state of a queue item.
#[derive(Clone, Copy, Debug, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting to be claimed by a worker.
    Pending,
    /// Claimed and currently being processed.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished with an error. May be reset to pending by an external
    /// retry action.
    Failed,
}

/// One image's processing request.
#[derive(Clone, Debug, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct QueueItem {
    /// Unique id of this queue item.
    pub id: Uuid,

    /// The image this item refers to, owned by the image store.
    pub image_id: String,

    /// Current lifecycle state.
    pub status: QueueStatus,

    /// Higher priorities are claimed first.
    pub priority: i32,

    /// Number of failed processing attempts. Never incremented on success.
    pub attempts: u32,

    /// Why the last attempt failed, if it did.
    pub error_message: Option<String>,

    /// When the item was enqueued.
    pub created_at: DateTime<Utc>,

    /// When a worker last claimed the item.
    pub started_at: Option<DateTime<Utc>>,

    /// When the item reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Counts of items per status, for the status surface.
#[derive(Clone, Copy, Debug, Default, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueCounts {
    /// Is there any item still waiting or in flight?
    pub fn has_active_work(&self) -> bool {
        self.pending > 0 || self.processing > 0
    }
}

/// Ordered record of pending, in-flight and finished processing requests.
///
/// The queue does not deduplicate: submitting the same image twice creates
/// two items, and resubmission policy belongs to the caller.
#[derive(Default)]
pub struct WorkQueue {
    items: Mutex<HashMap<Uuid, QueueItem>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending item for `image_id`.
    pub fn enqueue(&self, image_id: &str, priority: i32) -> QueueItem {
        let item = QueueItem {
            id: Uuid::new_v4(),
            image_id: image_id.to_owned(),
            status: QueueStatus::Pending,
            priority,
            attempts: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let mut items = self.items.lock().expect("lock poisoned");
        items.insert(item.id, item.clone());
        debug!(item_id = %item.id, image_id, priority, "Enqueued item");
        item
    }

    /// Atomically claim the next eligible pending item.
    ///
    /// Selects the highest-priority item, breaking ties by earliest
    /// `created_at`, transitions it to processing and stamps `started_at`.
    /// Exactly one concurrent caller can receive a given item.
    pub fn claim_next(&self) -> Option<QueueItem> {
        let mut items = self.items.lock().expect("lock poisoned");
        let next_id = items
            .values()
            .filter(|item| item.status == QueueStatus::Pending)
            .min_by_key(|item| (std::cmp::Reverse(item.priority), item.created_at, item.id))
            .map(|item| item.id)?;
        let item = items.get_mut(&next_id).expect("item exists under lock");
        item.status = QueueStatus::Processing;
        item.started_at = Some(Utc::now());
        Some(item.clone())
    }

    /// Mark an item completed.
    pub fn complete(&self, id: Uuid) {
        let mut items = self.items.lock().expect("lock poisoned");
        if let Some(item) = items.get_mut(&id) {
            item.status = QueueStatus::Completed;
            item.completed_at = Some(Utc::now());
        }
    }

    /// Mark an item failed, recording the error and bumping `attempts`.
    pub fn fail(&self, id: Uuid, message: &str) {
        let mut items = self.items.lock().expect("lock poisoned");
        if let Some(item) = items.get_mut(&id) {
            item.status = QueueStatus::Failed;
            item.attempts += 1;
            item.error_message = Some(message.to_owned());
            item.completed_at = Some(Utc::now());
        }
    }

    /// Reset a failed item to pending so it can be claimed again.
    ///
    /// This is the external retry action: it is never triggered from inside
    /// the pipeline, and it preserves the `attempts` count.
    pub fn retry(&self, id: Uuid) -> bool {
        let mut items = self.items.lock().expect("lock poisoned");
        match items.get_mut(&id) {
            Some(item) if item.status == QueueStatus::Failed => {
                item.status = QueueStatus::Pending;
                item.error_message = None;
                item.started_at = None;
                item.completed_at = None;
                true
            }
            _ => false,
        }
    }

    /// Look up a single item.
    pub fn get(&self, id: Uuid) -> Option<QueueItem> {
        let items = self.items.lock().expect("lock poisoned");
        items.get(&id).cloned()
    }

    /// Snapshot of every item, newest first.
    pub fn snapshot(&self) -> Vec<QueueItem> {
        let items = self.items.lock().expect("lock poisoned");
        let mut all: Vec<_> = items.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Item counts by status.
    pub fn counts(&self) -> QueueCounts {
        let items = self.items.lock().expect("lock poisoned");
        let mut counts = QueueCounts::default();
        for item in items.values() {
            match item.status {
                QueueStatus::Pending => counts.pending += 1,
                QueueStatus::Processing => counts.processing += 1,
                QueueStatus::Completed => counts.completed += 1,
                QueueStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}
