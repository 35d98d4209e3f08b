use crate::errors::AppError;
use crate::models::{
    BatchFilter, BatchJob, BatchTally, ItemStatus, ProgressOutcome, WebhookResponse,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

pub use crate::models::UNKNOWN_ID_NOTE;

/// Result of storing one provider callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// No item had this id; the payload was stored as a new error record.
    StoredUnknown,
    /// Item updated; not linked to a batch.
    Standalone,
    /// Item updated and its batch progressed (or was already terminal).
    Batch {
        batch_id: String,
        progress: ProgressOutcome,
    },
    /// Item updated; it had already been counted toward its batch.
    AlreadyCounted { batch_id: String },
}

/// Persistence for batches and their per-item webhook responses.
///
/// Counter mutation is only reachable through `apply_callback`,
/// `record_dispatch_failure` and `expire_stale_batches`; implementations must
/// run each of them atomically against the batch row.
#[async_trait]
pub trait BatchRepository: Send + Sync {
    /// Insert a batch together with its item placeholders.
    async fn create_batch(
        &self,
        batch: &BatchJob,
        items: &[WebhookResponse],
    ) -> Result<(), AppError>;

    async fn get_batch(&self, id: &str) -> Result<Option<BatchJob>, AppError>;

    /// Batches matching `filter`, newest first.
    async fn list_batches(&self, filter: &BatchFilter) -> Result<Vec<BatchJob>, AppError>;

    /// Remove a batch and its items. Returns false when it no longer exists.
    async fn delete_batch(&self, id: &str) -> Result<bool, AppError>;

    /// Items of a batch ordered by correlation id.
    async fn list_items(&self, batch_id: &str) -> Result<Vec<WebhookResponse>, AppError>;

    async fn tally(&self, batch_id: &str) -> Result<BatchTally, AppError>;

    /// Tallies for several batches in one read. Every requested id gets an
    /// entry, zeroed when it has no items.
    async fn tallies(&self, batch_ids: &[String])
        -> Result<HashMap<String, BatchTally>, AppError>;

    /// Move a queued batch to processing. No-op for any other status.
    async fn mark_processing(&self, batch_id: &str) -> Result<(), AppError>;

    /// Mark an item as failed at dispatch time and count it toward its batch.
    async fn record_dispatch_failure(
        &self,
        item_id: &str,
        reason: &str,
    ) -> Result<Option<ProgressOutcome>, AppError>;

    /// Store a classified callback and advance the owning batch.
    async fn apply_callback(
        &self,
        correlation_id: &str,
        body: &Value,
        status: ItemStatus,
    ) -> Result<CallbackOutcome, AppError>;

    /// Mark open batches created before `cutoff` as errored. Returns their ids.
    async fn expire_stale_batches(
        &self,
        cutoff: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<String>, AppError>;
}
