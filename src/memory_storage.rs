use crate::errors::AppError;
use crate::models::{
    BatchFilter, BatchJob, BatchStatus, BatchTally, ItemStatus, ProgressOutcome, WebhookResponse,
};
use crate::repository::{BatchRepository, CallbackOutcome, UNKNOWN_ID_NOTE};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

#[derive(Default)]
struct State {
    batches: HashMap<String, BatchJob>,
    items: BTreeMap<String, WebhookResponse>,
}

impl State {
    fn tally(&self, batch_id: &str) -> BatchTally {
        let mut tally = BatchTally::default();
        self.items
            .values()
            .filter(|item| item.batch_id.as_deref() == Some(batch_id))
            .for_each(|item| tally.record(item.status));
        tally
    }

    /// Applies one progress step to `batch_id`, stamping the completion
    /// message when it was the last item.
    fn progress(&mut self, batch_id: &str, now: DateTime<Utc>) -> ProgressOutcome {
        let tally = self.tally(batch_id);
        match self.batches.get_mut(batch_id) {
            Some(batch) => {
                let outcome = batch.apply_progress(now);
                if let ProgressOutcome::Completed { .. } = outcome {
                    batch.message = Some(tally.completion_message());
                }
                outcome
            }
            None => ProgressOutcome::AlreadyTerminal,
        }
    }
}

/// In-process batch store used by tests and by local runs without Postgres.
///
/// A single async mutex guards all state, so every operation is atomic with
/// respect to the others.
#[derive(Default)]
pub struct MemoryBatchStore {
    state: Mutex<State>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchRepository for MemoryBatchStore {
    async fn create_batch(
        &self,
        batch: &BatchJob,
        items: &[WebhookResponse],
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if state.batches.contains_key(&batch.id) {
            return Err(AppError::InternalError(format!(
                "batch {} already exists",
                batch.id
            )));
        }
        state.batches.insert(batch.id.clone(), batch.clone());
        for item in items {
            state.items.insert(item.id.clone(), item.clone());
        }
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<Option<BatchJob>, AppError> {
        Ok(self.state.lock().await.batches.get(id).cloned())
    }

    async fn list_batches(&self, filter: &BatchFilter) -> Result<Vec<BatchJob>, AppError> {
        let state = self.state.lock().await;
        let mut batches: Vec<BatchJob> = state
            .batches
            .values()
            .filter(|b| filter.user_id.as_ref().map_or(true, |u| &b.user_id == u))
            .filter(|b| filter.status.map_or(true, |s| b.status == s))
            .filter(|b| filter.provider.map_or(true, |p| b.provider == p))
            .cloned()
            .collect();

        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if filter.limit > 0 {
            batches.truncate(filter.limit as usize);
        }
        Ok(batches)
    }

    async fn delete_batch(&self, id: &str) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        if state.batches.remove(id).is_none() {
            return Ok(false);
        }
        state
            .items
            .retain(|_, item| item.batch_id.as_deref() != Some(id));
        Ok(true)
    }

    async fn list_items(&self, batch_id: &str) -> Result<Vec<WebhookResponse>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .values()
            .filter(|item| item.batch_id.as_deref() == Some(batch_id))
            .cloned()
            .collect())
    }

    async fn tally(&self, batch_id: &str) -> Result<BatchTally, AppError> {
        Ok(self.state.lock().await.tally(batch_id))
    }

    async fn tallies(
        &self,
        batch_ids: &[String],
    ) -> Result<HashMap<String, BatchTally>, AppError> {
        let state = self.state.lock().await;
        let mut tallies: HashMap<String, BatchTally> = batch_ids
            .iter()
            .map(|id| (id.clone(), BatchTally::default()))
            .collect();
        for item in state.items.values() {
            if let Some(tally) = item.batch_id.as_ref().and_then(|id| tallies.get_mut(id)) {
                tally.record(item.status);
            }
        }
        Ok(tallies)
    }

    async fn mark_processing(&self, batch_id: &str) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if let Some(batch) = state.batches.get_mut(batch_id) {
            if batch.status == BatchStatus::Queued {
                batch.status = BatchStatus::Processing;
                batch.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn record_dispatch_failure(
        &self,
        item_id: &str,
        reason: &str,
    ) -> Result<Option<ProgressOutcome>, AppError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let Some(item) = state.items.get_mut(item_id) else {
            return Err(AppError::NotFound(format!("item {} not found", item_id)));
        };
        item.status = ItemStatus::Error;
        item.note = Some(reason.to_string());
        item.updated_at = now;
        if item.counted {
            return Ok(None);
        }
        item.counted = true;
        let batch_id = item.batch_id.clone();

        Ok(batch_id.map(|id| state.progress(&id, now)))
    }

    async fn apply_callback(
        &self,
        correlation_id: &str,
        body: &Value,
        status: ItemStatus,
    ) -> Result<CallbackOutcome, AppError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        if !state.items.contains_key(correlation_id) {
            state.items.insert(
                correlation_id.to_string(),
                WebhookResponse {
                    id: correlation_id.to_string(),
                    batch_id: None,
                    cpf: None,
                    response_body: Some(body.clone()),
                    status: ItemStatus::Error,
                    note: Some(UNKNOWN_ID_NOTE.to_string()),
                    counted: false,
                    created_at: now,
                    updated_at: now,
                },
            );
            return Ok(CallbackOutcome::StoredUnknown);
        }

        let Some(item) = state.items.get_mut(correlation_id) else {
            return Err(AppError::InternalError(format!(
                "item {} vanished while locked",
                correlation_id
            )));
        };
        item.response_body = Some(body.clone());
        item.updated_at = now;
        if item.is_unknown_delivery() {
            return Ok(CallbackOutcome::StoredUnknown);
        }
        item.status = status;

        let Some(batch_id) = item.batch_id.clone() else {
            return Ok(CallbackOutcome::Standalone);
        };
        if item.counted {
            return Ok(CallbackOutcome::AlreadyCounted { batch_id });
        }
        item.counted = true;

        let progress = state.progress(&batch_id, now);
        Ok(CallbackOutcome::Batch { batch_id, progress })
    }

    async fn expire_stale_batches(
        &self,
        cutoff: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<String>, AppError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut expired = Vec::new();
        for batch in state.batches.values_mut() {
            if batch.created_at < cutoff && batch.expire(reason, now) {
                expired.push(batch.id.clone());
            }
        }
        expired.sort();
        Ok(expired)
    }
}
