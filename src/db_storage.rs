use crate::errors::{AppError, ResultExt};
use crate::models::{
    BatchFilter, BatchJob, BatchTally, ItemStatus, ProgressOutcome, WebhookResponse,
};
use crate::repository::{BatchRepository, CallbackOutcome, UNKNOWN_ID_NOTE};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use sqlx::{FromRow, PgPool, Postgres, Transaction};

/// Postgres-backed batch store.
///
/// Progress is always applied inside a transaction that holds the item row
/// and then the batch row with `SELECT ... FOR UPDATE`, in that order, so
/// concurrent callbacks on one batch serialize while different batches run in
/// parallel.
pub struct PgBatchStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct BatchRow {
    id: String,
    provider: String,
    file_name: String,
    cpfs: Vec<String>,
    total_cpfs: i32,
    processed_cpfs: i32,
    status: String,
    message: Option<String>,
    user_id: String,
    user_email: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<BatchRow> for BatchJob {
    type Error = AppError;

    fn try_from(row: BatchRow) -> Result<Self, Self::Error> {
        Ok(BatchJob {
            provider: row.provider.parse().map_err(AppError::InternalError)?,
            status: row.status.parse().map_err(AppError::InternalError)?,
            id: row.id,
            file_name: row.file_name,
            cpfs: row.cpfs,
            total_cpfs: row.total_cpfs,
            processed_cpfs: row.processed_cpfs,
            message: row.message,
            user_id: row.user_id,
            user_email: row.user_email,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ItemRow {
    id: String,
    batch_id: Option<String>,
    cpf: Option<String>,
    response_body: Option<Value>,
    status: String,
    note: Option<String>,
    counted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ItemRow> for WebhookResponse {
    type Error = AppError;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        Ok(WebhookResponse {
            status: row.status.parse().map_err(AppError::InternalError)?,
            id: row.id,
            batch_id: row.batch_id,
            cpf: row.cpf,
            response_body: row.response_body,
            note: row.note,
            counted: row.counted,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const BATCH_COLUMNS: &str = "id, provider, file_name, cpfs, total_cpfs, processed_cpfs, status, \
     message, user_id, user_email, created_at, updated_at, completed_at";

impl PgBatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn tally_in(
        tx: &mut Transaction<'_, Postgres>,
        batch_id: &str,
    ) -> Result<BatchTally, AppError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM webhook_responses WHERE batch_id = $1 GROUP BY status",
        )
        .bind(batch_id)
        .fetch_all(&mut **tx)
        .await
        .context("Failed to tally batch items")?;

        let mut tally = BatchTally::default();
        for (status, count) in rows {
            let status: ItemStatus = status.parse().map_err(AppError::InternalError)?;
            tally.add(status, count);
        }
        Ok(tally)
    }

    /// Lock the batch row, apply one progress step and persist the result.
    async fn progress_in(
        tx: &mut Transaction<'_, Postgres>,
        batch_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ProgressOutcome, AppError> {
        let row = sqlx::query_as::<_, BatchRow>(&format!(
            "SELECT {} FROM batch_jobs WHERE id = $1 FOR UPDATE",
            BATCH_COLUMNS
        ))
        .bind(batch_id)
        .fetch_optional(&mut **tx)
        .await
        .context("Failed to lock batch row")?;

        let Some(row) = row else {
            tracing::warn!("Item references missing batch {}", batch_id);
            return Ok(ProgressOutcome::AlreadyTerminal);
        };
        let mut batch = BatchJob::try_from(row)?;

        let outcome = batch.apply_progress(now);
        if outcome == ProgressOutcome::AlreadyTerminal {
            return Ok(outcome);
        }
        if let ProgressOutcome::Completed { .. } = outcome {
            batch.message = Some(Self::tally_in(tx, batch_id).await?.completion_message());
        }

        sqlx::query(
            r#"
            UPDATE batch_jobs
            SET processed_cpfs = $2,
                status = $3,
                message = $4,
                completed_at = $5,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(&batch.id)
        .bind(batch.processed_cpfs)
        .bind(batch.status.as_str())
        .bind(&batch.message)
        .bind(batch.completed_at)
        .bind(batch.updated_at)
        .execute(&mut **tx)
        .await
        .context("Failed to update batch progress")?;

        Ok(outcome)
    }
}

#[async_trait]
impl BatchRepository for PgBatchStore {
    async fn create_batch(
        &self,
        batch: &BatchJob,
        items: &[WebhookResponse],
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(
            r#"
            INSERT INTO batch_jobs (
                id, provider, file_name, cpfs, total_cpfs, processed_cpfs, status,
                message, user_id, user_email, created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(&batch.id)
        .bind(batch.provider.as_str())
        .bind(&batch.file_name)
        .bind(&batch.cpfs)
        .bind(batch.total_cpfs)
        .bind(batch.processed_cpfs)
        .bind(batch.status.as_str())
        .bind(&batch.message)
        .bind(&batch.user_id)
        .bind(&batch.user_email)
        .bind(batch.created_at)
        .bind(batch.updated_at)
        .bind(batch.completed_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert batch")?;

        let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        let cpfs: Vec<Option<String>> = items.iter().map(|i| i.cpf.clone()).collect();

        // Placeholders all start out as empty `received` rows.
        sqlx::query(
            r#"
            INSERT INTO webhook_responses (id, batch_id, cpf, status, counted, created_at, updated_at)
            SELECT t.id, $3, t.cpf, 'received', false, $4, $4
            FROM UNNEST($1::text[], $2::text[]) AS t(id, cpf)
            "#,
        )
        .bind(&ids)
        .bind(&cpfs)
        .bind(&batch.id)
        .bind(batch.created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert batch items")?;

        tx.commit().await.context("Failed to commit batch")?;

        tracing::info!(
            "Stored batch {} with {} item placeholders",
            batch.id,
            items.len()
        );
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<Option<BatchJob>, AppError> {
        sqlx::query_as::<_, BatchRow>(&format!(
            "SELECT {} FROM batch_jobs WHERE id = $1",
            BATCH_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch batch")?
        .map(BatchJob::try_from)
        .transpose()
    }

    async fn list_batches(&self, filter: &BatchFilter) -> Result<Vec<BatchJob>, AppError> {
        let limit = if filter.limit > 0 { filter.limit } else { 100 };

        let rows = sqlx::query_as::<_, BatchRow>(&format!(
            r#"
            SELECT {}
            FROM batch_jobs
            WHERE ($1::text IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR provider = $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            "#,
            BATCH_COLUMNS
        ))
        .bind(&filter.user_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.provider.map(|p| p.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list batches")?;

        rows.into_iter().map(BatchJob::try_from).collect()
    }

    async fn delete_batch(&self, id: &str) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        // Items first, matching the lock order used by callbacks.
        sqlx::query("SELECT id FROM webhook_responses WHERE batch_id = $1 ORDER BY id FOR UPDATE")
            .bind(id)
            .fetch_all(&mut *tx)
            .await
            .context("Failed to lock batch items")?;

        sqlx::query("DELETE FROM webhook_responses WHERE batch_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete batch items")?;

        let result = sqlx::query("DELETE FROM batch_jobs WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete batch")?;

        tx.commit().await.context("Failed to commit batch deletion")?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_items(&self, batch_id: &str) -> Result<Vec<WebhookResponse>, AppError> {
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT id, batch_id, cpf, response_body, status, note, counted, created_at, updated_at
            FROM webhook_responses
            WHERE batch_id = $1
            ORDER BY id
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list batch items")?;

        rows.into_iter().map(WebhookResponse::try_from).collect()
    }

    async fn tally(&self, batch_id: &str) -> Result<BatchTally, AppError> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let tally = Self::tally_in(&mut tx, batch_id).await?;
        tx.commit().await.context("Failed to commit tally")?;
        Ok(tally)
    }

    async fn tallies(
        &self,
        batch_ids: &[String],
    ) -> Result<HashMap<String, BatchTally>, AppError> {
        let mut tallies: HashMap<String, BatchTally> = batch_ids
            .iter()
            .map(|id| (id.clone(), BatchTally::default()))
            .collect();
        if batch_ids.is_empty() {
            return Ok(tallies);
        }

        let rows = sqlx::query_as::<_, (String, String, i64)>(
            "SELECT batch_id, status, COUNT(*) FROM webhook_responses \
             WHERE batch_id = ANY($1) GROUP BY batch_id, status",
        )
        .bind(batch_ids)
        .fetch_all(&self.pool)
        .await
        .context("Failed to tally batch items")?;

        for (batch_id, status, count) in rows {
            let status: ItemStatus = status.parse().map_err(AppError::InternalError)?;
            tallies.entry(batch_id).or_default().add(status, count);
        }
        Ok(tallies)
    }

    async fn mark_processing(&self, batch_id: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE batch_jobs SET status = 'processing', updated_at = now() \
             WHERE id = $1 AND status = 'queued'",
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark batch as processing")?;
        Ok(())
    }

    async fn record_dispatch_failure(
        &self,
        item_id: &str,
        reason: &str,
    ) -> Result<Option<ProgressOutcome>, AppError> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let now = Utc::now();

        let existing = sqlx::query_as::<_, (Option<String>, bool)>(
            "SELECT batch_id, counted FROM webhook_responses WHERE id = $1 FOR UPDATE",
        )
        .bind(item_id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to lock item")?;

        let Some((batch_id, counted)) = existing else {
            return Err(AppError::NotFound(format!("item {} not found", item_id)));
        };

        sqlx::query(
            r#"
            UPDATE webhook_responses
            SET status = 'error', note = $2, counted = (counted OR batch_id IS NOT NULL), updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(item_id)
        .bind(reason)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to mark item as failed")?;

        let progress = match batch_id {
            Some(ref id) if !counted => Some(Self::progress_in(&mut tx, id, now).await?),
            _ => None,
        };

        tx.commit().await.context("Failed to commit dispatch failure")?;
        Ok(progress)
    }

    async fn apply_callback(
        &self,
        correlation_id: &str,
        body: &Value,
        status: ItemStatus,
    ) -> Result<CallbackOutcome, AppError> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let now = Utc::now();

        let existing = sqlx::query_as::<_, (Option<String>, bool, Option<String>)>(
            "SELECT batch_id, counted, note FROM webhook_responses WHERE id = $1 FOR UPDATE",
        )
        .bind(correlation_id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to lock item")?;

        let known = existing.filter(|(batch_id, _, note)| {
            batch_id.is_some() || note.as_deref() != Some(UNKNOWN_ID_NOTE)
        });
        let Some((batch_id, counted, _)) = known else {
            // New or repeated unknown delivery: keep the latest body, status stays `error`.
            // Two first deliveries may race here; the later body wins.
            sqlx::query(
                r#"
                INSERT INTO webhook_responses (id, batch_id, cpf, response_body, status, note, counted, created_at, updated_at)
                VALUES ($1, NULL, NULL, $2, 'error', $3, false, $4, $4)
                ON CONFLICT (id) DO UPDATE
                SET response_body = EXCLUDED.response_body, updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(correlation_id)
            .bind(body)
            .bind(UNKNOWN_ID_NOTE)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("Failed to store unknown callback")?;

            tx.commit().await.context("Failed to commit unknown callback")?;
            return Ok(CallbackOutcome::StoredUnknown);
        };

        sqlx::query(
            r#"
            UPDATE webhook_responses
            SET response_body = $2, status = $3, counted = (counted OR batch_id IS NOT NULL), updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(correlation_id)
        .bind(body)
        .bind(status.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to update item")?;

        let outcome = match batch_id {
            None => CallbackOutcome::Standalone,
            Some(batch_id) if counted => CallbackOutcome::AlreadyCounted { batch_id },
            Some(batch_id) => {
                let progress = Self::progress_in(&mut tx, &batch_id, now).await?;
                CallbackOutcome::Batch { batch_id, progress }
            }
        };

        tx.commit().await.context("Failed to commit callback")?;
        Ok(outcome)
    }

    async fn expire_stale_batches(
        &self,
        cutoff: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<String>, AppError> {
        let mut ids = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE batch_jobs
            SET status = 'error', message = $2, completed_at = now(), updated_at = now()
            WHERE status IN ('queued', 'processing') AND created_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .bind(reason)
        .fetch_all(&self.pool)
        .await
        .context("Failed to expire stale batches")?;

        ids.sort();
        Ok(ids)
    }
}
