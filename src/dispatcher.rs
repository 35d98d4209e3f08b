//! Batch submission and provider fan-out.
//!
//! Submitting a batch:
//! 1. Validate and normalize the rows for the chosen provider
//! 2. Return the existing batch for an identical recent submission
//! 3. Store the batch and one `received` placeholder per CPF atomically
//! 4. Spawn the fan-out: one request per CPF, bounded concurrency
//! 5. Count synchronous dispatch failures toward progress so the batch can
//!    still reach a terminal state
use crate::config::MAX_BATCH_SIZE_LIMIT;
use crate::errors::{AppError, ResultExt};
use crate::models::{correlation_id, BatchJob, CpfRecord, Provider, WebhookResponse};
use crate::providers::{DispatchRequest, ProviderClient, ProviderRegistry};
use crate::repository::BatchRepository;
use crate::validation::validate_records;
use chrono::Utc;
use moka::future::Cache;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

/// Who is submitting and what.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub records: Vec<CpfRecord>,
    pub provider: Provider,
    pub user_id: String,
    pub user_email: Option<String>,
    pub file_name: String,
}

/// Result of a submission.
pub struct Submission {
    pub batch: BatchJob,
    /// True when an identical recent submission was returned instead.
    pub duplicate: bool,
    /// Fan-out task; `None` for duplicates.
    pub dispatch: Option<JoinHandle<DispatchSummary>>,
}

/// How many requests the provider accepted synchronously.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub sent: usize,
    pub failed: usize,
}

pub struct Dispatcher {
    store: Arc<dyn BatchRepository>,
    providers: ProviderRegistry,
    callback_url: String,
    concurrency: usize,
    max_batch_size: usize,
    /// Submission fingerprint -> batch id.
    recent_submissions: Cache<String, String>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn BatchRepository>,
        providers: ProviderRegistry,
        callback_url: String,
        concurrency: usize,
        max_batch_size: usize,
        dedup_ttl: Duration,
    ) -> Self {
        let recent_submissions = Cache::builder()
            .time_to_live(dedup_ttl)
            .max_capacity(10_000)
            .build();

        Self {
            store,
            providers,
            callback_url,
            concurrency: concurrency.max(1),
            max_batch_size: max_batch_size.min(MAX_BATCH_SIZE_LIMIT),
            recent_submissions,
        }
    }

    pub async fn submit(&self, new_batch: NewBatch) -> Result<Submission, AppError> {
        let client = self.providers.get(new_batch.provider).ok_or_else(|| {
            AppError::BadRequest(format!(
                "Provider {} is not enabled",
                new_batch.provider
            ))
        })?;

        let records =
            validate_records(&new_batch.records, new_batch.provider, self.max_batch_size)?;
        let cpfs: Vec<String> = records.iter().map(|r| r.cpf.clone()).collect();

        let fingerprint = submission_fingerprint(&new_batch.user_id, new_batch.provider, &cpfs);

        let file_name = match new_batch.file_name.trim() {
            "" => "upload".to_string(),
            name => name.to_string(),
        };
        let batch = BatchJob::new(
            new_batch.provider,
            file_name,
            cpfs,
            new_batch.user_id,
            new_batch.user_email,
        );

        let now = Utc::now();
        let requests: Vec<DispatchRequest> = records
            .into_iter()
            .enumerate()
            .map(|(idx, record)| DispatchRequest {
                correlation_id: correlation_id(&batch.id, idx),
                record,
                callback_url: self.callback_url.clone(),
            })
            .collect();
        let items: Vec<WebhookResponse> = requests
            .iter()
            .map(|r| {
                WebhookResponse::placeholder(r.correlation_id.clone(), &batch.id, &r.record.cpf, now)
            })
            .collect();

        // Concurrent identical submissions wait on the same entry; only the
        // first one runs the insert and creates the batch.
        loop {
            let claim = self
                .recent_submissions
                .entry(fingerprint.clone())
                .or_try_insert_with(async {
                    self.store
                        .create_batch(&batch, &items)
                        .await
                        .context("Failed to create batch")?;
                    Ok::<_, AppError>(batch.id.clone())
                })
                .await
                .map_err(unshare_error)?;

            if claim.is_fresh() {
                break;
            }

            let existing_id = claim.into_value();
            if let Some(existing) = self.store.get_batch(&existing_id).await? {
                tracing::info!(
                    "Duplicate submission from user {} returned existing batch {}",
                    existing.user_id,
                    existing.id
                );
                return Ok(Submission {
                    batch: existing,
                    duplicate: true,
                    dispatch: None,
                });
            }
            // Deleted since it was submitted; forget it and claim again
            self.recent_submissions.invalidate(&fingerprint).await;
        }

        tracing::info!(
            "Created batch {} ({} CPFs, provider={}, file={})",
            batch.id,
            batch.total_cpfs,
            batch.provider,
            batch.file_name
        );

        let dispatch = tokio::spawn(fan_out(
            self.store.clone(),
            client,
            batch.id.clone(),
            requests,
            self.concurrency,
        ));

        Ok(Submission {
            batch,
            duplicate: false,
            dispatch: Some(dispatch),
        })
    }
}

/// Errors from the dedup cache come back shared between waiting callers.
fn unshare_error(error: Arc<AppError>) -> AppError {
    Arc::try_unwrap(error).unwrap_or_else(|shared| AppError::InternalError(shared.to_string()))
}

/// SHA-256 over owner, provider and the ordered CPF list.
fn submission_fingerprint(user_id: &str, provider: Provider, cpfs: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b"|");
    hasher.update(provider.as_str().as_bytes());
    for cpf in cpfs {
        hasher.update(b"|");
        hasher.update(cpf.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Send every request of a batch, at most `concurrency` in flight.
async fn fan_out(
    store: Arc<dyn BatchRepository>,
    client: Arc<dyn ProviderClient>,
    batch_id: String,
    requests: Vec<DispatchRequest>,
    concurrency: usize,
) -> DispatchSummary {
    if let Err(e) = store.mark_processing(&batch_id).await {
        tracing::error!("Failed to mark batch {} as processing: {}", batch_id, e);
    }

    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut tasks = JoinSet::new();

    for request in requests {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let store = store.clone();
        let client = client.clone();
        tasks.spawn(async move {
            let _permit = permit;
            match client.dispatch(&request).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        "Dispatch of {} to {} failed: {}",
                        request.correlation_id,
                        client.provider(),
                        e
                    );
                    if let Err(store_err) = store
                        .record_dispatch_failure(&request.correlation_id, &e.to_string())
                        .await
                    {
                        tracing::error!(
                            "Failed to record dispatch failure for {}: {}",
                            request.correlation_id,
                            store_err
                        );
                    }
                    false
                }
            }
        });
    }

    let mut summary = DispatchSummary::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(true) => summary.sent += 1,
            Ok(false) => summary.failed += 1,
            Err(e) => {
                tracing::error!("Dispatch task for batch {} panicked: {}", batch_id, e);
                summary.failed += 1;
            }
        }
    }

    tracing::info!(
        "Batch {} dispatched: {} sent, {} failed",
        batch_id,
        summary.sent,
        summary.failed
    );
    summary
}
