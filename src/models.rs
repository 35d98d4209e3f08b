use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============ Enumerations ============

/// Credit-bureau provider a batch is queried against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// FGTS balance via V8.
    V8,
    /// FGTS balance via Facta.
    Facta,
    /// CLT payroll-loan offers via C6.
    C6,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::V8, Provider::Facta, Provider::C6];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::V8 => "v8",
            Provider::Facta => "facta",
            Provider::C6 => "c6",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v8" => Ok(Provider::V8),
            "facta" => Ok(Provider::Facta),
            "c6" => Ok(Provider::C6),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

/// Aggregate status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Queued,
    Processing,
    Completed,
    Error,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Queued => "queued",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Error => "error",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(BatchStatus::Queued),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            "error" => Ok(BatchStatus::Error),
            other => Err(format!("unknown batch status '{}'", other)),
        }
    }
}

/// Status of one dispatched item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Placeholder, or a callback that carried neither a balance nor an error.
    Received,
    Success,
    Error,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Received => "received",
            ItemStatus::Success => "success",
            ItemStatus::Error => "error",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(ItemStatus::Received),
            "success" => Ok(ItemStatus::Success),
            "error" => Ok(ItemStatus::Error),
            other => Err(format!("unknown item status '{}'", other)),
        }
    }
}

// ============ Records ============

/// One spreadsheet row submitted for lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpfRecord {
    pub cpf: String,
    #[serde(default)]
    pub nome: Option<String>,
    /// `dd/mm/yyyy` or `yyyy-mm-dd` on input, `yyyy-mm-dd` once validated.
    #[serde(default)]
    pub data_nascimento: Option<String>,
    /// E.164 once validated.
    #[serde(default)]
    pub telefone: Option<String>,
}

impl CpfRecord {
    pub fn new(cpf: impl Into<String>) -> Self {
        Self {
            cpf: cpf.into(),
            nome: None,
            data_nascimento: None,
            telefone: None,
        }
    }
}

/// A user-submitted batch of CPFs queried against one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    pub id: String,
    pub provider: Provider,
    pub file_name: String,
    pub cpfs: Vec<String>,
    pub total_cpfs: i32,
    pub processed_cpfs: i32,
    pub status: BatchStatus,
    pub message: Option<String>,
    pub user_id: String,
    pub user_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// What a single progress step did to a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOutcome {
    /// Counter moved but the batch is still open.
    Advanced { processed: i32, total: i32 },
    /// This step accounted for the last item.
    Completed { total: i32 },
    /// Batch was already terminal; nothing changed.
    AlreadyTerminal,
}

impl BatchJob {
    /// Builds a freshly queued batch owned by `user_id`.
    pub fn new(
        provider: Provider,
        file_name: String,
        cpfs: Vec<String>,
        user_id: String,
        user_email: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_batch_id(now),
            provider,
            file_name,
            total_cpfs: cpfs.len() as i32,
            cpfs,
            processed_cpfs: 0,
            status: BatchStatus::Queued,
            message: None,
            user_id,
            user_email,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// A batch is terminal once it completed, or errored with every item
    /// accounted for or with `completed_at` already stamped (reaped).
    pub fn is_terminal(&self) -> bool {
        match self.status {
            BatchStatus::Completed => true,
            BatchStatus::Error => {
                self.processed_cpfs >= self.total_cpfs || self.completed_at.is_some()
            }
            BatchStatus::Queued | BatchStatus::Processing => false,
        }
    }

    /// Counts one more item as accounted for.
    ///
    /// This is the only place the counter moves; stores call it while holding
    /// the batch row lock so concurrent callbacks never double count.
    pub fn apply_progress(&mut self, now: DateTime<Utc>) -> ProgressOutcome {
        if self.is_terminal() {
            return ProgressOutcome::AlreadyTerminal;
        }

        self.processed_cpfs = (self.processed_cpfs + 1).min(self.total_cpfs);
        self.updated_at = now;

        if self.processed_cpfs >= self.total_cpfs {
            self.status = BatchStatus::Completed;
            self.completed_at = Some(now);
            ProgressOutcome::Completed {
                total: self.total_cpfs,
            }
        } else {
            if self.status == BatchStatus::Queued {
                self.status = BatchStatus::Processing;
            }
            ProgressOutcome::Advanced {
                processed: self.processed_cpfs,
                total: self.total_cpfs,
            }
        }
    }

    /// Marks an open batch as expired. Returns false when it was already terminal.
    pub fn expire(&mut self, reason: &str, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = BatchStatus::Error;
        self.message = Some(reason.to_string());
        self.completed_at = Some(now);
        self.updated_at = now;
        true
    }
}

/// Note stored on callbacks whose correlation id matches no dispatched item.
pub const UNKNOWN_ID_NOTE: &str = "unknown correlation id";

/// Per-item record of a dispatched lookup and the provider's latest answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    /// Correlation id echoed back by the provider.
    pub id: String,
    pub batch_id: Option<String>,
    pub cpf: Option<String>,
    pub response_body: Option<serde_json::Value>,
    pub status: ItemStatus,
    pub note: Option<String>,
    /// Whether this item already advanced its batch counter.
    pub counted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookResponse {
    /// Record created for a callback whose correlation id matched nothing.
    pub fn is_unknown_delivery(&self) -> bool {
        self.batch_id.is_none() && self.note.as_deref() == Some(UNKNOWN_ID_NOTE)
    }

    /// Empty placeholder created at dispatch time.
    pub fn placeholder(id: String, batch_id: &str, cpf: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            batch_id: Some(batch_id.to_string()),
            cpf: Some(cpf.to_string()),
            response_body: None,
            status: ItemStatus::Received,
            note: None,
            counted: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Correlation id for item `index` of `batch_id`.
pub fn correlation_id(batch_id: &str, index: usize) -> String {
    format!("{}.{:05}", batch_id, index)
}

fn new_batch_id(now: DateTime<Utc>) -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("batch-{}-{}", now.timestamp_millis(), &random[..8])
}

// ============ Derived views ============

/// Success / error split of a batch's items.
///
/// Completion only says every item was accounted for; this is how callers tell
/// "all succeeded" apart from "all answered".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTally {
    pub success: i64,
    pub error: i64,
    pub pending: i64,
}

impl BatchTally {
    pub fn record(&mut self, status: ItemStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: ItemStatus, count: i64) {
        match status {
            ItemStatus::Success => self.success += count,
            ItemStatus::Error => self.error += count,
            ItemStatus::Received => self.pending += count,
        }
    }

    /// Message stored on a batch when its last item is accounted for.
    pub fn completion_message(&self) -> String {
        format!(
            "Batch completed: {} success, {} error, {} without result",
            self.success, self.error, self.pending
        )
    }
}

/// Batch snapshot plus its tally, as returned to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchView {
    #[serde(flatten)]
    pub batch: BatchJob,
    pub tally: BatchTally,
    pub all_accounted: bool,
    pub all_succeeded: bool,
}

impl BatchView {
    pub fn new(batch: BatchJob, tally: BatchTally) -> Self {
        let all_accounted = batch.processed_cpfs >= batch.total_cpfs;
        let all_succeeded = tally.success >= i64::from(batch.total_cpfs);
        Self {
            batch,
            tally,
            all_accounted,
            all_succeeded,
        }
    }
}

/// Listing criteria for batches.
#[derive(Debug, Clone, Default)]
pub struct BatchFilter {
    /// Restrict to one owner; `None` lists every user's batches (admin).
    pub user_id: Option<String>,
    pub status: Option<BatchStatus>,
    pub provider: Option<Provider>,
    pub limit: i64,
}
