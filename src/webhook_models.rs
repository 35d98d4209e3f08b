use crate::models::{BatchJob, BatchView, CpfRecord, ItemStatus, Provider, WebhookResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field names providers use to echo the correlation id back.
const CORRELATION_FIELDS: [&str; 3] = ["balanceId", "balance_id", "correlationId"];

/// Field names that carry an error reason.
const ERROR_FIELDS: [&str; 3] = ["errorMessage", "error", "message"];

/// A provider callback body, parsed once at the edge.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackPayload {
    /// Empty body or `{}`: provider connectivity check.
    ConnectivityCheck,
    /// Substantive callback.
    Callback {
        correlation_id: Option<String>,
        body: Value,
    },
}

impl CallbackPayload {
    /// Interpret raw request bytes. Only a JSON syntax error is an `Err`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(CallbackPayload::ConnectivityCheck);
        }

        let body: Value = serde_json::from_slice(bytes)?;
        if body.as_object().is_some_and(|obj| obj.is_empty()) {
            return Ok(CallbackPayload::ConnectivityCheck);
        }

        Ok(CallbackPayload::Callback {
            correlation_id: extract_correlation_id(&body),
            body,
        })
    }
}

/// Correlation id as a string; numeric ids are accepted too.
pub fn extract_correlation_id(body: &Value) -> Option<String> {
    let obj = body.as_object()?;
    CORRELATION_FIELDS.iter().find_map(|field| match obj.get(*field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Outcome a provider reported for one item.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Success,
    Error(String),
    /// Neither a balance nor an error yet (intermediate notification).
    Received,
}

impl Classification {
    pub fn item_status(&self) -> ItemStatus {
        match self {
            Classification::Success => ItemStatus::Success,
            Classification::Error(_) => ItemStatus::Error,
            Classification::Received => ItemStatus::Received,
        }
    }
}

/// Classify a callback body.
///
/// Error signals win over a balance; anything without either falls back to
/// `Received`.
pub fn classify(body: &Value) -> Classification {
    let Some(obj) = body.as_object() else {
        return Classification::Received;
    };

    for field in ERROR_FIELDS {
        match obj.get(field) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => {}
            Some(Value::String(s)) if s.trim().is_empty() => {}
            Some(Value::String(s)) => return Classification::Error(s.trim().to_string()),
            Some(other) => return Classification::Error(other.to_string()),
        }
    }

    if let Some(Value::String(status)) = obj.get("status") {
        let status = status.to_ascii_lowercase();
        if status == "error" || status == "failed" {
            return Classification::Error(format!("provider status '{}'", status));
        }
    }

    match obj.get("balance") {
        None | Some(Value::Null) => Classification::Received,
        Some(_) => Classification::Success,
    }
}

/// `{status, message}` envelope returned by the webhook and action endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusEnvelope {
    pub status: String,
    pub message: String,
}

impl StatusEnvelope {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
        }
    }
}

/// Body of `POST /api/batches`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBatchRequest {
    pub cpfs: Vec<CpfRecord>,
    pub provider: Provider,
    #[serde(default)]
    pub file_name: Option<String>,
    /// Must match the caller unless the caller is an admin.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBatchResponse {
    pub status: String,
    pub batch: BatchJob,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchListResponse {
    pub status: String,
    pub batches: Vec<BatchView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatusResponse {
    pub status: String,
    pub batch: BatchView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemsResponse {
    pub status: String,
    pub items: Vec<WebhookResponse>,
}

/// Query string of `GET /api/batches`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchListQuery {
    pub status: Option<String>,
    pub provider: Option<String>,
    pub limit: Option<i64>,
}
