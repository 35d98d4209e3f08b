use crate::errors::AppError;
use crate::handlers::AppState;
use crate::models::ProgressOutcome;
use crate::repository::CallbackOutcome;
use crate::webhook_models::{classify, CallbackPayload, Classification, StatusEnvelope};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;

/// Balance Webhook Handler
///
/// Receives asynchronous answers from V8, Facta and C6 for items dispatched
/// by a batch. Every accepted callback is stored, even when its correlation id
/// is unknown, and acknowledged with 200 so providers do not retry.
///
/// Expected payload: provider JSON carrying `balanceId`; `{}` or an empty body
/// is a connectivity check.
/// Authentication: X-Webhook-Token header must match WEBHOOK_SECRET when set.
pub async fn balance_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<StatusEnvelope>), AppError> {
    validate_webhook_secret(&state, &headers)?;

    let payload = CallbackPayload::from_bytes(&body).map_err(|e| {
        AppError::InternalError(format!("Failed to parse webhook body: {}", e))
    })?;

    let (correlation_id, body) = match payload {
        CallbackPayload::ConnectivityCheck => {
            tracing::debug!("Balance webhook connectivity check received");
            return Ok((
                StatusCode::OK,
                Json(StatusEnvelope::success("Webhook reachable")),
            ));
        }
        CallbackPayload::Callback {
            correlation_id: None,
            ..
        } => {
            tracing::warn!("Balance webhook without correlation id rejected");
            return Err(AppError::BadRequest(
                "Missing balanceId in callback body".to_string(),
            ));
        }
        CallbackPayload::Callback {
            correlation_id: Some(id),
            body,
        } => (id, body),
    };

    let classification = classify(&body);
    if let Classification::Error(ref reason) = classification {
        tracing::info!("Callback {} reported error: {}", correlation_id, reason);
    }

    let outcome = state
        .store
        .apply_callback(&correlation_id, &body, classification.item_status())
        .await?;

    match outcome {
        CallbackOutcome::StoredUnknown => {
            tracing::warn!(
                "Callback for unknown correlation id {} stored as error",
                correlation_id
            );
        }
        CallbackOutcome::Standalone => {
            tracing::debug!("Stored standalone callback {}", correlation_id);
        }
        CallbackOutcome::AlreadyCounted { ref batch_id } => {
            tracing::debug!(
                "Callback {} already counted for batch {}, body refreshed",
                correlation_id,
                batch_id
            );
        }
        CallbackOutcome::Batch {
            ref batch_id,
            progress,
        } => match progress {
            ProgressOutcome::Advanced { processed, total } => tracing::info!(
                "Batch {} progressed: {}/{} ({})",
                batch_id,
                processed,
                total,
                classification.item_status()
            ),
            ProgressOutcome::Completed { total } => {
                tracing::info!("Batch {} completed ({} CPFs)", batch_id, total)
            }
            ProgressOutcome::AlreadyTerminal => tracing::debug!(
                "Batch {} already terminal, callback {} ignored for progress",
                batch_id,
                correlation_id
            ),
        },
    }

    Ok((
        StatusCode::OK,
        Json(StatusEnvelope::success("Callback stored")),
    ))
}

/// GET on the webhook path: liveness check for provider configuration screens.
pub async fn balance_webhook_liveness() -> (StatusCode, Json<StatusEnvelope>) {
    (
        StatusCode::OK,
        Json(StatusEnvelope::success("Balance webhook is up")),
    )
}

/// Validate webhook secret from X-Webhook-Token header
fn validate_webhook_secret(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    // If no secret is configured, skip validation (warn was already logged at startup)
    let Some(ref expected_secret) = state.config.webhook_secret else {
        return Ok(());
    };

    let token = headers
        .get("x-webhook-token")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing X-Webhook-Token header".to_string()))?;

    if !constant_time_compare(token, expected_secret) {
        tracing::warn!("Invalid webhook token received");
        return Err(AppError::Unauthorized("Invalid webhook token".to_string()));
    }

    Ok(())
}

/// Constant-time string comparison
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
