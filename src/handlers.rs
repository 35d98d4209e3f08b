use crate::config::Config;
use crate::dispatcher::{Dispatcher, NewBatch};
use crate::errors::AppError;
use crate::models::{BatchFilter, BatchJob, BatchStatus, BatchView, Provider};
use crate::repository::BatchRepository;
use crate::webhook_handler;
use crate::webhook_models::{
    BatchItemsResponse, BatchListQuery, BatchListResponse, BatchStatusResponse, StatusEnvelope,
    SubmitBatchRequest, SubmitBatchResponse,
};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequestParts, Path, Query, State,
    },
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Batch and webhook-response persistence.
    pub store: Arc<dyn BatchRepository>,
    /// Application configuration.
    pub config: Config,
    /// Creates batches and fans requests out to providers.
    pub dispatcher: Arc<Dispatcher>,
}

const DEFAULT_LIST_LIMIT: i64 = 100;
const MAX_LIST_LIMIT: i64 = 500;

/// Authenticated caller, as asserted by the upstream auth layer.
///
/// `X-User-Id` is required; `X-User-Role: admin` grants access to every
/// user's batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub user_email: Option<String>,
    pub is_admin: bool,
}

impl Caller {
    fn can_access(&self, batch: &BatchJob) -> bool {
        self.is_admin || batch.user_id == self.user_id
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let user_id = header("x-user-id")
            .ok_or_else(|| AppError::Unauthorized("Missing X-User-Id header".to_string()))?;
        let is_admin = header("x-user-role").is_some_and(|role| role.eq_ignore_ascii_case("admin"));

        Ok(Caller {
            user_id,
            user_email: header("x-user-email"),
            is_admin,
        })
    }
}

/// Health check endpoint.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "lhamascred-api",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// POST /api/batches
///
/// Validates the uploaded rows, creates the batch and starts dispatching it.
/// An identical submission from the same user within the dedup window returns
/// the existing batch with 200 instead of 201.
pub async fn submit_batch(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    payload: Result<Json<SubmitBatchRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitBatchResponse>), AppError> {
    let Json(request) = payload?;
    tracing::info!(
        "POST /batches - user={}, provider={}, rows={}",
        caller.user_id,
        request.provider,
        request.cpfs.len()
    );

    let (user_id, user_email) = match request.user_id {
        Some(ref requested) if requested != &caller.user_id => {
            if !caller.is_admin {
                return Err(AppError::Unauthorized(format!(
                    "user {} cannot submit batches for {}",
                    caller.user_id, requested
                )));
            }
            (requested.clone(), request.user_email.clone())
        }
        _ => (
            caller.user_id.clone(),
            caller.user_email.clone().or(request.user_email.clone()),
        ),
    };

    let submission = state
        .dispatcher
        .submit(NewBatch {
            records: request.cpfs,
            provider: request.provider,
            user_id,
            user_email,
            file_name: request.file_name.unwrap_or_default(),
        })
        .await?;

    let (status, message) = if submission.duplicate {
        (
            StatusCode::OK,
            "Identical batch submitted recently; returning the existing batch".to_string(),
        )
    } else {
        (
            StatusCode::CREATED,
            format!(
                "Batch created; dispatching {} CPFs",
                submission.batch.total_cpfs
            ),
        )
    };

    Ok((
        status,
        Json(SubmitBatchResponse {
            status: "success".to_string(),
            batch: submission.batch,
            message: Some(message),
        }),
    ))
}

/// GET /api/batches
///
/// Newest first. Admins see every user's batches.
pub async fn list_batches(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    query: Result<Query<BatchListQuery>, QueryRejection>,
) -> Result<Json<BatchListResponse>, AppError> {
    let Query(query) = query?;
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<BatchStatus>)
        .transpose()
        .map_err(AppError::BadRequest)?;
    let provider = query
        .provider
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<Provider>)
        .transpose()
        .map_err(AppError::BadRequest)?;

    let filter = BatchFilter {
        user_id: (!caller.is_admin).then(|| caller.user_id.clone()),
        status,
        provider,
        limit: query
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT),
    };

    let batches = state.store.list_batches(&filter).await?;
    let ids: Vec<String> = batches.iter().map(|b| b.id.clone()).collect();
    let mut tallies = state.store.tallies(&ids).await?;
    let views: Vec<BatchView> = batches
        .into_iter()
        .map(|batch| {
            let tally = tallies.remove(&batch.id).unwrap_or_default();
            BatchView::new(batch, tally)
        })
        .collect();

    tracing::debug!("Listed {} batches for {}", views.len(), caller.user_id);

    Ok(Json(BatchListResponse {
        status: "success".to_string(),
        batches: views,
    }))
}

/// Loads a batch the caller may see. Other users' batches read as missing.
async fn load_visible_batch(
    state: &AppState,
    caller: &Caller,
    batch_id: &str,
) -> Result<BatchJob, AppError> {
    state
        .store
        .get_batch(batch_id)
        .await?
        .filter(|batch| caller.can_access(batch))
        .ok_or_else(|| AppError::NotFound(format!("Batch {} not found", batch_id)))
}

/// GET /api/batches/:id
pub async fn get_batch_status(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchStatusResponse>, AppError> {
    let batch = load_visible_batch(&state, &caller, &batch_id).await?;
    let tally = state.store.tally(&batch.id).await?;

    Ok(Json(BatchStatusResponse {
        status: "success".to_string(),
        batch: BatchView::new(batch, tally),
    }))
}

/// DELETE /api/batches/:id
///
/// Removes the batch and its items. A batch that is already gone is reported
/// as 404, not treated as a failure of the service.
pub async fn delete_batch(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(batch_id): Path<String>,
) -> Result<Json<StatusEnvelope>, AppError> {
    load_visible_batch(&state, &caller, &batch_id).await?;

    if !state.store.delete_batch(&batch_id).await? {
        return Err(AppError::NotFound(format!("Batch {} not found", batch_id)));
    }

    tracing::info!("Batch {} deleted by {}", batch_id, caller.user_id);
    Ok(Json(StatusEnvelope::success(format!(
        "Batch {} deleted",
        batch_id
    ))))
}

/// GET /api/batches/:id/items
///
/// Per-item provider responses; the data behind the batch report download.
pub async fn list_batch_items(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchItemsResponse>, AppError> {
    let batch = load_visible_batch(&state, &caller, &batch_id).await?;
    let items = state.store.list_items(&batch.id).await?;

    Ok(Json(BatchItemsResponse {
        status: "success".to_string(),
        items,
    }))
}

/// Serves the OpenAPI specification YAML file.
pub async fn serve_openapi_spec() -> impl IntoResponse {
    match tokio::fs::read_to_string("openapi.yml").await {
        Ok(content) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/yaml")],
            content,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "OpenAPI spec not found").into_response(),
    }
}

/// Serves the Swagger UI HTML page pointed at `serve_openapi_spec`.
pub async fn serve_swagger_ui() -> impl IntoResponse {
    let html = r#"
<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Lhamascred API - Swagger UI</title>
    <link rel="stylesheet" type="text/css" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css">
    <style>
        body { margin: 0; padding: 0; }
    </style>
</head>
<body>
    <div id="swagger-ui"></div>
    <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
    <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-standalone-preset.js"></script>
    <script>
        window.onload = function() {
            window.ui = SwaggerUIBundle({
                url: "/api-docs/openapi.yml",
                dom_id: '#swagger-ui',
                deepLinking: true,
                presets: [
                    SwaggerUIBundle.presets.apis,
                    SwaggerUIStandalonePreset
                ],
                layout: "StandaloneLayout"
            });
        };
    </script>
</body>
</html>
"#;
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
}

/// User-facing batch actions. `main` adds rate limiting on top.
pub fn batch_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/batches", get(list_batches).post(submit_batch))
        .route(
            "/api/batches/:id",
            get(get_batch_status).delete(delete_batch),
        )
        .route("/api/batches/:id/items", get(list_batch_items))
}

/// Provider callback endpoint. Never rate limited.
pub fn webhook_routes() -> Router<Arc<AppState>> {
    Router::new().route(
        "/api/webhook/balance",
        get(webhook_handler::balance_webhook_liveness).post(webhook_handler::balance_webhook),
    )
}

/// Health and API documentation.
pub fn service_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/docs", get(serve_swagger_ui))
        .route("/api-docs/openapi.yml", get(serve_openapi_spec))
}

/// Every route without the rate limiter, ready to serve.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(service_routes())
        .merge(webhook_routes())
        .merge(batch_routes())
        .with_state(state)
}
