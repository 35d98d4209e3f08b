/// End-to-end tests of the HTTP surface over the in-memory store.
/// Providers are faked; callbacks are posted straight to the webhook route.
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use lhamascred_api::config::Config;
use lhamascred_api::dispatcher::Dispatcher;
use lhamascred_api::errors::AppError;
use lhamascred_api::handlers::{build_router, AppState};
use lhamascred_api::memory_storage::MemoryBatchStore;
use lhamascred_api::models::{ItemStatus, Provider};
use lhamascred_api::providers::{DispatchRequest, ProviderClient, ProviderRegistry};
use lhamascred_api::repository::{BatchRepository, CallbackOutcome};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const CPFS: [&str; 3] = ["52998224725", "11144477735", "39053344705"];

/// Accepts every request except those for CPFs in `reject`.
struct FakeProvider {
    provider: Provider,
    reject: Vec<String>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ProviderClient for FakeProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<(), AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject.contains(&request.record.cpf) {
            return Err(AppError::ExternalApiError("provider said no".to_string()));
        }
        Ok(())
    }
}

struct TestApp {
    router: Router,
    store: Arc<MemoryBatchStore>,
}

fn test_app_with(config: Config, reject: &[&str]) -> TestApp {
    let store = Arc::new(MemoryBatchStore::new());
    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(FakeProvider {
        provider: Provider::V8,
        reject: reject.iter().map(|c| c.to_string()).collect(),
        calls: Arc::new(AtomicUsize::new(0)),
    }));

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        providers,
        config.callback_url(),
        config.dispatch_concurrency,
        config.max_batch_size,
        Duration::from_secs(60),
    ));
    let state = Arc::new(AppState {
        store: store.clone(),
        config,
        dispatcher,
    });

    TestApp {
        router: build_router(state),
        store,
    }
}

fn test_app() -> TestApp {
    test_app_with(Config::for_tests(), &[])
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn as_user(builder: axum::http::request::Builder, user: &str) -> axum::http::request::Builder {
    builder.header("x-user-id", user)
}

fn get(uri: &str, user: &str) -> Request<Body> {
    as_user(Request::builder().uri(uri), user)
        .body(Body::empty())
        .unwrap()
}

fn callback(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/webhook/balance")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn submit(app: &TestApp, user: &str, cpfs: &[&str]) -> (StatusCode, Value) {
    let rows: Vec<Value> = cpfs.iter().map(|c| json!({ "cpf": c })).collect();
    let request = as_user(
        Request::builder()
            .method("POST")
            .uri("/api/batches")
            .header("content-type", "application/json"),
        user,
    )
    .body(Body::from(
        json!({ "cpfs": rows, "provider": "v8", "fileName": "lote.xlsx" }).to_string(),
    ))
    .unwrap();
    send(app, request).await
}

/// Polls the batch until `done` holds; the fan-out runs in the background.
async fn wait_for_batch(
    app: &TestApp,
    batch_id: &str,
    done: impl Fn(&Value) -> bool,
) -> Value {
    for _ in 0..200 {
        let (status, body) = send(app, get(&format!("/api/batches/{}", batch_id), "user-1")).await;
        assert_eq!(status, StatusCode::OK);
        if done(&body["batch"]) {
            return body["batch"].clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("batch {} never reached the expected state", batch_id);
}

async fn item_ids(app: &TestApp, batch_id: &str) -> Vec<String> {
    let (status, body) = send(app, get(&format!("/api/batches/{}/items", batch_id), "user-1")).await;
    assert_eq!(status, StatusCode::OK);
    body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["id"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn batch_lifecycle_from_submission_to_completion() {
    let app = test_app();

    // 1. Submission creates placeholders and the fan-out moves it to processing
    let (status, body) = submit(&app, "user-1", &CPFS).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "success");
    let batch_id = body["batch"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["batch"]["totalCpfs"], 3);
    assert_eq!(body["batch"]["processedCpfs"], 0);

    let batch = wait_for_batch(&app, &batch_id, |b| b["status"] == "processing").await;
    assert_eq!(batch["processedCpfs"], 0);
    assert_eq!(batch["tally"]["pending"], 3);

    let ids = item_ids(&app, &batch_id).await;
    assert_eq!(ids.len(), 3);

    // 2. Balance received
    let (status, body) = send(&app, callback(json!({ "balanceId": ids[0], "balance": 500 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    let batch = wait_for_batch(&app, &batch_id, |_| true).await;
    assert_eq!(batch["processedCpfs"], 1);
    assert_eq!(batch["status"], "processing");

    // 3. Provider error still counts
    let (status, _) = send(
        &app,
        callback(json!({ "balanceId": ids[1], "errorMessage": "timeout" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let batch = wait_for_batch(&app, &batch_id, |_| true).await;
    assert_eq!(batch["processedCpfs"], 2);
    assert_eq!(batch["status"], "processing");

    // 4. Last item completes the batch
    let last = json!({ "balanceId": ids[2], "balance": 1200.5 });
    send(&app, callback(last.clone())).await;
    let batch = wait_for_batch(&app, &batch_id, |_| true).await;
    assert_eq!(batch["processedCpfs"], 3);
    assert_eq!(batch["status"], "completed");
    assert!(batch["completedAt"].is_string());
    assert_eq!(batch["allAccounted"], true);
    assert_eq!(batch["allSucceeded"], false);
    assert_eq!(batch["tally"]["success"], 2);
    assert_eq!(batch["tally"]["error"], 1);
    assert_eq!(
        batch["message"],
        "Batch completed: 2 success, 1 error, 0 without result"
    );
    let completed_at = batch["completedAt"].clone();

    // 5. Replay is acknowledged but changes nothing
    let (status, _) = send(&app, callback(last)).await;
    assert_eq!(status, StatusCode::OK);
    let batch = wait_for_batch(&app, &batch_id, |_| true).await;
    assert_eq!(batch["processedCpfs"], 3);
    assert_eq!(batch["status"], "completed");
    assert_eq!(batch["completedAt"], completed_at);
}

#[tokio::test]
async fn unknown_correlation_id_is_stored_and_acknowledged() {
    let app = test_app();

    let (status, body) = send(&app, callback(json!({ "balanceId": "ghost", "balance": 10 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    let outcome = app
        .store
        .apply_callback("ghost", &json!({ "balanceId": "ghost" }), ItemStatus::Success)
        .await
        .unwrap();
    // Second delivery refreshes the stored record and keeps it flagged as unknown
    assert_eq!(outcome, CallbackOutcome::StoredUnknown);
}

#[tokio::test]
async fn webhook_connectivity_check_and_liveness() {
    let app = test_app();

    let empty = Request::builder()
        .method("POST")
        .uri("/api/webhook/balance")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, empty).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Webhook reachable");

    let (status, _) = send(&app, callback(json!({}))).await;
    assert_eq!(status, StatusCode::OK);

    let liveness = Request::builder()
        .uri("/api/webhook/balance")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, liveness).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
}

#[tokio::test]
async fn webhook_rejects_missing_id_and_malformed_json() {
    let app = test_app();

    let (status, body) = send(&app, callback(json!({ "balance": 10 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    assert_eq!(body["message"], "Missing balanceId in callback body");

    let malformed = Request::builder()
        .method("POST")
        .uri("/api/webhook/balance")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, malformed).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn webhook_secret_is_enforced_when_configured() {
    let mut config = Config::for_tests();
    config.webhook_secret = Some("s3cret".to_string());
    let app = test_app_with(config, &[]);

    let (status, _) = send(&app, callback(json!({ "balanceId": "x1" }))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("POST")
        .uri("/api/webhook/balance")
        .header("x-webhook-token", "s3cret")
        .body(Body::from(json!({ "balanceId": "x1" }).to_string()))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn dispatch_failures_count_toward_completion() {
    let app = test_app_with(Config::for_tests(), &CPFS);

    let (status, body) = submit(&app, "user-1", &CPFS).await;
    assert_eq!(status, StatusCode::CREATED);
    let batch_id = body["batch"]["id"].as_str().unwrap().to_string();

    let batch = wait_for_batch(&app, &batch_id, |b| b["status"] == "completed").await;
    assert_eq!(batch["processedCpfs"], 3);
    assert_eq!(batch["tally"]["error"], 3);
    assert_eq!(batch["allSucceeded"], false);
}

#[tokio::test]
async fn invalid_submissions_are_rejected() {
    let app = test_app();

    let (status, body) = submit(&app, "user-1", &["123"]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");

    let (status, _) = submit(&app, "user-1", &[]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Facta is not registered in this app
    let request = as_user(
        Request::builder()
            .method("POST")
            .uri("/api/batches")
            .header("content-type", "application/json"),
        "user-1",
    )
    .body(Body::from(
        json!({ "cpfs": [{ "cpf": CPFS[0], "dataNascimento": "01/02/1980" }], "provider": "facta" })
            .to_string(),
    ))
    .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn identical_resubmission_returns_existing_batch() {
    let app = test_app();

    let (status, first) = submit(&app, "user-1", &CPFS).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, second) = submit(&app, "user-1", &CPFS).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["batch"]["id"], second["batch"]["id"]);

    let (_, list) = send(&app, get("/api/batches", "user-1")).await;
    assert_eq!(list["batches"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn callers_only_see_their_own_batches() {
    let app = test_app();

    let (_, body) = submit(&app, "user-1", &CPFS[..1]).await;
    let batch_id = body["batch"]["id"].as_str().unwrap().to_string();
    submit(&app, "user-2", &CPFS[1..2]).await;

    let missing_header = Request::builder()
        .uri("/api/batches")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, missing_header).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, list) = send(&app, get("/api/batches", "user-2")).await;
    assert_eq!(status, StatusCode::OK);
    let batches = list["batches"].as_array().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0]["userId"], "user-2");

    let (status, _) = send(&app, get(&format!("/api/batches/{}", batch_id), "user-2")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let admin = Request::builder()
        .uri("/api/batches")
        .header("x-user-id", "ops")
        .header("x-user-role", "admin")
        .body(Body::empty())
        .unwrap();
    let (status, list) = send(&app, admin).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["batches"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn list_filters_reject_unknown_values() {
    let app = test_app();

    let (status, _) = send(&app, get("/api/batches?status=paused", "user-1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, get("/api/batches?provider=serasa", "user-1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, get("/api/batches?status=queued&provider=v8&limit=5", "user-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["batches"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn deleting_twice_reports_not_found() {
    let app = test_app();

    let (_, body) = submit(&app, "user-1", &CPFS).await;
    let batch_id = body["batch"]["id"].as_str().unwrap().to_string();

    let delete = || {
        as_user(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/batches/{}", batch_id)),
            "user-1",
        )
        .body(Body::empty())
        .unwrap()
    };

    let (status, body) = send(&app, delete()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert!(app.store.list_items(&batch_id).await.unwrap().is_empty());

    let (status, body) = send(&app, delete()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn health_reports_service_name() {
    let app = test_app();

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "lhamascred-api");
}

#[tokio::test]
async fn malformed_requests_get_the_error_envelope() {
    let app = test_app();

    let request = as_user(
        Request::builder()
            .method("POST")
            .uri("/api/batches")
            .header("content-type", "application/json"),
        "user-1",
    )
    .body(Body::from(
        json!({ "cpfs": [{ "cpf": CPFS[0] }], "provider": "serasa" }).to_string(),
    ))
    .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    assert!(body["message"].as_str().unwrap().contains("serasa"));

    let request = as_user(
        Request::builder()
            .method("POST")
            .uri("/api/batches")
            .header("content-type", "application/json"),
        "user-1",
    )
    .body(Body::from("{\"cpfs\": ["))
    .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");

    let (status, body) = send(&app, get("/api/batches?limit=abc", "user-1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn interim_callback_counts_once_and_final_answer_does_not_recount() {
    let app = test_app();

    let (_, body) = submit(&app, "user-1", &CPFS).await;
    let batch_id = body["batch"]["id"].as_str().unwrap().to_string();
    wait_for_batch(&app, &batch_id, |b| b["status"] == "processing").await;
    let ids = item_ids(&app, &batch_id).await;

    let (status, _) = send(&app, callback(json!({ "balanceId": ids[0], "balance": null }))).await;
    assert_eq!(status, StatusCode::OK);
    let batch = wait_for_batch(&app, &batch_id, |_| true).await;
    assert_eq!(batch["processedCpfs"], 1);
    let items = app.store.list_items(&batch_id).await.unwrap();
    assert_eq!(items[0].status, ItemStatus::Received);

    let (status, _) = send(&app, callback(json!({ "balanceId": ids[0], "balance": 10 }))).await;
    assert_eq!(status, StatusCode::OK);
    let batch = wait_for_batch(&app, &batch_id, |_| true).await;
    assert_eq!(batch["processedCpfs"], 1);
    assert_eq!(batch["status"], "processing");
    let items = app.store.list_items(&batch_id).await.unwrap();
    assert_eq!(items[0].status, ItemStatus::Success);
    assert_eq!(items[0].response_body, Some(json!({ "balanceId": ids[0], "balance": 10 })));
}

#[tokio::test]
async fn listing_carries_each_batch_tally() {
    let app = test_app_with(Config::for_tests(), &[CPFS[2]]);

    let (_, first) = submit(&app, "user-1", &CPFS).await;
    let first_id = first["batch"]["id"].as_str().unwrap().to_string();
    let (_, second) = submit(&app, "user-1", &CPFS[..2]).await;
    let second_id = second["batch"]["id"].as_str().unwrap().to_string();

    wait_for_batch(&app, &first_id, |b| b["tally"]["error"] == 1).await;
    let id = item_ids(&app, &second_id).await.remove(0);
    send(&app, callback(json!({ "balanceId": id, "balance": 10 }))).await;

    let (status, list) = send(&app, get("/api/batches", "user-1")).await;
    assert_eq!(status, StatusCode::OK);
    let batches = list["batches"].as_array().unwrap();
    assert_eq!(batches.len(), 2);

    let view = |id: &str| batches.iter().find(|b| b["id"] == id).unwrap().clone();
    assert_eq!(view(&first_id)["tally"], json!({ "success": 0, "error": 1, "pending": 2 }));
    assert_eq!(view(&second_id)["tally"], json!({ "success": 1, "error": 0, "pending": 1 }));
}
