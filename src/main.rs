use lhamascred_api::config::Config;
use lhamascred_api::db::Database;
use lhamascred_api::db_storage::PgBatchStore;
use lhamascred_api::dispatcher::Dispatcher;
use lhamascred_api::handlers::{self, AppState};
use lhamascred_api::memory_storage::MemoryBatchStore;
use lhamascred_api::providers::ProviderRegistry;
use lhamascred_api::reaper::StaleBatchReaper;
use lhamascred_api::repository::BatchRepository;

use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point for the application.
///
/// Initializes tracing, configuration and the batch store (Postgres when
/// configured, in-memory otherwise), wires the providers and dispatcher,
/// starts the stale-batch reaper and serves HTTP.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lhamascred_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    let store: Arc<dyn BatchRepository> = match config.database_url {
        Some(ref url) => {
            let db = Database::new(url).await?;
            tracing::info!("Database connection pool established");
            Arc::new(PgBatchStore::new(db.pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set: batches are kept in memory and lost on restart");
            Arc::new(MemoryBatchStore::new())
        }
    };

    let providers = ProviderRegistry::from_config(&config)?;
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        providers,
        config.callback_url(),
        config.dispatch_concurrency,
        config.max_batch_size,
        Duration::from_secs(config.submission_dedup_ttl_secs),
    ));
    tracing::info!("Dispatcher ready, callbacks at {}", config.callback_url());

    if config.stale_batch_hours > 0 {
        StaleBatchReaper::new(store.clone(), config.stale_batch_hours)
            .spawn(Duration::from_secs(config.reaper_interval_secs.max(1)));
        tracing::info!(
            "Stale batch reaper running every {}s (max age {}h)",
            config.reaper_interval_secs,
            config.stale_batch_hours
        );
    } else {
        tracing::warn!("STALE_BATCH_HOURS=0: stale batch reaper disabled");
    }

    let app_state = Arc::new(AppState {
        store,
        config: config.clone(),
        dispatcher,
    });

    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(config.rate_limit_per_second)
            .burst_size(config.rate_limit_burst)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| {
                anyhow::anyhow!("RATE_LIMIT_PER_SECOND and RATE_LIMIT_BURST must be non-zero")
            })?,
    );

    // User-facing batch routes: 5MB body limit plus per-IP rate limiting
    let batch_routes = handlers::batch_routes().layer(
        ServiceBuilder::new()
            .layer(RequestBodyLimitLayer::new(5 * 1024 * 1024))
            .layer(GovernorLayer {
                config: governor_conf,
            }),
    );

    // Provider callbacks bypass rate limiting
    let webhook_routes =
        handlers::webhook_routes().layer(RequestBodyLimitLayer::new(1024 * 1024));

    let app = Router::new()
        .merge(handlers::service_routes())
        .merge(webhook_routes)
        .merge(batch_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
