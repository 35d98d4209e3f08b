use crate::models::Provider;
use serde::Deserialize;

/// Correlation ids zero-pad the item index to five digits, so a batch may not
/// hold more items than that width can order.
pub const MAX_BATCH_SIZE_LIMIT: usize = 99_999;
/// Ten years.
pub const MAX_STALE_BATCH_HOURS: u64 = 87_600;

/// Base URL and bearer token for one credit-bureau provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEndpoint {
    pub base_url: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Postgres URL. Without it the service runs on the in-memory store.
    pub database_url: Option<String>,
    pub port: u16,
    /// Public base URL of this service, used to build the callback URL sent to providers.
    pub public_base_url: String,
    pub webhook_secret: Option<String>,
    pub v8: Option<ProviderEndpoint>,
    pub facta: Option<ProviderEndpoint>,
    pub c6: Option<ProviderEndpoint>,
    pub dispatch_concurrency: usize,
    pub max_batch_size: usize,
    pub submission_dedup_ttl_secs: u64,
    /// Zero disables the stale-batch reaper.
    pub stale_batch_hours: u64,
    pub reaper_interval_secs: u64,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(|url| {
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DATABASE_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })
                .transpose()?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            public_base_url: std::env::var("PUBLIC_BASE_URL")
                .map_err(|_| anyhow::anyhow!("PUBLIC_BASE_URL environment variable required"))
                .and_then(|url| validate_http_url("PUBLIC_BASE_URL", url))?,
            webhook_secret: std::env::var("WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            v8: provider_from_env("V8")?,
            facta: provider_from_env("FACTA")?,
            c6: provider_from_env("C6")?,
            dispatch_concurrency: parse_env("DISPATCH_CONCURRENCY", 8)?,
            max_batch_size: parse_env("MAX_BATCH_SIZE", 5000)?,
            submission_dedup_ttl_secs: parse_env("SUBMISSION_DEDUP_TTL_SECS", 60)?,
            stale_batch_hours: parse_env("STALE_BATCH_HOURS", 24)?,
            reaper_interval_secs: parse_env("REAPER_INTERVAL_SECS", 300)?,
            rate_limit_per_second: parse_env("RATE_LIMIT_PER_SECOND", 10)?,
            rate_limit_burst: parse_env("RATE_LIMIT_BURST", 20)?,
        };

        config.validate_limits()?;

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        if let Some(ref url) = config.database_url {
            tracing::debug!("Database URL: {}...", url.chars().take(20).collect::<String>());
        }
        tracing::debug!("Public base URL: {}", config.public_base_url);
        for provider in Provider::ALL {
            match config.provider(provider) {
                Some(endpoint) => {
                    tracing::info!("Provider {} enabled: {}", provider, endpoint.base_url)
                }
                None => tracing::warn!("Provider {} disabled (missing base URL or token)", provider),
            }
        }
        if config.webhook_secret.is_none() {
            tracing::warn!("WEBHOOK_SECRET not set, webhook callbacks are not authenticated");
        }
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }

    fn validate_limits(&self) -> anyhow::Result<()> {
        if self.dispatch_concurrency == 0 {
            anyhow::bail!("DISPATCH_CONCURRENCY must be at least 1");
        }
        if self.max_batch_size == 0 || self.max_batch_size > MAX_BATCH_SIZE_LIMIT {
            anyhow::bail!("MAX_BATCH_SIZE must be between 1 and {}", MAX_BATCH_SIZE_LIMIT);
        }
        if self.stale_batch_hours > MAX_STALE_BATCH_HOURS {
            anyhow::bail!("STALE_BATCH_HOURS must be at most {}", MAX_STALE_BATCH_HOURS);
        }
        Ok(())
    }

    /// Endpoint settings for `provider`, or `None` when it is not configured.
    pub fn provider(&self, provider: Provider) -> Option<&ProviderEndpoint> {
        match provider {
            Provider::V8 => self.v8.as_ref(),
            Provider::Facta => self.facta.as_ref(),
            Provider::C6 => self.c6.as_ref(),
        }
    }

    /// Callback URL providers must post their asynchronous answers to.
    pub fn callback_url(&self) -> String {
        format!(
            "{}/api/webhook/balance",
            self.public_base_url.trim_end_matches('/')
        )
    }

    /// Settings suitable for tests: no database, no providers, no secret.
    pub fn for_tests() -> Self {
        Self {
            database_url: None,
            port: 0,
            public_base_url: "http://localhost:3000".to_string(),
            webhook_secret: None,
            v8: None,
            facta: None,
            c6: None,
            dispatch_concurrency: 4,
            max_batch_size: 100,
            submission_dedup_ttl_secs: 60,
            stale_batch_hours: 24,
            reaper_interval_secs: 300,
            rate_limit_per_second: 10,
            rate_limit_burst: 20,
        }
    }
}

fn validate_http_url(name: &str, raw: String) -> anyhow::Result<String> {
    if raw.trim().is_empty() {
        anyhow::bail!("{} cannot be empty", name);
    }
    let parsed = url::Url::parse(&raw)
        .map_err(|e| anyhow::anyhow!("{} is not a valid URL: {}", name, e))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        anyhow::bail!("{} must start with http:// or https://", name);
    }
    Ok(raw)
}

/// Reads `{PREFIX}_BASE_URL` and `{PREFIX}_TOKEN`; the provider is enabled only
/// when both are present.
fn provider_from_env(prefix: &str) -> anyhow::Result<Option<ProviderEndpoint>> {
    let base_url = std::env::var(format!("{}_BASE_URL", prefix))
        .ok()
        .filter(|s| !s.trim().is_empty());
    let token = std::env::var(format!("{}_TOKEN", prefix))
        .ok()
        .filter(|s| !s.trim().is_empty());

    match (base_url, token) {
        (Some(base_url), Some(token)) => Ok(Some(ProviderEndpoint {
            base_url: validate_http_url(&format!("{}_BASE_URL", prefix), base_url)?,
            token,
        })),
        _ => Ok(None),
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid non-negative number", name)),
        _ => Ok(default),
    }
}
