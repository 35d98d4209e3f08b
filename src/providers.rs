use crate::circuit_breaker::{create_provider_circuit_breaker, ProviderCircuitBreaker};
use crate::config::{Config, ProviderEndpoint};
use crate::errors::AppError;
use crate::models::{CpfRecord, Provider};
use async_trait::async_trait;
use failsafe::futures::CircuitBreaker;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// One outbound lookup for one CPF.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub correlation_id: String,
    pub record: CpfRecord,
    pub callback_url: String,
}

/// Sends lookup requests to a credit-bureau provider.
///
/// Answers arrive later on the balance webhook; `dispatch` only reports
/// whether the provider accepted the request.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> Provider;

    async fn dispatch(&self, request: &DispatchRequest) -> Result<(), AppError>;
}

/// Query path on the provider's API.
pub fn request_path(provider: Provider) -> &'static str {
    match provider {
        Provider::V8 => "/fgts/balance",
        Provider::Facta => "/fgts/saldo",
        Provider::C6 => "/clt/consulta",
    }
}

/// JSON body each provider expects. The correlation id always travels as
/// `balanceId` so the callback can be matched.
pub fn request_body(provider: Provider, request: &DispatchRequest) -> Value {
    let record = &request.record;
    match provider {
        Provider::V8 => json!({
            "documentNumber": record.cpf,
            "balanceId": request.correlation_id,
            "webhookUrl": request.callback_url,
        }),
        Provider::Facta => json!({
            "cpf": record.cpf,
            "dataNascimento": record.data_nascimento,
            "balanceId": request.correlation_id,
            "webhookUrl": request.callback_url,
        }),
        Provider::C6 => json!({
            "cpf": record.cpf,
            "nome": record.nome,
            "dataNascimento": record.data_nascimento,
            "telefone": record.telefone,
            "balanceId": request.correlation_id,
            "webhookUrl": request.callback_url,
        }),
    }
}

/// HTTP client for a provider, guarded by a circuit breaker.
#[derive(Clone)]
pub struct HttpProviderClient {
    provider: Provider,
    client: reqwest::Client,
    base_url: String,
    token: String,
    breaker: ProviderCircuitBreaker,
}

impl HttpProviderClient {
    pub fn new(provider: Provider, endpoint: &ProviderEndpoint) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!(
                    "Failed to create {} client: {}",
                    provider, e
                ))
            })?;

        Ok(Self {
            provider,
            client,
            base_url: endpoint.base_url.trim_end_matches('/').to_string(),
            token: endpoint.token.clone(),
            breaker: create_provider_circuit_breaker(),
        })
    }

    async fn send(&self, request: &DispatchRequest) -> Result<(), SendError> {
        let url = format!("{}{}", self.base_url, request_path(self.provider));
        let body = request_body(self.provider, request);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(SendError::Status { status, body });
        }

        Ok(())
    }
}

/// Why a single provider request failed.
#[derive(Debug)]
enum SendError {
    /// Connection, TLS or timeout failure.
    Transport(String),
    /// The provider answered with a non-2xx status.
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

impl SendError {
    /// Only provider-wide trouble opens the breaker. A 4xx rejects one CPF
    /// and says nothing about the provider's health.
    fn trips_breaker(&self) -> bool {
        match self {
            SendError::Transport(_) => true,
            SendError::Status { status, .. } => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
        }
    }

    fn into_app_error(self, provider: Provider) -> AppError {
        match self {
            SendError::Transport(e) => {
                AppError::ExternalApiError(format!("{} request failed: {}", provider, e))
            }
            SendError::Status { status, body } => AppError::ExternalApiError(format!(
                "{} returned {}: {}",
                provider, status, body
            )),
        }
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<(), AppError> {
        tracing::debug!(
            "Dispatching {} to {} (cpf={})",
            request.correlation_id,
            self.provider,
            request.record.cpf
        );

        match self
            .breaker
            .call_with(SendError::trips_breaker, self.send(request))
            .await
        {
            Ok(()) => Ok(()),
            Err(failsafe::Error::Inner(e)) => Err(e.into_app_error(self.provider)),
            Err(failsafe::Error::Rejected) => Err(AppError::ExternalApiError(format!(
                "{} circuit breaker open, request not sent",
                self.provider
            ))),
        }
    }
}

/// Enabled provider clients keyed by provider.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    clients: HashMap<Provider, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP clients for every provider with a base URL and token configured.
    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let mut registry = Self::new();
        for provider in Provider::ALL {
            if let Some(endpoint) = config.provider(provider) {
                registry.register(Arc::new(HttpProviderClient::new(provider, endpoint)?));
            }
        }
        Ok(registry)
    }

    pub fn register(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients.insert(client.provider(), client);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(&provider).cloned()
    }
}
