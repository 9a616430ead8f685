use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AppResult, EscrowError};

/// Provider-side outcome of a single collect/disburse call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Succeeded,
    Failed,
    /// Accepted but not settled yet; re-query with the same key
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResult {
    pub status: GatewayStatus,
    #[serde(default)]
    pub provider_ref: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl GatewayResult {
    pub fn succeeded(provider_ref: impl Into<String>) -> Self {
        Self {
            status: GatewayStatus::Succeeded,
            provider_ref: Some(provider_ref.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: GatewayStatus::Failed,
            provider_ref: None,
            error: Some(error.into()),
        }
    }

    pub fn pending() -> Self {
        Self {
            status: GatewayStatus::Pending,
            provider_ref: None,
            error: None,
        }
    }
}

/// What the provider is asked to move
#[derive(Debug, Clone, Serialize)]
pub struct MovementRequest {
    pub idempotency_key: String,
    pub amount: Decimal,
    pub currency: String,
    /// Payer for collect, payee for disburse
    pub party_ref: String,
}

/// Payment provider boundary
///
/// INVARIANTS:
/// - calling twice with the same `idempotency_key` never moves funds twice
/// - `Err` is a transport failure; the ledger treats it like a failed attempt
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn collect(&self, request: &MovementRequest) -> AppResult<GatewayResult>;

    async fn disburse(&self, request: &MovementRequest) -> AppResult<GatewayResult>;

    fn name(&self) -> &str;
}

// ========== HTTP GATEWAY ==========

/// Bridge to the payment provider over JSON/HTTP
pub struct HttpPaymentGateway {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpPaymentGateway {
    pub fn new(base_url: String, api_key: Option<String>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    async fn call(&self, operation: &str, request: &MovementRequest) -> AppResult<GatewayResult> {
        let url = format!("{}/{}", self.base_url, operation);

        let mut builder = self
            .client
            .post(&url)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| EscrowError::Gateway(format!("{} {}: {}", operation, url, e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(EscrowError::Gateway(format!("{} returned HTTP {}", operation, status)).into());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Ok(GatewayResult::failed(format!("HTTP {}: {}", status, body)));
        }

        let result: GatewayResult = response
            .json()
            .await
            .map_err(|e| EscrowError::Gateway(format!("Malformed {} response: {}", operation, e)))?;

        debug!(
            "💳 {} {} -> {:?}",
            operation, request.idempotency_key, result.status
        );
        Ok(result)
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn collect(&self, request: &MovementRequest) -> AppResult<GatewayResult> {
        self.call("collect", request).await
    }

    async fn disburse(&self, request: &MovementRequest) -> AppResult<GatewayResult> {
        self.call("disburse", request).await
    }

    fn name(&self) -> &str {
        "http"
    }
}

// ========== SANDBOX GATEWAY ==========

/// Always succeeds; results memoised per idempotency key like a real provider
pub struct SandboxGateway {
    settled: Mutex<HashMap<String, GatewayResult>>,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self {
            settled: Mutex::new(HashMap::new()),
        }
    }

    fn settle(&self, operation: &str, request: &MovementRequest) -> GatewayResult {
        let mut settled = self.settled.lock();
        settled
            .entry(request.idempotency_key.clone())
            .or_insert_with(|| {
                info!(
                    "🧪 Sandbox {} {} {} for {}",
                    operation, request.amount, request.currency, request.party_ref
                );
                GatewayResult::succeeded(format!("sandbox-{}", Uuid::new_v4()))
            })
            .clone()
    }
}

impl Default for SandboxGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn collect(&self, request: &MovementRequest) -> AppResult<GatewayResult> {
        Ok(self.settle("collect", request))
    }

    async fn disburse(&self, request: &MovementRequest) -> AppResult<GatewayResult> {
        Ok(self.settle("disburse", request))
    }

    fn name(&self) -> &str {
        "sandbox"
    }
}
