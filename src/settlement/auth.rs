use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// What the caller claims to be acting as
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthorizationSubject {
    /// Signing or cancelling their own investment
    Investor { investment_id: Option<Uuid> },
    /// Deciding on a dilution as a linked shareholder
    Shareholder {
        investment_id: Uuid,
        shareholder_id: Uuid,
    },
    /// Maintaining the shareholder register of a business they own
    BusinessOwner { business_id: Uuid },
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationRequest {
    pub caller_id: Uuid,
    pub subject: AuthorizationSubject,
    /// PIN or equivalent one-time credential
    pub credential: String,
}

/// Explicit verdict from the identity service
///
/// SECURITY: both flags must be true. Transport-level "authenticated" state is
/// never trusted on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationVerdict {
    pub identity_confirmed: bool,
    pub pin_verified: bool,
}

impl AuthorizationVerdict {
    pub fn denied() -> Self {
        Self {
            identity_confirmed: false,
            pin_verified: false,
        }
    }

    /// Map the verdict to an authorization error, identity first
    pub fn require(&self) -> AppResult<()> {
        if !self.identity_confirmed {
            return Err(AppError::Authorization("caller identity not confirmed".into()));
        }
        if !self.pin_verified {
            return Err(AppError::Authorization("PIN not verified".into()));
        }
        Ok(())
    }
}

/// Identity and PIN verification boundary
///
/// INVARIANT: never errors. Any failure to reach a verdict is a denial.
#[async_trait]
pub trait AuthorizationCheck: Send + Sync {
    async fn verify(&self, request: &AuthorizationRequest) -> AuthorizationVerdict;
}

/// Calls the identity service's `/verify` endpoint
pub struct HttpAuthorizationCheck {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAuthorizationCheck {
    pub fn new(base_url: String) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl AuthorizationCheck for HttpAuthorizationCheck {
    async fn verify(&self, request: &AuthorizationRequest) -> AuthorizationVerdict {
        let url = format!("{}/verify", self.base_url);

        let response = match self.client.post(&url).json(request).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(
                    "🔒 Authorization service returned {} for caller {}, denying",
                    response.status(),
                    request.caller_id
                );
                return AuthorizationVerdict::denied();
            }
            Err(e) => {
                warn!("🔒 Authorization service unreachable ({}), denying", e);
                return AuthorizationVerdict::denied();
            }
        };

        match response.json::<AuthorizationVerdict>().await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("🔒 Malformed authorization verdict ({}), denying", e);
                AuthorizationVerdict::denied()
            }
        }
    }
}

/// Fail-closed check used when no identity service is configured
pub struct DenyAll;

#[async_trait]
impl AuthorizationCheck for DenyAll {
    async fn verify(&self, request: &AuthorizationRequest) -> AuthorizationVerdict {
        warn!(
            "🔒 No authorization service configured, denying caller {}",
            request.caller_id
        );
        AuthorizationVerdict::denied()
    }
}
