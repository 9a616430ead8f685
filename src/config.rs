use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Service configuration
///
/// Sources, lowest precedence first: built-in defaults, optional
/// `settlement.toml`, environment variables (`DATABASE_URL`, `BIND_ADDRESS`, ...).
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub bind_address: String,
    /// Postgres when set, in-memory store otherwise
    pub database_url: Option<String>,
    /// Payment provider bridge; sandbox gateway when unset
    pub payment_gateway_url: Option<String>,
    pub payment_gateway_api_key: Option<String>,
    /// Identity/PIN verification service; every check is denied when unset
    pub auth_service_url: Option<String>,
    pub notification_webhook_url: Option<String>,
    /// Shared secret for `/api/v1/admin/*`; those routes are refused when unset
    pub admin_token: Option<String>,

    pub default_threshold_percent: Decimal,
    pub approval_window_hours: i64,
    pub default_currency: String,
    pub platform_fee_percent: Decimal,
    pub max_investor_allocation_percent: Decimal,

    pub escrow_max_attempts: u32,
    pub escrow_base_backoff_ms: u64,
    pub escrow_max_backoff_ms: u64,
    pub escrow_max_rounds: u32,

    pub concurrency_retry_limit: u32,
    pub sweep_interval_secs: u64,
    /// How long the sweep leaves a just-written step to the call that made it
    pub resume_grace_secs: i64,
}

/// Retry policy for a single fund movement
#[derive(Debug, Clone)]
pub struct EscrowConfig {
    /// Gateway calls per round before the round is marked failed
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Rounds per idempotency key before manual reconciliation is required
    pub max_rounds: u32,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(5000),
            max_rounds: 5,
        }
    }
}

/// Policy knobs for the investment settlement flow
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub default_threshold_percent: Decimal,
    pub approval_window: chrono::Duration,
    pub default_currency: String,
    pub max_investor_allocation_percent: Decimal,
    pub concurrency_retry_limit: u32,
    /// Held or finalized investments younger than this are left to the
    /// signing or approving call before the sweep resumes them
    pub resume_grace: chrono::Duration,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            default_threshold_percent: Decimal::from(60),
            approval_window: chrono::Duration::hours(24),
            default_currency: "UGX".to_string(),
            max_investor_allocation_percent: Decimal::from(60),
            concurrency_retry_limit: 3,
            resume_grace: chrono::Duration::seconds(60),
        }
    }
}

impl Config {
    /// Load from defaults, `settlement.toml` and the environment
    pub fn load() -> AppResult<Self> {
        let builder = Self::defaults()?
            .add_source(config::File::with_name("settlement").required(false))
            .add_source(config::Environment::default().try_parsing(true));

        Self::build(builder)
    }

    fn defaults() -> AppResult<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(config::Config::builder()
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("default_threshold_percent", "60")?
            .set_default("approval_window_hours", 24)?
            .set_default("default_currency", "UGX")?
            .set_default("platform_fee_percent", "2.5")?
            .set_default("max_investor_allocation_percent", "60")?
            .set_default("escrow_max_attempts", 3)?
            .set_default("escrow_base_backoff_ms", 200)?
            .set_default("escrow_max_backoff_ms", 5000)?
            .set_default("escrow_max_rounds", 5)?
            .set_default("concurrency_retry_limit", 3)?
            .set_default("sweep_interval_secs", 60)?
            .set_default("resume_grace_secs", 60)?)
    }

    fn build(builder: config::ConfigBuilder<config::builder::DefaultState>) -> AppResult<Self> {
        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AppResult<()> {
        let hundred = Decimal::from(100);

        if self.default_threshold_percent <= Decimal::ZERO || self.default_threshold_percent > hundred {
            return Err(AppError::Config(format!(
                "default_threshold_percent must be in (0, 100], got {}",
                self.default_threshold_percent
            )));
        }
        if self.platform_fee_percent < Decimal::ZERO || self.platform_fee_percent >= hundred {
            return Err(AppError::Config(format!(
                "platform_fee_percent must be in [0, 100), got {}",
                self.platform_fee_percent
            )));
        }
        if self.max_investor_allocation_percent <= Decimal::ZERO
            || self.max_investor_allocation_percent > hundred
        {
            return Err(AppError::Config(
                "max_investor_allocation_percent must be in (0, 100]".into(),
            ));
        }
        if self.approval_window_hours <= 0 {
            return Err(AppError::Config("approval_window_hours must be positive".into()));
        }
        if self.escrow_max_attempts == 0 || self.escrow_max_rounds == 0 {
            return Err(AppError::Config(
                "escrow_max_attempts and escrow_max_rounds must be at least 1".into(),
            ));
        }
        if self.concurrency_retry_limit == 0 {
            return Err(AppError::Config("concurrency_retry_limit must be at least 1".into()));
        }
        if self.resume_grace_secs < 0 {
            return Err(AppError::Config("resume_grace_secs must not be negative".into()));
        }
        if matches!(&self.admin_token, Some(token) if token.len() < 16) {
            return Err(AppError::Config("admin_token must be at least 16 characters".into()));
        }
        if self.default_currency.len() != 3 {
            return Err(AppError::Config("default_currency must be an ISO 4217 code".into()));
        }
        Ok(())
    }

    pub fn escrow(&self) -> EscrowConfig {
        EscrowConfig {
            max_attempts: self.escrow_max_attempts,
            base_backoff: Duration::from_millis(self.escrow_base_backoff_ms),
            max_backoff: Duration::from_millis(self.escrow_max_backoff_ms),
            max_rounds: self.escrow_max_rounds,
        }
    }

    pub fn settlement(&self) -> SettlementConfig {
        SettlementConfig {
            default_threshold_percent: self.default_threshold_percent,
            approval_window: chrono::Duration::hours(self.approval_window_hours),
            default_currency: self.default_currency.clone(),
            max_investor_allocation_percent: self.max_investor_allocation_percent,
            concurrency_retry_limit: self.concurrency_retry_limit,
            resume_grace: chrono::Duration::seconds(self.resume_grace_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
