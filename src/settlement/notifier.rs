use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Settlement event channel capacity
const EVENT_CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationPayload {
    /// Sent to each shareholder who must decide
    ApprovalRequested {
        business_id: Uuid,
        business_name: String,
        amount: Decimal,
        currency: String,
        threshold_percent: Decimal,
        deadline: DateTime<Utc>,
    },
    InvestmentFinalized {
        amount: Decimal,
        currency: String,
    },
    /// Funds returned to the investor after the approval window closed
    InvestmentReversed {
        amount: Decimal,
        currency: String,
    },
    /// Sent to the investor once their equity is on the register
    ShareholderAdded {
        business_id: Uuid,
        business_name: String,
        shares: Decimal,
        ownership_share_percent: Decimal,
    },
}

impl NotificationPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationPayload::ApprovalRequested { .. } => "approval_requested",
            NotificationPayload::InvestmentFinalized { .. } => "investment_finalized",
            NotificationPayload::InvestmentReversed { .. } => "investment_reversed",
            NotificationPayload::ShareholderAdded { .. } => "shareholder_added",
        }
    }
}

/// One delivered notification, as published to subscribers
#[derive(Debug, Clone, Serialize)]
pub struct SettlementEvent {
    pub recipient_id: Uuid,
    pub investment_id: Uuid,
    pub payload: NotificationPayload,
    pub emitted_at: DateTime<Utc>,
}

/// Delivery boundary for settlement notifications
///
/// At-least-once; callers log failures and carry on.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(
        &self,
        recipient_id: Uuid,
        investment_id: Uuid,
        payload: &NotificationPayload,
    ) -> AppResult<()>;
}

// ========== IN-PROCESS CHANNEL ==========

/// Publishes every notification to a broadcast channel
pub struct ChannelNotifier {
    events: broadcast::Sender<SettlementEvent>,
}

impl ChannelNotifier {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettlementEvent> {
        self.events.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

impl Default for ChannelNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationDispatcher for ChannelNotifier {
    async fn notify(
        &self,
        recipient_id: Uuid,
        investment_id: Uuid,
        payload: &NotificationPayload,
    ) -> AppResult<()> {
        info!(
            "📨 {} -> {} (investment {})",
            payload.kind(),
            recipient_id,
            investment_id
        );

        let event = SettlementEvent {
            recipient_id,
            investment_id,
            payload: payload.clone(),
            emitted_at: Utc::now(),
        };
        // No subscribers is not a delivery failure
        if self.events.send(event).is_err() {
            debug!("No settlement event subscribers");
        }
        Ok(())
    }
}

// ========== WEBHOOK ==========

/// POSTs each event as JSON to a configured endpoint
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookNotifier {
    async fn notify(
        &self,
        recipient_id: Uuid,
        investment_id: Uuid,
        payload: &NotificationPayload,
    ) -> AppResult<()> {
        let event = SettlementEvent {
            recipient_id,
            investment_id,
            payload: payload.clone(),
            emitted_at: Utc::now(),
        };

        let response = self.client.post(&self.url).json(&event).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::ExternalError(format!(
                "Notification webhook returned {}: {}",
                status, error_text
            )));
        }
        Ok(())
    }
}

// ========== FANOUT ==========

/// Delivers to every sink; one failing sink does not stop the others
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn NotificationDispatcher>>,
}

impl FanoutNotifier {
    pub fn new(sinks: Vec<Arc<dyn NotificationDispatcher>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl NotificationDispatcher for FanoutNotifier {
    async fn notify(
        &self,
        recipient_id: Uuid,
        investment_id: Uuid,
        payload: &NotificationPayload,
    ) -> AppResult<()> {
        let mut failures = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.notify(recipient_id, investment_id, payload).await {
                warn!("⚠️ Notification sink failed for {}: {}", recipient_id, e);
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AppError::ExternalError(failures.join("; ")))
        }
    }
}
