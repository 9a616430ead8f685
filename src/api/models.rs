use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::ledger::models::ApprovalDecision;
use crate::settlement::{NewInvestment, NewShareholder};
use crate::transfer::NewTransfer;

/// Run derive rules, mapping failures to a 400
pub fn validated<T: Validate>(request: T) -> AppResult<T> {
    request
        .validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;
    Ok(request)
}

// ========== REQUEST MODELS ==========

#[derive(Debug, Deserialize, Validate)]
pub struct ShareholderInput {
    /// Existing shareholder to update; a new one is created when absent
    pub id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub ownership_share_percent: Decimal,
    /// Share count; lets finalize dilute the register precisely
    pub shares: Option<Decimal>,
    #[serde(default = "default_true")]
    pub can_approve: bool,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Replace entries in a business' register; the caller must own the business
#[derive(Debug, Deserialize, Validate)]
pub struct RegisterShareholdersRequest {
    pub caller_id: Uuid,
    #[validate(length(min = 4, max = 12))]
    pub pin: String,
    pub shareholders: Vec<ShareholderInput>,
}

impl RegisterShareholdersRequest {
    /// Returns (caller, pin, shareholders)
    pub fn into_parts(self) -> AppResult<(Uuid, String, Vec<NewShareholder>)> {
        let request = validated(self)?;
        if request.shareholders.is_empty() {
            return Err(AppError::Validation("at least one shareholder is required".into()));
        }
        let shareholders = request
            .shareholders
            .into_iter()
            .map(|s| {
                let s = validated(s)?;
                Ok(NewShareholder {
                    id: s.id,
                    user_id: s.user_id,
                    name: s.name,
                    ownership_share_percent: s.ownership_share_percent,
                    shares: s.shares,
                    can_approve: s.can_approve,
                    active: s.active,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;
        Ok((request.caller_id, request.pin, shareholders))
    }
}

/// Request to sign an investment into a pitch
#[derive(Debug, Deserialize, Validate)]
pub struct SignInvestmentRequest {
    /// Authenticated caller; must be the investor
    pub caller_id: Uuid,
    #[validate(length(min = 4, max = 12))]
    pub pin: String,

    pub pitch_id: Uuid,
    pub business_id: Uuid,
    #[validate(length(min = 1, max = 200))]
    pub business_name: String,
    pub investor_id: Uuid,
    pub amount: Decimal,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
    pub share_price: Decimal,
    pub threshold_percent: Option<Decimal>,
    #[validate(length(min = 1, max = 64))]
    pub investor_payment_ref: String,
    #[validate(length(min = 1, max = 64))]
    pub business_payment_ref: String,
    pub funding_target: Option<Decimal>,
    pub outstanding_shares: Option<Decimal>,
}

impl SignInvestmentRequest {
    /// Returns (caller, pin, investment)
    pub fn into_parts(self) -> AppResult<(Uuid, String, NewInvestment)> {
        let r = validated(self)?;
        Ok((
            r.caller_id,
            r.pin,
            NewInvestment {
                pitch_id: r.pitch_id,
                business_id: r.business_id,
                business_name: r.business_name,
                investor_id: r.investor_id,
                amount: r.amount,
                currency: r.currency,
                share_price: r.share_price,
                threshold_percent: r.threshold_percent,
                investor_payment_ref: r.investor_payment_ref,
                business_payment_ref: r.business_payment_ref,
                funding_target: r.funding_target,
                outstanding_shares: r.outstanding_shares,
            },
        ))
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct SubmitApprovalRequest {
    pub caller_id: Uuid,
    #[validate(length(min = 4, max = 12))]
    pub pin: String,
    pub shareholder_id: Uuid,
    pub decision: ApprovalDecision,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CancelInvestmentRequest {
    pub caller_id: Uuid,
    #[validate(length(min = 4, max = 12))]
    pub pin: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateTransferRequest {
    #[validate(length(min = 1, max = 64))]
    pub sender_ref: String,
    #[validate(length(min = 1, max = 64))]
    pub recipient_ref: String,
    pub amount: Decimal,
    pub fee_percent: Option<Decimal>,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
}

impl CreateTransferRequest {
    pub fn into_transfer(self) -> AppResult<NewTransfer> {
        let r = validated(self)?;
        Ok(NewTransfer {
            sender_ref: r.sender_ref,
            recipient_ref: r.recipient_ref,
            amount: r.amount,
            fee_percent: r.fee_percent,
            currency: r.currency,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ReconciliationQuery {
    pub open_only: Option<bool>,
}

/// GET /admin/events?recipient_id=...
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub recipient_id: Option<Uuid>,
}

fn default_true() -> bool {
    true
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: &'static str,
    pub gateway: String,
    pub event_subscribers: usize,
    pub timestamp: DateTime<Utc>,
}
