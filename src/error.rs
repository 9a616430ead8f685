use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::models::{ApprovalStatus, InvestmentStatus, QuorumOutcome, SagaStatus};

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Escrow error: {0}")]
    Escrow(#[from] EscrowError),

    #[error("Quorum error: {0}")]
    Quorum(#[from] QuorumError),

    #[error("Transfer error: {0}")]
    Saga(#[from] SagaError),

    /// Malformed input; rejected before any side effect
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Caller not authorized or PIN not verified; rejected before any mutation
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// Optimistic-lock version mismatch. Internal retry signal.
    #[error("Concurrency conflict on {entity} {id} (expected version {expected})")]
    ConcurrencyConflict {
        entity: &'static str,
        id: Uuid,
        expected: i64,
    },

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: InvestmentStatus,
        to: InvestmentStatus,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("External error: {0}")]
    ExternalError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Fund movement errors
#[derive(Error, Debug)]
pub enum EscrowError {
    #[error("Gateway gave up on {key} after {attempts} attempts: {last_error}")]
    GatewayExhausted {
        key: String,
        attempts: i32,
        last_error: String,
    },

    #[error("Retry rounds exhausted for {key} ({rounds} rounds), manual handling required")]
    RoundsExhausted { key: String, rounds: i32 },

    #[error("Movement {0} is already in flight")]
    InFlight(String),

    #[error("Gateway transport error: {0}")]
    Gateway(String),
}

/// Shareholder approval errors
#[derive(Error, Debug)]
pub enum QuorumError {
    #[error("Quorum not found for investment {0}")]
    NotFound(Uuid),

    #[error("Shareholder {shareholder_id} already {current}, cannot change decision")]
    AlreadyDecided {
        shareholder_id: Uuid,
        current: ApprovalStatus,
    },

    #[error("Shareholder {0} is not eligible to approve this investment")]
    NotEligible(Uuid),

    #[error("Shareholder {0} has no linked identity and cannot decide")]
    UnlinkedShareholder(Uuid),

    #[error("Quorum already closed with outcome {0}")]
    Closed(QuorumOutcome),

    #[error("Approval window closed at {0}")]
    DeadlinePassed(DateTime<Utc>),

    #[error("Invalid quorum parameters: {0}")]
    InvalidParameters(String),
}

/// P2P transfer errors
#[derive(Error, Debug)]
pub enum SagaError {
    /// Sender charged, recipient unpaid. Always surfaced, never reported as success.
    #[error("Transfer {saga_id} partially failed: sender charged, recipient unpaid ({reason})")]
    PartialFailure {
        saga_id: Uuid,
        reconciliation_id: Option<Uuid>,
        reason: String,
    },

    #[error("Transfer {saga_id} collection failed, no funds moved: {reason}")]
    CollectFailed { saga_id: Uuid, reason: String },

    #[error("Transfer {saga_id} in state {status:?} cannot be retried")]
    InvalidState { saga_id: Uuid, status: SagaStatus },
}

impl AppError {
    /// Whether the caller should reload and re-run the logical operation
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, AppError::ConcurrencyConflict { .. })
    }

    /// Another caller owns the movement or entity right now; its outcome is unknown
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            AppError::Escrow(EscrowError::InFlight(_)) | AppError::ConcurrencyConflict { .. }
        )
    }

    /// The movement ran to its attempt or round limit without moving funds
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            AppError::Escrow(EscrowError::GatewayExhausted { .. })
                | AppError::Escrow(EscrowError::RoundsExhausted { .. })
        )
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AppError {
    fn response_parts(&self) -> (StatusCode, &'static str, String, Option<serde_json::Value>) {
        match self {
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                None,
            ),
            AppError::Authorization(msg) => (
                StatusCode::FORBIDDEN,
                "NOT_AUTHORIZED",
                msg.clone(),
                None,
            ),
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Not found: {}", what),
                None,
            ),
            AppError::Quorum(QuorumError::NotFound(id)) => (
                StatusCode::NOT_FOUND,
                "QUORUM_NOT_FOUND",
                format!("No quorum for investment {}", id),
                None,
            ),
            AppError::Quorum(QuorumError::UnlinkedShareholder(_))
            | AppError::Quorum(QuorumError::NotEligible(_)) => (
                StatusCode::FORBIDDEN,
                "NOT_ELIGIBLE",
                self.to_string(),
                None,
            ),
            AppError::Quorum(QuorumError::InvalidParameters(msg)) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                None,
            ),
            AppError::Quorum(QuorumError::AlreadyDecided { shareholder_id, current }) => (
                StatusCode::CONFLICT,
                "DECISION_CONFLICT",
                self.to_string(),
                Some(serde_json::json!({
                    "shareholder_id": shareholder_id,
                    "current": current,
                })),
            ),
            AppError::Quorum(QuorumError::Closed(outcome)) => (
                StatusCode::CONFLICT,
                "QUORUM_CLOSED",
                self.to_string(),
                Some(serde_json::json!({ "outcome": outcome })),
            ),
            AppError::Quorum(QuorumError::DeadlinePassed(deadline)) => (
                StatusCode::CONFLICT,
                "APPROVAL_WINDOW_CLOSED",
                self.to_string(),
                Some(serde_json::json!({ "deadline": deadline })),
            ),
            AppError::InvalidTransition { from, to } => (
                StatusCode::CONFLICT,
                "INVALID_TRANSITION",
                self.to_string(),
                Some(serde_json::json!({ "from": from, "to": to })),
            ),
            AppError::Duplicate(_) => (
                StatusCode::CONFLICT,
                "DUPLICATE",
                self.to_string(),
                None,
            ),
            AppError::Saga(SagaError::PartialFailure { saga_id, reconciliation_id, .. }) => (
                StatusCode::BAD_GATEWAY,
                "PARTIAL_SAGA_FAILURE",
                self.to_string(),
                Some(serde_json::json!({
                    "saga_id": saga_id,
                    "reconciliation_id": reconciliation_id,
                    "collection_succeeded": true,
                })),
            ),
            AppError::Saga(SagaError::CollectFailed { saga_id, .. }) => (
                StatusCode::BAD_GATEWAY,
                "COLLECTION_FAILED",
                self.to_string(),
                Some(serde_json::json!({
                    "saga_id": saga_id,
                    "collection_succeeded": false,
                })),
            ),
            AppError::Saga(SagaError::InvalidState { saga_id, status }) => (
                StatusCode::CONFLICT,
                "INVALID_TRANSFER_STATE",
                self.to_string(),
                Some(serde_json::json!({ "saga_id": saga_id, "status": status })),
            ),
            AppError::Escrow(EscrowError::GatewayExhausted { key, attempts, .. }) => (
                StatusCode::BAD_GATEWAY,
                "GATEWAY_ERROR",
                self.to_string(),
                Some(serde_json::json!({ "idempotency_key": key, "attempts": attempts })),
            ),
            AppError::Escrow(EscrowError::RoundsExhausted { key, rounds }) => (
                StatusCode::CONFLICT,
                "MANUAL_RECONCILIATION_REQUIRED",
                self.to_string(),
                Some(serde_json::json!({ "idempotency_key": key, "rounds": rounds })),
            ),
            AppError::Escrow(EscrowError::InFlight(_)) | AppError::ConcurrencyConflict { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "RETRY_LATER",
                "The operation is busy, please retry".to_string(),
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = self.response_parts();

        if status.is_server_error() {
            tracing::error!("❌ Request failed: {}", self);
        }

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::ExternalError(format!("HTTP request error: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_failure_is_surfaced_as_error_status() {
        let err = AppError::Saga(SagaError::PartialFailure {
            saga_id: Uuid::new_v4(),
            reconciliation_id: Some(Uuid::new_v4()),
            reason: "disburse failed".into(),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_validation_and_authorization_statuses() {
        let response = AppError::Validation("amount must be positive".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = AppError::Authorization("PIN not verified".into()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_conflict_display() {
        let err = AppError::Quorum(QuorumError::AlreadyDecided {
            shareholder_id: Uuid::nil(),
            current: ApprovalStatus::Approved,
        });
        assert!(err.to_string().contains("already approved"));
        assert!(!err.is_concurrency_conflict());
    }

    #[test]
    fn test_in_flight_is_not_a_failure() {
        let in_flight = AppError::Escrow(EscrowError::InFlight("collect_ab12".into()));
        assert!(in_flight.is_in_progress());
        assert!(!in_flight.is_exhausted());

        let exhausted = AppError::Escrow(EscrowError::GatewayExhausted {
            key: "collect_ab12".into(),
            attempts: 3,
            last_error: "declined".into(),
        });
        assert!(exhausted.is_exhausted());
        assert!(!exhausted.is_in_progress());
    }
}
