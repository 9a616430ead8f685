use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use chrono::Utc;
use futures::stream::{self, Stream};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::*;
use crate::error::AppResult;
use crate::ledger::models::{ReconciliationRecord, Shareholder, TransferSaga};
use crate::settlement::{
    ApprovalResult, ChannelNotifier, InvestmentView, SettlementCoordinator, SweepReport,
};
use crate::transfer::TransferSagaService;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SettlementCoordinator>,
    pub transfers: Arc<TransferSagaService>,
    pub events: Arc<ChannelNotifier>,
    pub store_backend: &'static str,
    pub gateway_name: String,
    /// Operator endpoints are refused when unset
    pub admin_token: Option<String>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        store: state.store_backend,
        gateway: state.gateway_name.clone(),
        event_subscribers: state.events.subscriber_count(),
        timestamp: Utc::now(),
    })
}

// ========== SHAREHOLDERS ==========

/// POST /businesses/:business_id/shareholders
///
/// SECURITY: the identity service must confirm the caller owns the business.
pub async fn register_shareholders(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
    Json(request): Json<RegisterShareholdersRequest>,
) -> AppResult<Json<Vec<Shareholder>>> {
    let (caller_id, pin, inputs) = request.into_parts()?;
    let shareholders = state
        .coordinator
        .register_shareholders(caller_id, &pin, business_id, inputs)
        .await?;
    Ok(Json(shareholders))
}

/// GET /businesses/:business_id/shareholders
pub async fn list_shareholders(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
) -> AppResult<Json<Vec<Shareholder>>> {
    Ok(Json(state.coordinator.shareholders(business_id).await?))
}

// ========== INVESTMENTS ==========

/// POST /investments
///
/// Blocks until the collect leg settles; the response carries the opened quorum.
pub async fn sign_investment(
    State(state): State<AppState>,
    Json(request): Json<SignInvestmentRequest>,
) -> AppResult<(StatusCode, Json<InvestmentView>)> {
    let (caller_id, pin, investment) = request.into_parts()?;
    info!(
        "📝 Sign request from {} for pitch {}: {}",
        caller_id, investment.pitch_id, investment.amount
    );

    let view = state
        .coordinator
        .sign_investment(caller_id, &pin, investment)
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// GET /investments/:id
pub async fn get_investment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<InvestmentView>> {
    Ok(Json(state.coordinator.view(id).await?))
}

/// POST /investments/:id/approvals
///
/// SECURITY: the PIN goes to the identity service with the caller and the
/// shareholder they claim to be; nothing is recorded without both confirmed.
pub async fn submit_approval(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<SubmitApprovalRequest>,
) -> AppResult<Json<ApprovalResult>> {
    let request = validated(request)?;
    let result = state
        .coordinator
        .approve_as(
            request.caller_id,
            &request.pin,
            id,
            request.shareholder_id,
            request.decision,
        )
        .await?;
    Ok(Json(result))
}

/// POST /investments/:id/cancel
pub async fn cancel_investment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelInvestmentRequest>,
) -> AppResult<Json<InvestmentView>> {
    let request = validated(request)?;
    state
        .coordinator
        .cancel_investment(request.caller_id, &request.pin, id)
        .await?;
    Ok(Json(state.coordinator.view(id).await?))
}

// ========== TRANSFERS ==========

/// POST /transfers
///
/// A partial failure is returned as an error carrying the saga and
/// reconciliation ids, never as a success.
pub async fn create_transfer(
    State(state): State<AppState>,
    Json(request): Json<CreateTransferRequest>,
) -> AppResult<(StatusCode, Json<TransferSaga>)> {
    let transfer = request.into_transfer()?;
    let saga = state.transfers.execute(transfer).await?;
    Ok((StatusCode::CREATED, Json(saga)))
}

/// GET /transfers/:id
pub async fn get_transfer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<TransferSaga>> {
    Ok(Json(state.transfers.get(id).await?))
}

/// POST /transfers/:id/retry
pub async fn retry_transfer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<TransferSaga>> {
    Ok(Json(state.transfers.retry(id).await?))
}

// ========== ADMIN ==========

/// POST /admin/sweep
pub async fn run_sweep(State(state): State<AppState>) -> AppResult<Json<SweepReport>> {
    info!("🧹 Manual sweep requested");
    Ok(Json(state.coordinator.sweep(Utc::now()).await?))
}

/// GET /admin/reconciliations?open_only=true
pub async fn list_reconciliations(
    State(state): State<AppState>,
    Query(query): Query<ReconciliationQuery>,
) -> AppResult<Json<Vec<ReconciliationRecord>>> {
    let records = state
        .coordinator
        .list_reconciliations(query.open_only.unwrap_or(true))
        .await?;
    Ok(Json(records))
}

/// POST /admin/investments/:id/resolve
pub async fn resolve_investment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<InvestmentView>> {
    Ok(Json(state.coordinator.resolve_investment(id).await?))
}

/// GET /admin/events
///
/// Streams settlement notifications as they are published. A subscriber
/// that falls behind loses the skipped events and keeps streaming.
pub async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    info!("📡 Event stream opened (recipient filter: {:?})", query.recipient_id);
    let recipient = query.recipient_id;

    let events = stream::unfold(state.events.subscribe(), move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if recipient.is_some_and(|id| id != event.recipient_id) {
                        continue;
                    }
                    let sse = Event::default().event(event.payload.kind()).json_data(&event);
                    return Some((sse, rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("⚠️  Event stream lagged, {} events dropped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}
