use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, SagaError};
use crate::escrow::{idempotency_key, EscrowLedger, Movement};
use crate::ledger::models::{
    EscrowDirection, EscrowSubject, EscrowTransaction, LegStatus, ReconciliationKind, SagaLeg,
    SagaStatus, TransferSaga,
};
use crate::ledger::{EntityLocks, PersistenceStore};

#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub sender_ref: String,
    pub recipient_ref: String,
    pub amount: Decimal,
    /// Platform fee default applies when None
    pub fee_percent: Option<Decimal>,
    pub currency: Option<String>,
}

/// Peer-to-peer transfer: collect from the sender, then disburse to the recipient
///
/// INVARIANTS:
/// - the disburse leg never starts unless the collect leg succeeded
/// - a succeeded leg is never run again; retries reuse the failed leg's key
/// - partial failure always leaves an open ReconciliationRecord and is
///   returned to the caller as `SagaError::PartialFailure`
/// - a saga is marked Failed only when its collect ran out of attempts or rounds
///   and the ledger holds no succeeded collect round
/// - one driver per saga at a time in this process; across processes the
///   version check on `update_saga` rejects the stale writer
pub struct TransferSagaService {
    store: Arc<dyn PersistenceStore>,
    ledger: Arc<EscrowLedger>,
    locks: EntityLocks,
    default_fee_percent: Decimal,
    default_currency: String,
}

impl TransferSagaService {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        ledger: Arc<EscrowLedger>,
        default_fee_percent: Decimal,
        default_currency: String,
    ) -> Self {
        Self {
            store,
            ledger,
            locks: EntityLocks::new(),
            default_fee_percent,
            default_currency,
        }
    }

    #[instrument(skip(self, transfer), fields(amount = %transfer.amount))]
    pub async fn execute(&self, transfer: NewTransfer) -> AppResult<TransferSaga> {
        let saga = self.prepare(transfer)?;
        let _guard = self.locks.acquire(saga.id).await;
        self.store.insert_saga(&saga).await?;
        info!(
            "💱 Transfer {} started: {} {} ({}% fee, recipient gets {})",
            saga.id, saga.amount, saga.currency, saga.fee_percent, saga.recipient_amount
        );
        self.drive(saga).await
    }

    /// Re-run only the leg that has not succeeded
    ///
    /// A completed saga is returned unchanged. A saga whose collect failed moved
    /// no funds and is not retried; the sender starts a new transfer instead.
    #[instrument(skip(self))]
    pub async fn retry(&self, saga_id: Uuid) -> AppResult<TransferSaga> {
        // Reload after the lock so a retry queued behind another sees its result
        let _guard = self.locks.acquire(saga_id).await;
        let saga = self.get(saga_id).await?;
        match saga.overall_status {
            SagaStatus::Completed => {
                info!("✓ Transfer {} already completed, nothing to retry", saga_id);
                Ok(saga)
            }
            SagaStatus::Failed => Err(SagaError::InvalidState {
                saga_id,
                status: saga.overall_status,
            }
            .into()),
            SagaStatus::PartialFailure | SagaStatus::Pending => {
                info!(
                    "🔁 Retrying transfer {} from state {}",
                    saga_id,
                    saga.overall_status.as_str()
                );
                self.drive(saga).await
            }
        }
    }

    pub async fn get(&self, saga_id: Uuid) -> AppResult<TransferSaga> {
        self.store
            .get_saga(saga_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Transfer {}", saga_id)))
    }

    fn prepare(&self, transfer: NewTransfer) -> AppResult<TransferSaga> {
        let hundred = Decimal::from(100);
        let fee_percent = transfer.fee_percent.unwrap_or(self.default_fee_percent);
        let currency = transfer
            .currency
            .unwrap_or_else(|| self.default_currency.clone())
            .to_uppercase();

        if transfer.amount <= Decimal::ZERO {
            return Err(AppError::Validation("amount must be positive".into()));
        }
        if fee_percent < Decimal::ZERO || fee_percent >= hundred {
            return Err(AppError::Validation(format!(
                "fee must be in [0, 100), got {}",
                fee_percent
            )));
        }
        if transfer.sender_ref.trim().is_empty() || transfer.recipient_ref.trim().is_empty() {
            return Err(AppError::Validation("payment references are required".into()));
        }
        if transfer.sender_ref == transfer.recipient_ref {
            return Err(AppError::Validation(
                "sender and recipient must differ".into(),
            ));
        }
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(AppError::Validation(format!("invalid currency {}", currency)));
        }

        let fee_amount = transfer.amount * fee_percent / hundred;
        let id = Uuid::new_v4();
        let now = Utc::now();

        Ok(TransferSaga {
            id,
            sender_ref: transfer.sender_ref,
            recipient_ref: transfer.recipient_ref,
            amount: transfer.amount,
            currency,
            fee_percent,
            fee_amount,
            recipient_amount: transfer.amount - fee_amount,
            collect_leg: SagaLeg::new(idempotency_key(
                EscrowSubject::Transfer,
                id,
                EscrowDirection::Collect,
            )),
            disburse_leg: SagaLeg::new(idempotency_key(
                EscrowSubject::Transfer,
                id,
                EscrowDirection::Disburse,
            )),
            overall_status: SagaStatus::Pending,
            reconciliation_id: None,
            created_at: now,
            updated_at: now,
            version: 0,
        })
    }

    async fn drive(&self, mut saga: TransferSaga) -> AppResult<TransferSaga> {
        // ========== LEG 1: COLLECT ==========
        if saga.collect_leg.status != LegStatus::Succeeded {
            match self.ledger.execute(self.collect_movement(&saga)).await {
                Ok(tx) => {
                    mark_leg(&mut saga.collect_leg, &tx);
                    saga = self.save(saga).await?;
                }
                Err(e) => {
                    let key = saga.collect_leg.idempotency_key.clone();
                    if let Some(tx) = self.ledger.settled(&key).await? {
                        info!("✓ Transfer {} collect {} settled by another run", saga.id, key);
                        mark_leg(&mut saga.collect_leg, &tx);
                        saga = self.save(saga).await?;
                    } else if e.is_exhausted() {
                        error!("❌ Transfer {} collection failed: {}", saga.id, e);
                        saga.collect_leg.status = LegStatus::Failed;
                        saga.overall_status = SagaStatus::Failed;
                        let saga = self.save(saga).await?;
                        return Err(SagaError::CollectFailed {
                            saga_id: saga.id,
                            reason: e.to_string(),
                        }
                        .into());
                    } else {
                        // Outcome unknown: leave the saga as it is so a later retry resumes it
                        warn!("⏳ Transfer {} collection not settled yet: {}", saga.id, e);
                        return Err(e);
                    }
                }
            }
        }

        // ========== LEG 2: DISBURSE ==========
        let movement = self.disburse_movement(&saga);
        match self.ledger.execute(movement.clone()).await {
            Ok(tx) => {
                mark_leg(&mut saga.disburse_leg, &tx);
                saga.overall_status = SagaStatus::Completed;
                if let Some(reconciliation_id) = saga.reconciliation_id {
                    self.resolve_reconciliation(reconciliation_id).await?;
                }
                let saga = self.save(saga).await?;
                info!(
                    "✅ Transfer {} completed: {} {} delivered",
                    saga.id, saga.recipient_amount, saga.currency
                );
                Ok(saga)
            }
            Err(e) if e.is_in_progress() => {
                warn!("⏳ Transfer {} disbursement in progress elsewhere: {}", saga.id, e);
                Err(e)
            }
            Err(e) => {
                let reason = e.to_string();
                if saga.reconciliation_id.is_none() {
                    let record =
                        movement.reconciliation(ReconciliationKind::TransferDisburse, reason.clone());
                    self.store.insert_reconciliation(&record).await?;
                    saga.reconciliation_id = Some(record.id);
                }
                saga.disburse_leg.status = LegStatus::Failed;
                saga.overall_status = SagaStatus::PartialFailure;
                let saga = self.save(saga).await?;

                error!(
                    "🚨 Transfer {} partially failed: sender charged {} {}, recipient unpaid ({})",
                    saga.id, saga.amount, saga.currency, reason
                );
                Err(SagaError::PartialFailure {
                    saga_id: saga.id,
                    reconciliation_id: saga.reconciliation_id,
                    reason,
                }
                .into())
            }
        }
    }

    fn collect_movement(&self, saga: &TransferSaga) -> Movement {
        Movement {
            subject: EscrowSubject::Transfer,
            reference_id: saga.id,
            direction: EscrowDirection::Collect,
            amount: saga.amount,
            currency: saga.currency.clone(),
            party_ref: saga.sender_ref.clone(),
        }
    }

    fn disburse_movement(&self, saga: &TransferSaga) -> Movement {
        Movement {
            subject: EscrowSubject::Transfer,
            reference_id: saga.id,
            direction: EscrowDirection::Disburse,
            amount: saga.recipient_amount,
            currency: saga.currency.clone(),
            party_ref: saga.recipient_ref.clone(),
        }
    }

    async fn save(&self, mut saga: TransferSaga) -> AppResult<TransferSaga> {
        let expected = saga.version;
        saga.updated_at = Utc::now();
        self.store.update_saga(&saga, expected).await
    }

    async fn resolve_reconciliation(&self, id: Uuid) -> AppResult<()> {
        let Some(record) = self.store.get_reconciliation(id).await? else {
            warn!("Reconciliation record {} missing", id);
            return Ok(());
        };
        if !record.is_open() {
            return Ok(());
        }
        let mut resolved = record.clone();
        resolved.resolved_at = Some(Utc::now());
        self.store
            .update_reconciliation(&resolved, record.version)
            .await?;
        Ok(())
    }
}

fn mark_leg(leg: &mut SagaLeg, tx: &EscrowTransaction) {
    leg.status = LegStatus::Succeeded;
    leg.escrow_transaction_id = Some(tx.id);
}
