use chrono::Utc;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::gateway::{GatewayStatus, MovementRequest, PaymentGateway};
use crate::config::EscrowConfig;
use crate::error::{AppError, AppResult, EscrowError};
use crate::ledger::models::{
    EscrowDirection, EscrowStatus, EscrowSubject, EscrowTransaction, ReconciliationKind,
    ReconciliationRecord,
};
use crate::ledger::PersistenceStore;

/// Deterministic key for one logical fund movement
///
/// Same subject, reference and direction always produce the same key, so a
/// retried call is deduplicated by the provider.
pub fn idempotency_key(
    subject: EscrowSubject,
    reference_id: Uuid,
    direction: EscrowDirection,
) -> String {
    let digest = Sha256::digest(
        format!("{}:{}:{}", subject.as_str(), reference_id, direction.as_str()).as_bytes(),
    );
    format!("{}_{}", direction.as_str(), hex::encode(&digest[..16]))
}

/// A fund movement the ledger is asked to perform
#[derive(Debug, Clone)]
pub struct Movement {
    pub subject: EscrowSubject,
    pub reference_id: Uuid,
    pub direction: EscrowDirection,
    pub amount: Decimal,
    pub currency: String,
    pub party_ref: String,
}

impl Movement {
    pub fn key(&self) -> String {
        idempotency_key(self.subject, self.reference_id, self.direction)
    }

    /// Operator record for this movement when it could not be completed
    pub fn reconciliation(
        &self,
        kind: ReconciliationKind,
        reason: impl Into<String>,
    ) -> ReconciliationRecord {
        ReconciliationRecord {
            id: Uuid::new_v4(),
            kind,
            reference_id: self.reference_id,
            idempotency_key: self.key(),
            amount: self.amount,
            currency: self.currency.clone(),
            party_ref: self.party_ref.clone(),
            reason: reason.into(),
            created_at: Utc::now(),
            resolved_at: None,
            version: 0,
        }
    }
}

/// Executes and records fund movements exactly-once from the caller's view
///
/// INVARIANTS:
/// - at most one succeeded EscrowTransaction per idempotency key
/// - a terminal record is never mutated; retrying a failed movement appends a new round
/// - only the ledger mutates a pending record
pub struct EscrowLedger {
    store: Arc<dyn PersistenceStore>,
    gateway: Arc<dyn PaymentGateway>,
    config: EscrowConfig,
}

impl EscrowLedger {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        gateway: Arc<dyn PaymentGateway>,
        config: EscrowConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    pub async fn collect(
        &self,
        subject: EscrowSubject,
        reference_id: Uuid,
        amount: Decimal,
        currency: &str,
        payer_ref: &str,
    ) -> AppResult<EscrowTransaction> {
        self.execute(Movement {
            subject,
            reference_id,
            direction: EscrowDirection::Collect,
            amount,
            currency: currency.to_string(),
            party_ref: payer_ref.to_string(),
        })
        .await
    }

    pub async fn disburse(
        &self,
        subject: EscrowSubject,
        reference_id: Uuid,
        amount: Decimal,
        currency: &str,
        payee_ref: &str,
    ) -> AppResult<EscrowTransaction> {
        self.execute(Movement {
            subject,
            reference_id,
            direction: EscrowDirection::Disburse,
            amount,
            currency: currency.to_string(),
            party_ref: payee_ref.to_string(),
        })
        .await
    }

    /// The succeeded round for a key, if any
    pub async fn settled(&self, idempotency_key: &str) -> AppResult<Option<EscrowTransaction>> {
        let rounds = self.store.list_escrow_by_key(idempotency_key).await?;
        Ok(rounds.into_iter().find(|r| r.succeeded()))
    }

    pub async fn movements(&self, reference_id: Uuid) -> AppResult<Vec<EscrowTransaction>> {
        self.store.list_escrow_for_reference(reference_id).await
    }

    /// Run one logical movement
    ///
    /// Returns the already-succeeded round without calling the gateway when one
    /// exists. Otherwise opens the next round (bounded by `max_rounds`) and
    /// drives it through the retry loop.
    pub async fn execute(&self, movement: Movement) -> AppResult<EscrowTransaction> {
        let key = movement.key();
        let rounds = self.store.list_escrow_by_key(&key).await?;

        if let Some(done) = rounds.iter().find(|r| r.succeeded()) {
            info!(
                "✓ {} {} already settled in round {}, not moving funds again",
                movement.direction, key, done.round
            );
            return Ok(done.clone());
        }

        if let Some(open) = rounds.iter().find(|r| r.status == EscrowStatus::Pending) {
            return self.resume_if_stale(open.clone()).await;
        }

        let completed_rounds = rounds.len() as i32;
        if completed_rounds >= self.config.max_rounds as i32 {
            error!(
                "🚨 {} {} failed {} rounds. Manual reconciliation required.",
                movement.direction, key, completed_rounds
            );
            return Err(EscrowError::RoundsExhausted {
                key,
                rounds: completed_rounds,
            }
            .into());
        }

        let now = Utc::now();
        let record = EscrowTransaction {
            id: Uuid::new_v4(),
            reference_id: movement.reference_id,
            subject: movement.subject,
            direction: movement.direction,
            idempotency_key: key.clone(),
            round: completed_rounds + 1,
            status: EscrowStatus::Pending,
            amount: movement.amount,
            currency: movement.currency,
            party_ref: movement.party_ref,
            attempt_count: 0,
            last_error: None,
            provider_ref: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        // A concurrent caller opening the same round loses here
        match self.store.insert_escrow(&record).await {
            Ok(()) => {}
            Err(AppError::Duplicate(_)) => return Err(EscrowError::InFlight(key).into()),
            Err(e) => return Err(e),
        }

        self.run_round(record).await
    }

    /// A pending round is normally owned by a live retry loop. One that has not
    /// been touched for longer than a full loop can take was abandoned (process
    /// restart); it is claimed with a version bump and driven again under the
    /// same key, which the provider deduplicates.
    async fn resume_if_stale(&self, open: EscrowTransaction) -> AppResult<EscrowTransaction> {
        let stale_after = self.config.max_backoff * self.config.max_attempts
            + std::time::Duration::from_secs(60);
        let idle = (Utc::now() - open.updated_at).to_std().unwrap_or_default();
        if idle < stale_after {
            return Err(EscrowError::InFlight(open.idempotency_key).into());
        }

        let mut claimed = open.clone();
        claimed.updated_at = Utc::now();
        let claimed = match self.store.update_escrow(&claimed, open.version).await {
            Ok(claimed) => claimed,
            Err(e) if e.is_concurrency_conflict() => {
                return Err(EscrowError::InFlight(open.idempotency_key).into())
            }
            Err(e) => return Err(e),
        };

        warn!(
            "♻️ Resuming abandoned {} {} round {} after {:?} idle",
            claimed.direction, claimed.idempotency_key, claimed.round, idle
        );
        self.run_round(claimed).await
    }

    /// Bounded retry loop with exponential backoff
    async fn run_round(&self, mut record: EscrowTransaction) -> AppResult<EscrowTransaction> {
        let request = MovementRequest {
            idempotency_key: record.idempotency_key.clone(),
            amount: record.amount,
            currency: record.currency.clone(),
            party_ref: record.party_ref.clone(),
        };
        let mut backoff = self.config.base_backoff;

        loop {
            let result = match record.direction {
                EscrowDirection::Collect => self.gateway.collect(&request).await,
                EscrowDirection::Disburse => self.gateway.disburse(&request).await,
            };
            record.attempt_count += 1;
            record.updated_at = Utc::now();

            let last_error = match result {
                Ok(outcome) if outcome.status == GatewayStatus::Succeeded => {
                    record.status = EscrowStatus::Succeeded;
                    record.provider_ref = outcome.provider_ref;
                    record.last_error = None;
                    let expected = record.version;
                    let settled = self.store.update_escrow(&record, expected).await?;
                    info!(
                        "✅ {} {} {} settled via {} (round {}, attempt {})",
                        settled.direction,
                        settled.amount,
                        settled.currency,
                        self.gateway.name(),
                        settled.round,
                        settled.attempt_count
                    );
                    return Ok(settled);
                }
                Ok(outcome) if outcome.status == GatewayStatus::Pending => "pending".to_string(),
                Ok(outcome) => outcome
                    .error
                    .unwrap_or_else(|| "declined by provider".to_string()),
                Err(e) => e.to_string(),
            };
            record.last_error = Some(last_error.clone());

            if record.attempt_count >= self.config.max_attempts as i32 {
                record.status = EscrowStatus::Failed;
                let expected = record.version;
                let failed = self.store.update_escrow(&record, expected).await?;
                error!(
                    "❌ {} {} failed after {} attempts: {}",
                    failed.direction, failed.idempotency_key, failed.attempt_count, last_error
                );
                return Err(EscrowError::GatewayExhausted {
                    key: failed.idempotency_key,
                    attempts: failed.attempt_count,
                    last_error,
                }
                .into());
            }

            let expected = record.version;
            record = self.store.update_escrow(&record, expected).await?;

            warn!(
                "⚠️ {} {} attempt {}/{} failed ({}), retrying in {:?}",
                record.direction,
                record.idempotency_key,
                record.attempt_count,
                self.config.max_attempts,
                last_error,
                backoff
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }
}
