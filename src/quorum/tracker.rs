use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ledger::EntityLocks;
use crate::error::{AppError, AppResult, QuorumError};
use crate::ledger::models::{
    ApprovalDecision, ApprovalRecord, ApprovalStatus, QuorumOutcome, QuorumState, SnapshotEntry,
};
use crate::ledger::PersistenceStore;

/// Result of recording one shareholder decision
#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    pub quorum: QuorumState,
    pub record: ApprovalRecord,
    /// True only for the call that moved the outcome pending -> met
    pub threshold_crossed: bool,
    /// False when the same decision had already been recorded
    pub recorded: bool,
}

/// Ownership-weighted consensus for one investment
///
/// INVARIANTS:
/// - `approved_share_percent` is always recomputed from the approval records,
///   never accumulated incrementally
/// - outcome leaves pending at most once, via compare-and-swap on the quorum version
/// - `record_approval` and `sweep_expired` run under the per-investment lock
pub struct QuorumTracker {
    store: Arc<dyn PersistenceStore>,
    locks: Arc<EntityLocks>,
    retry_limit: u32,
}

impl QuorumTracker {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        locks: Arc<EntityLocks>,
        retry_limit: u32,
    ) -> Self {
        Self {
            store,
            locks,
            retry_limit: retry_limit.max(1),
        }
    }

    /// Freeze the snapshot and open the quorum
    ///
    /// Idempotent: a second call for the same investment returns the existing state.
    pub async fn create(
        &self,
        investment_id: Uuid,
        snapshot: Vec<SnapshotEntry>,
        threshold_percent: Decimal,
        deadline: DateTime<Utc>,
    ) -> AppResult<QuorumState> {
        let total = Self::validate_snapshot(&snapshot, threshold_percent)?;

        let quorum = QuorumState {
            investment_id,
            snapshot,
            total_eligible_share_percent: total,
            approved_share_percent: Decimal::ZERO,
            threshold_percent,
            deadline,
            outcome: QuorumOutcome::Pending,
            decided_at: None,
            created_at: Utc::now(),
            version: 0,
        };

        match self.store.insert_quorum(&quorum).await {
            Ok(()) => {
                info!(
                    "🗳️ Quorum opened for investment {}: {}% eligible, threshold {}%, deadline {}",
                    investment_id, total, threshold_percent, deadline
                );
                Ok(quorum)
            }
            Err(AppError::Duplicate(_)) => self.get(investment_id).await,
            Err(e) => Err(e),
        }
    }

    /// Check a snapshot can open a quorum; returns the eligible share total
    pub fn validate_snapshot(
        snapshot: &[SnapshotEntry],
        threshold_percent: Decimal,
    ) -> AppResult<Decimal> {
        let hundred = Decimal::from(100);
        if threshold_percent <= Decimal::ZERO || threshold_percent > hundred {
            return Err(QuorumError::InvalidParameters(format!(
                "threshold must be in (0, 100], got {}",
                threshold_percent
            ))
            .into());
        }
        if snapshot.is_empty() {
            return Err(QuorumError::InvalidParameters("shareholder snapshot is empty".into()).into());
        }
        if snapshot
            .iter()
            .any(|e| e.share_percent < Decimal::ZERO || e.share_percent > hundred)
        {
            return Err(QuorumError::InvalidParameters(
                "share percentages must be within 0-100".into(),
            )
            .into());
        }

        let total: Decimal = snapshot.iter().map(|e| e.share_percent).sum();
        if total > hundred {
            return Err(QuorumError::InvalidParameters(format!(
                "snapshot shares sum to {}%",
                total
            ))
            .into());
        }
        Ok(total)
    }

    /// Pending records for every snapshot shareholder allowed to decide
    pub async fn open_approvals(&self, quorum: &QuorumState) -> AppResult<Vec<ApprovalRecord>> {
        let now = Utc::now();
        let records: Vec<ApprovalRecord> = quorum
            .snapshot
            .iter()
            .filter(|e| e.can_approve)
            .map(|e| ApprovalRecord {
                id: Uuid::new_v4(),
                investment_id: quorum.investment_id,
                shareholder_id: e.shareholder_id,
                share_percent: e.share_percent,
                status: ApprovalStatus::Pending,
                pin_verified: false,
                decided_at: None,
                created_at: now,
                version: 0,
            })
            .collect();

        let inserted = self.store.insert_approvals(&records).await?;
        debug!(
            "Opened {} approval records for investment {}",
            inserted, quorum.investment_id
        );
        self.store.list_approvals(quorum.investment_id).await
    }

    pub async fn get(&self, investment_id: Uuid) -> AppResult<QuorumState> {
        self.store
            .get_quorum(investment_id)
            .await?
            .ok_or_else(|| QuorumError::NotFound(investment_id).into())
    }

    pub async fn approvals(&self, investment_id: Uuid) -> AppResult<Vec<ApprovalRecord>> {
        self.store.list_approvals(investment_id).await
    }

    /// Record a PIN-verified decision and recompute the quorum
    ///
    /// Repeating the same decision is a no-op; a conflicting one is rejected.
    /// Decisions after `met` are recorded but never change the outcome.
    pub async fn record_approval(
        &self,
        investment_id: Uuid,
        shareholder_id: Uuid,
        decision: ApprovalDecision,
        now: DateTime<Utc>,
    ) -> AppResult<ApprovalOutcome> {
        let _guard = self.locks.acquire(investment_id).await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .try_record(investment_id, shareholder_id, decision, now)
                .await
            {
                Err(e) if e.is_concurrency_conflict() && attempt < self.retry_limit => {
                    warn!(
                        "🔁 Version conflict recording approval for {} (attempt {}), reloading",
                        investment_id, attempt
                    );
                }
                other => return other,
            }
        }
    }

    async fn try_record(
        &self,
        investment_id: Uuid,
        shareholder_id: Uuid,
        decision: ApprovalDecision,
        now: DateTime<Utc>,
    ) -> AppResult<ApprovalOutcome> {
        let quorum = self.get(investment_id).await?;

        let entry = quorum
            .snapshot_entry(shareholder_id)
            .ok_or(QuorumError::NotEligible(shareholder_id))?;
        if !entry.can_approve {
            return Err(QuorumError::NotEligible(shareholder_id).into());
        }
        if entry.user_id.is_none() {
            return Err(QuorumError::UnlinkedShareholder(shareholder_id).into());
        }

        let record = self
            .store
            .get_approval(investment_id, shareholder_id)
            .await?
            .ok_or(QuorumError::NotEligible(shareholder_id))?;

        if record.is_decided() {
            if record.status != decision.status() {
                return Err(QuorumError::AlreadyDecided {
                    shareholder_id,
                    current: record.status,
                }
                .into());
            }
            debug!(
                "Shareholder {} already {} investment {}, no-op",
                shareholder_id, record.status, investment_id
            );
            // Heals a quorum left stale by an interrupted earlier call
            let (quorum, threshold_crossed) = self.recompute(quorum, now).await?;
            return Ok(ApprovalOutcome {
                quorum,
                record,
                threshold_crossed,
                recorded: false,
            });
        }

        match quorum.outcome {
            QuorumOutcome::Expired => {
                return Err(QuorumError::Closed(QuorumOutcome::Expired).into());
            }
            QuorumOutcome::Pending if now >= quorum.deadline => {
                return Err(QuorumError::DeadlinePassed(quorum.deadline).into());
            }
            _ => {}
        }

        let mut decided = record.clone();
        decided.status = decision.status();
        decided.pin_verified = true;
        decided.decided_at = Some(now);
        let record = self.store.update_approval(&decided, record.version).await?;

        info!(
            "✍️ Shareholder {} {} investment {} ({}% of ownership)",
            shareholder_id, record.status, investment_id, record.share_percent
        );

        let (quorum, threshold_crossed) = self.recompute(quorum, now).await?;
        Ok(ApprovalOutcome {
            quorum,
            record,
            threshold_crossed,
            recorded: true,
        })
    }

    /// Recompute the approved share from the records; flip to met if the
    /// threshold is reached while still pending
    async fn recompute(
        &self,
        quorum: QuorumState,
        now: DateTime<Utc>,
    ) -> AppResult<(QuorumState, bool)> {
        let approvals = self.store.list_approvals(quorum.investment_id).await?;
        let approved: Decimal = approvals
            .iter()
            .filter(|a| a.status == ApprovalStatus::Approved)
            .filter_map(|a| quorum.snapshot_entry(a.shareholder_id))
            .map(|e| e.share_percent)
            .sum();

        let mut next = quorum.clone();
        next.approved_share_percent = approved;

        let mut crossed = false;
        if next.is_pending() && approved >= next.threshold_percent {
            next.outcome = QuorumOutcome::Met;
            next.decided_at = Some(now);
            crossed = true;
        }

        if next == quorum {
            return Ok((quorum, false));
        }

        let updated = self.store.update_quorum(&next, quorum.version).await?;
        if crossed {
            info!(
                "🎉 Quorum met for investment {}: {}% approved >= {}% threshold",
                updated.investment_id, updated.approved_share_percent, updated.threshold_percent
            );
        }
        Ok((updated, crossed))
    }

    /// Expire the quorum if its deadline passed while still pending
    ///
    /// Returns the expired state only to the caller that performed the transition.
    pub async fn sweep_expired(
        &self,
        investment_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Option<QuorumState>> {
        let _guard = self.locks.acquire(investment_id).await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_expire(investment_id, now).await {
                Err(e) if e.is_concurrency_conflict() && attempt < self.retry_limit => {
                    warn!(
                        "🔁 Version conflict sweeping {} (attempt {}), reloading",
                        investment_id, attempt
                    );
                }
                other => return other,
            }
        }
    }

    async fn try_expire(
        &self,
        investment_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Option<QuorumState>> {
        let quorum = self.get(investment_id).await?;
        if !quorum.is_pending() || now < quorum.deadline {
            return Ok(None);
        }

        // Approvals that landed before the deadline still count
        let (quorum, _) = self.recompute(quorum, now).await?;
        if !quorum.is_pending() {
            return Ok(None);
        }

        let mut expired = quorum.clone();
        expired.outcome = QuorumOutcome::Expired;
        expired.decided_at = Some(now);
        let expired = self.store.update_quorum(&expired, quorum.version).await?;

        info!(
            "⌛ Quorum expired for investment {}: {}% approved < {}% threshold",
            investment_id, expired.approved_share_percent, expired.threshold_percent
        );
        Ok(Some(expired))
    }
}
