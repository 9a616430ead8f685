use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::auth::{AuthorizationCheck, AuthorizationRequest, AuthorizationSubject};
use super::notifier::{NotificationDispatcher, NotificationPayload};
use crate::config::SettlementConfig;
use crate::error::{AppError, AppResult, QuorumError};
use crate::escrow::{EscrowLedger, Movement};
use crate::ledger::models::*;
use crate::ledger::{EntityLocks, PersistenceStore};
use crate::quorum::QuorumTracker;

/// Decimal places kept on recomputed ownership percentages
const OWNERSHIP_DP: u32 = 4;

// ========== INPUTS & VIEWS ==========

/// What an investor signs
#[derive(Debug, Clone)]
pub struct NewInvestment {
    pub pitch_id: Uuid,
    pub business_id: Uuid,
    pub business_name: String,
    pub investor_id: Uuid,
    pub amount: Decimal,
    pub currency: Option<String>,
    pub share_price: Decimal,
    pub threshold_percent: Option<Decimal>,
    pub investor_payment_ref: String,
    pub business_payment_ref: String,
    /// Pitch funding target; enables the per-investor allocation cap
    pub funding_target: Option<Decimal>,
    /// Business shares outstanding before this investment. Falls back to the
    /// register's share counts when None.
    pub outstanding_shares: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct NewShareholder {
    pub id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub name: String,
    pub ownership_share_percent: Decimal,
    pub shares: Option<Decimal>,
    pub can_approve: bool,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvestmentView {
    pub investment: Investment,
    pub quorum: Option<QuorumState>,
    pub approvals: Vec<ApprovalRecord>,
    pub escrow: Vec<EscrowTransaction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalResult {
    pub investment: Investment,
    pub quorum: QuorumState,
    pub record: ApprovalRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub expired: usize,
    pub reversed: usize,
    pub finalized: usize,
    pub flagged: usize,
    pub resumed: usize,
    /// Finalized investments whose release had not settled
    pub released: usize,
    /// Cancelled investments whose late collect had not been refunded
    pub refunded: usize,
}

/// Drives investments through their lifecycle
///
/// INVARIANTS:
/// - the only component that changes `Investment.status`, and only along
///   `InvestmentStatus::can_transition_to`
/// - every status change is a version compare-and-swap, retried on conflict
///   up to `concurrency_retry_limit`
/// - quorum open, finalize, reversal, refund and resolve for one investment run
///   under its settle lock, which is held across the gateway call. Lock order is
///   settle lock then quorum lock, never the reverse. The business' register
///   lock is only ever taken innermost.
/// - a disburse that is in flight elsewhere is never flagged for reconciliation
///
/// SECURITY: every investor, shareholder or business owner action passes an
/// explicit `AuthorizationCheck` verdict before any mutation.
pub struct SettlementCoordinator {
    store: Arc<dyn PersistenceStore>,
    ledger: Arc<EscrowLedger>,
    tracker: Arc<QuorumTracker>,
    settle_locks: EntityLocks,
    /// Per business; serializes read-modify-write of the register
    register_locks: EntityLocks,
    auth: Arc<dyn AuthorizationCheck>,
    notifier: Arc<dyn NotificationDispatcher>,
    config: SettlementConfig,
}

impl SettlementCoordinator {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        ledger: Arc<EscrowLedger>,
        auth: Arc<dyn AuthorizationCheck>,
        notifier: Arc<dyn NotificationDispatcher>,
        config: SettlementConfig,
    ) -> Self {
        let tracker = Arc::new(QuorumTracker::new(
            store.clone(),
            Arc::new(EntityLocks::new()),
            config.concurrency_retry_limit,
        ));

        Self {
            store,
            ledger,
            tracker,
            settle_locks: EntityLocks::new(),
            register_locks: EntityLocks::new(),
            auth,
            notifier,
            config,
        }
    }

    // ========== SHAREHOLDERS ==========

    /// Insert or update a business' shareholder register
    ///
    /// Only a verified owner of the business may change it. Running quorums keep
    /// their snapshot; only later investments see the change.
    #[instrument(skip(self, credential, shareholders))]
    pub async fn register_shareholders(
        &self,
        caller_id: Uuid,
        credential: &str,
        business_id: Uuid,
        shareholders: Vec<NewShareholder>,
    ) -> AppResult<Vec<Shareholder>> {
        self.auth
            .verify(&AuthorizationRequest {
                caller_id,
                subject: AuthorizationSubject::BusinessOwner { business_id },
                credential: credential.to_string(),
            })
            .await
            .require()?;

        let hundred = Decimal::from(100);
        let incoming: Vec<Shareholder> = shareholders
            .into_iter()
            .map(|s| Shareholder {
                id: s.id.unwrap_or_else(Uuid::new_v4),
                business_id,
                user_id: s.user_id,
                name: s.name,
                ownership_share_percent: s.ownership_share_percent,
                shares: s.shares.unwrap_or(Decimal::ZERO),
                can_approve: s.can_approve,
                status: if s.active {
                    ShareholderStatus::Active
                } else {
                    ShareholderStatus::Inactive
                },
            })
            .collect();

        if let Some(bad) = incoming
            .iter()
            .find(|s| s.ownership_share_percent < Decimal::ZERO || s.ownership_share_percent > hundred)
        {
            return Err(AppError::Validation(format!(
                "Shareholder {} has ownership {}%, expected 0-100",
                bad.name, bad.ownership_share_percent
            )));
        }
        if let Some(bad) = incoming.iter().find(|s| s.shares < Decimal::ZERO) {
            return Err(AppError::Validation(format!(
                "Shareholder {} has a negative share count",
                bad.name
            )));
        }

        let _register = self.register_locks.acquire(business_id).await;
        let existing = self.store.list_shareholders(business_id).await?;
        let active_total: Decimal = existing
            .iter()
            .filter(|s| !incoming.iter().any(|i| i.id == s.id))
            .chain(incoming.iter())
            .filter(|s| s.status == ShareholderStatus::Active)
            .map(|s| s.ownership_share_percent)
            .sum();
        if active_total > hundred {
            return Err(AppError::Validation(format!(
                "Active ownership would total {}%",
                active_total
            )));
        }

        self.store.upsert_shareholders(&incoming).await?;
        info!(
            "👥 Registered {} shareholders for business {}",
            incoming.len(),
            business_id
        );
        self.store.list_shareholders(business_id).await
    }

    /// Put the investor on the business' register and dilute everyone else
    ///
    /// Idempotent: the investor's entry is keyed by the investment id, so a
    /// resumed finalize never dilutes twice.
    async fn issue_shares(&self, investment: &Investment) -> AppResult<Shareholder> {
        let _register = self.register_locks.acquire(investment.business_id).await;
        let register = self.store.list_shareholders(investment.business_id).await?;
        if let Some(issued) = register.iter().find(|s| s.id == investment.id) {
            return Ok(issued.clone());
        }

        let outstanding = investment
            .outstanding_shares
            .or_else(|| registered_share_count(&register));
        let mut updated = Vec::with_capacity(register.len() + 1);
        let investor_percent = match outstanding {
            Some(outstanding) if outstanding > Decimal::ZERO => {
                let post_money = outstanding + investment.shares;
                for holder in &register {
                    let mut diluted = holder.clone();
                    diluted.ownership_share_percent =
                        ownership(holder.ownership_share_percent * outstanding / post_money);
                    updated.push(diluted);
                }
                ownership(investment.shares * Decimal::from(100) / post_money)
            }
            _ => {
                warn!(
                    "⚠️ Outstanding shares of business {} unknown, investor {} registered without an ownership percentage",
                    investment.business_id, investment.investor_id
                );
                Decimal::ZERO
            }
        };

        let issued = Shareholder {
            id: investment.id,
            business_id: investment.business_id,
            user_id: Some(investment.investor_id),
            name: format!("Investor {}", investment.investor_id),
            ownership_share_percent: investor_percent,
            shares: investment.shares,
            can_approve: true,
            status: ShareholderStatus::Active,
        };
        updated.push(issued.clone());
        self.store.upsert_shareholders(&updated).await?;

        info!(
            "📜 Issued {} shares ({}%) of business {} to investor {}",
            issued.shares, issued.ownership_share_percent, investment.business_id, investment.investor_id
        );
        Ok(issued)
    }

    // ========== SIGN ==========

    /// Validate, authorize, collect, then open the approval quorum
    ///
    /// A failed collect leaves the investment `failed` and surfaces the gateway error.
    #[instrument(skip(self, credential, new), fields(investor_id = %new.investor_id))]
    pub async fn sign_investment(
        &self,
        caller_id: Uuid,
        credential: &str,
        new: NewInvestment,
    ) -> AppResult<InvestmentView> {
        let funding_target = new.funding_target;
        let investment = self.validate_new(new)?;

        self.authorize_investor(caller_id, investment.investor_id, None, credential)
            .await?;
        self.check_allocation(&investment, funding_target).await?;

        // Fail before any money moves if no quorum could ever open
        let snapshot = self.snapshot(investment.business_id).await?;
        QuorumTracker::validate_snapshot(&snapshot, investment.threshold_percent)
            .map_err(|e| AppError::Validation(e.to_string()))?;

        self.store.insert_investment(&investment).await?;
        info!(
            "📝 Investment {} signed: {} {} into pitch {}",
            investment.id, investment.amount, investment.currency, investment.pitch_id
        );

        let id = investment.id;
        self.transition(id, InvestmentStatus::EscrowPending, |_| {})
            .await?;

        let collected = self
            .ledger
            .collect(
                EscrowSubject::Investment,
                id,
                investment.amount,
                &investment.currency,
                &investment.investor_payment_ref,
            )
            .await;

        if let Err(e) = collected {
            error!("❌ Collection failed for investment {}: {}", id, e);
            let reason = e.to_string();
            match self
                .transition(id, InvestmentStatus::Failed, |inv| {
                    inv.failure_reason = Some(reason.clone())
                })
                .await
            {
                Ok(_) | Err(AppError::InvalidTransition { .. }) => {}
                Err(te) => warn!("Could not mark investment {} failed: {}", id, te),
            }
            return Err(e);
        }

        let _settle = self.settle_locks.acquire(id).await;
        match self.transition(id, InvestmentStatus::EscrowHeld, |_| {}).await {
            Ok(_) => {}
            Err(AppError::InvalidTransition {
                from: InvestmentStatus::Cancelled,
                ..
            }) => {
                warn!("Investment {} was cancelled while collecting, refunding", id);
                self.refund_cancelled(id).await?;
                return self.view(id).await;
            }
            Err(e) => return Err(e),
        }

        self.open_quorum(id).await?;
        self.view(id).await
    }

    fn validate_new(&self, new: NewInvestment) -> AppResult<Investment> {
        let hundred = Decimal::from(100);
        let threshold = new
            .threshold_percent
            .unwrap_or(self.config.default_threshold_percent);
        let currency = new
            .currency
            .unwrap_or_else(|| self.config.default_currency.clone())
            .to_uppercase();

        if new.amount <= Decimal::ZERO {
            return Err(AppError::Validation("amount must be positive".into()));
        }
        if new.share_price <= Decimal::ZERO {
            return Err(AppError::Validation("share price must be positive".into()));
        }
        if threshold <= Decimal::ZERO || threshold > hundred {
            return Err(AppError::Validation(format!(
                "threshold must be in (0, 100], got {}",
                threshold
            )));
        }
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(AppError::Validation(format!("invalid currency {}", currency)));
        }
        if new.investor_payment_ref.trim().is_empty() || new.business_payment_ref.trim().is_empty()
        {
            return Err(AppError::Validation("payment references are required".into()));
        }
        if matches!(new.funding_target, Some(target) if target <= Decimal::ZERO) {
            return Err(AppError::Validation("funding target must be positive".into()));
        }
        if matches!(new.outstanding_shares, Some(outstanding) if outstanding <= Decimal::ZERO) {
            return Err(AppError::Validation("outstanding shares must be positive".into()));
        }

        let now = Utc::now();
        Ok(Investment {
            id: Uuid::new_v4(),
            pitch_id: new.pitch_id,
            business_id: new.business_id,
            business_name: new.business_name,
            investor_id: new.investor_id,
            amount: new.amount,
            currency,
            share_price: new.share_price,
            shares: new.amount / new.share_price,
            outstanding_shares: new.outstanding_shares,
            threshold_percent: threshold,
            investor_payment_ref: new.investor_payment_ref,
            business_payment_ref: new.business_payment_ref,
            status: InvestmentStatus::Created,
            requires_reconciliation: false,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            version: 0,
        })
    }

    /// One investor may hold at most `max_investor_allocation_percent` of a pitch
    async fn check_allocation(
        &self,
        investment: &Investment,
        funding_target: Option<Decimal>,
    ) -> AppResult<()> {
        let Some(target) = funding_target else {
            return Ok(());
        };

        let committed: Decimal = self
            .store
            .list_investor_pitch_investments(investment.investor_id, investment.pitch_id)
            .await?
            .iter()
            .filter(|i| {
                !matches!(
                    i.status,
                    InvestmentStatus::Failed | InvestmentStatus::Cancelled | InvestmentStatus::Reversed
                )
            })
            .map(|i| i.amount)
            .sum();

        let limit = target * self.config.max_investor_allocation_percent / Decimal::from(100);
        if committed + investment.amount > limit {
            return Err(AppError::Validation(format!(
                "Investor would hold {} of a {} target, limit is {}% ({})",
                committed + investment.amount,
                target,
                self.config.max_investor_allocation_percent,
                limit
            )));
        }
        Ok(())
    }

    async fn snapshot(&self, business_id: Uuid) -> AppResult<Vec<SnapshotEntry>> {
        Ok(self
            .store
            .list_shareholders(business_id)
            .await?
            .iter()
            .filter(|s| s.status == ShareholderStatus::Active)
            .map(SnapshotEntry::from)
            .collect())
    }

    /// Freeze the shareholder snapshot, open the quorum and request approvals
    ///
    /// Caller holds the settle lock.
    async fn open_quorum(&self, id: Uuid) -> AppResult<QuorumState> {
        let investment = self.load(id).await?;
        let snapshot = self.snapshot(investment.business_id).await?;
        let deadline = Utc::now() + self.config.approval_window;

        let quorum = self
            .tracker
            .create(id, snapshot, investment.threshold_percent, deadline)
            .await?;
        self.transition(id, InvestmentStatus::AwaitingApproval, |_| {})
            .await?;

        let approvals = self.tracker.open_approvals(&quorum).await?;
        let payload = NotificationPayload::ApprovalRequested {
            business_id: investment.business_id,
            business_name: investment.business_name.clone(),
            amount: investment.amount,
            currency: investment.currency.clone(),
            threshold_percent: quorum.threshold_percent,
            deadline: quorum.deadline,
        };
        let recipients = approvals
            .iter()
            .filter(|a| !a.is_decided())
            .map(|a| a.shareholder_id)
            .collect();
        self.notify_all(id, recipients, &payload).await;

        Ok(quorum)
    }

    // ========== APPROVALS ==========

    /// Authorize a shareholder and record their decision
    #[instrument(skip(self, credential))]
    pub async fn approve_as(
        &self,
        caller_id: Uuid,
        credential: &str,
        investment_id: Uuid,
        shareholder_id: Uuid,
        decision: ApprovalDecision,
    ) -> AppResult<ApprovalResult> {
        let quorum = self.tracker.get(investment_id).await?;
        let entry = quorum
            .snapshot_entry(shareholder_id)
            .ok_or(QuorumError::NotEligible(shareholder_id))?;
        let user_id = entry
            .user_id
            .ok_or(QuorumError::UnlinkedShareholder(shareholder_id))?;
        if user_id != caller_id {
            return Err(AppError::Authorization(
                "caller is not the linked identity for this shareholder".into(),
            ));
        }

        let verdict = self
            .auth
            .verify(&AuthorizationRequest {
                caller_id,
                subject: AuthorizationSubject::Shareholder {
                    investment_id,
                    shareholder_id,
                },
                credential: credential.to_string(),
            })
            .await;
        if !verdict.identity_confirmed {
            return Err(AppError::Authorization("caller identity not confirmed".into()));
        }

        self.submit_approval(investment_id, shareholder_id, decision, verdict.pin_verified)
            .await
    }

    /// Record a decision; finalizes the investment when the quorum is met
    ///
    /// Idempotent once finalized: later approvals never move funds again.
    pub async fn submit_approval(
        &self,
        investment_id: Uuid,
        shareholder_id: Uuid,
        decision: ApprovalDecision,
        pin_verified: bool,
    ) -> AppResult<ApprovalResult> {
        if !pin_verified {
            return Err(AppError::Authorization("PIN not verified".into()));
        }

        let outcome = self
            .tracker
            .record_approval(investment_id, shareholder_id, decision, Utc::now())
            .await?;

        let investment = if outcome.quorum.outcome == QuorumOutcome::Met {
            let _settle = self.settle_locks.acquire(investment_id).await;
            self.finalize(investment_id).await?
        } else {
            self.load(investment_id).await?
        };

        Ok(ApprovalResult {
            investment,
            quorum: outcome.quorum,
            record: outcome.record,
        })
    }

    /// Finalize, issue the investor's shares and release escrow to the business
    ///
    /// Caller holds the settle lock. Only the call that moves the status runs the
    /// follow-up; an interrupted one is completed by the sweep.
    async fn finalize(&self, id: Uuid) -> AppResult<Investment> {
        let (investment, changed) = self
            .transition(id, InvestmentStatus::Finalized, |_| {})
            .await?;
        if !changed {
            return Ok(investment);
        }

        info!("🏁 Investment {} finalized", id);
        let issued = self.issue_shares(&investment).await?;
        match self.release(&investment).await {
            Ok(_) => {}
            Err(e) if e.is_in_progress() => {
                warn!("⏳ Release for investment {} already in flight: {}", id, e)
            }
            Err(e) => return Err(e),
        }
        self.finalized_notices(&investment, &issued).await;

        self.load(id).await
    }

    /// Pay the escrow out to the business
    ///
    /// Ok(false) when the disburse failed and the investment was flagged.
    async fn release(&self, investment: &Investment) -> AppResult<bool> {
        let movement = self.release_movement(investment);
        match self.ledger.execute(movement.clone()).await {
            Ok(tx) => {
                info!(
                    "💸 Released {} {} to business {} for investment {}",
                    tx.amount, tx.currency, investment.business_id, investment.id
                );
                Ok(true)
            }
            Err(e) if e.is_in_progress() => Err(e),
            Err(e) => {
                self.flag_for_reconciliation(
                    investment.id,
                    &movement,
                    ReconciliationKind::InvestmentRelease,
                    e.to_string(),
                )
                .await?;
                Ok(false)
            }
        }
    }

    async fn finalized_notices(&self, investment: &Investment, issued: &Shareholder) {
        let payload = NotificationPayload::InvestmentFinalized {
            amount: investment.amount,
            currency: investment.currency.clone(),
        };
        let recipients = self.final_notice_recipients(investment).await;
        self.notify_all(investment.id, recipients, &payload).await;

        let payload = NotificationPayload::ShareholderAdded {
            business_id: investment.business_id,
            business_name: investment.business_name.clone(),
            shares: issued.shares,
            ownership_share_percent: issued.ownership_share_percent,
        };
        self.notify_all(investment.id, vec![investment.investor_id], &payload)
            .await;
    }

    // ========== DEADLINE SWEEP ==========

    /// Enforce deadlines; also completes steps an interrupted call left behind
    ///
    /// Safe to run concurrently with itself and with approvals: every
    /// per-investment step re-reads its state under the settle lock.
    #[instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> AppResult<SweepReport> {
        let mut report = SweepReport::default();
        let grace = self.config.resume_grace;

        // Held but no quorum: the signing call died after the collect settled
        for held in self
            .store
            .list_investments_by_status(InvestmentStatus::EscrowHeld)
            .await?
            .into_iter()
            .filter(|i| now - i.updated_at >= grace)
        {
            match self.resume_held(held.id).await {
                Ok(true) => report.resumed += 1,
                Ok(false) => {}
                Err(e) => warn!("⚠️ Could not open quorum for held investment {}: {}", held.id, e),
            }
        }

        for awaiting in self
            .store
            .list_investments_by_status(InvestmentStatus::AwaitingApproval)
            .await?
        {
            report.examined += 1;
            if let Err(e) = self.sweep_one(awaiting.id, now, &mut report).await {
                warn!("⚠️ Sweep failed for investment {}: {}", awaiting.id, e);
            }
        }

        // Expired but never reversed: the reversal attempt itself was interrupted
        for expired in self
            .store
            .list_investments_by_status(InvestmentStatus::Expired)
            .await?
            .into_iter()
            .filter(|i| !i.requires_reconciliation)
        {
            match self.reverse_expired(expired.id).await {
                Ok(Some(true)) => report.reversed += 1,
                Ok(Some(false)) => report.flagged += 1,
                Ok(None) => {}
                Err(e) => warn!("⚠️ Reversal failed for investment {}: {}", expired.id, e),
            }
        }

        // Finalized but never paid out: finalize was interrupted before the release
        for finalized in self
            .store
            .list_investments_by_status(InvestmentStatus::Finalized)
            .await?
            .into_iter()
            .filter(|i| !i.requires_reconciliation && now - i.updated_at >= grace)
        {
            match self.resume_finalized(finalized.id).await {
                Ok(Some(true)) => report.released += 1,
                Ok(Some(false)) => report.flagged += 1,
                Ok(None) => {}
                Err(e) => warn!("⚠️ Release failed for investment {}: {}", finalized.id, e),
            }
        }

        // Cancelled while collecting, then the refund was interrupted
        for cancelled in self
            .store
            .list_investments_by_status(InvestmentStatus::Cancelled)
            .await?
            .into_iter()
            .filter(|i| !i.requires_reconciliation && now - i.updated_at >= grace)
        {
            match self.resume_cancelled(cancelled.id).await {
                Ok(Some(true)) => report.refunded += 1,
                Ok(Some(false)) => report.flagged += 1,
                Ok(None) => {}
                Err(e) => warn!("⚠️ Refund failed for investment {}: {}", cancelled.id, e),
            }
        }

        if report != SweepReport::default() {
            info!("🧹 Sweep complete: {:?}", report);
        }
        Ok(report)
    }

    async fn resume_held(&self, id: Uuid) -> AppResult<bool> {
        let _settle = self.settle_locks.acquire(id).await;
        if self.load(id).await?.status != InvestmentStatus::EscrowHeld {
            return Ok(false);
        }
        self.open_quorum(id).await?;
        Ok(true)
    }

    async fn sweep_one(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> AppResult<()> {
        let _settle = self.settle_locks.acquire(id).await;
        // Another sweep or an approval may have settled it while we waited
        if self.load(id).await?.status != InvestmentStatus::AwaitingApproval {
            return Ok(());
        }

        let quorum = self.tracker.get(id).await?;
        let expire = match quorum.outcome {
            QuorumOutcome::Met => {
                self.finalize(id).await?;
                report.finalized += 1;
                return Ok(());
            }
            QuorumOutcome::Expired => true,
            QuorumOutcome::Pending if now >= quorum.deadline => {
                self.tracker.sweep_expired(id, now).await?.is_some()
            }
            QuorumOutcome::Pending => false,
        };

        if !expire {
            // Lost the race to a last-moment approval
            if self.tracker.get(id).await?.outcome == QuorumOutcome::Met {
                self.finalize(id).await?;
                report.finalized += 1;
            }
            return Ok(());
        }

        report.expired += 1;
        self.transition(id, InvestmentStatus::Expired, |_| {}).await?;
        info!("⌛ Investment {} expired without quorum", id);
        match self.reverse(id).await? {
            true => report.reversed += 1,
            false => report.flagged += 1,
        }
        Ok(())
    }

    async fn reverse_expired(&self, id: Uuid) -> AppResult<Option<bool>> {
        let _settle = self.settle_locks.acquire(id).await;
        let investment = self.load(id).await?;
        if investment.status != InvestmentStatus::Expired || investment.requires_reconciliation {
            return Ok(None);
        }
        self.reverse(id).await.map(Some)
    }

    async fn resume_finalized(&self, id: Uuid) -> AppResult<Option<bool>> {
        let _settle = self.settle_locks.acquire(id).await;
        let investment = self.load(id).await?;
        if investment.status != InvestmentStatus::Finalized || investment.requires_reconciliation {
            return Ok(None);
        }
        let key = self.release_movement(&investment).key();
        if self.ledger.settled(&key).await?.is_some() {
            return Ok(None);
        }

        warn!("♻️ Investment {} finalized without a settled release, resuming", id);
        let issued = self.issue_shares(&investment).await?;
        let released = self.release(&investment).await?;
        self.finalized_notices(&investment, &issued).await;
        Ok(Some(released))
    }

    async fn resume_cancelled(&self, id: Uuid) -> AppResult<Option<bool>> {
        let _settle = self.settle_locks.acquire(id).await;
        let investment = self.load(id).await?;
        if investment.status != InvestmentStatus::Cancelled || investment.requires_reconciliation {
            return Ok(None);
        }

        let rounds = self.ledger.movements(id).await?;
        let settled = |direction: EscrowDirection| {
            rounds
                .iter()
                .any(|r| r.direction == direction && r.succeeded())
        };
        if !settled(EscrowDirection::Collect) || settled(EscrowDirection::Disburse) {
            return Ok(None);
        }

        warn!("♻️ Cancelled investment {} holds funds, refunding", id);
        self.refund_cancelled(id).await.map(Some)
    }

    /// Compensating disburse back to the investor
    ///
    /// Caller holds the settle lock. Returns false when the disburse failed and
    /// the investment was flagged.
    async fn reverse(&self, id: Uuid) -> AppResult<bool> {
        let investment = self.load(id).await?;
        let movement = self.refund_movement(&investment);

        match self.ledger.execute(movement.clone()).await {
            Ok(tx) => {
                let (investment, _) = self
                    .transition(id, InvestmentStatus::Reversed, |inv| {
                        inv.requires_reconciliation = false
                    })
                    .await?;
                self.resolve_reconciliations(&movement.key()).await?;
                info!(
                    "↩️ Investment {} reversed: {} {} returned to investor",
                    id, tx.amount, tx.currency
                );
                let payload = NotificationPayload::InvestmentReversed {
                    amount: investment.amount,
                    currency: investment.currency.clone(),
                };
                let recipients = self.final_notice_recipients(&investment).await;
                self.notify_all(id, recipients, &payload).await;
                Ok(true)
            }
            Err(e) if e.is_in_progress() => Err(e),
            Err(e) => {
                self.flag_for_reconciliation(
                    id,
                    &movement,
                    ReconciliationKind::InvestmentReversal,
                    e.to_string(),
                )
                .await?;
                Ok(false)
            }
        }
    }

    // ========== CANCEL & RECONCILE ==========

    /// Investor walks away before any funds were held
    #[instrument(skip(self, credential))]
    pub async fn cancel_investment(
        &self,
        caller_id: Uuid,
        credential: &str,
        id: Uuid,
    ) -> AppResult<Investment> {
        let investment = self.load(id).await?;
        self.authorize_investor(caller_id, investment.investor_id, Some(id), credential)
            .await?;

        let (investment, changed) = self
            .transition(id, InvestmentStatus::Cancelled, |_| {})
            .await?;
        if changed {
            info!("🚫 Investment {} cancelled by investor", id);
        }
        Ok(investment)
    }

    /// Collect landed after the investor cancelled: give the money back
    ///
    /// Caller holds the settle lock. Returns false when the refund was flagged.
    async fn refund_cancelled(&self, id: Uuid) -> AppResult<bool> {
        let investment = self.load(id).await?;
        let movement = self.refund_movement(&investment);
        match self.ledger.execute(movement.clone()).await {
            Ok(_) => {
                if investment.requires_reconciliation {
                    self.clear_reconciliation_flag(id).await?;
                }
                self.resolve_reconciliations(&movement.key()).await?;
                info!("↩️ Refunded cancelled investment {}", id);
                Ok(true)
            }
            Err(e) if e.is_in_progress() => Err(e),
            Err(e) => {
                self.flag_for_reconciliation(
                    id,
                    &movement,
                    ReconciliationKind::InvestmentReversal,
                    e.to_string(),
                )
                .await?;
                Ok(false)
            }
        }
    }

    /// Operator retry of the failed disburse for a flagged investment
    ///
    /// Reuses the original idempotency key; bounded by the ledger's round limit.
    /// A flag left on an investment whose disburse has since settled is cleared
    /// without calling the gateway.
    #[instrument(skip(self))]
    pub async fn resolve_investment(&self, id: Uuid) -> AppResult<InvestmentView> {
        let _settle = self.settle_locks.acquire(id).await;
        let investment = self.load(id).await?;
        if !investment.requires_reconciliation {
            return Err(AppError::Validation(format!(
                "Investment {} does not require reconciliation",
                id
            )));
        }

        let movement = match investment.status {
            InvestmentStatus::Expired | InvestmentStatus::Cancelled | InvestmentStatus::Reversed => {
                self.refund_movement(&investment)
            }
            InvestmentStatus::Finalized => self.release_movement(&investment),
            other => {
                return Err(AppError::Validation(format!(
                    "Investment {} in status {} cannot be reconciled",
                    id, other
                )))
            }
        };

        self.ledger.execute(movement.clone()).await?;

        if investment.status == InvestmentStatus::Expired {
            self.transition(id, InvestmentStatus::Reversed, |inv| {
                inv.requires_reconciliation = false
            })
            .await?;
        } else {
            self.clear_reconciliation_flag(id).await?;
        }
        self.resolve_reconciliations(&movement.key()).await?;

        info!("✅ Investment {} reconciled", id);
        let investment = self.load(id).await?;
        let payload = match investment.status {
            InvestmentStatus::Finalized => Some(NotificationPayload::InvestmentFinalized {
                amount: investment.amount,
                currency: investment.currency.clone(),
            }),
            InvestmentStatus::Reversed => Some(NotificationPayload::InvestmentReversed {
                amount: investment.amount,
                currency: investment.currency.clone(),
            }),
            _ => None,
        };
        if let Some(payload) = payload {
            let recipients = self.final_notice_recipients(&investment).await;
            self.notify_all(id, recipients, &payload).await;
        }

        self.view(id).await
    }

    pub async fn list_reconciliations(&self, open_only: bool) -> AppResult<Vec<ReconciliationRecord>> {
        self.store.list_reconciliations(open_only).await
    }

    async fn flag_for_reconciliation(
        &self,
        id: Uuid,
        movement: &Movement,
        kind: ReconciliationKind,
        reason: String,
    ) -> AppResult<ReconciliationRecord> {
        let key = movement.key();
        let existing = self
            .store
            .list_reconciliations(true)
            .await?
            .into_iter()
            .find(|r| r.idempotency_key == key);

        let record = match existing {
            Some(record) => record,
            None => {
                let record = movement.reconciliation(kind, reason.clone());
                self.store.insert_reconciliation(&record).await?;
                record
            }
        };

        self.modify(id, |current| {
            if current.requires_reconciliation {
                return Ok(None);
            }
            let mut next = current.clone();
            next.requires_reconciliation = true;
            Ok(Some(next))
        })
        .await?;

        error!(
            "🚨 Investment {} requires manual reconciliation ({:?}, record {}): {}",
            id, kind, record.id, reason
        );
        Ok(record)
    }

    async fn clear_reconciliation_flag(&self, id: Uuid) -> AppResult<()> {
        self.modify(id, |current| {
            if !current.requires_reconciliation {
                return Ok(None);
            }
            let mut next = current.clone();
            next.requires_reconciliation = false;
            Ok(Some(next))
        })
        .await?;
        Ok(())
    }

    async fn resolve_reconciliations(&self, idempotency_key: &str) -> AppResult<()> {
        let open = self.store.list_reconciliations(true).await?;
        for record in open.into_iter().filter(|r| r.idempotency_key == idempotency_key) {
            let mut resolved = record.clone();
            resolved.resolved_at = Some(Utc::now());
            self.store
                .update_reconciliation(&resolved, record.version)
                .await?;
        }
        Ok(())
    }

    // ========== READS ==========

    pub async fn view(&self, id: Uuid) -> AppResult<InvestmentView> {
        let investment = self.load(id).await?;
        let quorum = self.store.get_quorum(id).await?;
        let approvals = self.tracker.approvals(id).await?;
        let escrow = self.ledger.movements(id).await?;
        Ok(InvestmentView {
            investment,
            quorum,
            approvals,
            escrow,
        })
    }

    pub async fn shareholders(&self, business_id: Uuid) -> AppResult<Vec<Shareholder>> {
        self.store.list_shareholders(business_id).await
    }

    async fn load(&self, id: Uuid) -> AppResult<Investment> {
        self.store
            .get_investment(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Investment {}", id)))
    }

    // ========== HELPERS ==========

    async fn authorize_investor(
        &self,
        caller_id: Uuid,
        investor_id: Uuid,
        investment_id: Option<Uuid>,
        credential: &str,
    ) -> AppResult<()> {
        if caller_id != investor_id {
            return Err(AppError::Authorization("caller is not the investor".into()));
        }
        self.auth
            .verify(&AuthorizationRequest {
                caller_id,
                subject: AuthorizationSubject::Investor { investment_id },
                credential: credential.to_string(),
            })
            .await
            .require()
    }

    fn refund_movement(&self, investment: &Investment) -> Movement {
        self.disburse_movement(investment, &investment.investor_payment_ref)
    }

    fn release_movement(&self, investment: &Investment) -> Movement {
        self.disburse_movement(investment, &investment.business_payment_ref)
    }

    /// Release and refund are mutually exclusive, so both share the
    /// investment's single disburse key
    fn disburse_movement(&self, investment: &Investment, payee_ref: &str) -> Movement {
        Movement {
            subject: EscrowSubject::Investment,
            reference_id: investment.id,
            direction: EscrowDirection::Disburse,
            amount: investment.amount,
            currency: investment.currency.clone(),
            party_ref: payee_ref.to_string(),
        }
    }

    async fn final_notice_recipients(&self, investment: &Investment) -> Vec<Uuid> {
        let mut recipients = vec![investment.investor_id];
        match self.store.get_quorum(investment.id).await {
            Ok(Some(quorum)) => {
                recipients.extend(quorum.snapshot.iter().map(|e| e.shareholder_id))
            }
            Ok(None) => {}
            Err(e) => warn!("Could not load snapshot for notices on {}: {}", investment.id, e),
        }
        recipients
    }

    /// Fire-and-forget: failures are logged, never propagated
    async fn notify_all(
        &self,
        investment_id: Uuid,
        recipients: Vec<Uuid>,
        payload: &NotificationPayload,
    ) {
        for recipient in recipients {
            if let Err(e) = self.notifier.notify(recipient, investment_id, payload).await {
                warn!(
                    "⚠️ Failed to deliver {} to {} for investment {}: {}",
                    payload.kind(),
                    recipient,
                    investment_id,
                    e
                );
            }
        }
    }

    /// Move to `to` along the state machine; a no-op if already there
    async fn transition<F>(
        &self,
        id: Uuid,
        to: InvestmentStatus,
        annotate: F,
    ) -> AppResult<(Investment, bool)>
    where
        F: Fn(&mut Investment) + Send + Sync,
    {
        let (investment, changed) = self
            .modify(id, |current| {
                if current.status == to {
                    return Ok(None);
                }
                if !current.status.can_transition_to(to) {
                    return Err(AppError::InvalidTransition {
                        from: current.status,
                        to,
                    });
                }
                let mut next = current.clone();
                next.status = to;
                annotate(&mut next);
                Ok(Some(next))
            })
            .await?;

        if changed {
            info!("🔄 Investment {} -> {}", id, to);
        }
        Ok((investment, changed))
    }

    /// Reload-and-retry loop around a versioned investment update
    async fn modify<F>(&self, id: Uuid, change: F) -> AppResult<(Investment, bool)>
    where
        F: Fn(&Investment) -> AppResult<Option<Investment>> + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.load(id).await?;
            let Some(mut next) = change(&current)? else {
                return Ok((current, false));
            };
            next.updated_at = Utc::now();

            match self.store.update_investment(&next, current.version).await {
                Ok(updated) => return Ok((updated, true)),
                Err(e)
                    if e.is_concurrency_conflict()
                        && attempt < self.config.concurrency_retry_limit =>
                {
                    warn!(
                        "🔁 Version conflict on investment {} (attempt {}), reloading",
                        id, attempt
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Total shares on the register, when every entry carries a count
fn registered_share_count(register: &[Shareholder]) -> Option<Decimal> {
    if register.is_empty() || register.iter().any(|s| s.shares <= Decimal::ZERO) {
        return None;
    }
    Some(register.iter().map(|s| s.shares).sum())
}

/// Truncated so recomputed percentages never sum past 100
fn ownership(percent: Decimal) -> Decimal {
    percent.round_dp_with_strategy(OWNERSHIP_DP, RoundingStrategy::ToZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettlementConfig;
    use crate::escrow::gateway::GatewayStatus;
    use crate::ledger::InMemoryStore;
    use crate::testing::{
        fast_escrow_config, pending_round, RecordingNotifier, ScriptedGateway, StaticAuthorization,
    };
    use chrono::Duration;
    use rust_decimal_macros::dec;

    struct Harness {
        coordinator: Arc<SettlementCoordinator>,
        store: Arc<InMemoryStore>,
        gateway: Arc<ScriptedGateway>,
        notifier: Arc<RecordingNotifier>,
        business_id: Uuid,
        investor_id: Uuid,
        /// (shareholder id, linked user id)
        holders: Vec<(Uuid, Uuid)>,
    }

    fn build(auth: StaticAuthorization, notifier: RecordingNotifier) -> Harness {
        build_with(auth, notifier, ScriptedGateway::new())
    }

    fn build_with(
        auth: StaticAuthorization,
        notifier: RecordingNotifier,
        gateway: ScriptedGateway,
    ) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(gateway);
        let notifier = Arc::new(notifier);
        let ledger = Arc::new(EscrowLedger::new(
            store.clone(),
            gateway.clone(),
            fast_escrow_config(),
        ));
        let coordinator = Arc::new(SettlementCoordinator::new(
            store.clone(),
            ledger,
            Arc::new(auth),
            notifier.clone(),
            SettlementConfig::default(),
        ));

        Harness {
            coordinator,
            store,
            gateway,
            notifier,
            business_id: Uuid::new_v4(),
            investor_id: Uuid::new_v4(),
            holders: Vec::new(),
        }
    }

    async fn harness_with_shares(shares: &[Decimal]) -> Harness {
        let mut h = build(StaticAuthorization::allow(), RecordingNotifier::new());
        register(&mut h, shares).await.unwrap();
        h
    }

    /// Ten shares per percentage point
    async fn register(h: &mut Harness, shares: &[Decimal]) -> AppResult<()> {
        let holders: Vec<NewShareholder> = shares
            .iter()
            .enumerate()
            .map(|(n, share)| NewShareholder {
                id: Some(Uuid::new_v4()),
                user_id: Some(Uuid::new_v4()),
                name: format!("Owner {}", n + 1),
                ownership_share_percent: *share,
                shares: Some(*share * dec!(10)),
                can_approve: true,
                active: true,
            })
            .collect();
        h.holders = holders
            .iter()
            .map(|s| (s.id.unwrap(), s.user_id.unwrap()))
            .collect();
        h.coordinator
            .register_shareholders(Uuid::new_v4(), "1234", h.business_id, holders)
            .await?;
        Ok(())
    }

    fn new_investment(h: &Harness, amount: Decimal) -> NewInvestment {
        NewInvestment {
            pitch_id: Uuid::new_v4(),
            business_id: h.business_id,
            business_name: "Kampala Coffee Roasters".into(),
            investor_id: h.investor_id,
            amount,
            currency: None,
            share_price: dec!(1000),
            threshold_percent: None,
            investor_payment_ref: "256700000001".into(),
            business_payment_ref: "256700000099".into(),
            funding_target: None,
            outstanding_shares: None,
        }
    }

    async fn sign(h: &Harness, amount: Decimal) -> InvestmentView {
        h.coordinator
            .sign_investment(h.investor_id, "1234", new_investment(h, amount))
            .await
            .unwrap()
    }

    async fn approve(h: &Harness, id: Uuid, holder: usize) -> AppResult<ApprovalResult> {
        let (shareholder_id, user_id) = h.holders[holder];
        h.coordinator
            .approve_as(user_id, "1234", id, shareholder_id, ApprovalDecision::Approve)
            .await
    }

    fn past_deadline() -> DateTime<Utc> {
        Utc::now() + Duration::hours(24) + Duration::seconds(1)
    }

    #[tokio::test]
    async fn test_sign_collects_then_opens_quorum() {
        let h = harness_with_shares(&[dec!(50), dec!(30), dec!(20)]).await;
        let view = sign(&h, dec!(100000)).await;

        assert_eq!(view.investment.status, InvestmentStatus::AwaitingApproval);
        assert_eq!(view.investment.currency, "UGX");
        assert_eq!(view.investment.threshold_percent, dec!(60));
        let quorum = view.quorum.unwrap();
        assert_eq!(quorum.total_eligible_share_percent, dec!(100));
        assert_eq!(view.approvals.len(), 3);
        assert_eq!(view.escrow.len(), 1);
        assert!(view.escrow[0].succeeded());
        assert_eq!(h.gateway.movements(EscrowDirection::Collect), vec![dec!(100000)]);
        assert_eq!(
            h.notifier
                .count_where(|p| matches!(p, NotificationPayload::ApprovalRequested { .. })),
            3
        );
    }

    #[tokio::test]
    async fn test_collect_failure_is_terminal_without_quorum() {
        let h = harness_with_shares(&[dec!(100)]).await;
        h.gateway.fail_always(EscrowDirection::Collect);

        let err = h
            .coordinator
            .sign_investment(h.investor_id, "1234", new_investment(&h, dec!(5000)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Escrow(_)));

        let failed = h
            .store
            .list_investments_by_status(InvestmentStatus::Failed)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].failure_reason.is_some());
        assert!(h.store.get_quorum(failed[0].id).await.unwrap().is_none());
        assert_eq!(h.notifier.sent.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_quorum_finalizes_and_releases_once() {
        let h = harness_with_shares(&[dec!(50), dec!(30), dec!(20)]).await;
        let id = sign(&h, dec!(100000)).await.investment.id;

        let first = approve(&h, id, 0).await.unwrap();
        assert_eq!(first.investment.status, InvestmentStatus::AwaitingApproval);

        let second = approve(&h, id, 1).await.unwrap();
        assert_eq!(second.investment.status, InvestmentStatus::Finalized);
        assert_eq!(second.quorum.outcome, QuorumOutcome::Met);

        // Approval after the threshold: recorded, no second payout
        let third = approve(&h, id, 2).await.unwrap();
        assert_eq!(third.investment.status, InvestmentStatus::Finalized);
        assert_eq!(third.record.status, ApprovalStatus::Approved);
        let repeat = approve(&h, id, 1).await.unwrap();
        assert_eq!(repeat.investment.status, InvestmentStatus::Finalized);

        assert_eq!(h.gateway.movements(EscrowDirection::Disburse), vec![dec!(100000)]);
        assert_eq!(h.gateway.calls(EscrowDirection::Disburse), 1);
        assert_eq!(
            h.notifier
                .count_where(|p| matches!(p, NotificationPayload::InvestmentFinalized { .. })),
            4
        );
    }

    #[tokio::test]
    async fn test_expiry_reverses_with_one_disburse() {
        let h = harness_with_shares(&[dec!(50), dec!(30), dec!(20)]).await;
        let id = sign(&h, dec!(100000)).await.investment.id;

        let report = h.coordinator.sweep(past_deadline()).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.reversed, 1);

        let view = h.coordinator.view(id).await.unwrap();
        assert_eq!(view.investment.status, InvestmentStatus::Reversed);
        assert_eq!(view.quorum.unwrap().outcome, QuorumOutcome::Expired);

        let again = h.coordinator.sweep(past_deadline()).await.unwrap();
        assert_eq!(again.expired, 0);
        assert_eq!(h.gateway.movements(EscrowDirection::Disburse), vec![dec!(100000)]);
        assert_eq!(h.gateway.calls(EscrowDirection::Disburse), 1);
    }

    #[tokio::test]
    async fn test_sweep_before_deadline_is_noop() {
        let h = harness_with_shares(&[dec!(100)]).await;
        let id = sign(&h, dec!(100000)).await.investment.id;

        let report = h.coordinator.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.expired, 0);
        assert_eq!(
            h.coordinator.view(id).await.unwrap().investment.status,
            InvestmentStatus::AwaitingApproval
        );
    }

    #[tokio::test]
    async fn test_failed_reversal_is_flagged_then_resolved() {
        let h = harness_with_shares(&[dec!(100)]).await;
        let id = sign(&h, dec!(100000)).await.investment.id;
        h.gateway.fail_always(EscrowDirection::Disburse);

        let report = h.coordinator.sweep(past_deadline()).await.unwrap();
        assert_eq!(report.flagged, 1);

        let investment = h.coordinator.view(id).await.unwrap().investment;
        assert_eq!(investment.status, InvestmentStatus::Expired);
        assert!(investment.requires_reconciliation);

        let open = h.coordinator.list_reconciliations(true).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].kind, ReconciliationKind::InvestmentReversal);
        assert_eq!(open[0].amount, dec!(100000));

        // Flagged investments are not retried by the sweep
        let calls = h.gateway.calls(EscrowDirection::Disburse);
        h.coordinator.sweep(past_deadline()).await.unwrap();
        assert_eq!(h.gateway.calls(EscrowDirection::Disburse), calls);

        h.gateway.recover(EscrowDirection::Disburse);
        let resolved = h.coordinator.resolve_investment(id).await.unwrap();
        assert_eq!(resolved.investment.status, InvestmentStatus::Reversed);
        assert!(!resolved.investment.requires_reconciliation);
        assert!(h.coordinator.list_reconciliations(true).await.unwrap().is_empty());
        assert_eq!(h.gateway.movements(EscrowDirection::Disburse), vec![dec!(100000)]);
    }

    #[tokio::test]
    async fn test_failed_release_flags_finalized_investment() {
        let h = harness_with_shares(&[dec!(70), dec!(30)]).await;
        let id = sign(&h, dec!(100000)).await.investment.id;
        h.gateway.fail_always(EscrowDirection::Disburse);

        let result = approve(&h, id, 0).await.unwrap();
        assert_eq!(result.investment.status, InvestmentStatus::Finalized);
        assert!(result.investment.requires_reconciliation);

        let open = h.coordinator.list_reconciliations(true).await.unwrap();
        assert_eq!(open[0].kind, ReconciliationKind::InvestmentRelease);
        assert_eq!(open[0].party_ref, "256700000099");

        // Flagged releases wait for the operator, not the sweep
        h.coordinator.sweep(past_deadline()).await.unwrap();
        assert!(h.gateway.movements(EscrowDirection::Disburse).is_empty());

        h.gateway.recover(EscrowDirection::Disburse);
        let resolved = h.coordinator.resolve_investment(id).await.unwrap();
        assert_eq!(resolved.investment.status, InvestmentStatus::Finalized);
        assert!(!resolved.investment.requires_reconciliation);
        assert!(h.coordinator.list_reconciliations(true).await.unwrap().is_empty());
        assert_eq!(h.gateway.movements(EscrowDirection::Disburse), vec![dec!(100000)]);
    }

    #[tokio::test]
    async fn test_unverified_pin_rejected_before_mutation() {
        let h = harness_with_shares(&[dec!(100)]).await;
        let id = sign(&h, dec!(100000)).await.investment.id;
        let (shareholder_id, _) = h.holders[0];

        let err = h
            .coordinator
            .submit_approval(id, shareholder_id, ApprovalDecision::Approve, false)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));

        let approvals = h.coordinator.view(id).await.unwrap().approvals;
        assert!(approvals.iter().all(|a| a.status == ApprovalStatus::Pending));
    }

    #[tokio::test]
    async fn test_pin_rejected_by_identity_service() {
        let mut h = build(StaticAuthorization::pin_rejected(), RecordingNotifier::new());

        // Owners changing the register are verified like everyone else
        let err = register(&mut h, &[dec!(100)]).await.unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));
        assert!(h.coordinator.shareholders(h.business_id).await.unwrap().is_empty());

        let err = h
            .coordinator
            .sign_investment(h.investor_id, "0000", new_investment(&h, dec!(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));
        assert_eq!(h.gateway.calls(EscrowDirection::Collect), 0);
    }

    #[tokio::test]
    async fn test_caller_must_be_the_linked_shareholder() {
        let h = harness_with_shares(&[dec!(100)]).await;
        let id = sign(&h, dec!(100000)).await.investment.id;
        let (shareholder_id, _) = h.holders[0];

        let err = h
            .coordinator
            .approve_as(Uuid::new_v4(), "1234", id, shareholder_id, ApprovalDecision::Approve)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));
    }

    #[tokio::test]
    async fn test_validation_rejects_without_side_effects() {
        let h = harness_with_shares(&[dec!(100)]).await;

        let mut zero = new_investment(&h, dec!(0));
        let err = h
            .coordinator
            .sign_investment(h.investor_id, "1234", zero.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        zero.amount = dec!(100);
        zero.threshold_percent = Some(dec!(150));
        let err = h
            .coordinator
            .sign_investment(h.investor_id, "1234", zero)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        assert_eq!(h.gateway.calls(EscrowDirection::Collect), 0);
    }

    #[tokio::test]
    async fn test_business_without_shareholders_rejected_before_collect() {
        let h = build(StaticAuthorization::allow(), RecordingNotifier::new());

        let err = h
            .coordinator
            .sign_investment(h.investor_id, "1234", new_investment(&h, dec!(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(h.gateway.calls(EscrowDirection::Collect), 0);
    }

    #[tokio::test]
    async fn test_allocation_cap() {
        let h = harness_with_shares(&[dec!(100)]).await;
        let mut within = new_investment(&h, dec!(60000));
        within.funding_target = Some(dec!(100000));
        h.coordinator
            .sign_investment(h.investor_id, "1234", within.clone())
            .await
            .unwrap();

        // Same pitch, would take the investor to 70%
        let mut over = within;
        over.amount = dec!(10000);
        let err = h
            .coordinator
            .sign_investment(h.investor_id, "1234", over)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_cancel_only_before_funds_held() {
        let h = harness_with_shares(&[dec!(100)]).await;

        let held = sign(&h, dec!(100000)).await.investment.id;
        let err = h
            .coordinator
            .cancel_investment(h.investor_id, "1234", held)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidTransition {
                from: InvestmentStatus::AwaitingApproval,
                to: InvestmentStatus::Cancelled
            }
        ));

        let mut created = h.coordinator.view(held).await.unwrap().investment;
        created.id = Uuid::new_v4();
        created.status = InvestmentStatus::Created;
        created.version = 0;
        h.store.insert_investment(&created).await.unwrap();

        let cancelled = h
            .coordinator
            .cancel_investment(h.investor_id, "1234", created.id)
            .await
            .unwrap();
        assert_eq!(cancelled.status, InvestmentStatus::Cancelled);
        assert_eq!(h.gateway.calls(EscrowDirection::Disburse), 0);
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_block() {
        let mut h = build(StaticAuthorization::allow(), RecordingNotifier::failing());
        register(&mut h, &[dec!(100)]).await.unwrap();

        let view = sign(&h, dec!(100000)).await;
        assert_eq!(view.investment.status, InvestmentStatus::AwaitingApproval);

        let result = approve(&h, view.investment.id, 0).await.unwrap();
        assert_eq!(result.investment.status, InvestmentStatus::Finalized);
    }

    #[tokio::test]
    async fn test_transient_collect_failure_still_opens_quorum() {
        let h = harness_with_shares(&[dec!(100)]).await;
        h.gateway
            .push(EscrowDirection::Collect, &[GatewayStatus::Failed, GatewayStatus::Pending]);

        let view = sign(&h, dec!(100000)).await;
        assert_eq!(view.investment.status, InvestmentStatus::AwaitingApproval);
        assert_eq!(view.escrow[0].attempt_count, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_approvals_racing_sweep_settle_one_way() {
        let shares: Vec<Decimal> = (0..10).map(|_| dec!(10)).collect();
        let h = harness_with_shares(&shares).await;
        let id = sign(&h, dec!(100000)).await.investment.id;

        let mut tasks = Vec::new();
        for holder in 0..h.holders.len() {
            let coordinator = h.coordinator.clone();
            let (shareholder_id, user_id) = h.holders[holder];
            tasks.push(tokio::spawn(async move {
                let _ = coordinator
                    .approve_as(user_id, "1234", id, shareholder_id, ApprovalDecision::Approve)
                    .await;
            }));
            if holder == 5 {
                let coordinator = h.coordinator.clone();
                tasks.push(tokio::spawn(async move {
                    let _ = coordinator.sweep(past_deadline()).await;
                }));
            }
        }
        futures::future::join_all(tasks).await;
        // Settle anything the race left mid-way
        h.coordinator.sweep(past_deadline()).await.unwrap();

        let view = h.coordinator.view(id).await.unwrap();
        let outcome = view.quorum.unwrap().outcome;
        match view.investment.status {
            InvestmentStatus::Finalized => assert_eq!(outcome, QuorumOutcome::Met),
            InvestmentStatus::Reversed => assert_eq!(outcome, QuorumOutcome::Expired),
            other => panic!("unexpected status {}", other),
        }
        assert_eq!(h.gateway.movements(EscrowDirection::Disburse), vec![dec!(100000)]);
    }

    async fn set_status(h: &Harness, id: Uuid, status: InvestmentStatus) -> Investment {
        let mut investment = h.store.get_investment(id).await.unwrap().unwrap();
        let expected = investment.version;
        investment.status = status;
        investment.updated_at = Utc::now();
        h.store.update_investment(&investment, expected).await.unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_reverse_once_without_flag() {
        let mut h = build_with(
            StaticAuthorization::allow(),
            RecordingNotifier::new(),
            ScriptedGateway::new().slow(std::time::Duration::from_millis(100)),
        );
        register(&mut h, &[dec!(100)]).await.unwrap();
        let id = sign(&h, dec!(100000)).await.investment.id;

        let now = past_deadline();
        let (a, b) = tokio::join!(h.coordinator.sweep(now), h.coordinator.sweep(now));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.reversed + b.reversed, 1);
        assert_eq!(a.flagged + b.flagged, 0);

        let investment = h.coordinator.view(id).await.unwrap().investment;
        assert_eq!(investment.status, InvestmentStatus::Reversed);
        assert!(!investment.requires_reconciliation);
        assert!(h.coordinator.list_reconciliations(true).await.unwrap().is_empty());
        assert_eq!(h.gateway.movements(EscrowDirection::Disburse), vec![dec!(100000)]);
    }

    #[tokio::test]
    async fn test_reversal_in_flight_elsewhere_is_not_flagged() {
        let h = harness_with_shares(&[dec!(100)]).await;
        let id = sign(&h, dec!(100000)).await.investment.id;
        let investment = h.coordinator.view(id).await.unwrap().investment;

        // Another instance already opened the refund round
        let mut round = pending_round(&h.coordinator.refund_movement(&investment));
        h.store.insert_escrow(&round).await.unwrap();

        let report = h.coordinator.sweep(past_deadline()).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.flagged, 0);
        let investment = h.coordinator.view(id).await.unwrap().investment;
        assert_eq!(investment.status, InvestmentStatus::Expired);
        assert!(!investment.requires_reconciliation);
        assert!(h.coordinator.list_reconciliations(true).await.unwrap().is_empty());
        assert_eq!(h.gateway.calls(EscrowDirection::Disburse), 0);

        // The other instance finishes; the next sweep records the reversal
        let expected = round.version;
        round.status = EscrowStatus::Succeeded;
        h.store.update_escrow(&round, expected).await.unwrap();

        let report = h.coordinator.sweep(past_deadline()).await.unwrap();
        assert_eq!(report.reversed, 1);
        assert_eq!(
            h.coordinator.view(id).await.unwrap().investment.status,
            InvestmentStatus::Reversed
        );
        assert_eq!(h.gateway.calls(EscrowDirection::Disburse), 0);
    }

    #[tokio::test]
    async fn test_resolve_clears_stale_flag_on_reversed_investment() {
        let h = harness_with_shares(&[dec!(100)]).await;
        let id = sign(&h, dec!(100000)).await.investment.id;
        h.coordinator.sweep(past_deadline()).await.unwrap();

        let mut investment = h.coordinator.view(id).await.unwrap().investment;
        assert_eq!(investment.status, InvestmentStatus::Reversed);
        let record = h
            .coordinator
            .refund_movement(&investment)
            .reconciliation(ReconciliationKind::InvestmentReversal, "left by a crashed sweep");
        h.store.insert_reconciliation(&record).await.unwrap();
        let expected = investment.version;
        investment.requires_reconciliation = true;
        h.store.update_investment(&investment, expected).await.unwrap();

        let resolved = h.coordinator.resolve_investment(id).await.unwrap();
        assert_eq!(resolved.investment.status, InvestmentStatus::Reversed);
        assert!(!resolved.investment.requires_reconciliation);
        assert!(h.coordinator.list_reconciliations(true).await.unwrap().is_empty());
        assert_eq!(h.gateway.calls(EscrowDirection::Disburse), 1);
    }

    #[tokio::test]
    async fn test_sweep_releases_finalized_investment_left_unpaid() {
        let h = harness_with_shares(&[dec!(100)]).await;
        let id = sign(&h, dec!(100000)).await.investment.id;
        // Process died right after the Finalized write
        set_status(&h, id, InvestmentStatus::Finalized).await;

        let early = h.coordinator.sweep(Utc::now()).await.unwrap();
        assert_eq!(early.released, 0);
        assert_eq!(h.gateway.calls(EscrowDirection::Disburse), 0);

        let later = Utc::now() + Duration::seconds(61);
        let report = h.coordinator.sweep(later).await.unwrap();
        assert_eq!(report.released, 1);
        assert_eq!(h.gateway.movements(EscrowDirection::Disburse), vec![dec!(100000)]);
        let register = h.coordinator.shareholders(h.business_id).await.unwrap();
        assert!(register.iter().any(|s| s.id == id && s.user_id == Some(h.investor_id)));

        let again = h.coordinator.sweep(later).await.unwrap();
        assert_eq!(again.released, 0);
        assert_eq!(h.gateway.calls(EscrowDirection::Disburse), 1);
    }

    #[tokio::test]
    async fn test_finalize_adds_investor_and_dilutes_register() {
        let h = harness_with_shares(&[dec!(50), dec!(30), dec!(20)]).await;
        let id = sign(&h, dec!(100000)).await.investment.id;
        approve(&h, id, 0).await.unwrap();
        let finalized = approve(&h, id, 1).await.unwrap().investment;
        assert_eq!(finalized.shares, dec!(100));

        // 1000 shares outstanding, 100 issued
        let register = h.coordinator.shareholders(h.business_id).await.unwrap();
        assert_eq!(register.len(), 4);
        let investor = register.iter().find(|s| s.id == id).unwrap();
        assert_eq!(investor.user_id, Some(h.investor_id));
        assert_eq!(investor.shares, dec!(100));
        assert_eq!(investor.ownership_share_percent, dec!(9.0909));
        assert_eq!(investor.status, ShareholderStatus::Active);
        let founder = register.iter().find(|s| s.id == h.holders[0].0).unwrap();
        assert_eq!(founder.ownership_share_percent, dec!(45.4545));
        let total: Decimal = register.iter().map(|s| s.ownership_share_percent).sum();
        assert!(total <= dec!(100));

        assert_eq!(
            h.notifier
                .count_where(|p| matches!(p, NotificationPayload::ShareholderAdded { .. })),
            1
        );

        // Issuing again for the same investment changes nothing
        h.coordinator.issue_shares(&finalized).await.unwrap();
        assert_eq!(h.coordinator.shareholders(h.business_id).await.unwrap(), register);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_finalizes_dilute_register_once_each() {
        let h = harness_with_shares(&[dec!(100)]).await;
        let first = sign(&h, dec!(100000)).await.investment.id;
        let second = sign(&h, dec!(100000)).await.investment.id;
        let (founder_id, founder_user) = h.holders[0];

        let approvals = [first, second].map(|id| {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .approve_as(founder_user, "1234", id, founder_id, ApprovalDecision::Approve)
                    .await
            })
        });
        for approval in approvals {
            approval.await.unwrap().unwrap();
        }

        // 1000 founder shares, then 100 more, then 100 more
        let register = h.coordinator.shareholders(h.business_id).await.unwrap();
        assert_eq!(register.len(), 3);
        let founder = register.iter().find(|s| s.id == founder_id).unwrap();
        assert_eq!(founder.ownership_share_percent, dec!(83.3332));
        let total: Decimal = register.iter().map(|s| s.ownership_share_percent).sum();
        assert!(total <= dec!(100) && total > dec!(99.99), "total {}", total);
    }

    #[tokio::test]
    async fn test_unknown_share_count_keeps_existing_percentages() {
        let h = build(StaticAuthorization::allow(), RecordingNotifier::new());
        let founder = NewShareholder {
            id: Some(Uuid::new_v4()),
            user_id: Some(Uuid::new_v4()),
            name: "Founder".into(),
            ownership_share_percent: dec!(100),
            shares: None,
            can_approve: true,
            active: true,
        };
        let (founder_id, founder_user) = (founder.id.unwrap(), founder.user_id.unwrap());
        h.coordinator
            .register_shareholders(Uuid::new_v4(), "1234", h.business_id, vec![founder])
            .await
            .unwrap();

        let id = sign(&h, dec!(50000)).await.investment.id;
        h.coordinator
            .approve_as(founder_user, "1234", id, founder_id, ApprovalDecision::Approve)
            .await
            .unwrap();

        let register = h.coordinator.shareholders(h.business_id).await.unwrap();
        let investor = register.iter().find(|s| s.id == id).unwrap();
        assert_eq!(investor.shares, dec!(50));
        assert_eq!(investor.ownership_share_percent, dec!(0));
        let founder = register.iter().find(|s| s.id == founder_id).unwrap();
        assert_eq!(founder.ownership_share_percent, dec!(100));
    }

    #[tokio::test]
    async fn test_cancel_during_collect_refunds_investor() {
        let mut h = build_with(
            StaticAuthorization::allow(),
            RecordingNotifier::new(),
            ScriptedGateway::new().slow(std::time::Duration::from_millis(200)),
        );
        register(&mut h, &[dec!(100)]).await.unwrap();

        let signing = {
            let coordinator = h.coordinator.clone();
            let new = new_investment(&h, dec!(100000));
            let investor_id = h.investor_id;
            tokio::spawn(async move { coordinator.sign_investment(investor_id, "1234", new).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let pending = h
            .store
            .list_investments_by_status(InvestmentStatus::EscrowPending)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        h.coordinator
            .cancel_investment(h.investor_id, "1234", pending[0].id)
            .await
            .unwrap();

        let view = signing.await.unwrap().unwrap();
        assert_eq!(view.investment.status, InvestmentStatus::Cancelled);
        assert!(!view.investment.requires_reconciliation);
        assert!(view.quorum.is_none());
        assert_eq!(h.gateway.movements(EscrowDirection::Collect), vec![dec!(100000)]);
        assert_eq!(h.gateway.movements(EscrowDirection::Disburse), vec![dec!(100000)]);
    }

    #[tokio::test]
    async fn test_sweep_refunds_cancelled_investment_holding_funds() {
        let h = harness_with_shares(&[dec!(100)]).await;
        let id = sign(&h, dec!(100000)).await.investment.id;
        // Refund after the late cancel never ran
        set_status(&h, id, InvestmentStatus::Cancelled).await;

        let report = h
            .coordinator
            .sweep(Utc::now() + Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(report.refunded, 1);
        assert_eq!(h.gateway.movements(EscrowDirection::Disburse), vec![dec!(100000)]);

        let again = h
            .coordinator
            .sweep(Utc::now() + Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(again.refunded, 0);
        assert_eq!(h.gateway.calls(EscrowDirection::Disburse), 1);
    }

    #[tokio::test]
    async fn test_inactive_shareholder_left_out_of_snapshot() {
        let h = build(StaticAuthorization::allow(), RecordingNotifier::new());
        let holder = |name: &str, percent: Decimal, active: bool| NewShareholder {
            id: Some(Uuid::new_v4()),
            user_id: Some(Uuid::new_v4()),
            name: name.into(),
            ownership_share_percent: percent,
            shares: None,
            can_approve: true,
            active,
        };
        let departed = holder("Departed partner", dec!(40), false);
        let departed_id = departed.id.unwrap();
        h.coordinator
            .register_shareholders(
                Uuid::new_v4(),
                "1234",
                h.business_id,
                vec![holder("Founder", dec!(60), true), departed],
            )
            .await
            .unwrap();

        let view = sign(&h, dec!(100000)).await;
        let quorum = view.quorum.unwrap();
        assert_eq!(quorum.snapshot.len(), 1);
        assert!(quorum.snapshot_entry(departed_id).is_none());
        assert_eq!(quorum.total_eligible_share_percent, dec!(60));
        assert_eq!(view.approvals.len(), 1);
        assert_eq!(
            h.notifier
                .count_where(|p| matches!(p, NotificationPayload::ApprovalRequested { .. })),
            1
        );
    }
}
