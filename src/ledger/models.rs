use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Entities persisted with optimistic concurrency control
///
/// INVARIANT: a successful store update bumps `version` by exactly one
pub trait Versioned {
    fn id(&self) -> Uuid;
    fn version(&self) -> i64;
    fn set_version(&mut self, version: i64);
}

macro_rules! versioned {
    ($ty:ty, $id:ident) => {
        impl Versioned for $ty {
            fn id(&self) -> Uuid {
                self.$id
            }

            fn version(&self) -> i64 {
                self.version
            }

            fn set_version(&mut self, version: i64) {
                self.version = version;
            }
        }
    };
}

// ========== INVESTMENT ==========

/// Investment lifecycle status
///
/// Only the settlement coordinator moves an investment between these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestmentStatus {
    Created,
    EscrowPending,
    EscrowHeld,
    AwaitingApproval,
    Finalized,
    Expired,
    Reversed,
    Failed,
    Cancelled,
}

impl InvestmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestmentStatus::Created => "created",
            InvestmentStatus::EscrowPending => "escrow_pending",
            InvestmentStatus::EscrowHeld => "escrow_held",
            InvestmentStatus::AwaitingApproval => "awaiting_approval",
            InvestmentStatus::Finalized => "finalized",
            InvestmentStatus::Expired => "expired",
            InvestmentStatus::Reversed => "reversed",
            InvestmentStatus::Failed => "failed",
            InvestmentStatus::Cancelled => "cancelled",
        }
    }

    /// The settlement state machine. Anything not listed here is rejected.
    pub fn can_transition_to(&self, next: InvestmentStatus) -> bool {
        use InvestmentStatus::*;
        matches!(
            (self, next),
            (Created, EscrowPending)
                | (Created, Cancelled)
                | (EscrowPending, EscrowHeld)
                | (EscrowPending, Failed)
                | (EscrowPending, Cancelled)
                | (EscrowHeld, AwaitingApproval)
                | (AwaitingApproval, Finalized)
                | (AwaitingApproval, Expired)
                | (Expired, Reversed)
        )
    }
}

impl fmt::Display for InvestmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Investment entity - an investor's commitment of funds into a business pitch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Investment {
    pub id: Uuid,
    pub pitch_id: Uuid,
    pub business_id: Uuid,
    pub business_name: String,
    pub investor_id: Uuid,

    pub amount: Decimal,
    pub currency: String,
    pub share_price: Decimal,
    /// Shares issued to the investor on finalize: `amount / share_price`
    #[serde(default)]
    pub shares: Decimal,
    /// Business shares outstanding before this investment, when the investor supplied it
    #[serde(default)]
    pub outstanding_shares: Option<Decimal>,

    /// Approval threshold requested for this investment (percent of ownership)
    pub threshold_percent: Decimal,

    /// Where the investor is charged from and refunded to
    pub investor_payment_ref: String,
    /// Where released funds are paid out to
    pub business_payment_ref: String,

    pub status: InvestmentStatus,
    /// Set when a compensating or release disburse failed and an operator must act
    pub requires_reconciliation: bool,
    pub failure_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

versioned!(Investment, id);

// ========== ESCROW ==========

/// Direction of a fund movement, from the platform's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowDirection {
    Collect,
    Disburse,
}

impl EscrowDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowDirection::Collect => "collect",
            EscrowDirection::Disburse => "disburse",
        }
    }
}

impl fmt::Display for EscrowDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What an escrow movement belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowSubject {
    Investment,
    Transfer,
}

impl EscrowSubject {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowSubject::Investment => "investment",
            EscrowSubject::Transfer => "transfer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Pending,
    Succeeded,
    Failed,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Pending => "pending",
            EscrowStatus::Succeeded => "succeeded",
            EscrowStatus::Failed => "failed",
        }
    }
}

/// One round of attempts to move funds under a single idempotency key
///
/// INVARIANTS:
/// - immutable once `status` is terminal
/// - a later round for the same key only exists if every earlier round failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowTransaction {
    pub id: Uuid,
    /// Investment id or transfer saga id, depending on `subject`
    pub reference_id: Uuid,
    pub subject: EscrowSubject,
    pub direction: EscrowDirection,
    pub idempotency_key: String,
    /// 1-based round number for this idempotency key
    pub round: i32,

    pub status: EscrowStatus,
    pub amount: Decimal,
    pub currency: String,
    /// Payer (collect) or payee (disburse) reference at the provider
    pub party_ref: String,

    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub provider_ref: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

versioned!(EscrowTransaction, id);

impl EscrowTransaction {
    pub fn succeeded(&self) -> bool {
        self.status == EscrowStatus::Succeeded
    }
}

// ========== SHAREHOLDERS & QUORUM ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareholderStatus {
    Active,
    Inactive,
}

/// Shareholder of a business
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shareholder {
    pub id: Uuid,
    pub business_id: Uuid,
    /// None when the owner has no authenticated identity on the platform
    pub user_id: Option<Uuid>,
    pub name: String,
    pub ownership_share_percent: Decimal,
    /// Shares held; zero when the register only carries percentages
    #[serde(default)]
    pub shares: Decimal,
    pub can_approve: bool,
    pub status: ShareholderStatus,
}

/// Frozen view of one shareholder, taken when the quorum opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub shareholder_id: Uuid,
    pub user_id: Option<Uuid>,
    pub share_percent: Decimal,
    pub can_approve: bool,
}

impl From<&Shareholder> for SnapshotEntry {
    fn from(shareholder: &Shareholder) -> Self {
        Self {
            shareholder_id: shareholder.id,
            user_id: shareholder.user_id,
            share_percent: shareholder.ownership_share_percent,
            can_approve: shareholder.can_approve,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumOutcome {
    Pending,
    Met,
    Expired,
}

impl QuorumOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuorumOutcome::Pending => "pending",
            QuorumOutcome::Met => "met",
            QuorumOutcome::Expired => "expired",
        }
    }
}

impl fmt::Display for QuorumOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Consensus state for one investment
///
/// INVARIANTS:
/// - `outcome` moves pending -> met or pending -> expired, never back
/// - only exists once the investment's collect has succeeded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuorumState {
    pub investment_id: Uuid,
    pub snapshot: Vec<SnapshotEntry>,
    pub total_eligible_share_percent: Decimal,
    pub approved_share_percent: Decimal,
    pub threshold_percent: Decimal,
    pub deadline: DateTime<Utc>,
    pub outcome: QuorumOutcome,
    pub decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

versioned!(QuorumState, investment_id);

impl QuorumState {
    pub fn is_pending(&self) -> bool {
        self.outcome == QuorumOutcome::Pending
    }

    pub fn snapshot_entry(&self, shareholder_id: Uuid) -> Option<&SnapshotEntry> {
        self.snapshot.iter().find(|e| e.shareholder_id == shareholder_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A shareholder's decision on a pending dilution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

impl ApprovalDecision {
    pub fn status(&self) -> ApprovalStatus {
        match self {
            ApprovalDecision::Approve => ApprovalStatus::Approved,
            ApprovalDecision::Reject => ApprovalStatus::Rejected,
        }
    }
}

/// Unique per (investment_id, shareholder_id); immutable once decided
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: Uuid,
    pub investment_id: Uuid,
    pub shareholder_id: Uuid,
    pub share_percent: Decimal,
    pub status: ApprovalStatus,
    pub pin_verified: bool,
    pub decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

versioned!(ApprovalRecord, id);

impl ApprovalRecord {
    pub fn is_decided(&self) -> bool {
        self.status != ApprovalStatus::Pending
    }
}

// ========== P2P TRANSFER ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegStatus {
    NotStarted,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaLeg {
    pub status: LegStatus,
    pub idempotency_key: String,
    pub escrow_transaction_id: Option<Uuid>,
}

impl SagaLeg {
    pub fn new(idempotency_key: String) -> Self {
        Self {
            status: LegStatus::NotStarted,
            idempotency_key,
            escrow_transaction_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Pending,
    Completed,
    PartialFailure,
    Failed,
}

impl SagaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "pending",
            SagaStatus::Completed => "completed",
            SagaStatus::PartialFailure => "partial_failure",
            SagaStatus::Failed => "failed",
        }
    }
}

/// Two-leg peer-to-peer transfer
///
/// INVARIANTS:
/// - Completed requires both legs succeeded
/// - PartialFailure means collect succeeded and disburse did not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSaga {
    pub id: Uuid,
    pub sender_ref: String,
    pub recipient_ref: String,
    pub amount: Decimal,
    pub currency: String,
    pub fee_percent: Decimal,
    pub fee_amount: Decimal,
    pub recipient_amount: Decimal,
    pub collect_leg: SagaLeg,
    pub disburse_leg: SagaLeg,
    pub overall_status: SagaStatus,
    pub reconciliation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

versioned!(TransferSaga, id);

// ========== RECONCILIATION ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationKind {
    /// Expired investment whose refund to the investor failed
    InvestmentReversal,
    /// Finalized investment whose payout to the business failed
    InvestmentRelease,
    /// Sender charged, recipient unpaid
    TransferDisburse,
}

/// Operator-visible record of money taken but not delivered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub id: Uuid,
    pub kind: ReconciliationKind,
    pub reference_id: Uuid,
    pub idempotency_key: String,
    pub amount: Decimal,
    pub currency: String,
    pub party_ref: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub version: i64,
}

versioned!(ReconciliationRecord, id);

impl ReconciliationRecord {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}
