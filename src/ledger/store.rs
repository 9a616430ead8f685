use async_trait::async_trait;
use uuid::Uuid;

use super::models::*;
use crate::error::AppResult;

/// Durable storage for every settlement entity
///
/// INVARIANTS:
/// - `update_*` only succeeds when the stored version equals `expected_version`;
///   otherwise it returns `AppError::ConcurrencyConflict` and writes nothing
/// - a successful update stores and returns the entity with `version = expected_version + 1`
/// - `insert_*` of an already-present unique key returns `AppError::Duplicate`
///
/// SECURITY: this is the only serialization primitive the core relies on.
/// Database-side row policies are not assumed.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    // ========== INVESTMENTS ==========

    async fn insert_investment(&self, investment: &Investment) -> AppResult<()>;

    async fn get_investment(&self, id: Uuid) -> AppResult<Option<Investment>>;

    async fn update_investment(
        &self,
        investment: &Investment,
        expected_version: i64,
    ) -> AppResult<Investment>;

    async fn list_investments_by_status(
        &self,
        status: InvestmentStatus,
    ) -> AppResult<Vec<Investment>>;

    /// All of one investor's investments into one pitch
    async fn list_investor_pitch_investments(
        &self,
        investor_id: Uuid,
        pitch_id: Uuid,
    ) -> AppResult<Vec<Investment>>;

    // ========== SHAREHOLDERS ==========

    /// Insert or replace shareholders by id
    async fn upsert_shareholders(&self, shareholders: &[Shareholder]) -> AppResult<()>;

    async fn list_shareholders(&self, business_id: Uuid) -> AppResult<Vec<Shareholder>>;

    // ========== ESCROW ==========

    /// Unique per (idempotency_key, round)
    async fn insert_escrow(&self, escrow: &EscrowTransaction) -> AppResult<()>;

    async fn update_escrow(
        &self,
        escrow: &EscrowTransaction,
        expected_version: i64,
    ) -> AppResult<EscrowTransaction>;

    /// Every round for a key, ordered by round
    async fn list_escrow_by_key(&self, idempotency_key: &str) -> AppResult<Vec<EscrowTransaction>>;

    /// Every movement for an investment or transfer, oldest first
    async fn list_escrow_for_reference(&self, reference_id: Uuid)
        -> AppResult<Vec<EscrowTransaction>>;

    // ========== QUORUM ==========

    /// Unique per investment
    async fn insert_quorum(&self, quorum: &QuorumState) -> AppResult<()>;

    async fn get_quorum(&self, investment_id: Uuid) -> AppResult<Option<QuorumState>>;

    async fn update_quorum(
        &self,
        quorum: &QuorumState,
        expected_version: i64,
    ) -> AppResult<QuorumState>;

    // ========== APPROVALS ==========

    /// Inserts records whose (investment_id, shareholder_id) is not present yet.
    /// Returns how many were inserted.
    async fn insert_approvals(&self, records: &[ApprovalRecord]) -> AppResult<usize>;

    async fn get_approval(
        &self,
        investment_id: Uuid,
        shareholder_id: Uuid,
    ) -> AppResult<Option<ApprovalRecord>>;

    async fn list_approvals(&self, investment_id: Uuid) -> AppResult<Vec<ApprovalRecord>>;

    async fn update_approval(
        &self,
        record: &ApprovalRecord,
        expected_version: i64,
    ) -> AppResult<ApprovalRecord>;

    // ========== TRANSFERS ==========

    async fn insert_saga(&self, saga: &TransferSaga) -> AppResult<()>;

    async fn get_saga(&self, id: Uuid) -> AppResult<Option<TransferSaga>>;

    async fn update_saga(&self, saga: &TransferSaga, expected_version: i64)
        -> AppResult<TransferSaga>;

    // ========== RECONCILIATION ==========

    async fn insert_reconciliation(&self, record: &ReconciliationRecord) -> AppResult<()>;

    async fn get_reconciliation(&self, id: Uuid) -> AppResult<Option<ReconciliationRecord>>;

    async fn list_reconciliations(&self, open_only: bool) -> AppResult<Vec<ReconciliationRecord>>;

    async fn update_reconciliation(
        &self,
        record: &ReconciliationRecord,
        expected_version: i64,
    ) -> AppResult<ReconciliationRecord>;
}
