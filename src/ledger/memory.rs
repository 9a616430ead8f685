use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::*;
use super::store::PersistenceStore;
use crate::error::{AppError, AppResult};

/// In-process store for sandbox mode and tests
pub struct InMemoryStore {
    investments: RwLock<HashMap<Uuid, Investment>>,
    shareholders: RwLock<HashMap<Uuid, Shareholder>>,
    escrows: RwLock<HashMap<Uuid, EscrowTransaction>>,
    quorums: RwLock<HashMap<Uuid, QuorumState>>,
    approvals: RwLock<HashMap<Uuid, ApprovalRecord>>,
    sagas: RwLock<HashMap<Uuid, TransferSaga>>,
    reconciliations: RwLock<HashMap<Uuid, ReconciliationRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            investments: RwLock::new(HashMap::new()),
            shareholders: RwLock::new(HashMap::new()),
            escrows: RwLock::new(HashMap::new()),
            quorums: RwLock::new(HashMap::new()),
            approvals: RwLock::new(HashMap::new()),
            sagas: RwLock::new(HashMap::new()),
            reconciliations: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_new<T: Versioned + Clone>(
    table: &mut HashMap<Uuid, T>,
    entity: &T,
    entity_name: &str,
) -> AppResult<()> {
    if table.contains_key(&entity.id()) {
        return Err(AppError::Duplicate(format!("{} {}", entity_name, entity.id())));
    }
    table.insert(entity.id(), entity.clone());
    Ok(())
}

/// Compare-and-swap on the stored version
fn swap_if_version<T: Versioned + Clone>(
    table: &mut HashMap<Uuid, T>,
    entity: &T,
    expected_version: i64,
    entity_name: &'static str,
) -> AppResult<T> {
    let id = entity.id();
    let current = table
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("{} {}", entity_name, id)))?;

    if current.version() != expected_version {
        return Err(AppError::ConcurrencyConflict {
            entity: entity_name,
            id,
            expected: expected_version,
        });
    }

    let mut next = entity.clone();
    next.set_version(expected_version + 1);
    table.insert(id, next.clone());
    Ok(next)
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    // ========== INVESTMENTS ==========

    async fn insert_investment(&self, investment: &Investment) -> AppResult<()> {
        let mut investments = self.investments.write().await;
        insert_new(&mut investments, investment, "investment")
    }

    async fn get_investment(&self, id: Uuid) -> AppResult<Option<Investment>> {
        let investments = self.investments.read().await;
        Ok(investments.get(&id).cloned())
    }

    async fn update_investment(
        &self,
        investment: &Investment,
        expected_version: i64,
    ) -> AppResult<Investment> {
        let mut investments = self.investments.write().await;
        swap_if_version(&mut investments, investment, expected_version, "investment")
    }

    async fn list_investments_by_status(
        &self,
        status: InvestmentStatus,
    ) -> AppResult<Vec<Investment>> {
        let investments = self.investments.read().await;
        let mut matching: Vec<Investment> = investments
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|i| i.created_at);
        Ok(matching)
    }

    async fn list_investor_pitch_investments(
        &self,
        investor_id: Uuid,
        pitch_id: Uuid,
    ) -> AppResult<Vec<Investment>> {
        let investments = self.investments.read().await;
        Ok(investments
            .values()
            .filter(|i| i.investor_id == investor_id && i.pitch_id == pitch_id)
            .cloned()
            .collect())
    }

    // ========== SHAREHOLDERS ==========

    async fn upsert_shareholders(&self, shareholders: &[Shareholder]) -> AppResult<()> {
        let mut table = self.shareholders.write().await;
        for shareholder in shareholders {
            table.insert(shareholder.id, shareholder.clone());
        }
        Ok(())
    }

    async fn list_shareholders(&self, business_id: Uuid) -> AppResult<Vec<Shareholder>> {
        let table = self.shareholders.read().await;
        let mut holders: Vec<Shareholder> = table
            .values()
            .filter(|s| s.business_id == business_id)
            .cloned()
            .collect();
        holders.sort_by_key(|s| s.id);
        Ok(holders)
    }

    // ========== ESCROW ==========

    async fn insert_escrow(&self, escrow: &EscrowTransaction) -> AppResult<()> {
        let mut escrows = self.escrows.write().await;
        let taken = escrows
            .values()
            .any(|e| e.idempotency_key == escrow.idempotency_key && e.round == escrow.round);
        if taken {
            return Err(AppError::Duplicate(format!(
                "escrow {} round {}",
                escrow.idempotency_key, escrow.round
            )));
        }
        insert_new(&mut escrows, escrow, "escrow")
    }

    async fn update_escrow(
        &self,
        escrow: &EscrowTransaction,
        expected_version: i64,
    ) -> AppResult<EscrowTransaction> {
        let mut escrows = self.escrows.write().await;
        swap_if_version(&mut escrows, escrow, expected_version, "escrow")
    }

    async fn list_escrow_by_key(&self, idempotency_key: &str) -> AppResult<Vec<EscrowTransaction>> {
        let escrows = self.escrows.read().await;
        let mut rounds: Vec<EscrowTransaction> = escrows
            .values()
            .filter(|e| e.idempotency_key == idempotency_key)
            .cloned()
            .collect();
        rounds.sort_by_key(|e| e.round);
        Ok(rounds)
    }

    async fn list_escrow_for_reference(
        &self,
        reference_id: Uuid,
    ) -> AppResult<Vec<EscrowTransaction>> {
        let escrows = self.escrows.read().await;
        let mut movements: Vec<EscrowTransaction> = escrows
            .values()
            .filter(|e| e.reference_id == reference_id)
            .cloned()
            .collect();
        movements.sort_by_key(|e| (e.created_at, e.round));
        Ok(movements)
    }

    // ========== QUORUM ==========

    async fn insert_quorum(&self, quorum: &QuorumState) -> AppResult<()> {
        let mut quorums = self.quorums.write().await;
        insert_new(&mut quorums, quorum, "quorum")
    }

    async fn get_quorum(&self, investment_id: Uuid) -> AppResult<Option<QuorumState>> {
        let quorums = self.quorums.read().await;
        Ok(quorums.get(&investment_id).cloned())
    }

    async fn update_quorum(
        &self,
        quorum: &QuorumState,
        expected_version: i64,
    ) -> AppResult<QuorumState> {
        let mut quorums = self.quorums.write().await;
        swap_if_version(&mut quorums, quorum, expected_version, "quorum")
    }

    // ========== APPROVALS ==========

    async fn insert_approvals(&self, records: &[ApprovalRecord]) -> AppResult<usize> {
        let mut approvals = self.approvals.write().await;
        let mut inserted = 0;
        for record in records {
            let exists = approvals.values().any(|a| {
                a.investment_id == record.investment_id && a.shareholder_id == record.shareholder_id
            });
            if !exists {
                approvals.insert(record.id, record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn get_approval(
        &self,
        investment_id: Uuid,
        shareholder_id: Uuid,
    ) -> AppResult<Option<ApprovalRecord>> {
        let approvals = self.approvals.read().await;
        Ok(approvals
            .values()
            .find(|a| a.investment_id == investment_id && a.shareholder_id == shareholder_id)
            .cloned())
    }

    async fn list_approvals(&self, investment_id: Uuid) -> AppResult<Vec<ApprovalRecord>> {
        let approvals = self.approvals.read().await;
        let mut records: Vec<ApprovalRecord> = approvals
            .values()
            .filter(|a| a.investment_id == investment_id)
            .cloned()
            .collect();
        records.sort_by_key(|a| a.shareholder_id);
        Ok(records)
    }

    async fn update_approval(
        &self,
        record: &ApprovalRecord,
        expected_version: i64,
    ) -> AppResult<ApprovalRecord> {
        let mut approvals = self.approvals.write().await;
        swap_if_version(&mut approvals, record, expected_version, "approval")
    }

    // ========== TRANSFERS ==========

    async fn insert_saga(&self, saga: &TransferSaga) -> AppResult<()> {
        let mut sagas = self.sagas.write().await;
        insert_new(&mut sagas, saga, "transfer")
    }

    async fn get_saga(&self, id: Uuid) -> AppResult<Option<TransferSaga>> {
        let sagas = self.sagas.read().await;
        Ok(sagas.get(&id).cloned())
    }

    async fn update_saga(
        &self,
        saga: &TransferSaga,
        expected_version: i64,
    ) -> AppResult<TransferSaga> {
        let mut sagas = self.sagas.write().await;
        swap_if_version(&mut sagas, saga, expected_version, "transfer")
    }

    // ========== RECONCILIATION ==========

    async fn insert_reconciliation(&self, record: &ReconciliationRecord) -> AppResult<()> {
        let mut records = self.reconciliations.write().await;
        insert_new(&mut records, record, "reconciliation")
    }

    async fn get_reconciliation(&self, id: Uuid) -> AppResult<Option<ReconciliationRecord>> {
        let records = self.reconciliations.read().await;
        Ok(records.get(&id).cloned())
    }

    async fn list_reconciliations(&self, open_only: bool) -> AppResult<Vec<ReconciliationRecord>> {
        let records = self.reconciliations.read().await;
        let mut listed: Vec<ReconciliationRecord> = records
            .values()
            .filter(|r| !open_only || r.is_open())
            .cloned()
            .collect();
        listed.sort_by_key(|r| r.created_at);
        Ok(listed)
    }

    async fn update_reconciliation(
        &self,
        record: &ReconciliationRecord,
        expected_version: i64,
    ) -> AppResult<ReconciliationRecord> {
        let mut records = self.reconciliations.write().await;
        swap_if_version(&mut records, record, expected_version, "reconciliation")
    }
}
