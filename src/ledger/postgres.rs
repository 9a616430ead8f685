use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::models::*;
use super::store::PersistenceStore;
use crate::error::{AppError, AppResult};

const INVESTMENTS: &str = "investments";
const SHAREHOLDERS: &str = "shareholders";
const ESCROWS: &str = "escrow_transactions";
const QUORUMS: &str = "quorum_states";
const APPROVALS: &str = "approval_records";
const SAGAS: &str = "transfer_sagas";
const RECONCILIATIONS: &str = "reconciliation_records";

/// Postgres-backed store
///
/// Rows hold a JSONB body plus a `version` column; lookup columns are generated
/// from the body (see `migrations/`).
pub struct PgStore {
    pub pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> AppResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("✅ Database migrations applied");
        Ok(())
    }

    async fn insert_body<T>(&self, table: &'static str, entity: &T) -> AppResult<()>
    where
        T: Versioned + Serialize + Sync,
    {
        let sql = format!("INSERT INTO {} (id, version, body) VALUES ($1, $2, $3)", table);
        sqlx::query(&sql)
            .bind(entity.id())
            .bind(entity.version())
            .bind(Json(entity))
            .execute(&self.pool)
            .await
            .map_err(|e| unique_violation_as_duplicate(e, table, entity.id()))?;
        Ok(())
    }

    async fn fetch_body<T>(&self, table: &'static str, id: Uuid) -> AppResult<Option<T>>
    where
        T: DeserializeOwned + Send + Unpin + 'static,
    {
        let sql = format!("SELECT body FROM {} WHERE id = $1", table);
        let row = sqlx::query_scalar::<_, Json<T>>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|Json(entity)| entity))
    }

    async fn fetch_where<T>(&self, sql: &str, binds: &[Uuid]) -> AppResult<Vec<T>>
    where
        T: DeserializeOwned + Send + Unpin + 'static,
    {
        let mut query = sqlx::query_scalar::<_, Json<T>>(sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|Json(entity)| entity).collect())
    }

    /// Single-statement compare-and-swap on `version`
    async fn update_if_version<T>(
        &self,
        table: &'static str,
        entity: &T,
        expected_version: i64,
    ) -> AppResult<T>
    where
        T: Versioned + Serialize + Clone + Sync,
    {
        let mut next = entity.clone();
        next.set_version(expected_version + 1);

        let sql = format!(
            "UPDATE {} SET version = $3, body = $4, updated_at = NOW() WHERE id = $1 AND version = $2",
            table
        );
        let result = sqlx::query(&sql)
            .bind(entity.id())
            .bind(expected_version)
            .bind(expected_version + 1)
            .bind(Json(&next))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::ConcurrencyConflict {
                entity: table,
                id: entity.id(),
                expected: expected_version,
            });
        }

        Ok(next)
    }
}

fn unique_violation_as_duplicate(error: sqlx::Error, table: &str, id: Uuid) -> AppError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::Duplicate(format!("{} {}", table, id))
        }
        _ => AppError::Database(error),
    }
}

#[async_trait]
impl PersistenceStore for PgStore {
    // ========== INVESTMENTS ==========

    async fn insert_investment(&self, investment: &Investment) -> AppResult<()> {
        self.insert_body(INVESTMENTS, investment).await
    }

    async fn get_investment(&self, id: Uuid) -> AppResult<Option<Investment>> {
        self.fetch_body(INVESTMENTS, id).await
    }

    async fn update_investment(
        &self,
        investment: &Investment,
        expected_version: i64,
    ) -> AppResult<Investment> {
        self.update_if_version(INVESTMENTS, investment, expected_version).await
    }

    async fn list_investments_by_status(
        &self,
        status: InvestmentStatus,
    ) -> AppResult<Vec<Investment>> {
        let rows = sqlx::query_scalar::<_, Json<Investment>>(
            "SELECT body FROM investments WHERE status = $1 ORDER BY inserted_at",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|Json(i)| i).collect())
    }

    async fn list_investor_pitch_investments(
        &self,
        investor_id: Uuid,
        pitch_id: Uuid,
    ) -> AppResult<Vec<Investment>> {
        self.fetch_where(
            "SELECT body FROM investments WHERE investor_id = $1 AND pitch_id = $2",
            &[investor_id, pitch_id],
        )
        .await
    }

    // ========== SHAREHOLDERS ==========

    async fn upsert_shareholders(&self, shareholders: &[Shareholder]) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        for shareholder in shareholders {
            sqlx::query(
                r#"
                INSERT INTO shareholders (id, body) VALUES ($1, $2)
                ON CONFLICT (id) DO UPDATE SET body = EXCLUDED.body, updated_at = NOW()
                "#,
            )
            .bind(shareholder.id)
            .bind(Json(shareholder))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_shareholders(&self, business_id: Uuid) -> AppResult<Vec<Shareholder>> {
        self.fetch_where(
            &format!("SELECT body FROM {} WHERE business_id = $1 ORDER BY id", SHAREHOLDERS),
            &[business_id],
        )
        .await
    }

    // ========== ESCROW ==========

    async fn insert_escrow(&self, escrow: &EscrowTransaction) -> AppResult<()> {
        self.insert_body(ESCROWS, escrow).await
    }

    async fn update_escrow(
        &self,
        escrow: &EscrowTransaction,
        expected_version: i64,
    ) -> AppResult<EscrowTransaction> {
        self.update_if_version(ESCROWS, escrow, expected_version).await
    }

    async fn list_escrow_by_key(&self, idempotency_key: &str) -> AppResult<Vec<EscrowTransaction>> {
        let rows = sqlx::query_scalar::<_, Json<EscrowTransaction>>(
            "SELECT body FROM escrow_transactions WHERE idempotency_key = $1 ORDER BY round",
        )
        .bind(idempotency_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|Json(e)| e).collect())
    }

    async fn list_escrow_for_reference(
        &self,
        reference_id: Uuid,
    ) -> AppResult<Vec<EscrowTransaction>> {
        self.fetch_where(
            "SELECT body FROM escrow_transactions WHERE reference_id = $1 ORDER BY inserted_at, round",
            &[reference_id],
        )
        .await
    }

    // ========== QUORUM ==========

    async fn insert_quorum(&self, quorum: &QuorumState) -> AppResult<()> {
        self.insert_body(QUORUMS, quorum).await
    }

    async fn get_quorum(&self, investment_id: Uuid) -> AppResult<Option<QuorumState>> {
        self.fetch_body(QUORUMS, investment_id).await
    }

    async fn update_quorum(
        &self,
        quorum: &QuorumState,
        expected_version: i64,
    ) -> AppResult<QuorumState> {
        self.update_if_version(QUORUMS, quorum, expected_version).await
    }

    // ========== APPROVALS ==========

    async fn insert_approvals(&self, records: &[ApprovalRecord]) -> AppResult<usize> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO approval_records (id, version, body) VALUES ($1, $2, $3)
                ON CONFLICT (investment_id, shareholder_id) DO NOTHING
                "#,
            )
            .bind(record.id)
            .bind(record.version)
            .bind(Json(record))
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_approval(
        &self,
        investment_id: Uuid,
        shareholder_id: Uuid,
    ) -> AppResult<Option<ApprovalRecord>> {
        let mut rows = self
            .fetch_where(
                "SELECT body FROM approval_records WHERE investment_id = $1 AND shareholder_id = $2",
                &[investment_id, shareholder_id],
            )
            .await?;
        Ok(rows.pop())
    }

    async fn list_approvals(&self, investment_id: Uuid) -> AppResult<Vec<ApprovalRecord>> {
        self.fetch_where(
            "SELECT body FROM approval_records WHERE investment_id = $1 ORDER BY shareholder_id",
            &[investment_id],
        )
        .await
    }

    async fn update_approval(
        &self,
        record: &ApprovalRecord,
        expected_version: i64,
    ) -> AppResult<ApprovalRecord> {
        self.update_if_version(APPROVALS, record, expected_version).await
    }

    // ========== TRANSFERS ==========

    async fn insert_saga(&self, saga: &TransferSaga) -> AppResult<()> {
        self.insert_body(SAGAS, saga).await
    }

    async fn get_saga(&self, id: Uuid) -> AppResult<Option<TransferSaga>> {
        self.fetch_body(SAGAS, id).await
    }

    async fn update_saga(
        &self,
        saga: &TransferSaga,
        expected_version: i64,
    ) -> AppResult<TransferSaga> {
        self.update_if_version(SAGAS, saga, expected_version).await
    }

    // ========== RECONCILIATION ==========

    async fn insert_reconciliation(&self, record: &ReconciliationRecord) -> AppResult<()> {
        self.insert_body(RECONCILIATIONS, record).await
    }

    async fn get_reconciliation(&self, id: Uuid) -> AppResult<Option<ReconciliationRecord>> {
        self.fetch_body(RECONCILIATIONS, id).await
    }

    async fn list_reconciliations(&self, open_only: bool) -> AppResult<Vec<ReconciliationRecord>> {
        let rows = sqlx::query_scalar::<_, Json<ReconciliationRecord>>(
            "SELECT body FROM reconciliation_records WHERE ($1 = FALSE OR is_open) ORDER BY inserted_at",
        )
        .bind(open_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|Json(r)| r).collect())
    }

    async fn update_reconciliation(
        &self,
        record: &ReconciliationRecord,
        expected_version: i64,
    ) -> AppResult<ReconciliationRecord> {
        self.update_if_version(RECONCILIATIONS, record, expected_version).await
    }
}
