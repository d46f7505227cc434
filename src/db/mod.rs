//! Database Module
//!
//! PostgreSQL(SQLx) 기반 materialized store
//!
//! # 일관성 규칙
//!
//! 키별 쓰기 순서는 호출자가 아니라 저장소가 결정한다.
//! live 스트림과 backfill이 같은 키에 동시에 쓰더라도 `last_seen_block` 비교가
//! 단일 `INSERT ... ON CONFLICT ... WHERE` 문 안에서 row lock과 함께 수행되므로
//! 더 낮은 높이의 쓰기는 no-op이 된다.
//!
//! # Connection Pool Settings
//!
//! - max_connections: 10
//! - min_connections: 1
//! - acquire_timeout: 3초

mod models;
mod repository;

pub use models::*;
pub use repository::{LoanStore, MemoryStore, StoreResult};

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::error::IndexerError;

const LOAN_COLUMNS: &str = r#"
    id,
    contract_address,
    borrower,
    collateral_token,
    loan_token,
    collateral_amount::text AS collateral_amount,
    loan_amount::text AS loan_amount,
    interest_rate,
    due_date,
    liquidated,
    status,
    last_seen_block
"#;

/// 데이터베이스 연결 및 쿼리 담당
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 데이터베이스 연결
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(3))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// 마이그레이션 실행
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_records(&self, sql: &str, borrower: Option<&str>) -> StoreResult<Vec<LoanRecord>> {
        let mut query = sqlx::query_as::<_, LoanRow>(sql);
        if let Some(borrower) = borrower {
            query = query.bind(borrower);
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.into_iter().map(LoanRecord::try_from).collect()
    }
}

impl Database {
    /// reorg 보정: 기대한 높이의 row만 덮어씀 (높이가 낮아질 수 있음)
    async fn correct(&self, record: &LoanRecord, replaces: u64) -> StoreResult<UpsertOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE loans SET
                id = $3,
                collateral_token = $4,
                loan_token = $5,
                collateral_amount = $6::numeric,
                loan_amount = $7::numeric,
                interest_rate = $8,
                due_date = $9,
                liquidated = $10,
                status = $11,
                last_seen_block = $12,
                updated_at = NOW()
            WHERE contract_address = $1 AND borrower = $2 AND last_seen_block = $13
            "#,
        )
        .bind(&record.contract_address)
        .bind(&record.borrower)
        .bind(record.id)
        .bind(&record.collateral_token)
        .bind(&record.loan_token)
        .bind(record.collateral_amount.to_raw_string())
        .bind(record.loan_amount.to_raw_string())
        .bind(i64::from(record.interest_rate))
        .bind(record.due_date)
        .bind(record.liquidated)
        .bind(record.status.as_str())
        .bind(to_i64(record.last_seen_block, "last_seen_block")?)
        .bind(to_i64(replaces, "replaces")?)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() > 0 {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Stale
        })
    }
}

fn to_i64(value: u64, field: &str) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| IndexerError::Store(format!("{field} {value} exceeds BIGINT")))
}

#[async_trait]
impl LoanStore for Database {
    /// 조건부 upsert
    ///
    /// `RETURNING (xmax = 0)`: 새 row면 true, 갱신이면 false, WHERE에 걸리면 row 없음
    async fn upsert(&self, record: &LoanRecord, origin: WriteOrigin) -> StoreResult<UpsertOutcome> {
        if let Some(replaces) = origin.replaces() {
            return self.correct(record, replaces).await;
        }

        let row: Option<(bool,)> = sqlx::query_as(
            r#"
            INSERT INTO loans (
                id, contract_address, borrower, collateral_token, loan_token,
                collateral_amount, loan_amount, interest_rate, due_date,
                liquidated, status, last_seen_block, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6::numeric, $7::numeric, $8, $9, $10, $11, $12, NOW())
            ON CONFLICT (contract_address, borrower)
            DO UPDATE SET
                id = EXCLUDED.id,
                collateral_token = EXCLUDED.collateral_token,
                loan_token = EXCLUDED.loan_token,
                collateral_amount = EXCLUDED.collateral_amount,
                loan_amount = EXCLUDED.loan_amount,
                interest_rate = EXCLUDED.interest_rate,
                due_date = EXCLUDED.due_date,
                liquidated = CASE
                    WHEN $13 OR loans.id <> EXCLUDED.id THEN EXCLUDED.liquidated
                    ELSE loans.liquidated OR EXCLUDED.liquidated
                END,
                status = EXCLUDED.status,
                last_seen_block = EXCLUDED.last_seen_block,
                updated_at = NOW()
            WHERE loans.last_seen_block <= EXCLUDED.last_seen_block
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(record.id)
        .bind(&record.contract_address)
        .bind(&record.borrower)
        .bind(&record.collateral_token)
        .bind(&record.loan_token)
        .bind(record.collateral_amount.to_raw_string())
        .bind(record.loan_amount.to_raw_string())
        .bind(i64::from(record.interest_rate))
        .bind(record.due_date)
        .bind(record.liquidated)
        .bind(record.status.as_str())
        .bind(to_i64(record.last_seen_block, "last_seen_block")?)
        .bind(origin.is_authoritative())
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((true,)) => UpsertOutcome::Inserted,
            Some((false,)) => UpsertOutcome::Updated,
            None => UpsertOutcome::Stale,
        })
    }

    async fn get(&self, contract: &str, borrower: &str) -> StoreResult<Option<LoanRecord>> {
        let sql = format!(
            "SELECT {LOAN_COLUMNS} FROM loans WHERE contract_address = $1 AND borrower = $2"
        );
        let row = sqlx::query_as::<_, LoanRow>(&sql)
            .bind(contract)
            .bind(borrower)
            .fetch_optional(&self.pool)
            .await?;

        row.map(LoanRecord::try_from).transpose()
    }

    async fn list_all(&self) -> StoreResult<Vec<LoanRecord>> {
        let sql = format!(
            "SELECT {LOAN_COLUMNS} FROM loans ORDER BY last_seen_block DESC, borrower, contract_address"
        );
        self.fetch_records(&sql, None).await
    }

    async fn list_by_borrower(&self, borrower: &str) -> StoreResult<Vec<LoanRecord>> {
        let sql = format!(
            "SELECT {LOAN_COLUMNS} FROM loans WHERE borrower = $1 \
             ORDER BY last_seen_block DESC, borrower, contract_address"
        );
        self.fetch_records(&sql, Some(borrower)).await
    }

    async fn list_since(&self, contract: &str, height: u64) -> StoreResult<Vec<LoanRecord>> {
        let sql = format!(
            "SELECT {LOAN_COLUMNS} FROM loans WHERE contract_address = $1 AND last_seen_block >= $2 \
             ORDER BY last_seen_block DESC, borrower"
        );
        let rows = sqlx::query_as::<_, LoanRow>(&sql)
            .bind(contract)
            .bind(to_i64(height, "height")?)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(LoanRecord::try_from).collect()
    }

    async fn retract(&self, contract: &str, borrower: &str, replaces: u64) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM loans
            WHERE contract_address = $1 AND borrower = $2 AND last_seen_block = $3
            "#,
        )
        .bind(contract)
        .bind(borrower)
        .bind(to_i64(replaces, "last_seen_block")?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn cursor(&self, contract: &str) -> StoreResult<Option<IngestionCursor>> {
        let row = sqlx::query_as::<_, CursorRow>(
            r#"
            SELECT contract_address, height, block_hash
            FROM ingestion_cursor
            WHERE contract_address = $1
            "#,
        )
        .bind(contract)
        .fetch_optional(&self.pool)
        .await?;

        row.map(IngestionCursor::try_from).transpose()
    }

    /// height > current 일 때만 전진 (조건부 UPDATE)
    async fn advance_cursor(
        &self,
        contract: &str,
        height: u64,
        block_hash: Option<String>,
    ) -> StoreResult<CursorOutcome> {
        let advanced: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO ingestion_cursor (contract_address, height, block_hash, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (contract_address)
            DO UPDATE SET
                height = EXCLUDED.height,
                block_hash = EXCLUDED.block_hash,
                updated_at = NOW()
            WHERE ingestion_cursor.height < EXCLUDED.height
            RETURNING height
            "#,
        )
        .bind(contract)
        .bind(to_i64(height, "cursor height")?)
        .bind(block_hash)
        .fetch_optional(&self.pool)
        .await?;

        if advanced.is_some() {
            return Ok(CursorOutcome::Advanced);
        }

        let current = self.cursor(contract).await?.map(|c| c.height).unwrap_or_default();
        Ok(CursorOutcome::Rejected { current })
    }

    /// Health check
    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
