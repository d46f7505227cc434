//! Database Models
//!
//! Materialized view of on-chain loan positions plus the ingestion cursor.
//! Amounts are kept in raw on-chain units; the JSON form renders them as exact
//! 18-decimal strings.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::IndexerError;
use crate::types::TokenAmount;

/// 한 컨트랙트에서 한 borrower의 대출 포지션
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanRecord {
    /// (contract, borrower, dueDate)에서 파생. 새 대출 생성 시에만 바뀜
    pub id: Uuid,

    /// 인덱싱 대상 컨트랙트 (checksum)
    pub contract_address: String,

    /// borrower 주소 (checksum)
    pub borrower: String,

    pub collateral_token: String,
    pub loan_token: String,

    pub collateral_amount: TokenAmount,
    pub loan_amount: TokenAmount,

    /// 이자율 (%)
    pub interest_rate: u32,

    pub due_date: DateTime<Utc>,

    /// 한 번 true가 되면 같은 대출에서는 false로 돌아가지 않음
    /// (reconciliation 보정 제외)
    pub liquidated: bool,

    /// 상환/청산으로 `loans(borrower)`가 비워지면 Closed (금액 0)
    pub status: LoanStatus,

    /// 이 레코드에 반영된 가장 높은 블록
    pub last_seen_block: u64,
}

/// 대출 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Active,
    Closed,
}

impl LoanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanStatus::Active => "active",
            LoanStatus::Closed => "closed",
        }
    }
}

impl FromStr for LoanStatus {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(LoanStatus::Active),
            "closed" => Ok(LoanStatus::Closed),
            other => Err(IndexerError::Store(format!("unknown loan status {other:?}"))),
        }
    }
}

/// 쓰기 경로 구분
///
/// Live: 구독 스트림, Reconcile: backfill/reconciliation 재적용
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    Live,
    Reconcile,
    /// reorg로 사라진 블록에서 온 레코드를 되돌림.
    /// 저장된 `last_seen_block`이 `replaces`와 같을 때만 적용되며 높이가 낮아질 수 있다
    Correction { replaces: u64 },
}

impl WriteOrigin {
    /// 체인에서 다시 읽은 값을 그대로 신뢰하는 쓰기 (liquidated 보정 허용)
    pub fn is_authoritative(&self) -> bool {
        !matches!(self, WriteOrigin::Live)
    }

    pub fn replaces(&self) -> Option<u64> {
        match self {
            WriteOrigin::Correction { replaces } => Some(*replaces),
            _ => None,
        }
    }
}

/// upsert 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// 기존 레코드의 last_seen_block이 더 높아서 무시됨
    /// (Correction이면 기존 높이가 `replaces`와 달라서)
    Stale,
}

/// 마지막으로 완전히 처리된 블록
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionCursor {
    pub contract_address: String,
    pub height: u64,
    /// 해당 높이의 블록 해시 (deep reorg 감지용)
    pub block_hash: Option<String>,
}

/// advance_cursor 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorOutcome {
    Advanced,
    /// height가 현재 커서보다 크지 않음
    Rejected { current: u64 },
}

/// loans 테이블 row (NUMERIC은 text로 캐스팅해서 읽음)
#[derive(Debug, Clone, FromRow)]
pub struct LoanRow {
    pub id: Uuid,
    pub contract_address: String,
    pub borrower: String,
    pub collateral_token: String,
    pub loan_token: String,
    pub collateral_amount: String,
    pub loan_amount: String,
    pub interest_rate: i64,
    pub due_date: DateTime<Utc>,
    pub liquidated: bool,
    pub status: String,
    pub last_seen_block: i64,
}

impl TryFrom<LoanRow> for LoanRecord {
    type Error = IndexerError;

    fn try_from(row: LoanRow) -> Result<Self, Self::Error> {
        let corrupt = |field: &str| IndexerError::Store(format!("corrupt {field} in loans row"));

        Ok(LoanRecord {
            id: row.id,
            contract_address: row.contract_address,
            borrower: row.borrower,
            collateral_token: row.collateral_token,
            loan_token: row.loan_token,
            collateral_amount: TokenAmount::from_raw_str(&row.collateral_amount)
                .map_err(|_| corrupt("collateral_amount"))?,
            loan_amount: TokenAmount::from_raw_str(&row.loan_amount)
                .map_err(|_| corrupt("loan_amount"))?,
            interest_rate: u32::try_from(row.interest_rate).map_err(|_| corrupt("interest_rate"))?,
            due_date: row.due_date,
            liquidated: row.liquidated,
            status: row.status.parse()?,
            last_seen_block: u64::try_from(row.last_seen_block)
                .map_err(|_| corrupt("last_seen_block"))?,
        })
    }
}

/// ingestion_cursor 테이블 row
#[derive(Debug, Clone, FromRow)]
pub struct CursorRow {
    pub contract_address: String,
    pub height: i64,
    pub block_hash: Option<String>,
}

impl TryFrom<CursorRow> for IngestionCursor {
    type Error = IndexerError;

    fn try_from(row: CursorRow) -> Result<Self, Self::Error> {
        Ok(IngestionCursor {
            contract_address: row.contract_address,
            height: u64::try_from(row.height)
                .map_err(|_| IndexerError::Store("negative cursor height".to_string()))?,
            block_hash: row.block_hash,
        })
    }
}
