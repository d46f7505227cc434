//! Repository Pattern Implementation
//!
//! 데이터 접근을 [`LoanStore`] trait 뒤로 숨김
//!
//! - PostgreSQL 구현: `db/mod.rs`의 [`Database`](super::Database)
//! - 프로세스 내 구현: [`MemoryStore`] (`DATABASE_URL=memory://`, 테스트)
//!
//! 두 구현 모두 같은 일관성 규칙을 지킴:
//!
//! ```text
//! upsert(record):
//!   existing 없음                                  → Inserted
//!   record.last_seen_block >= existing.last_seen   → Updated (같은 높이는 last writer wins)
//!   그 외                                           → Stale (no-op)
//!
//! liquidated: 같은 loan id + Live 쓰기이면 existing OR record
//!
//! upsert(record, Correction { replaces }):
//!   existing.last_seen_block == replaces           → Updated (높이가 낮아질 수 있음)
//!   그 외                                           → Stale
//!
//! retract(key, replaces): existing.last_seen_block == replaces 일 때만 삭제
//!
//! advance_cursor(h): h > current 일 때만 Advanced
//! ```

use std::collections::HashMap;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::models::{CursorOutcome, IngestionCursor, LoanRecord, UpsertOutcome, WriteOrigin};
use crate::error::IndexerError;

pub type StoreResult<T> = Result<T, IndexerError>;

/// Materialized store 인터페이스
///
/// 키별 쓰기 직렬화와 높이 비교는 구현체 책임 (호출자는 순서를 보장하지 않음)
#[async_trait]
pub trait LoanStore: Send + Sync {
    async fn upsert(&self, record: &LoanRecord, origin: WriteOrigin) -> StoreResult<UpsertOutcome>;

    async fn get(&self, contract: &str, borrower: &str) -> StoreResult<Option<LoanRecord>>;

    async fn list_all(&self) -> StoreResult<Vec<LoanRecord>>;

    async fn list_by_borrower(&self, borrower: &str) -> StoreResult<Vec<LoanRecord>>;

    /// `last_seen_block >= height`인 레코드 (reorg 검사용)
    async fn list_since(&self, contract: &str, height: u64) -> StoreResult<Vec<LoanRecord>>;

    /// 정식 체인에 이벤트가 하나도 남지 않은 레코드 삭제. 삭제했으면 true
    async fn retract(&self, contract: &str, borrower: &str, replaces: u64) -> StoreResult<bool>;

    async fn cursor(&self, contract: &str) -> StoreResult<Option<IngestionCursor>>;

    async fn advance_cursor(
        &self,
        contract: &str,
        height: u64,
        block_hash: Option<String>,
    ) -> StoreResult<CursorOutcome>;

    async fn health_check(&self) -> AnyResult<()>;
}

/// 기존 레코드와 새 레코드를 병합한 결과 (Stale이면 None)
pub(crate) fn merge_record(
    existing: Option<&LoanRecord>,
    incoming: &LoanRecord,
    origin: WriteOrigin,
) -> Option<LoanRecord> {
    if let Some(replaces) = origin.replaces() {
        return existing
            .filter(|current| current.last_seen_block == replaces)
            .map(|_| incoming.clone());
    }

    match existing {
        None => Some(incoming.clone()),
        Some(current) if incoming.last_seen_block < current.last_seen_block => None,
        Some(current) => {
            let mut merged = incoming.clone();
            if !origin.is_authoritative() && current.id == incoming.id {
                merged.liquidated = current.liquidated || incoming.liquidated;
            }
            Some(merged)
        }
    }
}

/// 프로세스 내 저장소
///
/// 모든 변경은 write lock 한 구간 안에서 끝남 → 키별 직렬화
#[derive(Default)]
pub struct MemoryStore {
    loans: RwLock<HashMap<(String, String), LoanRecord>>,
    cursors: RwLock<HashMap<String, IngestionCursor>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_records(records: &mut [LoanRecord]) {
    records.sort_by(|a, b| {
        b.last_seen_block
            .cmp(&a.last_seen_block)
            .then_with(|| a.borrower.cmp(&b.borrower))
            .then_with(|| a.contract_address.cmp(&b.contract_address))
    });
}

#[async_trait]
impl LoanStore for MemoryStore {
    async fn upsert(&self, record: &LoanRecord, origin: WriteOrigin) -> StoreResult<UpsertOutcome> {
        let mut loans = self.loans.write().await;
        let key = (record.contract_address.clone(), record.borrower.clone());
        let existing = loans.get(&key);
        let outcome = match existing {
            None => UpsertOutcome::Inserted,
            Some(_) => UpsertOutcome::Updated,
        };

        match merge_record(existing, record, origin) {
            Some(merged) => {
                loans.insert(key, merged);
                Ok(outcome)
            }
            None => Ok(UpsertOutcome::Stale),
        }
    }

    async fn get(&self, contract: &str, borrower: &str) -> StoreResult<Option<LoanRecord>> {
        let loans = self.loans.read().await;
        Ok(loans.get(&(contract.to_string(), borrower.to_string())).cloned())
    }

    async fn list_all(&self) -> StoreResult<Vec<LoanRecord>> {
        let mut records: Vec<_> = self.loans.read().await.values().cloned().collect();
        sort_records(&mut records);
        Ok(records)
    }

    async fn list_by_borrower(&self, borrower: &str) -> StoreResult<Vec<LoanRecord>> {
        let mut records: Vec<_> = self
            .loans
            .read()
            .await
            .values()
            .filter(|r| r.borrower == borrower)
            .cloned()
            .collect();
        sort_records(&mut records);
        Ok(records)
    }

    async fn list_since(&self, contract: &str, height: u64) -> StoreResult<Vec<LoanRecord>> {
        let mut records: Vec<_> = self
            .loans
            .read()
            .await
            .values()
            .filter(|r| r.contract_address == contract && r.last_seen_block >= height)
            .cloned()
            .collect();
        sort_records(&mut records);
        Ok(records)
    }

    async fn retract(&self, contract: &str, borrower: &str, replaces: u64) -> StoreResult<bool> {
        let mut loans = self.loans.write().await;
        let key = (contract.to_string(), borrower.to_string());
        match loans.get(&key) {
            Some(current) if current.last_seen_block == replaces => {
                loans.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cursor(&self, contract: &str) -> StoreResult<Option<IngestionCursor>> {
        Ok(self.cursors.read().await.get(contract).cloned())
    }

    async fn advance_cursor(
        &self,
        contract: &str,
        height: u64,
        block_hash: Option<String>,
    ) -> StoreResult<CursorOutcome> {
        let mut cursors = self.cursors.write().await;
        if let Some(current) = cursors.get(contract) {
            if height <= current.height {
                return Ok(CursorOutcome::Rejected { current: current.height });
            }
        }
        cursors.insert(
            contract.to_string(),
            IngestionCursor {
                contract_address: contract.to_string(),
                height,
                block_hash,
            },
        );
        Ok(CursorOutcome::Advanced)
    }

    async fn health_check(&self) -> AnyResult<()> {
        Ok(())
    }
}
