//! Services Module
//!
//! 인덱서 서비스 레이어
//!
//! # Services
//! - `EthLedger`: 노드 접근 (구독, 로그 조회, 시점 조회)
//! - `ChainEventSource`: 실시간 구독 + 재연결
//! - `EventDecoder`: raw 이벤트 → `LoanRecord`
//! - `Ingestor`: 디코딩 후 저장 (live / backfill 공용)
//! - `BackfillEngine`: 구간 재반영 + 커서 관리
//! - `IndexerPipeline`: 위 태스크 조립

mod backfill;
mod backoff;
mod blockchain;
mod decoder;
mod ingest;
mod pipeline;
mod source;

pub use backfill::{BackfillEngine, RangeStats, ReconcileReport};
pub use backoff::{sleep_or_cancel, BackoffPolicy};
pub use blockchain::{EthLedger, LedgerClient, LiveSubscription, LoanEventKind, OnChainLoan, RawLoanEvent};
pub use decoder::{loan_id, Decoded, EventDecoder, TokenSupport};
pub use ingest::{
    request_reconcile, run_ingest_worker, ApplyOutcome, IngestionControl, IngestionState, Ingestor,
    ReconcileRequest,
};
pub use pipeline::IndexerPipeline;
pub use source::ChainEventSource;
