//! Loan Indexer Library
//!
//! # Overview
//!
//! 대출 컨트랙트의 이벤트를 구독해 조회 가능한 materialized view로 유지하고,
//! 그 view를 HTTP로 제공한다.
//!
//! ## Architecture
//!
//! ```text
//!  Ledger node ──ws──▶ ChainEventSource ──▶ ingest worker ─┐
//!      │                                                   ├─▶ Ingestor ─▶ LoanStore ◀── routes (axum)
//!      └─────http──▶ BackfillEngine ───────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `config`: 환경 설정 관리
//! - `error`: 에러 타입 및 처리
//! - `routes`: HTTP 엔드포인트 핸들러
//! - `services`: ingestion 파이프라인 (구독, 디코딩, backfill)
//! - `db`: 저장소 (PostgreSQL / in-memory)
//! - `types`: 공통 타입 정의
//!
//! ## Usage
//!
//! ```rust,ignore
//! use loan_indexer::{config::Config, db::MemoryStore, routes, AppState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(Arc::new(MemoryStore::new()), IngestionControl::new(), config);
//!     let app = routes::create_router(state);
//!     // ... 서버 시작
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod services;
pub mod types;

// Re-exports for convenience
pub use config::Config;
pub use db::{Database, LoanStore, MemoryStore};
pub use error::{ApiError, IndexerError};
pub use services::IngestionControl;

/// 애플리케이션 전역 상태
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LoanStore>,
    pub control: IngestionControl,
    pub config: Arc<Config>,
    /// 인덱싱 대상 컨트랙트 (checksum)
    pub contract: Option<String>,
}

impl AppState {
    pub fn new(store: Arc<dyn LoanStore>, control: IngestionControl, config: Config) -> Self {
        let contract = config.lending_pool_address.map(|addr| addr.checksummed());
        Self {
            store,
            control,
            config: Arc::new(config),
            contract,
        }
    }
}
