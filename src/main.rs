//! Loan Indexer Server
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Client (Dashboard)                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum Web Server                         │
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                      Routes Layer                        ││
//! │  │  /health  /status  /loans  /loans/borrower/:address     ││
//! │  └─────────────────────────────────────────────────────────┘│
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                    Ingestion Pipeline                    ││
//! │  │  ChainEventSource    Ingestor    BackfillEngine         ││
//! │  └─────────────────────────────────────────────────────────┘│
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                    Data Layer                            ││
//! │  │  PostgreSQL (loans, ingestion_cursor)    MemoryStore    ││
//! │  └─────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Smart Contract (LendingPool)                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use loan_indexer::{
    config::StoreBackend,
    routes,
    services::{EthLedger, IndexerPipeline, LedgerClient},
    AppState, Config, Database, IngestionControl, LoanStore, MemoryStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 환경변수 로드
    dotenvy::dotenv().ok();

    // 로깅 초기화
    // RUST_LOG=debug,sqlx=warn 형태로 레벨 제어 가능
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loan_indexer=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("🚀 Starting Loan Indexer");

    // 설정 로드
    let config = Config::from_env()?;
    tracing::info!("📋 Configuration loaded");

    // 저장소
    let store: Arc<dyn LoanStore> = match config.store_backend() {
        StoreBackend::Postgres(url) => {
            let db = Database::connect(&url).await?;
            tracing::info!("🗄️  Database connected");

            db.run_migrations().await?;
            tracing::info!("📦 Migrations completed");
            Arc::new(db)
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store, state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let control = IngestionControl::new();
    let cancel = CancellationToken::new();

    // Ingestion 파이프라인
    let pipeline = match config.indexer_settings() {
        Some(settings) => {
            let ledger: Arc<dyn LedgerClient> = Arc::new(EthLedger::new(
                &config.eth_rpc_url,
                &config.eth_ws_url,
                settings.contract.address(),
                settings.rpc_timeout,
            )?);
            tracing::info!("⛓️  Ledger client ready ({})", settings.contract);
            Some(IndexerPipeline::spawn(
                settings,
                ledger,
                store.clone(),
                control.clone(),
                cancel.child_token(),
            ))
        }
        None => {
            tracing::warn!("LENDING_POOL_ADDRESS not set, serving queries only");
            None
        }
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = routes::create_router(AppState::new(store, control, config));

    tracing::info!("🌐 Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    // 서버 종료 후 파이프라인 정리 (구독 연결 해제 포함)
    cancel.cancel();
    if let Some(pipeline) = pipeline {
        pipeline.join().await;
    }
    tracing::info!("👋 Shutdown complete");

    Ok(())
}

/// Ctrl-C / SIGTERM 대기 후 전체 취소
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
    cancel.cancel();
}
