//! Ingestion pipeline wiring
//!
//! source ──(bounded)──▶ ingest worker
//!    │                       │
//!    └──── reconcile ────────┴──▶ backfill engine

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::IndexerSettings;
use crate::db::LoanStore;
use crate::services::backfill::BackfillEngine;
use crate::services::blockchain::LedgerClient;
use crate::services::decoder::EventDecoder;
use crate::services::ingest::{request_reconcile, run_ingest_worker, IngestionControl, Ingestor, ReconcileRequest};
use crate::services::source::ChainEventSource;

/// 동시에 대기할 수 있는 reconcile 요청 수 (초과분은 합쳐짐)
const RECONCILE_QUEUE: usize = 4;

pub struct IndexerPipeline {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl IndexerPipeline {
    pub fn spawn(
        settings: IndexerSettings,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn LoanStore>,
        control: IngestionControl,
        cancel: CancellationToken,
    ) -> Self {
        let ingestor = Arc::new(Ingestor::new(
            EventDecoder::new(settings.contract),
            ledger.clone(),
            store,
            control,
        ));

        let (event_tx, event_rx) = mpsc::channel(settings.queue_capacity.max(1));
        let (reconcile_tx, reconcile_rx) = mpsc::channel(RECONCILE_QUEUE);
        // 구독 성립 여부와 무관하게 HTTP RPC만으로 시작 backfill 진행
        request_reconcile(&reconcile_tx, ReconcileRequest::Startup);

        let source = ChainEventSource::new(ledger.clone(), event_tx, reconcile_tx.clone(), settings.backoff);
        let engine = BackfillEngine::new(
            ingestor.clone(),
            ledger,
            settings.start_block,
            settings.confirmation_depth,
            settings.batch_size,
            settings.backoff,
        );

        let tasks = vec![
            ("source", tokio::spawn(source.run(cancel.clone()))),
            (
                "ingest",
                tokio::spawn(run_ingest_worker(event_rx, ingestor, reconcile_tx, cancel.clone())),
            ),
            (
                "backfill",
                tokio::spawn(engine.run(reconcile_rx, settings.reconcile_interval, cancel)),
            ),
        ];

        info!(
            contract = %settings.contract,
            start_block = settings.start_block,
            confirmation_depth = settings.confirmation_depth,
            "Indexer pipeline started"
        );

        Self { tasks }
    }

    /// 모든 태스크 종료 대기 (취소 토큰이 먼저 트리거되어야 함)
    pub async fn join(self) {
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Pipeline task panicked");
            }
        }
    }
}
