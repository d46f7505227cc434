//! Ingestion path
//!
//! ```text
//! ChainEventSource ──mpsc (bounded)──▶ ingest worker ─┐
//!                                                     ├──▶ Ingestor::apply ──▶ LoanStore::upsert
//! BackfillEngine ─────────────────────────────────────┘
//! ```
//!
//! live와 backfill은 동시에 같은 키를 쓸 수 있다. 순서 판정은 저장소의
//! `last_seen_block` 비교가 담당한다.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{LoanStore, UpsertOutcome, WriteOrigin};
use crate::error::IndexerError;
use crate::services::blockchain::{LedgerClient, RawLoanEvent};
use crate::services::decoder::{Decoded, EventDecoder, TokenSupport};

/// Ingestion 상태
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IngestionState {
    Running,
    /// 일관성 위반 → 수동 확인 전까지 쓰기 중단 (조회는 계속)
    Halted { reason: String, since: DateTime<Utc> },
}

/// Ingestion 일시정지 스위치
#[derive(Clone)]
pub struct IngestionControl {
    state: Arc<watch::Sender<IngestionState>>,
}

impl IngestionControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(IngestionState::Running);
        Self { state: Arc::new(tx) }
    }

    pub fn state(&self) -> IngestionState {
        self.state.borrow().clone()
    }

    pub fn is_halted(&self) -> bool {
        matches!(*self.state.borrow(), IngestionState::Halted { .. })
    }

    /// 운영자 알림 후 ingestion 중단. 이미 중단 상태면 첫 사유 유지
    pub fn halt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let changed = self.state.send_if_modified(|state| match state {
            IngestionState::Running => {
                *state = IngestionState::Halted {
                    reason: reason.clone(),
                    since: Utc::now(),
                };
                true
            }
            IngestionState::Halted { .. } => false,
        });
        if changed {
            error!(target: "alert", %reason, "Ingestion halted pending manual review");
        }
    }
}

impl Default for IngestionControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Backfill 요청 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileRequest {
    Startup,
    /// 구독 성립 (첫 구독 포함)
    Reconnect,
    /// 노드가 `removed` 로그를 보냄
    Reorg { block: u64 },
    /// live 이벤트 반영 실패 (transport/store)
    Retry,
    Periodic,
}

/// apply 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Stored(UpsertOutcome),
    /// 이벤트 전후 모두 대출 없음
    Absent,
    /// ingestion 중단 상태
    Halted,
}

/// Decoder → Store 경로 (live와 backfill 공용)
pub struct Ingestor {
    decoder: EventDecoder,
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn LoanStore>,
    control: IngestionControl,
}

impl Ingestor {
    pub fn new(
        decoder: EventDecoder,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn LoanStore>,
        control: IngestionControl,
    ) -> Self {
        Self {
            decoder,
            ledger,
            store,
            control,
        }
    }

    pub fn contract(&self) -> String {
        self.decoder.contract().checksummed()
    }

    pub fn control(&self) -> &IngestionControl {
        &self.control
    }

    pub fn store(&self) -> &Arc<dyn LoanStore> {
        &self.store
    }

    /// 이벤트 블록 시점의 컨트랙트 상태를 읽어 정규화 후 upsert
    pub async fn apply(&self, event: &RawLoanEvent, origin: WriteOrigin) -> Result<ApplyOutcome, IndexerError> {
        if self.control.is_halted() {
            return Ok(ApplyOutcome::Halted);
        }

        let loan = self.ledger.read_loan(event.borrower, event.block_number).await?;
        let support = if loan.is_vacant() {
            TokenSupport { collateral: true, loan: true }
        } else {
            TokenSupport {
                collateral: self
                    .ledger
                    .is_supported_token(loan.collateral_token, event.block_number)
                    .await?,
                loan: self
                    .ledger
                    .is_supported_token(loan.loan_token, event.block_number)
                    .await?,
            }
        };

        let decoded = match self.decoder.decode(event, &loan, support)? {
            Decoded::Absent => self.decode_closed(event).await?,
            record => record,
        };

        match decoded {
            Decoded::Absent => {
                debug!(borrower = ?event.borrower, block = event.block_number, "No loan to record");
                Ok(ApplyOutcome::Absent)
            }
            Decoded::Record(record) => {
                let outcome = self.store.upsert(&record, origin).await?;
                debug!(
                    borrower = %record.borrower,
                    block = record.last_seen_block,
                    status = record.status.as_str(),
                    ?origin,
                    ?outcome,
                    "Loan upserted"
                );
                Ok(ApplyOutcome::Stored(outcome))
            }
        }
    }

    /// 이벤트 블록에서 대출이 비워짐 → 직전 블록 상태로 종료 레코드 생성
    async fn decode_closed(&self, event: &RawLoanEvent) -> Result<Decoded, IndexerError> {
        let Some(prior_block) = event.block_number.checked_sub(1) else {
            return Ok(Decoded::Absent);
        };
        let prior = self.ledger.read_loan(event.borrower, prior_block).await?;
        Ok(self.decoder.decode_closed(event, &prior)?)
    }

    /// 노드가 무효화한 로그 처리
    ///
    /// 커서(확정 구간) 이하이면 confirmation depth보다 깊은 reorg
    pub async fn handle_removed(&self, event: &RawLoanEvent) -> Result<ReconcileRequest, IndexerError> {
        let cursor = self.store.cursor(&self.contract()).await?;
        match cursor {
            Some(c) if event.block_number <= c.height => {
                let reason = format!(
                    "log at block {} removed below persisted cursor {}",
                    event.block_number, c.height
                );
                self.control.halt(reason.clone());
                Err(IndexerError::ConsistencyViolation(reason))
            }
            _ => Ok(ReconcileRequest::Reorg { block: event.block_number }),
        }
    }
}

/// Live 이벤트 소비 루프 (단일 파이프라인)
///
/// Transport/Store 실패로 반영하지 못한 이벤트는 reconciliation으로 다시 도출된다
pub async fn run_ingest_worker(
    mut events: mpsc::Receiver<RawLoanEvent>,
    ingestor: Arc<Ingestor>,
    reconcile_tx: mpsc::Sender<ReconcileRequest>,
    cancel: CancellationToken,
) {
    info!("Ingest worker started");

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = events.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };

        let result = if event.removed {
            ingestor.handle_removed(&event).await.map(|req| {
                warn!(block = event.block_number, "Node reported removed log, scheduling reconciliation");
                request_reconcile(&reconcile_tx, req);
            })
        } else {
            ingestor.apply(&event, WriteOrigin::Live).await.map(|_| ())
        };

        match result {
            Ok(()) => {}
            Err(IndexerError::Decode(e)) => {
                warn!(error = %e, borrower = ?event.borrower, block = event.block_number, "Dropping undecodable event");
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, block = event.block_number, "Live event not applied, scheduling reconciliation");
                request_reconcile(&reconcile_tx, ReconcileRequest::Retry);
            }
            Err(e) => {
                error!(error = %e, block = event.block_number, "Live ingestion failed");
            }
        }
    }

    info!("Ingest worker stopped");
}

/// 요청 큐가 가득 차 있으면 이미 실행 대기 중인 요청에 합쳐진다
pub fn request_reconcile(tx: &mpsc::Sender<ReconcileRequest>, request: ReconcileRequest) {
    match tx.try_send(request) {
        Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(?request, "Backfill engine stopped, reconcile request dropped");
        }
    }
}
