//! Chain Event Source
//!
//! 하나의 컨트랙트 로그 구독을 유지하고 raw 이벤트를 ingest 채널로 전달한다.
//!
//! - 노드에서 받은 순서 그대로 전달 (블록 높이 단조 증가를 가정하지 않음)
//! - 채널은 bounded: 가득 차면 producer가 대기 (backpressure)
//! - 전송 실패 시 exponential backoff + full jitter로 재구독
//! - 구독이 성립할 때마다 reconciliation 요청 → 구독 전/끊긴 동안 놓친 이벤트 복구
//!   (시작 시 backfill은 구독과 무관하게 파이프라인이 요청)
//! - 자체 영속 상태 없음 (커서는 저장소 소유)

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::error::IndexerError;
use crate::services::backoff::{sleep_or_cancel, BackoffPolicy};
use crate::services::blockchain::{LedgerClient, LiveSubscription, RawLoanEvent};
use crate::services::ingest::{request_reconcile, ReconcileRequest};

/// 구독 한 회차가 끝난 이유
#[derive(Debug)]
enum StreamEnd {
    Cancelled,
    /// ingest worker 종료
    SinkClosed,
    Disconnected(String),
}

pub struct ChainEventSource {
    ledger: Arc<dyn LedgerClient>,
    events: mpsc::Sender<RawLoanEvent>,
    reconcile_tx: mpsc::Sender<ReconcileRequest>,
    backoff: BackoffPolicy,
}

impl ChainEventSource {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        events: mpsc::Sender<RawLoanEvent>,
        reconcile_tx: mpsc::Sender<ReconcileRequest>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            ledger,
            events,
            reconcile_tx,
            backoff,
        }
    }

    #[instrument(skip_all, name = "chain_event_source")]
    pub async fn run(self, cancel: CancellationToken) {
        let mut attempts: u32 = 0;

        loop {
            let subscription = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sub = self.ledger.subscribe() => sub,
            };

            match subscription {
                Ok(mut sub) => {
                    attempts = 0;
                    info!("Subscribed to loan events");
                    request_reconcile(&self.reconcile_tx, ReconcileRequest::Reconnect);

                    match self.forward(&mut sub, &cancel).await {
                        StreamEnd::Cancelled => break,
                        StreamEnd::SinkClosed => {
                            error!("Ingest channel closed, stopping subscription");
                            break;
                        }
                        StreamEnd::Disconnected(reason) => {
                            warn!(%reason, "Loan event subscription lost, reconnecting");
                        }
                    }
                    // sub drop → 연결 해제 후 backoff
                }
                Err(e) => {
                    warn!(error = %e, attempt = attempts + 1, "Failed to subscribe to loan events");
                }
            }

            attempts = attempts.saturating_add(1);
            let delay = self.backoff.delay(attempts);
            info!(attempt = attempts, delay_ms = delay.as_millis() as u64, "Retrying subscription");
            if sleep_or_cancel(delay, &cancel).await {
                break;
            }
        }

        info!("Chain event source stopped");
    }

    async fn forward(&self, sub: &mut LiveSubscription, cancel: &CancellationToken) -> StreamEnd {
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                item = sub.next() => item,
            };

            match item {
                Some(Ok(event)) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return StreamEnd::Cancelled,
                        sent = self.events.send(event) => {
                            if sent.is_err() {
                                return StreamEnd::SinkClosed;
                            }
                        }
                    }
                }
                Some(Err(IndexerError::Decode(e))) => {
                    warn!(error = %e, "Dropping malformed live log");
                }
                Some(Err(e)) => return StreamEnd::Disconnected(e.to_string()),
                None => return StreamEnd::Disconnected("stream ended".to_string()),
            }
        }
    }
}
