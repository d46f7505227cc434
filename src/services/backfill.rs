//! Backfill / Reconciliation Engine
//!
//! 시작 시, 재연결 후, reorg 신호 후, 그리고 주기적으로
//! `[max(start_block, cursor - depth), head]` 구간을 `eth_getLogs`로 다시 읽어
//! live 경로와 같은 [`Ingestor`]로 반영한다.
//!
//! 구간 재반영 뒤에는 구간 안의 `last_seen_block`을 가진 레코드가 정식 체인의
//! 이벤트로 뒷받침되는지 확인한다. 버려진 블록에서 온 레코드는 높이 비교로는
//! 덮어쓸 수 없으므로 `WriteOrigin::Correction`으로 되돌린다.
//!
//! 커서는 이 엔진만 전진시킨다. 구간 전체가 반영된 뒤
//! `head - confirmation_depth` 높이(와 그 블록 해시)로 옮긴다.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, H256};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::db::{CursorOutcome, IngestionCursor, LoanRecord, UpsertOutcome, WriteOrigin};
use crate::error::IndexerError;
use crate::services::backoff::{sleep_or_cancel, BackoffPolicy};
use crate::services::blockchain::{LedgerClient, RawLoanEvent};
use crate::services::ingest::{ApplyOutcome, Ingestor, ReconcileRequest};
use crate::types::EthAddress;

/// 구간 처리 통계
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeStats {
    pub events: usize,
    pub stored: usize,
    pub absent: usize,
    /// 디코딩 실패로 건너뛴 이벤트
    pub skipped: usize,
    /// reorg로 버려진 블록에서 온 레코드를 되돌린 수
    pub corrected: usize,
}

/// 구간 스캔 결과: 통계 + borrower별 정식 체인의 마지막 이벤트
struct RangeScan {
    stats: RangeStats,
    latest: HashMap<Address, RawLoanEvent>,
}

/// reconcile_once 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub from: u64,
    pub to: u64,
    pub stats: RangeStats,
    /// 전진한 커서 높이 (전진하지 않았으면 None)
    pub cursor: Option<u64>,
}

pub struct BackfillEngine {
    ingestor: Arc<Ingestor>,
    ledger: Arc<dyn LedgerClient>,
    start_block: u64,
    confirmation_depth: u64,
    batch_size: u64,
    backoff: BackoffPolicy,
}

impl BackfillEngine {
    pub fn new(
        ingestor: Arc<Ingestor>,
        ledger: Arc<dyn LedgerClient>,
        start_block: u64,
        confirmation_depth: u64,
        batch_size: u64,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            ingestor,
            ledger,
            start_block,
            confirmation_depth,
            batch_size: batch_size.max(1),
            backoff,
        }
    }

    /// `[from, to]` 구간을 batch 단위로 다시 반영
    pub async fn reconcile_range(
        &self,
        from: u64,
        to: u64,
        cancel: &CancellationToken,
    ) -> Result<RangeStats, IndexerError> {
        Ok(self.scan_range(from, to, cancel).await?.stats)
    }

    async fn scan_range(&self, from: u64, to: u64, cancel: &CancellationToken) -> Result<RangeScan, IndexerError> {
        let mut scan = RangeScan {
            stats: RangeStats::default(),
            latest: HashMap::new(),
        };
        let mut start = from;

        while start <= to {
            if cancel.is_cancelled() {
                return Err(IndexerError::Cancelled);
            }

            let end = start.saturating_add(self.batch_size - 1).min(to);
            let events = self.ledger.fetch_events(start, end).await?;
            debug!(from = start, to = end, count = events.len(), "Fetched loan logs");

            for event in events.iter().filter(|e| !e.removed) {
                if cancel.is_cancelled() {
                    return Err(IndexerError::Cancelled);
                }
                scan.stats.events += 1;

                let newer = scan
                    .latest
                    .get(&event.borrower)
                    .map_or(true, |seen| event_order(event) >= event_order(seen));
                if newer {
                    scan.latest.insert(event.borrower, event.clone());
                }

                match self.ingestor.apply(event, WriteOrigin::Reconcile).await {
                    Ok(ApplyOutcome::Stored(_)) => scan.stats.stored += 1,
                    Ok(ApplyOutcome::Absent) => scan.stats.absent += 1,
                    Ok(ApplyOutcome::Halted) => return Ok(scan),
                    Err(IndexerError::Decode(e)) => {
                        scan.stats.skipped += 1;
                        warn!(
                            error = %e,
                            borrower = ?event.borrower,
                            block = event.block_number,
                            "Skipping undecodable event during reconciliation"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }

            if end == u64::MAX {
                break;
            }
            start = end + 1;
        }

        Ok(scan)
    }

    /// 정식 체인이 뒷받침하지 않는 레코드 보정
    ///
    /// `last_seen_block`이 `[from, head]` 안인 레코드는 그 높이에 같은 borrower의
    /// 이벤트가 있어야 한다. 구간 안의 마지막 이벤트가 더 낮거나 없으면
    /// 그 레코드는 버려진 블록에서 온 것이다.
    async fn repair_orphans(
        &self,
        contract: &str,
        from: u64,
        head: u64,
        latest: &HashMap<Address, RawLoanEvent>,
        cancel: &CancellationToken,
    ) -> Result<usize, IndexerError> {
        let mut corrected = 0;

        for record in self.ingestor.store().list_since(contract, from).await? {
            // head 이후 블록은 아직 확인할 수 없음
            if record.last_seen_block > head {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(IndexerError::Cancelled);
            }

            let borrower = match EthAddress::parse(&record.borrower) {
                Ok(addr) => addr.address(),
                Err(e) => {
                    warn!(borrower = %record.borrower, error = %e, "Unparseable borrower in store");
                    continue;
                }
            };

            let surviving = latest.get(&borrower);
            if surviving.map_or(false, |e| e.block_number >= record.last_seen_block) {
                continue;
            }

            let replacement = match surviving {
                Some(event) => Some(event.clone()),
                None => self.last_event_before(borrower, from, cancel).await?,
            };

            warn!(
                borrower = %record.borrower,
                orphaned_block = record.last_seen_block,
                replacement_block = ?replacement.as_ref().map(|e| e.block_number),
                "Stored loan is not backed by the canonical chain, correcting"
            );

            match self.correct(contract, &record, replacement).await {
                Ok(true) => corrected += 1,
                Ok(false) => {}
                Err(IndexerError::Decode(e)) => {
                    warn!(error = %e, borrower = %record.borrower, "Correction event undecodable, leaving record");
                }
                Err(e) => return Err(e),
            }

            if self.ingestor.control().is_halted() {
                break;
            }
        }

        Ok(corrected)
    }

    /// 보정 쓰기. 기존 row가 그 사이 다른 쓰기로 바뀌었으면 false
    async fn correct(
        &self,
        contract: &str,
        record: &LoanRecord,
        replacement: Option<RawLoanEvent>,
    ) -> Result<bool, IndexerError> {
        let replaces = record.last_seen_block;
        let store = self.ingestor.store();

        let outcome = match replacement {
            Some(event) => self.ingestor.apply(&event, WriteOrigin::Correction { replaces }).await?,
            None => ApplyOutcome::Absent,
        };

        match outcome {
            ApplyOutcome::Stored(UpsertOutcome::Stale) | ApplyOutcome::Halted => Ok(false),
            ApplyOutcome::Stored(_) => Ok(true),
            // 정식 체인에 이 borrower의 대출이 남아 있지 않음
            ApplyOutcome::Absent => store.retract(contract, &record.borrower, replaces).await,
        }
    }

    /// `before` 아래에서 borrower의 마지막 이벤트를 뒤로 훑어 찾음
    async fn last_event_before(
        &self,
        borrower: Address,
        before: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<RawLoanEvent>, IndexerError> {
        let Some(mut end) = before.checked_sub(1) else {
            return Ok(None);
        };

        while end >= self.start_block {
            if cancel.is_cancelled() {
                return Err(IndexerError::Cancelled);
            }

            let start = end.saturating_sub(self.batch_size - 1).max(self.start_block);
            let found = self
                .ledger
                .fetch_events(start, end)
                .await?
                .into_iter()
                .filter(|e| !e.removed && e.borrower == borrower)
                .max_by_key(event_order);
            if found.is_some() {
                return Ok(found);
            }

            match start.checked_sub(1) {
                Some(next) => end = next,
                None => break,
            }
        }

        Ok(None)
    }

    /// 한 번의 reconciliation
    ///
    /// ingestion이 중단 상태이면 아무것도 하지 않고 None
    #[instrument(skip(self, cancel))]
    pub async fn reconcile_once(
        &self,
        reason: ReconcileRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<ReconcileReport>, IndexerError> {
        let control = self.ingestor.control();
        if control.is_halted() {
            debug!("Ingestion halted, skipping reconciliation");
            return Ok(None);
        }

        let contract = self.ingestor.contract();
        let head = self.ledger.head_block().await?;
        let cursor = self.ingestor.store().cursor(&contract).await?;

        if let Some(cursor) = &cursor {
            self.verify_cursor(cursor, head).await?;
        }

        let from = range_start(self.start_block, cursor.as_ref().map(|c| c.height), self.confirmation_depth);
        if from > head {
            debug!(from, head, "Nothing to reconcile yet");
            return Ok(Some(ReconcileReport {
                from,
                to: head,
                stats: RangeStats::default(),
                cursor: None,
            }));
        }

        info!(from, to = head, "Reconciling loan state");
        let scan = self.scan_range(from, head, cancel).await?;
        let mut stats = scan.stats;

        if control.is_halted() {
            return Ok(None);
        }

        stats.corrected = self
            .repair_orphans(&contract, from, head, &scan.latest, cancel)
            .await?;

        if control.is_halted() {
            return Ok(None);
        }

        let target = cursor_target(head, self.confirmation_depth);
        let advanced = self.advance_cursor(&contract, target).await?;

        info!(
            from,
            to = head,
            events = stats.events,
            stored = stats.stored,
            skipped = stats.skipped,
            corrected = stats.corrected,
            cursor = ?advanced,
            "Reconciliation complete"
        );

        Ok(Some(ReconcileReport {
            from,
            to: head,
            stats,
            cursor: advanced,
        }))
    }

    /// 저장된 커서가 현재 체인과 같은 블록을 가리키는지 확인
    async fn verify_cursor(&self, cursor: &IngestionCursor, head: u64) -> Result<(), IndexerError> {
        if head < cursor.height {
            // 노드가 아직 따라오지 못한 경우 (재시도 대상)
            return Err(IndexerError::Transport(format!(
                "node head {head} is behind persisted cursor {}",
                cursor.height
            )));
        }

        let Some(expected) = cursor.block_hash.as_deref() else {
            return Ok(());
        };
        let actual = self
            .ledger
            .block_hash(cursor.height)
            .await?
            .ok_or_else(|| IndexerError::Transport(format!("block {} not available", cursor.height)))?;

        if !expected.eq_ignore_ascii_case(&hash_hex(&actual)) {
            let reason = format!(
                "block hash at cursor {} changed: stored {expected}, chain {}",
                cursor.height,
                hash_hex(&actual)
            );
            self.ingestor.control().halt(reason.clone());
            return Err(IndexerError::ConsistencyViolation(reason));
        }

        Ok(())
    }

    async fn advance_cursor(&self, contract: &str, target: u64) -> Result<Option<u64>, IndexerError> {
        let hash = self.ledger.block_hash(target).await?.map(|h| hash_hex(&h));
        match self.ingestor.store().advance_cursor(contract, target, hash).await? {
            CursorOutcome::Advanced => Ok(Some(target)),
            CursorOutcome::Rejected { current } => {
                debug!(target, current, "Cursor already at or beyond target");
                Ok(None)
            }
        }
    }

    /// 요청 기반 실행 루프
    ///
    /// 대기 중인 요청은 한 번의 실행으로 합쳐지고, `interval`마다 주기 실행
    pub async fn run(
        self,
        mut requests: mpsc::Receiver<ReconcileRequest>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 첫 tick은 즉시 완료됨
        ticker.tick().await;

        info!("Backfill engine started");

        loop {
            let request = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = requests.recv() => match next {
                    Some(request) => request,
                    None => break,
                },
                _ = ticker.tick() => ReconcileRequest::Periodic,
            };

            while let Ok(extra) = requests.try_recv() {
                debug!(?extra, "Coalesced reconcile request");
            }

            if self.run_with_retry(request, &cancel).await {
                break;
            }
        }

        info!("Backfill engine stopped");
    }

    /// 취소되면 true
    async fn run_with_retry(&self, request: ReconcileRequest, cancel: &CancellationToken) -> bool {
        let mut attempts: u32 = 0;
        loop {
            match self.reconcile_once(request, cancel).await {
                Ok(_) => return false,
                Err(IndexerError::Cancelled) => return true,
                Err(e) if e.is_transient() => {
                    attempts = attempts.saturating_add(1);
                    let delay = self.backoff.delay(attempts);
                    warn!(error = %e, attempt = attempts, delay_ms = delay.as_millis() as u64, "Reconciliation failed, retrying");
                    if sleep_or_cancel(delay, cancel).await {
                        return true;
                    }
                }
                Err(e) => {
                    error!(error = %e, ?request, "Reconciliation aborted");
                    return false;
                }
            }
        }
    }
}

fn range_start(start_block: u64, cursor: Option<u64>, depth: u64) -> u64 {
    match cursor {
        Some(height) => height.saturating_sub(depth).max(start_block),
        None => start_block,
    }
}

fn cursor_target(head: u64, depth: u64) -> u64 {
    head.saturating_sub(depth)
}

fn event_order(event: &RawLoanEvent) -> (u64, u64) {
    (event.block_number, event.log_index)
}

fn hash_hex(hash: &H256) -> String {
    format!("{hash:?}")
}
