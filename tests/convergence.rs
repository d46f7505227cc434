//! Live / reconciliation 쓰기가 어떤 순서로 섞여도 같은 상태로 수렴하는지

mod common;

use std::sync::Arc;

use ethers::types::{Address, U256};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use loan_indexer::db::{LoanRecord, LoanStatus, LoanStore, MemoryStore, UpsertOutcome, WriteOrigin};
use loan_indexer::error::{DecodeError, IndexerError};
use loan_indexer::services::{
    ApplyOutcome, BackfillEngine, BackoffPolicy, EventDecoder, IngestionControl, Ingestor, LedgerClient,
    LoanEventKind, OnChainLoan, RawLoanEvent, ReconcileRequest,
};

use common::{active_loan, borrower, contract, MockLedger, Scenario, CONTRACT};

fn ingestor(ledger: &Arc<MockLedger>, store: &Arc<MemoryStore>, control: IngestionControl) -> Arc<Ingestor> {
    Arc::new(Ingestor::new(
        EventDecoder::new(contract()),
        ledger.clone() as Arc<dyn LedgerClient>,
        store.clone() as Arc<dyn LoanStore>,
        control,
    ))
}

async fn apply_all(ingestor: &Ingestor, events: &[RawLoanEvent], origin: WriteOrigin) {
    for event in events {
        ingestor.apply(event, origin).await.unwrap();
    }
}

async fn in_order_state(ledger: &Arc<MockLedger>, events: &[RawLoanEvent]) -> Vec<LoanRecord> {
    let store = Arc::new(MemoryStore::new());
    let ingestor = ingestor(ledger, &store, IngestionControl::new());
    apply_all(&ingestor, events, WriteOrigin::Live).await;
    store.list_all().await.unwrap()
}

#[tokio::test]
async fn test_replaying_events_is_idempotent() {
    let ledger = Arc::new(MockLedger::new());
    let events = Scenario::new(3).run(&ledger, 30);

    let store = Arc::new(MemoryStore::new());
    let ingestor = ingestor(&ledger, &store, IngestionControl::new());

    apply_all(&ingestor, &events, WriteOrigin::Live).await;
    let once = store.list_all().await.unwrap();

    apply_all(&ingestor, &events, WriteOrigin::Reconcile).await;
    apply_all(&ingestor, &events, WriteOrigin::Live).await;
    assert_eq!(store.list_all().await.unwrap(), once);
    assert_eq!(once.len(), 3);
}

#[tokio::test]
async fn test_random_interleavings_converge() {
    let ledger = Arc::new(MockLedger::new());
    let events = Scenario::new(5).run(&ledger, 80);
    let expected = in_order_state(&ledger, &events).await;

    for seed in 0..25u64 {
        let mut rng = StdRng::seed_from_u64(seed);

        // 일부 이벤트는 live와 backfill 양쪽에서 중복 도착
        let mut deliveries: Vec<(RawLoanEvent, WriteOrigin)> = Vec::new();
        for event in &events {
            let origin = if rng.gen_bool(0.5) { WriteOrigin::Live } else { WriteOrigin::Reconcile };
            deliveries.push((event.clone(), origin));
            if rng.gen_bool(0.3) {
                deliveries.push((event.clone(), WriteOrigin::Reconcile));
            }
        }
        deliveries.shuffle(&mut rng);

        let store = Arc::new(MemoryStore::new());
        let ingestor = ingestor(&ledger, &store, IngestionControl::new());
        for (event, origin) in &deliveries {
            ingestor.apply(event, *origin).await.unwrap();
        }

        assert_eq!(store.list_all().await.unwrap(), expected, "seed {seed}");
    }
}

#[tokio::test]
async fn test_older_event_does_not_overwrite_newer_state() {
    let ledger = Arc::new(MockLedger::new());
    let who = borrower(1);
    let early = ledger.mine(LoanEventKind::Created, who, active_loan(U256::from(100), 1_700_000_000, false));
    let late = ledger.mine(LoanEventKind::Repaid, who, active_loan(U256::from(40), 1_700_000_000, false));

    let store = Arc::new(MemoryStore::new());
    let ingestor = ingestor(&ledger, &store, IngestionControl::new());

    ingestor.apply(&late, WriteOrigin::Live).await.unwrap();
    let outcome = ingestor.apply(&early, WriteOrigin::Reconcile).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Stored(UpsertOutcome::Stale));

    let records = store.list_all().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].last_seen_block, late.block_number);
    assert_eq!(records[0].loan_amount.raw(), U256::from(40));
}

#[tokio::test]
async fn test_full_repayment_closes_loan_in_any_order() {
    let ledger = Arc::new(MockLedger::new());
    let who = borrower(1);
    let created = ledger.mine(LoanEventKind::Created, who, active_loan(U256::from(100), 1_700_000_000, false));
    let repaid = ledger.mine(LoanEventKind::Repaid, who, OnChainLoan::default());

    let store = Arc::new(MemoryStore::new());
    let ingestor = ingestor(&ledger, &store, IngestionControl::new());
    ingestor.apply(&created, WriteOrigin::Live).await.unwrap();
    let outcome = ingestor.apply(&repaid, WriteOrigin::Live).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Stored(UpsertOutcome::Updated));

    let records = store.list_all().await.unwrap();
    assert_eq!(records.len(), 1);
    let closed = &records[0];
    assert_eq!(closed.status, LoanStatus::Closed);
    assert_eq!(closed.last_seen_block, repaid.block_number);
    assert_eq!(closed.loan_amount.raw(), U256::zero());
    assert_eq!(closed.collateral_amount.raw(), U256::zero());
    assert!(!closed.liquidated);

    // 역순, 다른 경로로 도착해도 같은 상태
    let reordered = Arc::new(MemoryStore::new());
    let other = self::ingestor(&ledger, &reordered, IngestionControl::new());
    other.apply(&repaid, WriteOrigin::Reconcile).await.unwrap();
    assert_eq!(
        other.apply(&created, WriteOrigin::Live).await.unwrap(),
        ApplyOutcome::Stored(UpsertOutcome::Stale)
    );
    assert_eq!(reordered.list_all().await.unwrap(), records);
}

#[tokio::test]
async fn test_liquidation_that_empties_loan_is_closed_and_liquidated() {
    let ledger = Arc::new(MockLedger::new());
    let who = borrower(1);
    let created = ledger.mine(LoanEventKind::Created, who, active_loan(U256::from(100), 1_700_000_000, false));
    let liquidated = ledger.mine(LoanEventKind::Liquidated, who, OnChainLoan::default());

    let store = Arc::new(MemoryStore::new());
    let ingestor = ingestor(&ledger, &store, IngestionControl::new());
    apply_all(&ingestor, &[created.clone(), liquidated], WriteOrigin::Live).await;

    let record = store.list_all().await.unwrap().remove(0);
    assert_eq!(record.status, LoanStatus::Closed);
    assert!(record.liquidated);

    // 종료 레코드는 같은 대출 id를 유지
    let fresh = Arc::new(MemoryStore::new());
    ingestor_with(&ledger, &fresh).apply(&created, WriteOrigin::Live).await.unwrap();
    assert_eq!(fresh.list_all().await.unwrap()[0].id, record.id);
}

fn ingestor_with(ledger: &Arc<MockLedger>, store: &Arc<MemoryStore>) -> Arc<Ingestor> {
    ingestor(ledger, store, IngestionControl::new())
}

#[tokio::test]
async fn test_vacant_loan_and_unsupported_token() {
    let ledger = Arc::new(MockLedger::new());
    let store = Arc::new(MemoryStore::new());
    let ingestor = ingestor(&ledger, &store, IngestionControl::new());

    let repaid = ledger.mine(LoanEventKind::Repaid, borrower(1), OnChainLoan::default());
    assert_eq!(ingestor.apply(&repaid, WriteOrigin::Live).await.unwrap(), ApplyOutcome::Absent);

    let odd_token = Address::from_low_u64_be(0x0dd);
    let mut loan = active_loan(U256::from(7), 1_700_000_000, false);
    loan.loan_token = odd_token;
    ledger.unsupport(odd_token);
    let created = ledger.mine(LoanEventKind::Created, borrower(2), loan);

    let err = ingestor.apply(&created, WriteOrigin::Live).await.unwrap_err();
    assert!(matches!(err, IndexerError::Decode(DecodeError::UnsupportedToken { .. })));
    assert!(store.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_halted_ingestor_skips_writes() {
    let ledger = Arc::new(MockLedger::new());
    let events = Scenario::new(2).run(&ledger, 4);

    let store = Arc::new(MemoryStore::new());
    let control = IngestionControl::new();
    let ingestor = ingestor(&ledger, &store, control.clone());

    control.halt("manual review");
    assert_eq!(ingestor.apply(&events[0], WriteOrigin::Live).await.unwrap(), ApplyOutcome::Halted);
    assert!(store.list_all().await.unwrap().is_empty());
}

fn engine(ingestor: Arc<Ingestor>, ledger: &Arc<MockLedger>, depth: u64) -> BackfillEngine {
    BackfillEngine::new(
        ingestor,
        ledger.clone() as Arc<dyn LedgerClient>,
        0,
        depth,
        7,
        BackoffPolicy::default(),
    )
}

#[tokio::test]
async fn test_backfill_matches_in_order_state_and_advances_cursor() {
    let ledger = Arc::new(MockLedger::new());
    let events = Scenario::new(4).run(&ledger, 50);
    let expected = in_order_state(&ledger, &events).await;

    let store = Arc::new(MemoryStore::new());
    let engine = engine(ingestor(&ledger, &store, IngestionControl::new()), &ledger, 12);
    let cancel = CancellationToken::new();

    let report = engine
        .reconcile_once(ReconcileRequest::Startup, &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!((report.from, report.to), (0, 50));
    assert_eq!(report.stats.events, 50);
    assert_eq!(report.cursor, Some(38));
    assert_eq!(store.list_all().await.unwrap(), expected);

    let cursor = store.cursor(CONTRACT).await.unwrap().unwrap();
    assert_eq!(cursor.height, 38);
    assert!(cursor.block_hash.is_some());

    // head가 그대로면 커서도 그대로
    let again = engine
        .reconcile_once(ReconcileRequest::Periodic, &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.from, 26);
    assert_eq!(again.cursor, None);
    assert_eq!(store.list_all().await.unwrap(), expected);
}

#[tokio::test]
async fn test_backfill_skips_undecodable_events() {
    let ledger = Arc::new(MockLedger::new());
    Scenario::new(2).run(&ledger, 5);

    let odd_token = Address::from_low_u64_be(0x0dd);
    let mut loan = active_loan(U256::from(7), 1_700_000_000, false);
    loan.collateral_token = odd_token;
    ledger.unsupport(odd_token);
    ledger.mine(LoanEventKind::Created, borrower(9), loan);
    ledger.mine_empty(3);

    let store = Arc::new(MemoryStore::new());
    let engine = engine(ingestor(&ledger, &store, IngestionControl::new()), &ledger, 2);

    let report = engine
        .reconcile_once(ReconcileRequest::Startup, &CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.stats.skipped, 1);
    assert_eq!(report.stats.stored, 5);
    assert_eq!(report.cursor, Some(7));
    assert_eq!(store.list_all().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_backfill_cancellation() {
    let ledger = Arc::new(MockLedger::new());
    Scenario::new(2).run(&ledger, 30);

    let store = Arc::new(MemoryStore::new());
    let engine = engine(ingestor(&ledger, &store, IngestionControl::new()), &ledger, 2);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = engine.reconcile_once(ReconcileRequest::Startup, &cancel).await.unwrap_err();
    assert!(matches!(err, IndexerError::Cancelled));
    assert!(store.cursor(CONTRACT).await.unwrap().is_none());
}

#[tokio::test]
async fn test_backfill_detects_changed_cursor_block() {
    let ledger = Arc::new(MockLedger::new());
    Scenario::new(2).run(&ledger, 20);

    let store = Arc::new(MemoryStore::new());
    let control = IngestionControl::new();
    let engine = engine(ingestor(&ledger, &store, control.clone()), &ledger, 2);
    let cancel = CancellationToken::new();

    engine.reconcile_once(ReconcileRequest::Startup, &cancel).await.unwrap();
    ledger.reorg_block(18);

    let err = engine.reconcile_once(ReconcileRequest::Reconnect, &cancel).await.unwrap_err();
    assert!(matches!(err, IndexerError::ConsistencyViolation(_)));
    assert!(control.is_halted());

    // 중단 후에는 아무 작업도 하지 않음
    assert_eq!(engine.reconcile_once(ReconcileRequest::Periodic, &cancel).await.unwrap(), None);
}

#[tokio::test]
async fn test_reconcile_reverts_writes_from_orphaned_blocks() {
    let ledger = Arc::new(MockLedger::new());
    let (kept, orphan_only, untouched) = (borrower(1), borrower(2), borrower(3));

    ledger.mine_empty(4);
    ledger.mine(LoanEventKind::Created, kept, active_loan(U256::from(100), 1_700_000_000, false)); // 5
    ledger.mine_empty(9);
    ledger.mine(LoanEventKind::Created, untouched, active_loan(U256::from(9), 1_700_000_000, false)); // 15
    let orphan_create = ledger.mine(
        LoanEventKind::Created,
        orphan_only,
        active_loan(U256::from(70), 1_700_000_000, false),
    ); // 16
    ledger.mine_empty(1);

    let store = Arc::new(MemoryStore::new());
    let ingestor = ingestor_with(&ledger, &store);
    let engine = engine(ingestor.clone(), &ledger, 4);
    let cancel = CancellationToken::new();
    engine.reconcile_once(ReconcileRequest::Startup, &cancel).await.unwrap();

    // live로 받은 블록 18이 이후 reorg로 사라짐
    let orphan_repay = ledger.mine(LoanEventKind::Repaid, kept, active_loan(U256::from(40), 1_700_000_000, false));
    ingestor.apply(&orphan_repay, WriteOrigin::Live).await.unwrap();
    assert_eq!(store.get(CONTRACT, &checksum(kept)).await.unwrap().unwrap().last_seen_block, 18);

    ledger.orphan_block(16);
    ledger.orphan_block(18);

    let report = engine
        .reconcile_once(ReconcileRequest::Reorg { block: orphan_create.block_number }, &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.stats.corrected, 2);

    // 정식 체인 기준: 블록 5의 상태로 복구
    let restored = store.get(CONTRACT, &checksum(kept)).await.unwrap().unwrap();
    assert_eq!(restored.last_seen_block, 5);
    assert_eq!(restored.loan_amount.raw(), U256::from(100));

    // 이벤트가 모두 사라진 borrower는 제거
    assert!(store.get(CONTRACT, &checksum(orphan_only)).await.unwrap().is_none());

    let other = store.get(CONTRACT, &checksum(untouched)).await.unwrap().unwrap();
    assert_eq!(other.last_seen_block, 15);
    assert_eq!(store.list_all().await.unwrap().len(), 2);
}

fn checksum(who: Address) -> String {
    loan_indexer::types::EthAddress::from(who).checksummed()
}
