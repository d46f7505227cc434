//! 통합 테스트 공용: 스크립트된 ledger + fixture
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use loan_indexer::config::{Config, Environment, IndexerSettings};
use loan_indexer::error::IndexerError;
use loan_indexer::services::{BackoffPolicy, LedgerClient, LiveSubscription, LoanEventKind, OnChainLoan, RawLoanEvent};
use loan_indexer::types::EthAddress;

pub const CONTRACT: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

pub fn contract() -> EthAddress {
    EthAddress::parse(CONTRACT).unwrap()
}

pub fn borrower(n: u64) -> Address {
    Address::from_low_u64_be(0x1000 + n)
}

pub fn collateral_token() -> Address {
    Address::from_low_u64_be(0xc011)
}

pub fn loan_token() -> Address {
    Address::from_low_u64_be(0x10a0)
}

pub fn active_loan(loan_amount: U256, due_date: u64, liquidated: bool) -> OnChainLoan {
    OnChainLoan {
        collateral_token: collateral_token(),
        loan_token: loan_token(),
        collateral_amount: loan_amount * U256::from(2),
        loan_amount,
        interest_rate: U256::from(5),
        due_date: U256::from(due_date),
        liquidated,
    }
}

pub fn block_hash(height: u64) -> H256 {
    H256::from_low_u64_be(0xb10c_0000 + height)
}

#[derive(Default)]
struct LedgerState {
    head: u64,
    events: BTreeMap<u64, Vec<RawLoanEvent>>,
    /// borrower → (block → 해당 블록 이후 상태)
    loans: HashMap<Address, BTreeMap<u64, OnChainLoan>>,
    reorged: HashMap<u64, H256>,
    unsupported: HashSet<Address>,
    live: Option<mpsc::Sender<Result<RawLoanEvent, IndexerError>>>,
    reachable: bool,
    subscriptions: usize,
}

/// 블록 하나에 이벤트 하나씩 쌓는 in-process ledger
pub struct MockLedger {
    state: Mutex<LedgerState>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                reachable: true,
                ..Default::default()
            }),
        }
    }

    /// 새 블록에 이벤트 하나를 기록. 구독이 살아 있으면 live로도 전달
    pub fn mine(&self, kind: LoanEventKind, who: Address, loan_after: OnChainLoan) -> RawLoanEvent {
        let mut state = self.state.lock().unwrap();
        state.head += 1;
        let block = state.head;

        let event = RawLoanEvent {
            kind,
            borrower: who,
            amount: loan_after.loan_amount,
            block_number: block,
            block_hash: Some(block_hash(block)),
            tx_hash: Some(H256::from_low_u64_be(block)),
            log_index: 0,
            removed: false,
        };
        state.events.entry(block).or_default().push(event.clone());
        state.loans.entry(who).or_default().insert(block, loan_after);

        if let Some(live) = &state.live {
            let _ = live.try_send(Ok(event.clone()));
        }
        event
    }

    /// 이벤트 없는 빈 블록
    pub fn mine_empty(&self, count: u64) {
        self.state.lock().unwrap().head += count;
    }

    /// 노드가 reorg로 무효화한 로그를 live로 전달
    pub fn emit_removed(&self, event: &RawLoanEvent) {
        let state = self.state.lock().unwrap();
        if let Some(live) = &state.live {
            let mut removed = event.clone();
            removed.removed = true;
            let _ = live.try_send(Ok(removed));
        }
    }

    /// 현재 구독 연결 끊기
    pub fn drop_connection(&self) {
        self.state.lock().unwrap().live = None;
    }

    /// false면 재구독 시도가 모두 실패
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.state.lock().unwrap();
        state.reachable = reachable;
        if !reachable {
            state.live = None;
        }
    }

    pub fn reorg_block(&self, height: u64) {
        self.state
            .lock()
            .unwrap()
            .reorged
            .insert(height, H256::from_low_u64_be(0xdead_0000 + height));
    }

    /// reorg로 블록 내용이 바뀜: 해당 높이의 이벤트와 상태 변경이 사라지고 해시도 바뀜
    pub fn orphan_block(&self, height: u64) {
        let mut state = self.state.lock().unwrap();
        state.events.remove(&height);
        for history in state.loans.values_mut() {
            history.remove(&height);
        }
        state
            .reorged
            .insert(height, H256::from_low_u64_be(0xdead_0000 + height));
    }

    pub fn unsupport(&self, token: Address) {
        self.state.lock().unwrap().unsupported.insert(token);
    }

    pub fn head(&self) -> u64 {
        self.state.lock().unwrap().head
    }

    pub fn subscriptions(&self) -> usize {
        self.state.lock().unwrap().subscriptions
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().live.is_some()
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn head_block(&self) -> Result<u64, IndexerError> {
        Ok(self.head())
    }

    async fn block_hash(&self, height: u64) -> Result<Option<H256>, IndexerError> {
        let state = self.state.lock().unwrap();
        if height > state.head {
            return Ok(None);
        }
        Ok(Some(state.reorged.get(&height).copied().unwrap_or_else(|| block_hash(height))))
    }

    async fn fetch_events(&self, from: u64, to: u64) -> Result<Vec<RawLoanEvent>, IndexerError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .events
            .range(from..=to)
            .flat_map(|(_, events)| events.iter().cloned())
            .collect())
    }

    async fn read_loan(&self, who: Address, block: u64) -> Result<OnChainLoan, IndexerError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .loans
            .get(&who)
            .and_then(|history| history.range(..=block).next_back())
            .map(|(_, loan)| loan.clone())
            .unwrap_or_default())
    }

    async fn is_supported_token(&self, token: Address, _block: u64) -> Result<bool, IndexerError> {
        Ok(!self.state.lock().unwrap().unsupported.contains(&token))
    }

    async fn subscribe(&self) -> Result<LiveSubscription, IndexerError> {
        let mut state = self.state.lock().unwrap();
        if !state.reachable {
            return Err(IndexerError::Transport("node unreachable".to_string()));
        }
        let (tx, rx) = mpsc::channel(1024);
        state.live = Some(tx);
        state.subscriptions += 1;
        Ok(LiveSubscription::new(rx, CancellationToken::new()))
    }
}

/// borrower들이 번갈아 대출/상환/청산하는 결정적 시나리오
///
/// 20블록마다 새 대출 (dueDate 변경 → 새 id). 같은 대출 안에서 청산 플래그는 되돌아가지 않음.
/// 11의 배수 블록에서는 청산되지 않은 대출을 전액 상환 (`loans(borrower)`가 비워짐)
pub struct Scenario {
    borrowers: u64,
    current: HashMap<Address, OnChainLoan>,
}

impl Scenario {
    pub fn new(borrowers: u64) -> Self {
        Self {
            borrowers,
            current: HashMap::new(),
        }
    }

    pub fn borrowers(&self) -> Vec<Address> {
        (0..self.borrowers).map(borrower).collect()
    }

    /// 다음 블록에 시나리오 이벤트 하나를 기록
    pub fn step(&mut self, ledger: &MockLedger) -> RawLoanEvent {
        let block = ledger.head() + 1;
        let who = borrower(block % self.borrowers);
        let due_date = 1_700_000_000 + (block / 20) * 86_400;

        let kind = if block % 7 == 0 {
            LoanEventKind::Liquidated
        } else if block % 3 == 0 {
            LoanEventKind::Repaid
        } else {
            LoanEventKind::Created
        };

        let previous = self.current.get(&who).filter(|l| l.due_date == U256::from(due_date));

        if block % 11 == 0 && previous.map_or(false, |l| !l.liquidated) {
            self.current.insert(who, OnChainLoan::default());
            return ledger.mine(LoanEventKind::Repaid, who, OnChainLoan::default());
        }

        let liquidated = kind == LoanEventKind::Liquidated || previous.map_or(false, |l| l.liquidated);
        let amount = U256::exp10(15) * U256::from(block);

        let loan = active_loan(amount, due_date, liquidated);
        self.current.insert(who, loan.clone());
        ledger.mine(kind, who, loan)
    }

    pub fn run(&mut self, ledger: &MockLedger, blocks: u64) -> Vec<RawLoanEvent> {
        (0..blocks).map(|_| self.step(ledger)).collect()
    }
}

/// borrower별 마지막 이벤트 블록
pub fn last_blocks(events: &[RawLoanEvent]) -> HashMap<String, u64> {
    let mut last = HashMap::new();
    for event in events {
        last.insert(EthAddress::from(event.borrower).checksummed(), event.block_number);
    }
    last
}

pub fn settings(confirmation_depth: u64) -> IndexerSettings {
    IndexerSettings {
        contract: contract(),
        start_block: 0,
        confirmation_depth,
        batch_size: 10,
        queue_capacity: 64,
        backoff: BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(40)),
        rpc_timeout: Duration::from_secs(1),
        reconcile_interval: Duration::from_secs(3600),
    }
}

pub fn test_config() -> Config {
    Config {
        port: 0,
        database_url: "memory://".to_string(),
        eth_rpc_url: "http://localhost:8545".to_string(),
        eth_ws_url: "ws://localhost:8545".to_string(),
        lending_pool_address: Some(contract()),
        start_block: 0,
        confirmation_depth: 2,
        backfill_batch_size: 10,
        ingest_queue_capacity: 64,
        backoff_base_ms: 5,
        backoff_max_ms: 40,
        rpc_timeout_secs: 1,
        reconcile_interval_secs: 3600,
        environment: Environment::Development,
    }
}

/// 조건이 참이 될 때까지 대기 (5초 제한)
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
