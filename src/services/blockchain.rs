//! Blockchain Service
//!
//! Ledger node access for the indexer.
//!
//! # Features
//! - Loan event subscription (WebSocket, `eth_subscribe("logs")`)
//! - Historical log range queries (`eth_getLogs`)
//! - Point-in-time contract reads (`loans(borrower)`, `supportedTokens(token)`)
//!
//! 연결 수명: 구독 1회당 `Provider<Ws>` 하나를 만들고, 구독 태스크가 소유한다.
//! [`LiveSubscription`]이 drop되거나 스트림이 끝나면 소켓도 함께 닫힌다.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use ethers::contract::{abigen, ContractError};
use ethers::providers::{Http, Middleware, Provider, Ws};
use ethers::types::{Address, BlockId, BlockNumber, Filter, Log, H256, U256};
use ethers::utils::keccak256;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{DecodeError, IndexerError};

abigen!(
    LendingPool,
    r#"[
        function loans(address) external view returns (address, address, uint256, uint256, uint256, uint256, bool)
        function supportedTokens(address) external view returns (bool)
    ]"#
);

/// 구독 태스크 → 소비자 버퍼
const SUBSCRIPTION_BUFFER: usize = 256;

/// 이벤트 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoanEventKind {
    Created,
    Repaid,
    Liquidated,
}

impl LoanEventKind {
    pub const ALL: [LoanEventKind; 3] = [
        LoanEventKind::Created,
        LoanEventKind::Repaid,
        LoanEventKind::Liquidated,
    ];

    /// Solidity 이벤트 시그니처
    pub fn signature(&self) -> &'static str {
        match self {
            LoanEventKind::Created => "LoanCreated(address,uint256)",
            LoanEventKind::Repaid => "LoanRepaid(address,uint256)",
            LoanEventKind::Liquidated => "LoanLiquidated(address,uint256)",
        }
    }

    /// topic0
    pub fn topic(&self) -> H256 {
        H256::from(keccak256(self.signature()))
    }

    pub fn from_topic(topic: &H256) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.topic() == *topic)
    }
}

/// 정규화 전 이벤트
///
/// 이벤트 하나에는 전체 대출 상태가 없으므로 borrower 키와 위치 정보만 담는다
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLoanEvent {
    pub kind: LoanEventKind,
    pub borrower: Address,
    pub amount: U256,
    pub block_number: u64,
    pub block_hash: Option<H256>,
    pub tx_hash: Option<H256>,
    pub log_index: u64,
    /// 노드가 reorg로 무효화를 알린 로그
    pub removed: bool,
}

impl RawLoanEvent {
    /// `event X(address indexed borrower, uint256 amount)` 로그 파싱
    pub fn from_log(log: &Log) -> Result<Self, DecodeError> {
        let topic0 = log
            .topics
            .first()
            .ok_or_else(|| DecodeError::MalformedLog("log has no topics".to_string()))?;
        let kind = LoanEventKind::from_topic(topic0)
            .ok_or_else(|| DecodeError::MalformedLog(format!("unknown event topic {topic0:?}")))?;

        if log.topics.len() != 2 {
            return Err(DecodeError::MalformedLog(format!(
                "{} expects 2 topics, got {}",
                kind.signature(),
                log.topics.len()
            )));
        }
        if log.data.len() != 32 {
            return Err(DecodeError::MalformedLog(format!(
                "{} expects 32 bytes of data, got {}",
                kind.signature(),
                log.data.len()
            )));
        }

        let block_number = log
            .block_number
            .ok_or_else(|| DecodeError::MalformedLog("pending log without block number".to_string()))?
            .as_u64();

        Ok(Self {
            kind,
            borrower: Address::from_slice(&log.topics[1].as_bytes()[12..]),
            amount: U256::from_big_endian(&log.data),
            block_number,
            block_hash: log.block_hash,
            tx_hash: log.transaction_hash,
            log_index: log.log_index.map(|i| i.as_u64()).unwrap_or_default(),
            removed: log.removed.unwrap_or(false),
        })
    }
}

/// `loans(borrower)` 조회 결과
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnChainLoan {
    pub collateral_token: Address,
    pub loan_token: Address,
    pub collateral_amount: U256,
    pub loan_amount: U256,
    pub interest_rate: U256,
    pub due_date: U256,
    pub liquidated: bool,
}

impl OnChainLoan {
    /// mapping 기본값 = 활성 대출 없음
    pub fn is_vacant(&self) -> bool {
        self.collateral_token.is_zero()
            && self.loan_token.is_zero()
            && self.collateral_amount.is_zero()
            && self.loan_amount.is_zero()
    }
}

impl From<(Address, Address, U256, U256, U256, U256, bool)> for OnChainLoan {
    fn from(raw: (Address, Address, U256, U256, U256, U256, bool)) -> Self {
        let (collateral_token, loan_token, collateral_amount, loan_amount, interest_rate, due_date, liquidated) = raw;
        Self {
            collateral_token,
            loan_token,
            collateral_amount,
            loan_amount,
            interest_rate,
            due_date,
            liquidated,
        }
    }
}

/// 실시간 구독 핸들
///
/// drop 시 구독 태스크가 취소되고 연결이 해제된다
pub struct LiveSubscription {
    events: mpsc::Receiver<Result<RawLoanEvent, IndexerError>>,
    _guard: DropGuard,
}

impl LiveSubscription {
    pub fn new(
        events: mpsc::Receiver<Result<RawLoanEvent, IndexerError>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            events,
            _guard: cancel.drop_guard(),
        }
    }

    /// None = 스트림 종료 (transport 끊김)
    pub async fn next(&mut self) -> Option<Result<RawLoanEvent, IndexerError>> {
        self.events.recv().await
    }
}

/// Ledger 노드 인터페이스
///
/// 테스트에서는 스크립트된 mock 구현으로 교체
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn head_block(&self) -> Result<u64, IndexerError>;

    async fn block_hash(&self, height: u64) -> Result<Option<H256>, IndexerError>;

    /// `[from, to]` 범위의 대출 이벤트 (블록, log index 순)
    async fn fetch_events(&self, from: u64, to: u64) -> Result<Vec<RawLoanEvent>, IndexerError>;

    /// `block` 시점의 `loans(borrower)`
    async fn read_loan(&self, borrower: Address, block: u64) -> Result<OnChainLoan, IndexerError>;

    async fn is_supported_token(&self, token: Address, block: u64) -> Result<bool, IndexerError>;

    async fn subscribe(&self) -> Result<LiveSubscription, IndexerError>;
}

fn at_block(height: u64) -> BlockId {
    BlockId::Number(BlockNumber::Number(height.into()))
}

/// 컨트랙트 호출 에러 분류
///
/// revert/ABI 디코딩 실패는 형태 불일치(Decode), 나머지는 전송 계층(Transport)
fn classify_contract_error<M: Middleware>(err: ContractError<M>) -> IndexerError {
    match err {
        ContractError::Revert(_) | ContractError::DecodingError(_) | ContractError::AbiError(_) => {
            IndexerError::Decode(DecodeError::UnexpectedShape(err.to_string()))
        }
        other => IndexerError::Transport(other.to_string()),
    }
}

/// ethers 기반 LedgerClient
pub struct EthLedger {
    contract: Address,
    http: Arc<Provider<Http>>,
    pool: LendingPool<Provider<Http>>,
    ws_url: String,
    rpc_timeout: Duration,
}

impl EthLedger {
    pub fn new(rpc_url: &str, ws_url: &str, contract: Address, rpc_timeout: Duration) -> AnyResult<Self> {
        let http = Arc::new(
            Provider::<Http>::try_from(rpc_url).context("ETH_RPC_URL must be a valid URL")?,
        );
        let pool = LendingPool::new(contract, http.clone());

        Ok(Self {
            contract,
            http,
            pool,
            ws_url: ws_url.to_string(),
            rpc_timeout,
        })
    }

    fn loan_filter(&self) -> Filter {
        Filter::new()
            .address(self.contract)
            .events(LoanEventKind::ALL.iter().map(|kind| kind.signature()))
    }

    async fn timed<T, F>(&self, what: &str, fut: F) -> Result<T, IndexerError>
    where
        F: Future<Output = Result<T, IndexerError>>,
    {
        tokio::time::timeout(self.rpc_timeout, fut)
            .await
            .map_err(|_| IndexerError::Transport(format!("{what} timed out after {:?}", self.rpc_timeout)))?
    }
}

#[async_trait]
impl LedgerClient for EthLedger {
    async fn head_block(&self) -> Result<u64, IndexerError> {
        self.timed("eth_blockNumber", async {
            Ok(self.http.get_block_number().await?.as_u64())
        })
        .await
    }

    async fn block_hash(&self, height: u64) -> Result<Option<H256>, IndexerError> {
        self.timed("eth_getBlockByNumber", async {
            let block = self.http.get_block(at_block(height)).await?;
            Ok(block.and_then(|b| b.hash))
        })
        .await
    }

    async fn fetch_events(&self, from: u64, to: u64) -> Result<Vec<RawLoanEvent>, IndexerError> {
        let filter = self.loan_filter().from_block(from).to_block(to);
        let logs = self
            .timed("eth_getLogs", async { Ok(self.http.get_logs(&filter).await?) })
            .await?;

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match RawLoanEvent::from_log(log) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!(error = %e, tx = ?log.transaction_hash, "Skipping malformed loan log"),
            }
        }
        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }

    async fn read_loan(&self, borrower: Address, block: u64) -> Result<OnChainLoan, IndexerError> {
        self.timed("loans()", async {
            let raw = self
                .pool
                .loans(borrower)
                .block(at_block(block))
                .call()
                .await
                .map_err(classify_contract_error)?;
            Ok(OnChainLoan::from(raw))
        })
        .await
    }

    async fn is_supported_token(&self, token: Address, block: u64) -> Result<bool, IndexerError> {
        self.timed("supportedTokens()", async {
            self.pool
                .supported_tokens(token)
                .block(at_block(block))
                .call()
                .await
                .map_err(classify_contract_error)
        })
        .await
    }

    /// 새 WebSocket 연결을 열고 로그 구독
    ///
    /// 구독이 확인된 뒤에만 반환한다 (실패 시 Transport 에러)
    async fn subscribe(&self) -> Result<LiveSubscription, IndexerError> {
        let provider = self
            .timed("websocket connect", async {
                Ok(Provider::<Ws>::connect(self.ws_url.as_str()).await?)
            })
            .await?;

        let filter = self.loan_filter();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut stream = match provider.subscribe_logs(&filter).await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(IndexerError::from(e)));
                    return;
                }
            };

            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    next = stream.next() => match next {
                        Some(log) => {
                            let item = RawLoanEvent::from_log(&log).map_err(IndexerError::Decode);
                            if tx.send(item).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            tracing::warn!("Loan log stream ended");
                            break;
                        }
                    }
                }
            }
            // stream, provider drop → 소켓 종료
        });

        ready_rx
            .await
            .map_err(|_| IndexerError::Transport("subscription task exited".to_string()))??;

        Ok(LiveSubscription::new(rx, cancel))
    }
}
