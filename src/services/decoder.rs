//! Event Decoder
//!
//! Raw log + point-in-time `loans(borrower)` read → [`LoanRecord`].
//!
//! 동기 순수 함수. 금액은 U256 raw 값을 그대로 [`TokenAmount`]로 감싸므로
//! 변환 경로에 부동소수점이 없다.

use chrono::{DateTime, TimeZone, Utc};
use ethers::types::{Address, U256};
use sha3::{Digest, Keccak256};
use uuid::{Builder, Uuid};

use crate::db::{LoanRecord, LoanStatus};
use crate::error::DecodeError;
use crate::services::blockchain::{LoanEventKind, OnChainLoan, RawLoanEvent};
use crate::types::{EthAddress, TokenAmount};

/// 디코딩 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Record(LoanRecord),
    /// borrower에게 활성 대출이 없음 (에러 아님)
    Absent,
}

/// 이벤트 블록 시점의 `supportedTokens` 조회 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSupport {
    pub collateral: bool,
    pub loan: bool,
}

#[derive(Debug, Clone)]
pub struct EventDecoder {
    contract: EthAddress,
}

impl EventDecoder {
    pub fn new(contract: EthAddress) -> Self {
        Self { contract }
    }

    pub fn contract(&self) -> EthAddress {
        self.contract
    }

    pub fn decode(
        &self,
        event: &RawLoanEvent,
        loan: &OnChainLoan,
        support: TokenSupport,
    ) -> Result<Decoded, DecodeError> {
        if event.borrower.is_zero() {
            return Err(DecodeError::MalformedLog("zero borrower address".to_string()));
        }
        if loan.is_vacant() {
            return Ok(Decoded::Absent);
        }

        if !support.collateral {
            return Err(DecodeError::UnsupportedToken {
                borrower: event.borrower,
                token: loan.collateral_token,
            });
        }
        if !support.loan {
            return Err(DecodeError::UnsupportedToken {
                borrower: event.borrower,
                token: loan.loan_token,
            });
        }

        if loan.interest_rate > U256::from(u32::MAX) {
            return Err(DecodeError::InterestRateOverflow(loan.interest_rate.to_string()));
        }

        Ok(Decoded::Record(LoanRecord {
            id: loan_id(self.contract.address(), event.borrower, loan.due_date),
            contract_address: self.contract.checksummed(),
            borrower: EthAddress::from(event.borrower).checksummed(),
            collateral_token: EthAddress::from(loan.collateral_token).checksummed(),
            loan_token: EthAddress::from(loan.loan_token).checksummed(),
            collateral_amount: TokenAmount::from_raw(loan.collateral_amount),
            loan_amount: TokenAmount::from_raw(loan.loan_amount),
            interest_rate: loan.interest_rate.as_u32(),
            due_date: due_date(loan.due_date)?,
            liquidated: loan.liquidated,
            status: LoanStatus::Active,
            last_seen_block: event.block_number,
        }))
    }

    /// 이벤트 블록에서 `loans(borrower)`가 비어 있을 때의 종료 레코드
    ///
    /// `prior`는 직전 블록 시점의 상태. 식별 정보(id, 토큰, dueDate, 이자율)는 거기서 가져오고
    /// 금액은 0. 직전 상태도 비어 있으면 닫을 대출이 없으므로 Absent
    pub fn decode_closed(&self, event: &RawLoanEvent, prior: &OnChainLoan) -> Result<Decoded, DecodeError> {
        if event.borrower.is_zero() {
            return Err(DecodeError::MalformedLog("zero borrower address".to_string()));
        }
        if prior.is_vacant() {
            return Ok(Decoded::Absent);
        }
        if prior.interest_rate > U256::from(u32::MAX) {
            return Err(DecodeError::InterestRateOverflow(prior.interest_rate.to_string()));
        }

        Ok(Decoded::Record(LoanRecord {
            id: loan_id(self.contract.address(), event.borrower, prior.due_date),
            contract_address: self.contract.checksummed(),
            borrower: EthAddress::from(event.borrower).checksummed(),
            collateral_token: EthAddress::from(prior.collateral_token).checksummed(),
            loan_token: EthAddress::from(prior.loan_token).checksummed(),
            collateral_amount: TokenAmount::zero(),
            loan_amount: TokenAmount::zero(),
            interest_rate: prior.interest_rate.as_u32(),
            due_date: due_date(prior.due_date)?,
            liquidated: prior.liquidated || event.kind == LoanEventKind::Liquidated,
            status: LoanStatus::Closed,
            last_seen_block: event.block_number,
        }))
    }
}

/// 대출 id
///
/// keccak256(contract ‖ borrower ‖ dueDate)의 앞 16바이트.
/// dueDate는 createLoan 시점에 고정되므로 같은 대출에 대한 모든 이벤트가 같은 id를 얻고,
/// 새 대출이 생성되면 id가 바뀐다.
pub fn loan_id(contract: Address, borrower: Address, due_date: U256) -> Uuid {
    let mut due = [0u8; 32];
    due_date.to_big_endian(&mut due);

    let digest = Keccak256::new()
        .chain_update(contract.as_bytes())
        .chain_update(borrower.as_bytes())
        .chain_update(due)
        .finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Builder::from_random_bytes(bytes).into_uuid()
}

fn due_date(raw: U256) -> Result<DateTime<Utc>, DecodeError> {
    if raw > U256::from(i64::MAX as u64) {
        return Err(DecodeError::DueDateOutOfRange(raw.to_string()));
    }
    Utc.timestamp_opt(raw.as_u64() as i64, 0)
        .single()
        .ok_or_else(|| DecodeError::DueDateOutOfRange(raw.to_string()))
}
