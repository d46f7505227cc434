//! Common Types Module
//!
//! 애플리케이션 전반에서 사용되는 공통 타입 정의
//!
//! - [`EthAddress`]: EIP-55 checksum 형태로 정규화된 주소
//! - [`TokenAmount`]: 18 decimals 고정소수점 금액 (U256 raw 단위 보존)

use std::fmt;
use std::str::FromStr;

use ethers::types::{Address, U256};
use ethers::utils::to_checksum;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// 모든 금액에 적용하는 단일 스케일 (소수점 18자리)
pub const TOKEN_DECIMALS: usize = 18;

/// Ethereum 주소 타입
///
/// 저장/비교는 항상 checksum 문자열 기준
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EthAddress(Address);

impl EthAddress {
    pub fn parse(addr: &str) -> Result<Self, AddressError> {
        let addr = addr.trim();
        if !(addr.starts_with("0x") && addr.len() == 42) {
            return Err(AddressError(addr.to_string()));
        }
        if !addr[2..].chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressError(addr.to_string()));
        }
        Address::from_str(addr)
            .map(Self)
            .map_err(|_| AddressError(addr.to_string()))
    }

    pub fn address(&self) -> Address {
        self.0
    }

    /// EIP-55 checksum 형태 (예: 0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed)
    pub fn checksummed(&self) -> String {
        to_checksum(&self.0, None)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<Address> for EthAddress {
    fn from(addr: Address) -> Self {
        Self(addr)
    }
}

impl fmt::Display for EthAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.checksummed())
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("invalid Ethereum address: {0}")]
pub struct AddressError(pub String);

/// 금액 타입 (18 decimals 고정소수점)
///
/// raw 값(가장 작은 온체인 단위)을 그대로 들고 있고, 10진 표현은
/// 정수 나눗셈으로만 만든다. f64 변환 경로 없음.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenAmount(U256);

impl TokenAmount {
    pub fn from_raw(raw: U256) -> Self {
        Self(raw)
    }

    pub fn zero() -> Self {
        Self(U256::zero())
    }

    pub fn raw(&self) -> U256 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// raw 단위 10진 문자열에서 생성 (DB NUMERIC(78,0)::text)
    pub fn from_raw_str(raw: &str) -> Result<Self, AmountError> {
        U256::from_dec_str(raw.trim())
            .map(Self)
            .map_err(|_| AmountError::Invalid(raw.to_string()))
    }

    /// raw 단위 10진 문자열
    pub fn to_raw_string(&self) -> String {
        self.0.to_string()
    }

    /// "1.234567890000000000" 형태로 변환 (항상 소수점 18자리)
    pub fn to_decimal_string(&self) -> String {
        let (int, frac) = self.0.div_mod(scale());
        let frac = frac.to_string();
        format!("{}.{}{}", int, "0".repeat(TOKEN_DECIMALS - frac.len()), frac)
    }

    /// 10진 문자열 파싱
    ///
    /// 소수점 18자리를 초과하면 잘라내지 않고 에러
    pub fn parse_decimal(value: &str) -> Result<Self, AmountError> {
        let value = value.trim();
        let (int_part, frac_part) = match value.split_once('.') {
            Some((int, frac)) => (int, frac),
            None => (value, ""),
        };

        let is_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
        if int_part.is_empty() || !is_digits(int_part) || !is_digits(frac_part) {
            return Err(AmountError::Invalid(value.to_string()));
        }
        if frac_part.len() > TOKEN_DECIMALS {
            return Err(AmountError::TooPrecise(value.to_string()));
        }

        let int = U256::from_dec_str(int_part)
            .map_err(|_| AmountError::Overflow(value.to_string()))?;
        let frac = if frac_part.is_empty() {
            U256::zero()
        } else {
            U256::from_dec_str(frac_part).map_err(|_| AmountError::Invalid(value.to_string()))?
                * U256::exp10(TOKEN_DECIMALS - frac_part.len())
        };

        int.checked_mul(scale())
            .and_then(|v| v.checked_add(frac))
            .map(Self)
            .ok_or_else(|| AmountError::Overflow(value.to_string()))
    }
}

fn scale() -> U256 {
    U256::exp10(TOKEN_DECIMALS)
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_decimal_string())
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_decimal_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse_decimal(&s).map_err(de::Error::custom)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum AmountError {
    #[error("invalid amount: {0}")]
    Invalid(String),

    #[error("amount has more than 18 fractional digits: {0}")]
    TooPrecise(String),

    #[error("amount overflows uint256: {0}")]
    Overflow(String),
}
