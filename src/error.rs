//! Error Handling Module
//!
//! Two layers of errors:
//! - [`IndexerError`] / [`DecodeError`]: ingestion pipeline (source, decoder, store, backfill)
//! - [`ApiError`]: HTTP layer, mapped to status codes via `IntoResponse`
//!
//! 전파 정책:
//! - Transport: 재시도 (backoff), 단독으로는 치명적이지 않음
//! - Decode: 로그 후 해당 이벤트 drop, 파이프라인은 계속
//! - ConsistencyViolation: 알림 + ingestion 일시정지, 조회는 계속 서비스
//! - Store: 조회 경로에서는 ServiceUnavailable (HTTP 500)

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ethers::providers::ProviderError;
use ethers::types::Address;
use serde::Serialize;
use thiserror::Error;

/// Ingestion 파이프라인 에러
#[derive(Debug, Error)]
pub enum IndexerError {
    /// 노드 연결 끊김, RPC 타임아웃 등
    #[error("transport error: {0}")]
    Transport(String),

    /// 온체인 데이터 형태가 예상과 다름
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// 커서/블록 높이가 confirmation window 밖으로 역행
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl IndexerError {
    /// 재시도로 회복 가능한 에러인지
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexerError::Transport(_) | IndexerError::Store(_))
    }
}

impl From<ProviderError> for IndexerError {
    fn from(err: ProviderError) -> Self {
        IndexerError::Transport(err.to_string())
    }
}

impl From<sqlx::Error> for IndexerError {
    fn from(err: sqlx::Error) -> Self {
        IndexerError::Store(err.to_string())
    }
}

/// 이벤트/컨트랙트 읽기 결과 디코딩 실패
///
/// 자동 재시도하지 않음 (컨트랙트 버전 불일치 가능성)
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    #[error("unsupported token {token:?} for borrower {borrower:?}")]
    UnsupportedToken { borrower: Address, token: Address },

    #[error("interest rate {0} does not fit in u32")]
    InterestRateOverflow(String),

    #[error("due date {0} is not a valid unix timestamp")]
    DueDateOutOfRange(String),

    #[error("malformed log: {0}")]
    MalformedLog(String),

    #[error("unexpected contract response: {0}")]
    UnexpectedShape(String),
}

/// API 에러 타입
///
/// 민감한 내부 정보는 클라이언트에 노출하지 않음
#[derive(Debug, Error)]
pub enum ApiError {
    // ============ 500 Internal Server Error ============
    /// 저장소에 접근 불가 (부분 응답 없이 실패)
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error")]
    InternalError,
}

/// API 에러 응답 구조
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            // 내부 에러는 클라이언트에 상세 정보 노출 안 함
            ApiError::ServiceUnavailable(_) => {
                tracing::error!("Store unavailable: {:?}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "SERVICE_UNAVAILABLE",
                    "Failed to fetch loans".to_string(),
                    None,
                )
            }
            ApiError::InternalError => {
                tracing::error!("Internal error: {:?}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
        };

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

impl From<IndexerError> for ApiError {
    fn from(err: IndexerError) -> Self {
        match err {
            IndexerError::Store(msg) => ApiError::ServiceUnavailable(msg),
            other => {
                tracing::error!("Unexpected indexer error on query path: {:?}", other);
                ApiError::InternalError
            }
        }
    }
}
