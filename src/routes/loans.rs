//! Loan Query Endpoints
//!
//! 저장소의 materialized view를 그대로 반환한다 (읽기 전용).
//! ingestion과 독립적으로 동작하며, 저장소 장애 시 부분 응답 없이 500.

use axum::{
    extract::{Path, State},
    Json,
};

use tracing::debug;

use crate::{db::LoanRecord, error::ApiError, types::EthAddress, AppState};

/// GET /loans
///
/// 전체 대출 목록 (`lastSeenBlock` 내림차순)
///
/// # Response
///
/// ```json
/// [
///   {
///     "id": "3f0c…",
///     "contractAddress": "0x5FbDB2315678afecb367f032d93F642f64180aa3",
///     "borrower": "0x…",
///     "collateralToken": "0x…",
///     "loanToken": "0x…",
///     "collateralAmount": "1.234567890000000000",
///     "loanAmount": "0.500000000000000000",
///     "interestRate": 5,
///     "dueDate": "2023-11-14T22:13:20Z",
///     "liquidated": false,
///     "status": "active",
///     "lastSeenBlock": 105
///   }
/// ]
/// ```
pub async fn list_loans(State(state): State<AppState>) -> Result<Json<Vec<LoanRecord>>, ApiError> {
    let loans = state.store.list_all().await?;
    Ok(Json(loans))
}

/// GET /loans/borrower/:address
///
/// 해당 borrower의 대출 목록. 없으면 빈 배열 (200)
///
/// 주소 형식이 잘못된 경우도 일치하는 borrower가 없으므로 빈 배열
pub async fn list_loans_by_borrower(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<Vec<LoanRecord>>, ApiError> {
    let borrower = match EthAddress::parse(&address) {
        Ok(borrower) => borrower,
        Err(e) => {
            debug!(%address, error = %e, "Malformed borrower address");
            return Ok(Json(Vec::new()));
        }
    };

    let loans = state.store.list_by_borrower(&borrower.checksummed()).await?;
    Ok(Json(loans))
}
