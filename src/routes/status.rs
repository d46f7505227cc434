//! Ingestion Status Endpoint

use axum::{extract::State, Json};
use serde::Serialize;

use crate::{db::IngestionCursor, error::ApiError, services::IngestionState, AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// 인덱싱 대상 컨트랙트 (없으면 조회 전용 모드)
    pub contract_address: Option<String>,
    pub cursor: Option<IngestionCursor>,
    pub ingestion: IngestionState,
}

/// GET /status
///
/// ```json
/// {
///   "contractAddress": "0x5FbDB2315678afecb367f032d93F642f64180aa3",
///   "cursor": { "contractAddress": "0x…", "height": 103, "blockHash": "0x…" },
///   "ingestion": { "state": "running" }
/// }
/// ```
pub async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let cursor = match &state.contract {
        Some(contract) => state.store.cursor(contract).await?,
        None => None,
    };

    Ok(Json(StatusResponse {
        contract_address: state.contract.clone(),
        cursor,
        ingestion: state.control.state(),
    }))
}
