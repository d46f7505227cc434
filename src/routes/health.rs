//! Health Check Endpoint
//!
//! 저장소 연결 + ingestion 상태를 함께 보고한다.
//! ingestion이 중단되어도 조회는 가능하므로 HTTP 상태는 항상 200이고,
//! `status` 필드로 구분한다.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::{services::IngestionState, AppState};

/// Health check 응답
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: DatabaseStatus,
    pub ingestion: IngestionState,
    pub timestamp: String,
}

#[derive(Serialize)]
pub struct DatabaseStatus {
    pub connected: bool,
    pub latency_ms: Option<u64>,
}

/// GET /health
///
/// 서버 및 의존성 상태 확인
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_start = std::time::Instant::now();
    let db_status = match state.store.health_check().await {
        Ok(_) => DatabaseStatus {
            connected: true,
            latency_ms: Some(db_start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Store health check failed");
            DatabaseStatus {
                connected: false,
                latency_ms: None,
            }
        }
    };

    let ingestion = state.control.state();
    let status = match (&ingestion, db_status.connected) {
        (IngestionState::Running, true) => "healthy",
        _ => "degraded",
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: db_status,
        ingestion,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
