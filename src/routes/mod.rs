//! API Routes Module
//!
//! 모든 HTTP 엔드포인트 정의
//!
//! # Routes
//! - `/health` - 헬스 체크
//! - `/status` - ingestion 커서/상태
//! - `/loans`, `/loans/borrower/:address` - 대출 조회
//! - `/api/loans/*` - 대시보드가 사용하는 동일 경로

pub mod health;
pub mod loans;
pub mod status;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// 라우터 생성
///
/// # Route Structure
///
/// ```text
/// GET  /health                        - 서버 상태 확인
/// GET  /status                        - 커서 높이, ingestion 상태
///
/// GET  /loans                         - 전체 대출
/// GET  /loans/borrower/:address       - borrower별 대출
/// GET  /api/loans                     - (동일)
/// GET  /api/loans/borrower/:address   - (동일)
/// ```
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(state.config.is_production());

    Router::new()
        .route("/health", get(health::health_check))
        .route("/status", get(status::get_status))
        .route("/loans", get(loans::list_loans))
        .route("/loans/borrower/:address", get(loans::list_loans_by_borrower))
        .route("/api/loans", get(loans::list_loans))
        .route("/api/loans/borrower/:address", get(loans::list_loans_by_borrower))
        // 미들웨어
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        // 상태 주입
        .with_state(state)
}

/// CORS 설정
///
/// 프로덕션에서는 `ALLOWED_ORIGINS`에 나열된 도메인만, 개발 환경에서는 localhost 허용
fn cors_layer(production: bool) -> CorsLayer {
    if production {
        let allowed_origins = std::env::var("ALLOWED_ORIGINS").unwrap_or_default();
        let origins: Vec<_> = allowed_origins
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([axum::http::Method::GET])
            .allow_headers([axum::http::header::CONTENT_TYPE])
    } else {
        let origins: Vec<_> = ["http://localhost:5173", "http://localhost:3000", "http://127.0.0.1:5173"]
            .into_iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
