//! Router wiring for the serving process.

use crate::server::state::AppState;
use crate::server::{download, pake_routes, upload, ws};
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{extract::State, Router};
use tower_http::cors::CorsLayer;

pub fn create_router(state: &AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/d/encrypt-info", get(download::encrypt_info))
        .route("/d/:token", get(download::download_handler))
        .route(
            "/u/:token",
            get(upload::upload_page).post(upload::upload_handler),
        )
        .route("/u/:token/manifest", get(upload::manifest_handler))
        .route("/pake/init", post(pake_routes::pake_init))
        .route("/pake/verify", post(pake_routes::pake_verify))
        .route("/ws/progress", get(ws::progress_ws))
        // Uploads are capped per shape by the handlers, not globally
        .layer(DefaultBodyLimit::max(
            (upload::MAX_UPLOAD_BYTES + 1024) as usize,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state.clone())
}

async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}
