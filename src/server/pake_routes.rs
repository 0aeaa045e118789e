//! PAKE handshake endpoints.
//!
//! `/pake/init` exchanges public messages and parks the derived key until
//! the peer proves it via `/pake/verify`; success binds the key to the
//! download token so that path starts encrypting. Failures count against
//! the client address.

use crate::common::AppError;
use crate::crypto::keys::EncryptionKey;
use crate::crypto::pake::{self, Pake, PakeRole};
use crate::server::state::{AppState, PakeSession, PAKE_EXPIRY};
use crate::utils::net;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::Json;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Deserialize)]
pub struct PakeInitRequest {
    /// Base64 of the peer's public message
    pub message: String,
}

#[derive(Serialize)]
pub struct PakeInitResponse {
    pub message: String,
}

#[derive(Deserialize)]
pub struct PakeVerifyRequest {
    /// Base64 HMAC over our public message
    pub confirmation: String,
}

#[derive(Serialize)]
pub struct PakeVerifyResponse {
    pub confirmation: String,
    pub token: String,
}

pub async fn pake_init(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<PakeInitRequest>,
) -> Result<Json<PakeInitResponse>, AppError> {
    let password = state
        .config
        .password
        .as_ref()
        .ok_or_else(|| AppError::BadRequest("no password is configured".into()))?;

    let ip = net::client_ip(&headers, peer);
    if state.pake.too_many_failures(&ip) {
        state.metrics.incr("pake_rejected_total");
        return Err(AppError::TooManyRequests(
            "too many failed attempts from this address".into(),
        ));
    }

    let client_message = base64::engine::general_purpose::STANDARD
        .decode(&request.message)
        .map_err(|_| AppError::BadRequest("message is not valid base64".into()))?;

    let mut server = Pake::new(password, PakeRole::Responder);
    let key = server.update(&client_message).map_err(|e| {
        state.pake.record_failure(&ip);
        AppError::BadRequest(format!("invalid handshake message: {}", e))
    })?;
    let server_message = server.public_message().to_vec();

    state.pake.sessions.insert(
        ip,
        PakeSession {
            key,
            client_message,
            server_message: server_message.clone(),
            expires_at: Instant::now() + PAKE_EXPIRY,
        },
    );
    state.metrics.incr("pake_init_total");

    Ok(Json(PakeInitResponse {
        message: base64::engine::general_purpose::STANDARD.encode(server_message),
    }))
}

pub async fn pake_verify(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<PakeVerifyRequest>,
) -> Result<Json<PakeVerifyResponse>, AppError> {
    let ip = net::client_ip(&headers, peer);

    let (_, session) = state
        .pake
        .sessions
        .remove(&ip)
        .ok_or_else(|| AppError::Gone("no pending handshake for this address".into()))?;

    if session.is_expired() {
        return Err(AppError::Gone("handshake expired".into()));
    }

    let candidate = base64::engine::general_purpose::STANDARD
        .decode(&request.confirmation)
        .map_err(|_| AppError::BadRequest("confirmation is not valid base64".into()))?;

    if !pake::verify_confirmation(&session.key, &session.server_message, &candidate) {
        state.pake.record_failure(&ip);
        state.metrics.incr("pake_failed_total");
        return Err(AppError::Unauthorized("key confirmation mismatch".into()));
    }

    // Proven: arm the download path with the agreed key
    state.bind_key(EncryptionKey::from_bytes(session.key));
    state.metrics.incr("pake_verified_total");
    tracing::info!(peer = %ip, "pake handshake verified");

    let confirmation = pake::confirmation(&session.key, &session.client_message);
    Ok(Json(PakeVerifyResponse {
        confirmation: base64::engine::general_purpose::STANDARD.encode(confirmation),
        token: state.token.as_str().to_string(),
    }))
}
