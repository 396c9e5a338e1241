//! Telegram webhook handler
//!
//! Telegram retries any non-2xx answer, so everything except an
//! authentication failure is acknowledged with 200. Decode and handler
//! failures are logged instead.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use serde::Serialize;

use crate::Error;
use crate::api::ApiState;
use crate::telegram::Dispatch;

/// Telegram webhook response
#[derive(Serialize)]
pub struct WebhookResponse {
    pub ok: bool,
}

/// Handle an incoming Telegram update
///
/// The body is taken raw so the secret token is checked before any decoding.
pub async fn handle_update(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<WebhookResponse>) {
    match state.dispatcher.handle(&body, &headers).await {
        Ok(Dispatch::Routed { update_id, kind }) => {
            tracing::debug!(update_id, kind = %kind, "Telegram update handled");
        }
        Ok(Dispatch::Duplicate { .. }) => {}
        Err(Error::Unauthorized) => {
            return (StatusCode::UNAUTHORIZED, Json(WebhookResponse { ok: false }));
        }
        Err(Error::MalformedUpdate(reason)) => {
            tracing::warn!(bytes = body.len(), error = %reason, "malformed Telegram update");
        }
        Err(e) => {
            tracing::error!(error = %e, "Telegram update handler failed");
        }
    }

    (StatusCode::OK, Json(WebhookResponse { ok: true }))
}
