//! Admin API endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    routing::{get, post},
};
use serde::Serialize;
use uuid::Uuid;

use super::{ApiState, auth::require_api_key};
use crate::delivery::{BroadcastRequest, DeliveryStats};

// --- Request/Response types ---

#[derive(Serialize)]
pub struct BroadcastAccepted {
    pub id: Uuid,
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

fn error_response(code: &str, message: &str) -> Json<ErrorResponse> {
    Json(ErrorResponse {
        error: ErrorDetail {
            code: code.to_string(),
            message: message.to_string(),
        },
    })
}

// --- Handlers ---

/// Delivery queue counters
async fn stats(State(state): State<Arc<ApiState>>) -> Json<DeliveryStats> {
    Json(state.queue.stats())
}

/// Start a broadcast in the background
async fn broadcast(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<BroadcastRequest>,
) -> Result<(StatusCode, Json<BroadcastAccepted>), (StatusCode, Json<ErrorResponse>)> {
    if req.text.trim().is_empty() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            error_response("empty_text", "broadcast text must not be empty"),
        ));
    }

    let Some(directory) = state.directory.clone() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            error_response("no_directory", "no recipient directory configured"),
        ));
    };

    let id = Uuid::new_v4();
    let queue = Arc::clone(&state.queue);

    tokio::spawn(async move {
        match queue.broadcast(directory.as_ref(), &req).await {
            Ok(summary) => tracing::info!(
                broadcast_id = %id,
                total = summary.total,
                sent = summary.sent,
                failed = summary.failed,
                pending = summary.pending,
                "admin broadcast complete"
            ),
            Err(e) => tracing::error!(broadcast_id = %id, error = %e, "admin broadcast failed"),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(BroadcastAccepted {
            id,
            status: "accepted",
        }),
    ))
}

// --- Router ---

/// Build admin router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/stats", get(stats))
        .route("/broadcast", post(broadcast))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_api_key,
        ))
        .with_state(state)
}
