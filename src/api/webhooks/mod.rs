//! Webhook endpoints

use std::sync::Arc;

use axum::{Router, middleware, routing::post};

use super::{ApiState, rate_limit::rate_limit_middleware};

pub mod telegram;

/// Build webhooks router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/telegram", post(telegram::handle_update))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit_middleware,
        ))
        .with_state(state)
}
