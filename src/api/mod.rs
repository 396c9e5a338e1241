//! HTTP API server for the courier gateway

pub mod admin;
mod auth;
pub mod health;
pub mod rate_limit;
pub mod webhooks;

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::delivery::{DeliveryQueue, RecipientDirectory};
use crate::telegram::WebhookDispatcher;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<WebhookDispatcher>,
    pub queue: Arc<DeliveryQueue>,
    /// Recipients for admin broadcasts; broadcasts are refused without one
    pub directory: Option<Arc<dyn RecipientDirectory>>,
    pub api_key: Option<String>,
    /// Inbound webhook limiter
    pub rate_limiter: Option<rate_limit::SharedLimiter>,
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    dispatcher: Arc<WebhookDispatcher>,
    queue: Arc<DeliveryQueue>,
    directory: Option<Arc<dyn RecipientDirectory>>,
    api_key: Option<String>,
    inbound_rpm: Option<u32>,
    port: u16,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub fn new(dispatcher: Arc<WebhookDispatcher>, queue: Arc<DeliveryQueue>) -> Self {
        Self {
            dispatcher,
            queue,
            directory: None,
            api_key: None,
            inbound_rpm: None,
            port: 18790,
        }
    }

    #[must_use]
    pub fn directory(mut self, directory: Option<Arc<dyn RecipientDirectory>>) -> Self {
        self.directory = directory;
        self
    }

    #[must_use]
    pub fn api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    /// Cap inbound webhook requests per minute
    #[must_use]
    pub const fn inbound_rpm(mut self, rpm: u32) -> Self {
        self.inbound_rpm = Some(rpm);
        self
    }

    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        let state = Arc::new(ApiState {
            dispatcher: self.dispatcher,
            queue: self.queue,
            directory: self.directory,
            api_key: self.api_key,
            rate_limiter: self.inbound_rpm.map(rate_limit::create_limiter),
        });

        ApiServer {
            state,
            port: self.port,
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .nest("/api/admin", admin::router(Arc::clone(&self.state)))
            .nest("/api/webhooks", webhooks::router(Arc::clone(&self.state)))
            .merge(health::router())
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        if self.state.api_key.is_none() {
            tracing::warn!("COURIER_API_KEY not set - admin endpoints are unauthenticated");
        }

        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }
}
