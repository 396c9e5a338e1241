//! Telegram Bot API integration
//!
//! [`BotApi`] wraps the Bot API methods the gateway uses and consults a
//! [`RateLimiter`] before each call. Inbound updates are authenticated and
//! routed by [`WebhookDispatcher`].

mod api;
pub mod dedup;
pub mod rate_limiter;
pub mod retry;
pub mod types;
pub mod update;
pub mod webhook;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use secrecy::SecretString;
use serde::Deserialize;

pub use dedup::UpdateDedup;
pub use rate_limiter::{RateLimiter, RateLimits, SlidingWindowLimiter, Window};
pub use retry::{RetryDecision, RetryPolicy};
pub use types::{
    InlineKeyboardButton, InlineKeyboardMarkup, InputFile, Message, ParseMode, SendMessage,
    SendPhoto, User, WebhookConfig, WebhookInfo,
};
pub use update::{Update, UpdateKind};
pub use webhook::{Dispatch, UpdateHandler, WebhookDispatcher};

/// How the client behaves when the rate limiter refuses a call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitMode {
    /// Sleep until headroom exists
    #[default]
    Block,
    /// Fail immediately with `RateLimited`
    Reject,
}

/// Per-call request timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiTimeouts {
    /// Text messages and JSON-only methods
    pub message: Duration,
    /// Photo sends, including multipart uploads
    pub media: Duration,
}

impl Default for ApiTimeouts {
    fn default() -> Self {
        Self {
            message: Duration::from_secs(30),
            media: Duration::from_secs(60),
        }
    }
}

/// Rate-limited Telegram Bot API client
#[derive(Clone)]
pub struct BotApi {
    token: Arc<SecretString>,
    base_url: String,
    client: Client,
    limiter: Arc<dyn RateLimiter>,
    mode: RateLimitMode,
    timeouts: ApiTimeouts,
}

impl std::fmt::Debug for BotApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotApi")
            .field("base_url", &self.base_url)
            .field("mode", &self.mode)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl BotApi {
    /// Create a client for `token` against the public Bot API
    #[must_use]
    pub fn new(token: impl Into<String>, limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            token: Arc::new(SecretString::from(token.into())),
            base_url: types::API_BASE.to_string(),
            client: Client::new(),
            limiter,
            mode: RateLimitMode::default(),
            timeouts: ApiTimeouts::default(),
        }
    }

    /// Point the client at another Bot API server (local server, test double)
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: RateLimitMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: ApiTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// The limiter this client consults
    #[must_use]
    pub fn limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.limiter
    }

    #[must_use]
    pub const fn timeouts(&self) -> ApiTimeouts {
        self.timeouts
    }
}
