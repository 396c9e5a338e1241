//! Error types for the courier gateway

use std::time::Duration;

use thiserror::Error;

/// Result type alias for courier operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the courier gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Local throttling refused the call
    #[error("rate limited locally, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Telegram flood control (HTTP 429 with `retry_after`)
    #[error("flood control for chat {chat_id:?}, retry after {retry_after:?}")]
    FloodControl {
        chat_id: Option<i64>,
        retry_after: Duration,
    },

    /// Network-level failure: timeout, connection reset, unreadable response
    #[error("transport error: {0}")]
    Transport(String),

    /// Telegram rejected the call (chat not found, bot blocked, bad request)
    #[error("telegram api error {code}: {description}")]
    Api { code: i64, description: String },

    /// Webhook secret token missing or wrong
    #[error("unauthorized webhook request")]
    Unauthorized,

    /// Webhook body could not be decoded into an update
    #[error("malformed update: {0}")]
    MalformedUpdate(String),

    /// Delivery queue refused a job
    #[error("queue error: {0}")]
    Queue(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether waiting and trying again can resolve this failure
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::FloodControl { .. } | Self::Transport(_)
        )
    }

    /// Wait mandated by the failure itself, if any
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } | Self::FloodControl { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        // Request URLs embed the bot token
        Self::Transport(e.without_url().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_and_transport_are_retryable() {
        assert!(Error::RateLimited { retry_after: Duration::from_secs(1) }.is_retryable());
        assert!(
            Error::FloodControl {
                chat_id: Some(1),
                retry_after: Duration::from_secs(5)
            }
            .is_retryable()
        );
        assert!(Error::Transport("reset".into()).is_retryable());
    }

    #[test]
    fn semantic_failures_are_not_retryable() {
        let api = Error::Api {
            code: 403,
            description: "Forbidden: bot was blocked by the user".into(),
        };
        assert!(!api.is_retryable());
        assert!(!Error::Unauthorized.is_retryable());
        assert!(!Error::MalformedUpdate("eof".into()).is_retryable());
    }

    #[test]
    fn retry_after_only_for_throttling() {
        let flood = Error::FloodControl {
            chat_id: None,
            retry_after: Duration::from_secs(7),
        };
        assert_eq!(flood.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(Error::Transport("x".into()).retry_after(), None);
    }
}
