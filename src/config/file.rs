//! TOML configuration file loading
//!
//! The file named by `COURIER_CONFIG` is a partial overlay: every field is
//! optional and environment variables take precedence over it.

use std::path::Path;

use serde::Deserialize;

use crate::Result;
use crate::telegram::retry::RetryPolicy;
use crate::telegram::{RateLimitMode, RateLimits};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CourierConfigFile {
    #[serde(default)]
    pub telegram: TelegramFileConfig,

    /// Outbound rate-limit windows
    #[serde(default)]
    pub rate_limits: Option<RateLimits>,

    #[serde(default)]
    pub delivery: DeliveryFileConfig,

    #[serde(default)]
    pub server: ServerFileConfig,
}

/// Telegram bot configuration
#[derive(Debug, Default, Deserialize)]
pub struct TelegramFileConfig {
    pub bot_token: Option<String>,
    pub api_base: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub allowed_updates: Option<Vec<String>>,
    pub max_connections: Option<u32>,
    /// Mini App opened by the /start button
    pub webapp_url: Option<String>,
    pub dedup_updates: Option<bool>,
    pub rate_limit_mode: Option<RateLimitMode>,
}

/// Delivery queue configuration
#[derive(Debug, Default, Deserialize)]
pub struct DeliveryFileConfig {
    pub queue: Option<String>,
    pub workers: Option<usize>,
    pub max_pending: Option<usize>,
    pub retry: Option<RetryPolicy>,
    pub message_timeout_secs: Option<u64>,
    pub media_timeout_secs: Option<u64>,
    pub broadcast_spacing_ms: Option<u64>,
    pub broadcast_timeout_secs: Option<u64>,
}

/// HTTP server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub port: Option<u16>,
    pub api_key: Option<String>,
    pub recipients_file: Option<String>,
    /// Inbound webhook requests allowed per minute
    pub inbound_rpm: Option<u32>,
}

/// Parse a configuration document
///
/// # Errors
///
/// Returns `Toml` if the document is invalid
pub fn parse(content: &str) -> Result<CourierConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load the config file at `path`
///
/// Returns `CourierConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: &Path) -> CourierConfigFile {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return CourierConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match parse(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                CourierConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            CourierConfigFile::default()
        }
    }
}
