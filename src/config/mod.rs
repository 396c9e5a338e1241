//! Configuration management for the courier gateway

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::delivery::QueueConfig;
use crate::telegram::{RateLimitMode, RateLimits, WebhookConfig, types};
use crate::{Error, Result};

use self::file::CourierConfigFile;

/// Default HTTP port
const DEFAULT_PORT: u16 = 18790;

/// Default inbound webhook requests per minute
const DEFAULT_INBOUND_RPM: u32 = 600;

/// Courier gateway configuration
#[derive(Debug)]
pub struct Config {
    pub telegram: TelegramConfig,

    /// Outbound Bot API ceilings
    pub rate_limits: RateLimits,

    pub delivery: QueueConfig,

    pub server: ServerConfig,
}

/// Telegram bot configuration
#[derive(Debug)]
pub struct TelegramConfig {
    /// Bot token (from `TELEGRAM_BOT_TOKEN`)
    pub bot_token: Option<SecretString>,

    /// Bot API server (from `TELEGRAM_API_BASE`)
    pub api_base: String,

    /// Public HTTPS URL Telegram posts updates to
    pub webhook_url: Option<String>,

    /// Secret echoed in `X-Telegram-Bot-Api-Secret-Token`
    pub webhook_secret: Option<String>,

    /// Update kinds to subscribe to; empty keeps Telegram's default
    pub allowed_updates: Vec<String>,

    pub max_connections: Option<u32>,

    /// Mini App opened by the /start button
    pub webapp_url: Option<String>,

    /// Drop redelivered updates by `update_id`
    pub dedup_updates: bool,

    pub rate_limit_mode: RateLimitMode,
}

/// HTTP server configuration
#[derive(Debug)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,

    /// API key for admin endpoints (from `COURIER_API_KEY` env)
    pub api_key: Option<String>,

    /// JSON recipient list used for broadcasts
    pub recipients_file: Option<PathBuf>,

    /// Inbound webhook requests allowed per minute
    pub inbound_rpm: u32,
}

impl Config {
    /// Load configuration from the environment, layered over the file named
    /// by `COURIER_CONFIG` when set
    ///
    /// # Errors
    ///
    /// Returns error if a variable holds an unparseable value
    pub fn load() -> Result<Self> {
        let file = std::env::var("COURIER_CONFIG")
            .ok()
            .map(|path| file::load_config_file(std::path::Path::new(&path)))
            .unwrap_or_default();

        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and a variable lookup
    ///
    /// # Errors
    ///
    /// Returns error if a variable holds an unparseable value
    pub fn from_sources(
        file: CourierConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let telegram = TelegramConfig {
            bot_token: var("TELEGRAM_BOT_TOKEN")
                .or(file.telegram.bot_token)
                .map(SecretString::from),
            api_base: var("TELEGRAM_API_BASE")
                .or(file.telegram.api_base)
                .unwrap_or_else(|| types::API_BASE.to_string()),
            webhook_url: var("TELEGRAM_WEBHOOK_URL").or(file.telegram.webhook_url),
            webhook_secret: var("TELEGRAM_WEBHOOK_SECRET").or(file.telegram.webhook_secret),
            allowed_updates: var("TELEGRAM_ALLOWED_UPDATES")
                .map(|s| split_list(&s))
                .or(file.telegram.allowed_updates)
                .unwrap_or_default(),
            max_connections: parse_var(&var, "TELEGRAM_MAX_CONNECTIONS")?
                .or(file.telegram.max_connections),
            webapp_url: var("TELEGRAM_WEBAPP_URL").or(file.telegram.webapp_url),
            dedup_updates: var("TELEGRAM_DEDUP_UPDATES")
                .map(|v| parse_bool(&v))
                .or(file.telegram.dedup_updates)
                .unwrap_or(true),
            rate_limit_mode: file.telegram.rate_limit_mode.unwrap_or_default(),
        };

        let defaults = QueueConfig::default();
        let delivery = file.delivery;
        let delivery = QueueConfig {
            name: var("COURIER_QUEUE")
                .or(delivery.queue)
                .unwrap_or(defaults.name),
            workers: parse_var(&var, "COURIER_WORKERS")?
                .or(delivery.workers)
                .unwrap_or(defaults.workers),
            max_pending: delivery.max_pending.unwrap_or(defaults.max_pending),
            retry: delivery.retry.unwrap_or(defaults.retry),
            message_timeout: delivery
                .message_timeout_secs
                .map_or(defaults.message_timeout, Duration::from_secs),
            media_timeout: delivery
                .media_timeout_secs
                .map_or(defaults.media_timeout, Duration::from_secs),
            broadcast_spacing: delivery
                .broadcast_spacing_ms
                .map_or(defaults.broadcast_spacing, Duration::from_millis),
            broadcast_timeout: delivery
                .broadcast_timeout_secs
                .map_or(defaults.broadcast_timeout, Duration::from_secs),
        };

        let server = ServerConfig {
            port: parse_var(&var, "COURIER_PORT")?
                .or_else(|| env("PORT").and_then(|s| s.parse().ok()))
                .or(file.server.port)
                .unwrap_or(DEFAULT_PORT),
            api_key: var("COURIER_API_KEY").or(file.server.api_key),
            recipients_file: var("COURIER_RECIPIENTS_FILE")
                .or(file.server.recipients_file)
                .map(PathBuf::from),
            inbound_rpm: parse_var(&var, "COURIER_INBOUND_RPM")?
                .or(file.server.inbound_rpm)
                .unwrap_or(DEFAULT_INBOUND_RPM),
        };

        Ok(Self {
            telegram,
            rate_limits: file.rate_limits.unwrap_or_default(),
            delivery,
            server,
        })
    }

    /// The bot token
    ///
    /// # Errors
    ///
    /// Returns `Config` if `TELEGRAM_BOT_TOKEN` is not set
    pub fn bot_token(&self) -> Result<&str> {
        self.telegram
            .bot_token
            .as_ref()
            .map(|token| token.expose_secret())
            .ok_or_else(|| Error::Config("TELEGRAM_BOT_TOKEN not set".to_string()))
    }

    /// Registration request for `setWebhook`
    ///
    /// # Errors
    ///
    /// Returns `Config` if no webhook URL is configured or it is not HTTPS
    pub fn webhook_config(&self) -> Result<WebhookConfig> {
        let url = self
            .telegram
            .webhook_url
            .as_deref()
            .ok_or_else(|| Error::Config("TELEGRAM_WEBHOOK_URL not set".to_string()))?;

        if !url.starts_with("https://") {
            return Err(Error::Config(format!(
                "webhook URL must use https: {url}"
            )));
        }

        let mut config = WebhookConfig::new(url);
        config.secret_token.clone_from(&self.telegram.webhook_secret);
        if !self.telegram.allowed_updates.is_empty() {
            config.allowed_updates = Some(self.telegram.allowed_updates.clone());
        }
        config.max_connections = self.telegram.max_connections;
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(
    var: impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    var(key)
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid value for {key}: {v}")))
        })
        .transpose()
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        load_with_file(vars, "")
    }

    fn load_with_file(vars: &[(&str, &str)], toml: &str) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_sources(file::parse(toml)?, |key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_any_source() {
        let config = load(&[]).unwrap();

        assert!(config.telegram.bot_token.is_none());
        assert_eq!(config.telegram.api_base, "https://api.telegram.org");
        assert!(config.telegram.dedup_updates);
        assert_eq!(config.server.port, 18790);
        assert_eq!(config.delivery.workers, 4);
        assert_eq!(config.delivery.retry.max_attempts, 3);
        assert_eq!(config.rate_limits, RateLimits::default());
        assert!(config.bot_token().is_err());
    }

    #[test]
    fn environment_overrides_file() {
        let config = load_with_file(
            &[("COURIER_PORT", "9100"), ("TELEGRAM_DEDUP_UPDATES", "false")],
            "[server]\nport = 9000\napi_key = \"from-file\"",
        )
        .unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.api_key.as_deref(), Some("from-file"));
        assert!(!config.telegram.dedup_updates);
    }

    #[test]
    fn invalid_number_is_an_error() {
        let err = load(&[("COURIER_WORKERS", "many")]).unwrap_err();
        assert!(err.to_string().contains("COURIER_WORKERS"));
    }

    #[test]
    fn allowed_updates_split_on_commas() {
        let config = load(&[("TELEGRAM_ALLOWED_UPDATES", "message, callback_query,,")]).unwrap();
        assert_eq!(config.telegram.allowed_updates, ["message", "callback_query"]);
    }

    #[test]
    fn webhook_config_carries_secret_and_filters() {
        let config = load(&[
            ("TELEGRAM_WEBHOOK_URL", "https://bot.example.com/api/webhooks/telegram"),
            ("TELEGRAM_WEBHOOK_SECRET", "s3cret"),
            ("TELEGRAM_ALLOWED_UPDATES", "message"),
            ("TELEGRAM_MAX_CONNECTIONS", "40"),
        ])
        .unwrap();

        let webhook = config.webhook_config().unwrap();
        assert_eq!(webhook.secret_token.as_deref(), Some("s3cret"));
        assert_eq!(webhook.allowed_updates, Some(vec!["message".to_string()]));
        assert_eq!(webhook.max_connections, Some(40));
    }

    #[test]
    fn webhook_url_must_be_https() {
        let config = load(&[("TELEGRAM_WEBHOOK_URL", "http://bot.example.com/hook")]).unwrap();
        assert!(matches!(config.webhook_config(), Err(Error::Config(_))));

        let config = load(&[]).unwrap();
        assert!(matches!(config.webhook_config(), Err(Error::Config(_))));
    }

    #[test]
    fn token_is_hidden_from_debug() {
        let config = load(&[("TELEGRAM_BOT_TOKEN", "123:secret-token")]).unwrap();
        assert_eq!(config.bot_token().unwrap(), "123:secret-token");
        assert!(!format!("{config:?}").contains("secret-token"));
    }
}
