//! Daemon - the main gateway service
//!
//! Wires the Bot API client, delivery workers, webhook dispatcher and HTTP
//! server together and runs them until Ctrl-C.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::api::ApiServerBuilder;
use crate::bot::CourierBot;
use crate::delivery::{DeliveryQueue, MessageSender, RecipientDirectory, StaticDirectory};
use crate::telegram::{ApiTimeouts, BotApi, SlidingWindowLimiter, WebhookDispatcher};
use crate::{Config, Result};

/// Build a Bot API client from configuration
///
/// # Errors
///
/// Returns error if no bot token is configured
pub fn bot_api(config: &Config) -> Result<BotApi> {
    let limiter = Arc::new(SlidingWindowLimiter::new(config.rate_limits.clone()));

    let timeouts = ApiTimeouts {
        message: config.delivery.message_timeout,
        media: config.delivery.media_timeout,
    };

    Ok(BotApi::new(config.bot_token()?, limiter)
        .with_base_url(&config.telegram.api_base)
        .with_mode(config.telegram.rate_limit_mode)
        .with_timeouts(timeouts))
}

/// The courier daemon
pub struct Daemon {
    config: Config,
}

impl Daemon {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns error if the token is rejected, the recipient file is
    /// unreadable, or the HTTP server fails
    pub async fn run(self) -> Result<()> {
        let api = Arc::new(bot_api(&self.config)?);

        let me = api.get_me().await?;
        tracing::info!(
            bot_id = me.id,
            username = ?me.username,
            "connected to Telegram"
        );

        let queue = Arc::new(DeliveryQueue::new(self.config.delivery.clone()));
        let workers = queue.start(Arc::clone(&api) as Arc<dyn MessageSender>);

        let handler = Arc::new(CourierBot::new(
            Arc::clone(&queue),
            self.config.telegram.webapp_url.clone(),
        ));
        let dispatcher = Arc::new(
            WebhookDispatcher::new(handler)
                .with_secret(self.config.telegram.webhook_secret.clone())
                .with_dedup(self.config.telegram.dedup_updates),
        );

        let directory = self
            .config
            .server
            .recipients_file
            .as_deref()
            .map(StaticDirectory::from_file)
            .transpose()?
            .map(|d| Arc::new(d) as Arc<dyn RecipientDirectory>);

        if self.config.telegram.webhook_url.is_some() {
            match self.config.webhook_config() {
                Ok(webhook) => {
                    if let Err(e) = api.set_webhook(&webhook).await {
                        tracing::error!(error = %e, "failed to register Telegram webhook");
                    }
                }
                Err(e) => tracing::error!(error = %e, "invalid webhook configuration"),
            }
        } else {
            tracing::info!("TELEGRAM_WEBHOOK_URL not set - leaving webhook registration unchanged");
        }

        // Set up shutdown signal
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                let _ = shutdown_tx.send(()).await;
            }
        });

        let server = ApiServerBuilder::new(dispatcher, Arc::clone(&queue))
            .directory(directory)
            .api_key(self.config.server.api_key.clone())
            .inbound_rpm(self.config.server.inbound_rpm)
            .port(self.config.server.port)
            .build();

        let result = server
            .run(async move {
                shutdown_rx.recv().await;
            })
            .await;

        workers.shutdown().await;

        let stats = queue.stats();
        tracing::info!(
            pending = stats.pending,
            sent = stats.sent,
            failed = stats.failed,
            "daemon stopped"
        );
        result
    }
}
