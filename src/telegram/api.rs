//! Raw Telegram Bot API calls

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use secrecy::ExposeSecret;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::retry::is_recoverable_status;
use super::types::{
    ApiResponse, DeleteWebhookRequest, InputFile, Message, SendMessage, SendPhoto,
    SendPhotoRequest, User, WebhookConfig, WebhookInfo,
};
use super::{BotApi, RateLimitMode};
use crate::{Error, Result};

impl BotApi {
    /// Send a text message
    ///
    /// # Errors
    ///
    /// Returns `FloodControl`, `RateLimited`, `Transport` or `Api` on failure
    pub async fn send_message(&self, request: &SendMessage) -> Result<Message> {
        let message: Message = self
            .call(
                "sendMessage",
                Some(request.chat_id),
                request,
                self.timeouts.message,
            )
            .await?;

        tracing::debug!(
            chat_id = request.chat_id,
            message_id = message.message_id,
            "Telegram message sent"
        );
        Ok(message)
    }

    /// Send a photo by URL, `file_id`, or multipart upload
    ///
    /// # Errors
    ///
    /// Returns `FloodControl`, `RateLimited`, `Transport` or `Api` on failure
    pub async fn send_photo(&self, request: &SendPhoto) -> Result<Message> {
        let chat_id = request.chat_id;

        let message: Message = match &request.photo {
            InputFile::Url(photo) | InputFile::FileId(photo) => {
                let body = SendPhotoRequest {
                    chat_id,
                    photo,
                    caption: request.caption.as_deref(),
                    parse_mode: request.parse_mode,
                    disable_notification: request.disable_notification,
                    reply_markup: request.reply_markup.as_ref(),
                };
                self.call("sendPhoto", Some(chat_id), &body, self.timeouts.media)
                    .await?
            }
            InputFile::Upload { file_name, bytes } => {
                let form = photo_form(request, file_name, bytes)?;
                self.admit(Some(chat_id)).await?;
                let response = self
                    .client
                    .post(self.endpoint("sendPhoto"))
                    .timeout(self.timeouts.media)
                    .multipart(form)
                    .send()
                    .await
                    .map_err(|e| transport("sendPhoto", e))?;
                self.read_envelope("sendPhoto", Some(chat_id), response)
                    .await?
            }
        };

        tracing::debug!(chat_id, message_id = message.message_id, "Telegram photo sent");
        Ok(message)
    }

    /// Fetch the bot's own user record (validates the token)
    ///
    /// # Errors
    ///
    /// Returns `Api` with code 401 if the token is invalid
    pub async fn get_me(&self) -> Result<User> {
        self.call("getMe", None, &serde_json::Map::new(), self.timeouts.message)
            .await
    }

    /// Register the webhook URL Telegram delivers updates to
    ///
    /// # Errors
    ///
    /// Returns error if the API request fails
    pub async fn set_webhook(&self, config: &WebhookConfig) -> Result<bool> {
        let done: bool = self
            .call("setWebhook", None, config, self.timeouts.message)
            .await?;

        tracing::info!(
            url = %config.url,
            max_connections = ?config.max_connections,
            allowed_updates = ?config.allowed_updates,
            "Telegram webhook set"
        );
        Ok(done)
    }

    /// Remove the webhook, optionally discarding updates Telegram still holds
    ///
    /// # Errors
    ///
    /// Returns error if the API request fails
    pub async fn delete_webhook(&self, drop_pending_updates: bool) -> Result<bool> {
        let request = DeleteWebhookRequest {
            drop_pending_updates,
        };
        let done: bool = self
            .call("deleteWebhook", None, &request, self.timeouts.message)
            .await?;

        tracing::info!(drop_pending_updates, "Telegram webhook deleted");
        Ok(done)
    }

    /// Current webhook status as Telegram sees it
    ///
    /// # Errors
    ///
    /// Returns error if the API request fails
    pub async fn get_webhook_info(&self) -> Result<WebhookInfo> {
        self.call(
            "getWebhookInfo",
            None,
            &serde_json::Map::new(),
            self.timeouts.message,
        )
        .await
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.base_url, self.token.expose_secret())
    }

    /// Obtain rate-limit permission for the global scope and, if given, the chat
    async fn admit(&self, chat_id: Option<i64>) -> Result<()> {
        match self.mode {
            RateLimitMode::Block => self.limiter.acquire(chat_id).await,
            RateLimitMode::Reject => self.limiter.try_acquire(chat_id),
        }
    }

    async fn call<B, T>(
        &self,
        method: &'static str,
        chat_id: Option<i64>,
        body: &B,
        timeout: Duration,
    ) -> Result<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned + Send,
    {
        self.admit(chat_id).await?;

        let response = self
            .client
            .post(self.endpoint(method))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| transport(method, e))?;

        self.read_envelope(method, chat_id, response).await
    }

    async fn read_envelope<T: DeserializeOwned>(
        &self,
        method: &'static str,
        chat_id: Option<i64>,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| transport(method, e))?;

        match serde_json::from_str::<ApiResponse<T>>(&body) {
            Ok(envelope) => self.interpret(method, chat_id, envelope),
            // Proxies answer outages with HTML bodies
            Err(_) if is_recoverable_status(status) => Err(Error::Transport(format!(
                "{method}: HTTP {status} without API envelope"
            ))),
            Err(e) => Err(Error::Api {
                code: i64::from(status),
                description: format!("{method}: undecodable response: {e}"),
            }),
        }
    }

    /// Map a decoded envelope to the result or a typed failure
    fn interpret<T>(
        &self,
        method: &'static str,
        chat_id: Option<i64>,
        envelope: ApiResponse<T>,
    ) -> Result<T> {
        if envelope.ok {
            return envelope.result.ok_or_else(|| Error::Api {
                code: 0,
                description: format!("{method}: ok response without result"),
            });
        }

        let code = envelope.error_code.unwrap_or_default();
        let mut description = envelope.description.unwrap_or_default();
        let parameters = envelope.parameters.unwrap_or_default();

        if let Some(secs) = parameters.retry_after {
            let retry_after = Duration::from_secs(secs);
            if let Some(chat) = chat_id {
                self.limiter.backoff(chat, retry_after);
            }
            tracing::warn!(method, ?chat_id, retry_after_secs = secs, "Telegram flood control");
            return Err(Error::FloodControl {
                chat_id,
                retry_after,
            });
        }

        if code >= 500 {
            return Err(Error::Transport(format!("{method}: {code} {description}")));
        }

        if let Some(new_id) = parameters.migrate_to_chat_id {
            description = format!("{description} (chat migrated to {new_id})");
        }

        Err(Error::Api { code, description })
    }
}

fn transport(method: &str, e: reqwest::Error) -> Error {
    let kind = if e.is_timeout() {
        "timed out"
    } else if e.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    Error::Transport(format!("{method} {kind}: {}", e.without_url()))
}

fn photo_form(request: &SendPhoto, file_name: &str, bytes: &[u8]) -> Result<Form> {
    let mut form = Form::new()
        .text("chat_id", request.chat_id.to_string())
        .part(
            "photo",
            Part::bytes(bytes.to_vec()).file_name(file_name.to_string()),
        );

    if let Some(caption) = &request.caption {
        form = form.text("caption", caption.clone());
    }
    if let Some(mode) = request.parse_mode {
        // Serializes to the bare mode name, e.g. "HTML"
        let mode = serde_json::to_value(mode)?;
        form = form.text("parse_mode", mode.as_str().unwrap_or_default().to_string());
    }
    if let Some(silent) = request.disable_notification {
        form = form.text("disable_notification", silent.to_string());
    }
    if let Some(markup) = &request.reply_markup {
        form = form.text("reply_markup", serde_json::to_string(markup)?);
    }

    Ok(form)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time::Instant;

    use super::*;
    use crate::telegram::SlidingWindowLimiter;

    fn envelope(json: serde_json::Value) -> ApiResponse<bool> {
        serde_json::from_value(json).unwrap()
    }

    fn api_with(limiter: Arc<SlidingWindowLimiter>) -> BotApi {
        BotApi::new("123:abc", limiter).with_base_url("http://127.0.0.1:9")
    }

    #[test]
    fn ok_envelope_yields_result() {
        let api = api_with(Arc::new(SlidingWindowLimiter::default()));
        let result = api.interpret("setWebhook", None, envelope(serde_json::json!({"ok": true, "result": true})));
        assert!(result.unwrap());
    }

    #[test]
    fn retry_after_maps_to_flood_control_and_blocks_chat() {
        let limiter = Arc::new(SlidingWindowLimiter::default());
        let api = api_with(Arc::clone(&limiter));

        let err = api
            .interpret(
                "sendMessage",
                Some(77),
                envelope(serde_json::json!({
                    "ok": false, "error_code": 429,
                    "description": "Too Many Requests: retry after 30",
                    "parameters": {"retry_after": 30}
                })),
            )
            .unwrap_err();

        match err {
            Error::FloodControl { chat_id, retry_after } => {
                assert_eq!(chat_id, Some(77));
                assert_eq!(retry_after, Duration::from_secs(30));
            }
            other => panic!("expected FloodControl, got {other:?}"),
        }

        let now = Instant::now();
        assert!(limiter.check_at(Some(77), now + Duration::from_secs(29)).is_err());
        assert!(limiter.check_at(Some(77), now + Duration::from_secs(31)).is_ok());
    }

    #[test]
    fn semantic_rejection_maps_to_api_error() {
        let api = api_with(Arc::new(SlidingWindowLimiter::default()));
        let err = api
            .interpret(
                "sendMessage",
                Some(1),
                envelope(serde_json::json!({
                    "ok": false, "error_code": 403,
                    "description": "Forbidden: bot was blocked by the user"
                })),
            )
            .unwrap_err();

        assert!(matches!(err, Error::Api { code: 403, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_side_errors_are_transport() {
        let api = api_with(Arc::new(SlidingWindowLimiter::default()));
        let err = api
            .interpret(
                "sendMessage",
                Some(1),
                envelope(serde_json::json!({
                    "ok": false, "error_code": 502, "description": "Bad Gateway"
                })),
            )
            .unwrap_err();

        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn migration_target_is_reported() {
        let api = api_with(Arc::new(SlidingWindowLimiter::default()));
        let err = api
            .interpret(
                "sendMessage",
                Some(-100),
                envelope(serde_json::json!({
                    "ok": false, "error_code": 400,
                    "description": "Bad Request: group chat was upgraded to a supergroup chat",
                    "parameters": {"migrate_to_chat_id": -100_123}
                })),
            )
            .unwrap_err();

        assert!(err.to_string().contains("-100123"));
    }

    #[test]
    fn debug_output_hides_token() {
        let api = api_with(Arc::new(SlidingWindowLimiter::default()));
        assert!(!format!("{api:?}").contains("123:abc"));
    }

    #[tokio::test]
    async fn reject_mode_fails_fast_when_throttled() {
        let limiter = Arc::new(SlidingWindowLimiter::default());
        limiter.backoff_at(5, Duration::from_secs(60), Instant::now());
        let api = api_with(limiter).with_mode(RateLimitMode::Reject);

        let err = api.send_message(&SendMessage::new(5, "hi")).await.unwrap_err();
        assert!(matches!(err, Error::RateLimited { .. }));
    }
}
