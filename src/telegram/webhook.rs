//! Webhook authentication, decoding and routing
//!
//! The dispatcher holds no business logic: it checks the secret token,
//! decodes the body into an [`Update`], drops redeliveries, and hands the
//! payload to an [`UpdateHandler`].

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use axum::http::HeaderMap;
use secrecy::{ExposeSecret, SecretString};

use super::dedup::UpdateDedup;
use super::types::{CallbackQuery, ChatMemberUpdated, Message};
use super::update::{Update, UpdateKind};
use crate::{Error, Result};

/// Header Telegram uses to echo the secret token given to `setWebhook`
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Business logic invoked for each accepted update
///
/// Every method defaults to ignoring the update.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn on_message(&self, _update_id: i64, _message: Message) -> Result<()> {
        Ok(())
    }

    async fn on_edited_message(&self, _update_id: i64, _message: Message) -> Result<()> {
        Ok(())
    }

    async fn on_callback_query(&self, _update_id: i64, _query: CallbackQuery) -> Result<()> {
        Ok(())
    }

    async fn on_chat_member(&self, _update_id: i64, _change: ChatMemberUpdated) -> Result<()> {
        Ok(())
    }

    /// Channel posts and update types without a dedicated hook
    async fn on_other(&self, _update: Update) -> Result<()> {
        Ok(())
    }
}

/// Outcome of a successful dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Handed to the handler
    Routed { update_id: i64, kind: String },
    /// Seen before within the dedup window; not routed again
    Duplicate { update_id: i64 },
}

/// Validates and routes inbound webhook requests
pub struct WebhookDispatcher {
    secret: Option<SecretString>,
    dedup: Option<Mutex<UpdateDedup>>,
    handler: Arc<dyn UpdateHandler>,
}

impl std::fmt::Debug for WebhookDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookDispatcher")
            .field("secret", &self.secret.is_some())
            .field("dedup", &self.dedup.is_some())
            .finish_non_exhaustive()
    }
}

impl WebhookDispatcher {
    /// Dispatcher with dedup enabled and no secret
    #[must_use]
    pub fn new(handler: Arc<dyn UpdateHandler>) -> Self {
        Self {
            secret: None,
            dedup: Some(Mutex::new(UpdateDedup::default())),
            handler,
        }
    }

    /// Require `secret` in the secret-token header; `None` disables the check
    #[must_use]
    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secret = secret.filter(|s| !s.is_empty()).map(SecretString::from);
        if self.secret.is_none() {
            tracing::warn!("Telegram webhook secret not configured - accepting unauthenticated updates");
        }
        self
    }

    #[must_use]
    pub fn with_dedup(mut self, enabled: bool) -> Self {
        self.dedup = enabled.then(|| Mutex::new(UpdateDedup::default()));
        self
    }

    /// Authenticate, decode and route one webhook request
    ///
    /// # Errors
    ///
    /// - `Unauthorized` if the secret token is missing or wrong (body untouched)
    /// - `MalformedUpdate` if the body is not a Telegram update
    /// - whatever the handler returns
    pub async fn handle(&self, raw_body: &[u8], headers: &HeaderMap) -> Result<Dispatch> {
        self.authenticate(headers)?;

        let update: Update = serde_json::from_slice(raw_body)
            .map_err(|e| Error::MalformedUpdate(e.to_string()))?;

        let update_id = update.update_id;
        if self.is_duplicate(update_id) {
            tracing::debug!(update_id, "duplicate Telegram update, skipping");
            return Ok(Dispatch::Duplicate { update_id });
        }

        let kind = update.kind.name().to_string();
        tracing::debug!(update_id, kind = %kind, chat_id = ?update.chat_id(), "routing Telegram update");

        self.route(update).await?;

        Ok(Dispatch::Routed { update_id, kind })
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<()> {
        if self.is_authentic(headers) {
            Ok(())
        } else {
            tracing::warn!("Telegram webhook secret mismatch");
            Err(Error::Unauthorized)
        }
    }

    /// Whether `headers` carry the configured secret token
    ///
    /// Always true when no secret is configured. Does not log.
    #[must_use]
    pub fn is_authentic(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.secret else {
            return true;
        };

        let provided = headers
            .get(SECRET_HEADER)
            .map(axum::http::HeaderValue::as_bytes)
            .unwrap_or_default();

        constant_time_eq(expected.expose_secret().as_bytes(), provided)
    }

    fn is_duplicate(&self, update_id: i64) -> bool {
        self.dedup.as_ref().is_some_and(|dedup| {
            dedup
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_duplicate(update_id)
        })
    }

    async fn route(&self, update: Update) -> Result<()> {
        let update_id = update.update_id;
        match update.kind {
            UpdateKind::Message(message) => self.handler.on_message(update_id, message).await,
            UpdateKind::EditedMessage(message) => {
                self.handler.on_edited_message(update_id, message).await
            }
            UpdateKind::CallbackQuery(query) => {
                self.handler.on_callback_query(update_id, query).await
            }
            UpdateKind::MyChatMember(change) => {
                self.handler.on_chat_member(update_id, change).await
            }
            kind => self.handler.on_other(Update { update_id, kind }).await,
        }
    }
}

/// Constant-time byte comparison to prevent timing attacks
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::HeaderValue;

    use super::*;

    #[derive(Default)]
    struct Counting {
        messages: AtomicUsize,
        callbacks: AtomicUsize,
        other: AtomicUsize,
    }

    #[async_trait]
    impl UpdateHandler for Counting {
        async fn on_message(&self, _update_id: i64, _message: Message) -> Result<()> {
            self.messages.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_callback_query(&self, _update_id: i64, _query: CallbackQuery) -> Result<()> {
            self.callbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_other(&self, _update: Update) -> Result<()> {
            self.other.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    const MESSAGE: &[u8] = br#"{"update_id":1,"message":{"message_id":5,"date":0,
        "chat":{"id":9,"type":"private"},"text":"hi"}}"#;

    fn headers(secret: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(SECRET_HEADER, HeaderValue::from_str(secret).unwrap());
        h
    }

    fn dispatcher(handler: Arc<Counting>) -> WebhookDispatcher {
        WebhookDispatcher::new(handler).with_secret(Some("s3cret".to_string()))
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hell"));
    }

    #[tokio::test]
    async fn routes_message_with_valid_secret() {
        let handler = Arc::new(Counting::default());
        let d = dispatcher(Arc::clone(&handler));

        let outcome = d.handle(MESSAGE, &headers("s3cret")).await.unwrap();

        assert_eq!(
            outcome,
            Dispatch::Routed {
                update_id: 1,
                kind: "message".to_string()
            }
        );
        assert_eq!(handler.messages.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected_before_decoding() {
        let handler = Arc::new(Counting::default());
        let d = dispatcher(Arc::clone(&handler));

        // Body is garbage: an auth failure must win over a decode failure
        let err = d.handle(b"not json", &headers("nope")).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized));

        let err = d.handle(MESSAGE, &HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized));
        assert_eq!(handler.messages.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_body_is_reported() {
        let d = dispatcher(Arc::new(Counting::default()));
        let err = d.handle(b"{\"update_id\":", &headers("s3cret")).await.unwrap_err();
        assert!(matches!(err, Error::MalformedUpdate(_)));
    }

    #[tokio::test]
    async fn redelivered_update_is_routed_once() {
        let handler = Arc::new(Counting::default());
        let d = dispatcher(Arc::clone(&handler));

        d.handle(MESSAGE, &headers("s3cret")).await.unwrap();
        let second = d.handle(MESSAGE, &headers("s3cret")).await.unwrap();

        assert_eq!(second, Dispatch::Duplicate { update_id: 1 });
        assert_eq!(handler.messages.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dedup_can_be_disabled() {
        let handler = Arc::new(Counting::default());
        let d = dispatcher(Arc::clone(&handler)).with_dedup(false);

        d.handle(MESSAGE, &headers("s3cret")).await.unwrap();
        d.handle(MESSAGE, &headers("s3cret")).await.unwrap();

        assert_eq!(handler.messages.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_secret_configured_accepts_any_request() {
        let handler = Arc::new(Counting::default());
        let d = WebhookDispatcher::new(Arc::clone(&handler) as Arc<dyn UpdateHandler>);

        d.handle(MESSAGE, &HeaderMap::new()).await.unwrap();
        assert_eq!(handler.messages.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn secret_check_is_exposed_without_dispatching() {
        let handler = Arc::new(Counting::default());
        let d = dispatcher(Arc::clone(&handler));

        assert!(d.is_authentic(&headers("s3cret")));
        assert!(!d.is_authentic(&headers("s3cre")));
        assert!(!d.is_authentic(&HeaderMap::new()));

        let open = WebhookDispatcher::new(handler);
        assert!(open.is_authentic(&HeaderMap::new()));
    }

    #[tokio::test]
    async fn callback_and_unknown_kinds_are_routed() {
        let handler = Arc::new(Counting::default());
        let d = dispatcher(Arc::clone(&handler));

        let callback = br#"{"update_id":2,"callback_query":{"id":"q",
            "from":{"id":1,"is_bot":false,"first_name":"A"},"data":"spin"}}"#;
        let poll = br#"{"update_id":3,"poll":{"id":"p"}}"#;

        d.handle(callback, &headers("s3cret")).await.unwrap();
        d.handle(poll, &headers("s3cret")).await.unwrap();

        assert_eq!(handler.callbacks.load(Ordering::SeqCst), 1);
        assert_eq!(handler.other.load(Ordering::SeqCst), 1);
    }
}
