//! Shared test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    routing::post,
};
use courier_gateway::delivery::{Job, MessageSender};
use courier_gateway::{BotApi, SlidingWindowLimiter};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::Instant;

pub const TOKEN: &str = "123456:test-token";

/// A request the mock Bot API received
#[derive(Debug, Clone)]
pub struct Call {
    pub method: String,
    pub content_type: String,
    pub body: Bytes,
}

impl Call {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

#[derive(Default)]
pub struct MockState {
    pub calls: Mutex<Vec<Call>>,
    /// Stored `setWebhook` request
    pub webhook: Mutex<Option<Value>>,
    /// Canned responses returned before the default behaviour
    pub script: Mutex<VecDeque<(StatusCode, String)>>,
}

/// In-process stand-in for the Telegram Bot API
pub struct MockTelegram {
    pub base_url: String,
    pub state: Arc<MockState>,
}

impl MockTelegram {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/{token}/{method}", post(handle))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    /// Client pointed at this server with a fresh limiter
    pub fn client(&self) -> BotApi {
        self.client_with(Arc::new(SlidingWindowLimiter::default()))
    }

    pub fn client_with(&self, limiter: Arc<SlidingWindowLimiter>) -> BotApi {
        BotApi::new(TOKEN, limiter).with_base_url(&self.base_url)
    }

    /// Answer the next call with `status` and a raw body
    pub fn respond_next(&self, status: StatusCode, body: impl Into<String>) {
        self.state
            .script
            .lock()
            .unwrap()
            .push_back((status, body.into()));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.calls.lock().unwrap().clone()
    }
}

async fn handle(
    State(state): State<Arc<MockState>>,
    Path((token, method)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.calls.lock().unwrap().push(Call {
        method: method.clone(),
        content_type,
        body: body.clone(),
    });

    if token != format!("bot{TOKEN}") {
        return reply(
            StatusCode::UNAUTHORIZED,
            json!({"ok": false, "error_code": 401, "description": "Unauthorized"}),
        );
    }

    if let Some((status, body)) = state.script.lock().unwrap().pop_front() {
        return (status, body);
    }

    let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    match method.as_str() {
        "getMe" => ok(json!({
            "id": 123_456, "is_bot": true, "first_name": "Courier", "username": "courier_bot"
        })),
        "setWebhook" => {
            *state.webhook.lock().unwrap() = Some(request);
            ok(json!(true))
        }
        "deleteWebhook" => {
            *state.webhook.lock().unwrap() = None;
            ok(json!(true))
        }
        "getWebhookInfo" => {
            let stored = state.webhook.lock().unwrap().clone();
            let info = stored.map_or_else(
                || json!({"url": "", "has_custom_certificate": false, "pending_update_count": 0}),
                |w| {
                    let mut info = json!({
                        "url": w["url"],
                        "has_custom_certificate": false,
                        "pending_update_count": 2,
                        "last_error_date": 1_700_000_000,
                        "last_error_message": "Connection timed out"
                    });
                    if !w["max_connections"].is_null() {
                        info["max_connections"] = w["max_connections"].clone();
                    }
                    if !w["allowed_updates"].is_null() {
                        info["allowed_updates"] = w["allowed_updates"].clone();
                    }
                    info
                },
            );
            ok(info)
        }
        "sendMessage" | "sendPhoto" => {
            let chat_id = request["chat_id"].as_i64().unwrap_or_default();
            ok(json!({
                "message_id": 1,
                "date": 1_700_000_000,
                "chat": {"id": chat_id, "type": "private"},
                "text": request["text"]
            }))
        }
        _ => reply(
            StatusCode::NOT_FOUND,
            json!({"ok": false, "error_code": 404, "description": "Not Found: method not found"}),
        ),
    }
}

fn ok(result: Value) -> (StatusCode, String) {
    reply(StatusCode::OK, json!({"ok": true, "result": result}))
}

fn reply(status: StatusCode, body: Value) -> (StatusCode, String) {
    (status, body.to_string())
}

/// Sender scripted per chat; records every attempt
pub struct ScriptedSender {
    behaviour: Box<dyn Fn(i64, u32) -> courier_gateway::Result<()> + Send + Sync>,
    pub attempts: Mutex<Vec<(i64, Instant)>>,
    delay: Option<Duration>,
}

impl ScriptedSender {
    /// `behaviour(chat_id, attempt)` decides the outcome of each attempt (1-based per chat)
    pub fn new(
        behaviour: impl Fn(i64, u32) -> courier_gateway::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            behaviour: Box::new(behaviour),
            attempts: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Every attempt succeeds
    pub fn ok() -> Self {
        Self::new(|_, _| Ok(()))
    }

    /// Take `delay` before answering
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn attempts_for(&self, chat_id: i64) -> Vec<Instant> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|(chat, _)| *chat == chat_id)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn total_attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageSender for ScriptedSender {
    async fn deliver(&self, job: &Job) -> courier_gateway::Result<()> {
        let chat_id = job.chat_id();
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push((chat_id, Instant::now()));
            u32::try_from(attempts.iter().filter(|(c, _)| *c == chat_id).count()).unwrap()
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        (self.behaviour)(chat_id, attempt)
    }
}
