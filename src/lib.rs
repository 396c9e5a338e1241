//! Courier Gateway - Telegram delivery gateway
//!
//! This library provides the Telegram side of a web application:
//! - Rate-limited Bot API client (`sendMessage`, `sendPhoto`, webhook management)
//! - Authenticated webhook intake with update routing
//! - Delivery queue with retries, delayed jobs and broadcast fan-out
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │        Telegram  ──webhook──▶  HTTP API (axum)       │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │  WebhookDispatcher  │  UpdateHandler  │  Admin API   │
//! └────────────────────┬────────────────────────────────┘
//!                      │ enqueue
//! ┌────────────────────▼────────────────────────────────┐
//! │   DeliveryQueue  ─▶  BotApi  ─▶  RateLimiter         │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod bot;
pub mod config;
pub mod daemon;
pub mod delivery;
pub mod error;
pub mod telegram;

pub use bot::CourierBot;
pub use config::Config;
pub use daemon::Daemon;
pub use delivery::{
    BroadcastRequest, BroadcastSummary, DeliveryQueue, DeliveryReport, Job, MessageSender,
    QueueConfig,
};
pub use error::{Error, Result};
pub use telegram::{BotApi, RateLimiter, SlidingWindowLimiter, UpdateHandler, WebhookDispatcher};
