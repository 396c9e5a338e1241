//! Sliding-window rate limiter for Telegram Bot API calls
//!
//! Telegram publishes three ceilings: roughly 30 requests per second across
//! the whole bot, one message per second into a single chat, and 20 messages
//! per minute into a single chat. Every outbound call is checked against the
//! global scope and, when it targets a chat, against that chat's scope.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;

use crate::{Error, Result};

/// Scope count above which idle chat histories are swept
const SWEEP_THRESHOLD: usize = 4096;

/// A limiting scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Shared by every call the bot makes
    Global,
    /// Calls targeting one chat
    Chat(i64),
}

/// At most `limit` calls within any trailing `period`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Window {
    pub limit: u32,
    #[serde(with = "secs")]
    pub period: Duration,
}

impl Window {
    #[must_use]
    pub const fn new(limit: u32, period: Duration) -> Self {
        Self { limit, period }
    }

    #[must_use]
    pub const fn per_second(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(1))
    }

    #[must_use]
    pub const fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }
}

/// Configured ceilings for each scope
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub global: Vec<Window>,
    pub per_chat: Vec<Window>,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            global: vec![Window::per_second(30)],
            per_chat: vec![Window::per_second(1), Window::per_minute(20)],
        }
    }
}

/// Rate limiter consulted before every Telegram API call
///
/// Implementations must make the check-and-record step atomic across all
/// scopes involved in a call.
#[async_trait]
pub trait RateLimiter: Send + Sync + std::fmt::Debug {
    /// Admit a call now or fail with [`Error::RateLimited`]
    ///
    /// Nothing is recorded when the call is refused.
    ///
    /// # Errors
    ///
    /// Returns `RateLimited` carrying the projected wait until headroom exists
    fn try_acquire(&self, chat_id: Option<i64>) -> Result<()>;

    /// Block further calls to `chat_id` for `wait` (server-mandated flood control)
    fn backoff(&self, chat_id: i64, wait: Duration);

    /// Wait until the call is admitted
    ///
    /// # Errors
    ///
    /// Returns any non-throttling error raised by `try_acquire`
    async fn acquire(&self, chat_id: Option<i64>) -> Result<()> {
        loop {
            match self.try_acquire(chat_id) {
                Err(Error::RateLimited { retry_after }) => {
                    tracing::trace!(?chat_id, ?retry_after, "waiting for rate limit headroom");
                    tokio::time::sleep(retry_after).await;
                }
                other => return other,
            }
        }
    }
}

#[derive(Debug, Default)]
struct State {
    /// Admitted call timestamps per scope, oldest first
    history: HashMap<Scope, VecDeque<Instant>>,
    /// Flood-control deadlines per chat
    blocked_until: HashMap<i64, Instant>,
}

/// In-process limiter keeping a timestamp window per scope
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    limits: RateLimits,
    state: Mutex<State>,
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new(RateLimits::default())
    }
}

impl SlidingWindowLimiter {
    #[must_use]
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(State::default()),
        }
    }

    /// Check and record a call at `now`; returns the wait on refusal
    ///
    /// # Errors
    ///
    /// Returns the projected duration until every involved window has headroom
    pub fn check_at(&self, chat_id: Option<i64>, now: Instant) -> std::result::Result<(), Duration> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if state.history.len() > SWEEP_THRESHOLD {
            self.sweep(&mut state, now);
        }

        let mut wait = Duration::ZERO;

        if let Some(chat) = chat_id {
            match state.blocked_until.get(&chat).copied() {
                Some(until) if until > now => wait = until - now,
                Some(_) => {
                    state.blocked_until.remove(&chat);
                }
                None => {}
            }
        }

        for (scope, windows) in self.scopes(chat_id) {
            let history = state.history.entry(scope).or_default();
            prune(history, max_period(windows), now);
            wait = wait.max(headroom_wait(history, windows, now));
        }

        if !wait.is_zero() {
            return Err(wait);
        }

        for (scope, _) in self.scopes(chat_id) {
            state.history.entry(scope).or_default().push_back(now);
        }

        Ok(())
    }

    /// Record a flood-control deadline for `chat_id` relative to `now`
    pub fn backoff_at(&self, chat_id: i64, wait: Duration, now: Instant) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let until = now + wait;
        let entry = state.blocked_until.entry(chat_id).or_insert(until);
        if *entry < until {
            *entry = until;
        }
    }

    fn scopes(&self, chat_id: Option<i64>) -> impl Iterator<Item = (Scope, &[Window])> + '_ {
        std::iter::once((Scope::Global, self.limits.global.as_slice())).chain(
            chat_id.map(|id| (Scope::Chat(id), self.limits.per_chat.as_slice())),
        )
    }

    /// Drop aged-out timestamps everywhere and forget idle chats
    fn sweep(&self, state: &mut State, now: Instant) {
        let chat_period = max_period(&self.limits.per_chat);
        let global_period = max_period(&self.limits.global);

        state.history.retain(|scope, history| {
            let period = match scope {
                Scope::Global => global_period,
                Scope::Chat(_) => chat_period,
            };
            prune(history, period, now);
            !history.is_empty()
        });
        state.blocked_until.retain(|_, until| *until > now);
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    fn try_acquire(&self, chat_id: Option<i64>) -> Result<()> {
        self.check_at(chat_id, Instant::now())
            .map_err(|retry_after| Error::RateLimited { retry_after })
    }

    fn backoff(&self, chat_id: i64, wait: Duration) {
        tracing::debug!(chat_id, ?wait, "chat placed under flood-control backoff");
        self.backoff_at(chat_id, wait, Instant::now());
    }
}

fn max_period(windows: &[Window]) -> Duration {
    windows
        .iter()
        .map(|w| w.period)
        .max()
        .unwrap_or_default()
}

fn prune(history: &mut VecDeque<Instant>, period: Duration, now: Instant) {
    while history
        .front()
        .is_some_and(|ts| now.saturating_duration_since(*ts) >= period)
    {
        history.pop_front();
    }
}

/// Time until every window has room for one more call
fn headroom_wait(history: &VecDeque<Instant>, windows: &[Window], now: Instant) -> Duration {
    windows
        .iter()
        .map(|w| {
            let limit = w.limit.max(1) as usize;
            let start = history.partition_point(|ts| now.saturating_duration_since(*ts) >= w.period);
            let in_window = history.len() - start;
            if in_window < limit {
                return Duration::ZERO;
            }
            // The oldest call that must leave the window before one more fits
            let expiring = history[start + in_window - limit];
            (expiring + w.period).saturating_duration_since(now)
        })
        .max()
        .unwrap_or_default()
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        f64::deserialize(d).map(Duration::from_secs_f64)
    }
}
