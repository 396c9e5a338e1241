//! Queued outbound delivery
//!
//! Sends are wrapped in [`OutboundRequest`]s and kept in a time-ordered queue.
//! A pool of worker tasks claims due requests, runs each attempt under a
//! timeout, and either reports the outcome or re-queues the request according
//! to the [`RetryPolicy`].

pub mod broadcast;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::telegram::retry::{self, RetryDecision, RetryPolicy};
use crate::telegram::{BotApi, RateLimitMode, SendMessage, SendPhoto};
use crate::{Error, Result};

pub use broadcast::{
    BroadcastRequest, BroadcastSummary, Recipient, RecipientDirectory, StaticDirectory,
};

/// Identifier of a queued request
pub type JobId = Uuid;

/// Capacity of the report event channel
const REPORT_CHANNEL_CAPACITY: usize = 1024;

/// Shortest delay before a throttled request is claimed again
const MIN_DEFER: Duration = Duration::from_millis(10);

/// A single send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Message(SendMessage),
    Photo(SendPhoto),
}

impl Job {
    #[must_use]
    pub const fn chat_id(&self) -> i64 {
        match self {
            Self::Message(m) => m.chat_id,
            Self::Photo(p) => p.chat_id,
        }
    }

    /// Bot API method the job invokes
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Message(_) => "sendMessage",
            Self::Photo(_) => "sendPhoto",
        }
    }
}

/// A job owned by the queue until it is sent or gives up
#[derive(Debug)]
pub struct OutboundRequest {
    pub id: JobId,
    pub job: Job,
    /// Attempts made so far
    pub attempt: u32,
    pub scheduled_at: Instant,
    /// Tie-breaker among requests due at the same instant
    pub seq: u64,
    notify: Option<mpsc::UnboundedSender<DeliveryReport>>,
}

/// Terminal result of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    Failed { error: String },
}

/// Published once per request when it reaches a terminal state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub id: JobId,
    pub chat_id: i64,
    pub attempts: u32,
    pub outcome: Outcome,
}

/// Something that can perform a send; implemented by [`BotApi`]
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Perform one delivery attempt
    ///
    /// # Errors
    ///
    /// Returns the typed failure used for the retry decision
    async fn deliver(&self, job: &Job) -> Result<()>;
}

/// Workers never sleep on the limiter: a throttled chat comes back as
/// `RateLimited` and the queue reschedules it, leaving the worker free.
#[async_trait]
impl MessageSender for BotApi {
    async fn deliver(&self, job: &Job) -> Result<()> {
        let api = self.clone().with_mode(RateLimitMode::Reject);
        match job {
            Job::Message(m) => api.send_message(m).await.map(drop),
            Job::Photo(p) => api.send_photo(p).await.map(drop),
        }
    }
}

/// Queue tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Name used in logs
    pub name: String,
    pub workers: usize,
    /// Upper bound on requests waiting to run
    pub max_pending: usize,
    pub retry: RetryPolicy,
    pub message_timeout: Duration,
    pub media_timeout: Duration,
    /// Delay added per successive broadcast recipient
    pub broadcast_spacing: Duration,
    /// Wall-clock limit for one broadcast
    pub broadcast_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "telegram".to_string(),
            workers: 4,
            max_pending: 10_000,
            retry: RetryPolicy::default(),
            message_timeout: Duration::from_secs(30),
            media_timeout: Duration::from_secs(60),
            broadcast_spacing: Duration::from_millis(100),
            broadcast_timeout: Duration::from_secs(300),
        }
    }
}

/// Counters exposed to operators
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub pending: usize,
    pub in_flight: usize,
    pub sent: u64,
    pub failed: u64,
    pub retried: u64,
    /// Requests rescheduled by the local rate limiter
    pub deferred: u64,
}

#[derive(Debug, Default)]
struct Pending {
    /// Due time, enqueue sequence, id; entries for cancelled ids are skipped
    heap: BinaryHeap<Reverse<(Instant, u64, JobId)>>,
    jobs: HashMap<JobId, OutboundRequest>,
}

enum Claim {
    Ready(OutboundRequest),
    WaitUntil(Instant),
    Empty,
}

/// Time-ordered delivery queue with a worker pool
#[derive(Debug)]
pub struct DeliveryQueue {
    config: QueueConfig,
    pending: Mutex<Pending>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    seq: AtomicU64,
    in_flight: AtomicUsize,
    sent: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    deferred: AtomicU64,
    reports: tokio::sync::broadcast::Sender<DeliveryReport>,
}

impl DeliveryQueue {
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (reports, _) = tokio::sync::broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            config,
            pending: Mutex::new(Pending::default()),
            wake: Notify::new(),
            shutdown,
            seq: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            reports,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queue a job to run as soon as a worker is free
    ///
    /// # Errors
    ///
    /// Returns `Queue` if the queue is full or shut down
    pub fn enqueue(&self, job: Job) -> Result<JobId> {
        self.push(job, Duration::ZERO, None)
    }

    /// Queue a job to run no earlier than `delay` from now
    ///
    /// # Errors
    ///
    /// Returns `Queue` if the queue is full or shut down
    pub fn enqueue_after(&self, job: Job, delay: Duration) -> Result<JobId> {
        self.push(job, delay, None)
    }

    /// Remove a job no worker has claimed yet; returns whether it was removed
    pub fn cancel(&self, id: JobId) -> bool {
        let removed = self.lock().jobs.remove(&id).is_some();
        if removed {
            tracing::debug!(queue = %self.config.name, job_id = %id, "delivery job cancelled");
        }
        removed
    }

    /// Receive a report for every request that reaches a terminal state
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DeliveryReport> {
        self.reports.subscribe()
    }

    #[must_use]
    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            pending: self.lock().jobs.len(),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
        }
    }

    /// Spawn the configured number of workers delivering through `sender`
    #[must_use]
    pub fn start(self: &Arc<Self>, sender: Arc<dyn MessageSender>) -> WorkerPool {
        let workers = self.config.workers.max(1);
        tracing::info!(queue = %self.config.name, workers, "delivery workers started");

        let handles = (0..workers)
            .map(|index| {
                let queue = Arc::clone(self);
                let sender = Arc::clone(&sender);
                tokio::spawn(async move { queue.work(index, sender).await })
            })
            .collect();

        WorkerPool {
            queue: Arc::clone(self),
            handles,
        }
    }

    /// Stop accepting jobs and tell workers to exit after their current attempt
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.wake.notify_waiters();
    }

    pub(crate) fn push(
        &self,
        job: Job,
        delay: Duration,
        notify: Option<mpsc::UnboundedSender<DeliveryReport>>,
    ) -> Result<JobId> {
        if *self.shutdown.borrow() {
            return Err(Error::Queue(format!("queue {} is shut down", self.config.name)));
        }

        let id = Uuid::new_v4();
        let chat_id = job.chat_id();
        {
            let mut pending = self.lock();
            if pending.jobs.len() >= self.config.max_pending {
                return Err(Error::Queue(format!(
                    "queue {} is full ({} pending)",
                    self.config.name, self.config.max_pending
                )));
            }

            let request = OutboundRequest {
                id,
                job,
                attempt: 0,
                scheduled_at: Instant::now() + delay,
                seq: 0,
                notify,
            };
            self.insert(&mut pending, request);
        }
        self.wake.notify_one();

        tracing::trace!(queue = %self.config.name, job_id = %id, chat_id, ?delay, "delivery job queued");
        Ok(id)
    }

    fn insert(&self, pending: &mut Pending, mut request: OutboundRequest) {
        request.seq = self.seq.fetch_add(1, Ordering::Relaxed);
        pending
            .heap
            .push(Reverse((request.scheduled_at, request.seq, request.id)));
        pending.jobs.insert(request.id, request);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self) -> Claim {
        let mut pending = self.lock();
        let now = Instant::now();

        while let Some(Reverse((due, _, id))) = pending.heap.peek().copied() {
            if !pending.jobs.contains_key(&id) {
                pending.heap.pop();
                continue;
            }
            if due > now {
                return Claim::WaitUntil(due);
            }
            pending.heap.pop();
            if let Some(request) = pending.jobs.remove(&id) {
                self.in_flight.fetch_add(1, Ordering::Relaxed);
                return Claim::Ready(request);
            }
        }

        Claim::Empty
    }

    async fn work(&self, index: usize, sender: Arc<dyn MessageSender>) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            match self.claim() {
                Claim::Ready(request) => {
                    self.execute(sender.as_ref(), request).await;
                    self.in_flight.fetch_sub(1, Ordering::Relaxed);
                }
                Claim::WaitUntil(due) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(due) => {}
                        () = self.wake.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Claim::Empty => {
                    tokio::select! {
                        () = self.wake.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        tracing::debug!(queue = %self.config.name, worker = index, "delivery worker stopped");
    }

    async fn execute(&self, sender: &dyn MessageSender, mut request: OutboundRequest) {
        request.attempt += 1;
        let chat_id = request.job.chat_id();
        let method = request.job.method();
        let limit = match request.job {
            Job::Message(_) => self.config.message_timeout,
            Job::Photo(_) => self.config.media_timeout,
        };

        let result = tokio::time::timeout(limit, sender.deliver(&request.job))
            .await
            .unwrap_or_else(|_| {
                Err(Error::Transport(format!("{method} timed out after {limit:?}")))
            });

        let err = match result {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    queue = %self.config.name,
                    job_id = %request.id,
                    chat_id,
                    attempt = request.attempt,
                    "delivery succeeded"
                );
                self.finish(request, Outcome::Sent);
                return;
            }
            // Refused locally: nothing reached Telegram, so no attempt is spent
            Err(Error::RateLimited { retry_after }) => {
                request.attempt -= 1;
                self.defer(request, retry_after);
                return;
            }
            Err(err) => err,
        };

        match retry::decide(&self.config.retry, request.attempt, &err) {
            RetryDecision::Retry(delay) => {
                self.retried.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    queue = %self.config.name,
                    job_id = %request.id,
                    chat_id,
                    attempt = request.attempt,
                    ?delay,
                    error = %err,
                    "delivery attempt failed, retrying"
                );
                request.scheduled_at = Instant::now() + delay;
                self.insert(&mut self.lock(), request);
                self.wake.notify_one();
            }
            RetryDecision::Exhausted | RetryDecision::Permanent => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    queue = %self.config.name,
                    job_id = %request.id,
                    chat_id,
                    method,
                    attempts = request.attempt,
                    retryable = err.is_retryable(),
                    error = %err,
                    "delivery failed permanently"
                );
                self.finish(
                    request,
                    Outcome::Failed {
                        error: err.to_string(),
                    },
                );
            }
        }
    }

    fn defer(&self, mut request: OutboundRequest, retry_after: Duration) {
        let delay = retry_after.max(MIN_DEFER);
        self.deferred.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            queue = %self.config.name,
            job_id = %request.id,
            chat_id = request.job.chat_id(),
            ?delay,
            "delivery throttled, rescheduled"
        );
        request.scheduled_at = Instant::now() + delay;
        self.insert(&mut self.lock(), request);
        self.wake.notify_one();
    }

    fn finish(&self, request: OutboundRequest, outcome: Outcome) {
        let report = DeliveryReport {
            id: request.id,
            chat_id: request.job.chat_id(),
            attempts: request.attempt,
            outcome,
        };

        if let Some(notify) = &request.notify {
            // The broadcast may have stopped waiting
            let _ = notify.send(report.clone());
        }
        let _ = self.reports.send(report);
    }
}

/// Handles to the running workers
#[derive(Debug)]
pub struct WorkerPool {
    queue: Arc<DeliveryQueue>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Signal shutdown and wait for every worker to exit
    pub async fn shutdown(self) {
        self.queue.shutdown();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "delivery worker panicked");
            }
        }
        tracing::info!(queue = %self.queue.config.name, "delivery workers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(chat_id: i64) -> Job {
        Job::Message(SendMessage::new(chat_id, "hello"))
    }

    #[test]
    fn claim_respects_due_time_and_order() {
        let queue = DeliveryQueue::new(QueueConfig::default());
        let late = queue
            .enqueue_after(message(1), Duration::from_secs(60))
            .unwrap();
        let now_a = queue.enqueue(message(2)).unwrap();
        let now_b = queue.enqueue(message(3)).unwrap();

        let Claim::Ready(first) = queue.claim() else {
            panic!("expected a ready job");
        };
        let Claim::Ready(second) = queue.claim() else {
            panic!("expected a ready job");
        };
        assert_eq!(first.id, now_a);
        assert_eq!(second.id, now_b);

        assert!(matches!(queue.claim(), Claim::WaitUntil(_)));
        assert!(queue.cancel(late));
        assert!(matches!(queue.claim(), Claim::Empty));
    }

    #[test]
    fn cancel_unknown_job_is_noop() {
        let queue = DeliveryQueue::new(QueueConfig::default());
        assert!(!queue.cancel(Uuid::new_v4()));
    }

    #[test]
    fn full_queue_rejects_jobs() {
        let queue = DeliveryQueue::new(QueueConfig {
            max_pending: 2,
            ..QueueConfig::default()
        });

        queue.enqueue(message(1)).unwrap();
        queue.enqueue(message(2)).unwrap();
        let err = queue.enqueue(message(3)).unwrap_err();

        assert!(matches!(err, Error::Queue(_)));
        assert_eq!(queue.stats().pending, 2);
    }

    #[test]
    fn shut_down_queue_rejects_jobs() {
        let queue = DeliveryQueue::new(QueueConfig::default());
        queue.shutdown();
        assert!(matches!(queue.enqueue(message(1)), Err(Error::Queue(_))));
    }

    #[tokio::test]
    async fn bot_api_delivery_returns_instead_of_waiting_on_limiter() {
        use crate::telegram::{RateLimiter, SlidingWindowLimiter};

        let limiter = Arc::new(SlidingWindowLimiter::default());
        limiter.backoff(5, Duration::from_secs(600));
        // Block mode would sleep out the backoff
        let api = BotApi::new("123:abc", limiter).with_base_url("http://127.0.0.1:9");

        let result = tokio::time::timeout(Duration::from_secs(5), api.deliver(&message(5)))
            .await
            .expect("delivery waited on the limiter");
        assert!(matches!(result, Err(Error::RateLimited { .. })));
    }

    #[test]
    fn job_reports_method_and_chat() {
        let job = message(42);
        assert_eq!(job.chat_id(), 42);
        assert_eq!(job.method(), "sendMessage");
    }
}
