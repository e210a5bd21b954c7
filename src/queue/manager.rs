//! Request queue manager
//!
//! One FIFO plus one active slot per resource key. All queue state lives
//! behind a single lock that is never held across an await, so every slot
//! transition happens in one synchronous step. Result callbacks always run
//! after the lock is released.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::QueueSettings;
use crate::error::{RejectCode, Result};

use super::RateLimiter;

// ─────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────

/// How a queued request ended
#[derive(Debug, Clone, PartialEq)]
pub enum QueueOutcome {
    /// Handler returned a value
    Completed(Value),
    /// Handler returned an error
    Failed(String),
    /// The queue refused or dropped the request
    Rejected(RejectCode),
}

impl QueueOutcome {
    pub fn reject_code(&self) -> Option<RejectCode> {
        match self {
            QueueOutcome::Rejected(code) => Some(*code),
            _ => None,
        }
    }
}

/// Completion callback, invoked exactly once
pub type ResultCallback = Box<dyn FnOnce(QueueOutcome) + Send + 'static>;

/// A request waiting for, or holding, a resource
pub struct QueuedRequest {
    pub id: String,
    pub client_id: String,
    pub resource_key: String,
    pub payload: Value,
    pub enqueued_at: Instant,
    on_result: ResultCallback,
}

impl QueuedRequest {
    pub fn new(
        id: impl Into<String>,
        client_id: impl Into<String>,
        resource_key: impl Into<String>,
        payload: Value,
        on_result: impl FnOnce(QueueOutcome) + Send + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            client_id: client_id.into(),
            resource_key: resource_key.into(),
            payload,
            enqueued_at: Instant::now(),
            on_result: Box::new(on_result),
        }
    }
}

impl std::fmt::Debug for QueuedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("resource_key", &self.resource_key)
            .finish_non_exhaustive()
    }
}

/// Executes the work behind a resource key
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, resource_key: &str, payload: Value) -> Result<Value>;
}

/// Position of a request within its resource queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePosition {
    Active,
    Pending(usize),
    NotFound,
}

impl QueuePosition {
    /// `0` active, `n >= 1` pending position, `-1` unknown
    pub fn as_i64(&self) -> i64 {
        match self {
            QueuePosition::Active => 0,
            QueuePosition::Pending(n) => *n as i64,
            QueuePosition::NotFound => -1,
        }
    }
}

/// Snapshot of one resource key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub queue_length: usize,
    pub has_active: bool,
}

/// Queue tuning
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub rate_limit_requests: usize,
    pub rate_limit_window: Duration,
    pub request_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from(&QueueSettings::default())
    }
}

impl From<&QueueSettings> for QueueConfig {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            rate_limit_requests: settings.rate_limit_requests,
            rate_limit_window: settings.window(),
            request_timeout: settings.request_timeout(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────

struct ActiveSlot {
    request_id: String,
    client_id: String,
    started_at: Instant,
    on_result: Option<ResultCallback>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ResourceQueue {
    pending: VecDeque<QueuedRequest>,
    active: Option<ActiveSlot>,
}

impl ResourceQueue {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.active.is_none()
    }
}

struct QueueState {
    queues: HashMap<String, ResourceQueue>,
    limiter: RateLimiter,
}

struct Inner {
    config: QueueConfig,
    handler: Arc<dyn RequestHandler>,
    state: Mutex<QueueState>,
}

// ─────────────────────────────────────────────────────────────────
// Queue Manager
// ─────────────────────────────────────────────────────────────────

/// Arbitrates concurrent requests against single-slot resources
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

impl QueueManager {
    pub fn new(config: QueueConfig, handler: Arc<dyn RequestHandler>) -> Self {
        let limiter = RateLimiter::new(config.rate_limit_requests, config.rate_limit_window);
        Self {
            inner: Arc::new(Inner {
                config,
                handler,
                state: Mutex::new(QueueState {
                    queues: HashMap::new(),
                    limiter,
                }),
            }),
        }
    }

    /// Admit a request
    ///
    /// Returns false if the client is over its rate limit; the callback has
    /// then already received `RATE_LIMITED` and nothing was queued.
    pub fn enqueue(&self, request: QueuedRequest) -> bool {
        let key = request.resource_key.clone();

        let rejected = {
            let mut state = self.inner.state.lock();
            if state.limiter.check(&request.client_id, Instant::now()) {
                debug!(
                    request_id = %request.id,
                    client = %request.client_id,
                    resource = %key,
                    "Request queued"
                );
                state.queues.entry(key.clone()).or_default().pending.push_back(request);
                None
            } else {
                Some(request)
            }
        };

        if let Some(request) = rejected {
            info!(
                request_id = %request.id,
                client = %request.client_id,
                resource = %key,
                "Request rejected: rate limited"
            );
            (request.on_result)(QueueOutcome::Rejected(RejectCode::RateLimited));
            return false;
        }

        self.inner.process_next(&key);
        true
    }

    /// Enqueue and wait for the outcome
    pub async fn enqueue_and_wait(
        &self,
        id: impl Into<String>,
        client_id: impl Into<String>,
        resource_key: impl Into<String>,
        payload: Value,
    ) -> QueueOutcome {
        let (tx, rx) = oneshot::channel();
        let request = QueuedRequest::new(id, client_id, resource_key, payload, move |outcome| {
            let _ = tx.send(outcome);
        });
        self.enqueue(request);

        // The callback is always invoked; a dropped sender means the
        // request was torn down with the runtime
        rx.await
            .unwrap_or(QueueOutcome::Rejected(RejectCode::QueueCleared))
    }

    /// Remove a still-pending request
    ///
    /// Active requests cannot be cancelled; returns false for them and for
    /// unknown ids.
    pub fn cancel(&self, request_id: &str, resource_key: &str) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            let Some(queue) = state.queues.get_mut(resource_key) else {
                return false;
            };

            if queue
                .active
                .as_ref()
                .is_some_and(|a| a.request_id == request_id)
            {
                debug!(request_id, resource = resource_key, "Cancel ignored: request is active");
                return false;
            }

            let Some(idx) = queue.pending.iter().position(|r| r.id == request_id) else {
                return false;
            };
            queue.pending.remove(idx)
        };

        match removed {
            Some(request) => {
                info!(request_id, resource = resource_key, "Request cancelled");
                (request.on_result)(QueueOutcome::Rejected(RejectCode::Cancelled));
                true
            }
            None => false,
        }
    }

    pub fn queue_position(&self, request_id: &str, resource_key: &str) -> QueuePosition {
        let state = self.inner.state.lock();
        let Some(queue) = state.queues.get(resource_key) else {
            return QueuePosition::NotFound;
        };

        if queue
            .active
            .as_ref()
            .is_some_and(|a| a.request_id == request_id)
        {
            return QueuePosition::Active;
        }

        queue
            .pending
            .iter()
            .position(|r| r.id == request_id)
            .map(|idx| QueuePosition::Pending(idx + 1))
            .unwrap_or(QueuePosition::NotFound)
    }

    /// Per-resource queue length and active flag
    pub fn status(&self) -> HashMap<String, ResourceStatus> {
        let state = self.inner.state.lock();
        state
            .queues
            .iter()
            .map(|(key, queue)| {
                (
                    key.clone(),
                    ResourceStatus {
                        queue_length: queue.pending.len(),
                        has_active: queue.active.is_some(),
                    },
                )
            })
            .collect()
    }

    /// How long the active request for `resource_key` has been running
    pub fn active_elapsed(&self, resource_key: &str) -> Option<Duration> {
        let state = self.inner.state.lock();
        state
            .queues
            .get(resource_key)
            .and_then(|q| q.active.as_ref())
            .map(|a| a.started_at.elapsed())
    }

    /// Drop everything queued for `resource_key`
    ///
    /// Pending requests and the active one (whose handler is aborted)
    /// receive `QUEUE_CLEARED`. Returns how many callers were notified.
    pub fn clear(&self, resource_key: &str) -> usize {
        let removed = self.inner.state.lock().queues.remove(resource_key);
        match removed {
            Some(queue) => notify_cleared(resource_key, queue),
            None => 0,
        }
    }

    /// Clear every resource key
    pub fn clear_all(&self) -> usize {
        let drained: Vec<_> = self.inner.state.lock().queues.drain().collect();
        drained
            .into_iter()
            .map(|(key, queue)| notify_cleared(&key, queue))
            .sum()
    }
}

fn notify_cleared(resource_key: &str, mut queue: ResourceQueue) -> usize {
    let mut callbacks: Vec<ResultCallback> = Vec::new();

    if let Some(mut active) = queue.active.take() {
        if let Some(task) = active.task.take() {
            task.abort();
        }
        if let Some(cb) = active.on_result.take() {
            callbacks.push(cb);
        }
    }
    callbacks.extend(queue.pending.drain(..).map(|r| r.on_result));

    if !callbacks.is_empty() {
        info!(resource = resource_key, count = callbacks.len(), "Queue cleared");
    }

    let count = callbacks.len();
    for cb in callbacks {
        cb(QueueOutcome::Rejected(RejectCode::QueueCleared));
    }
    count
}

// ─────────────────────────────────────────────────────────────────
// Processing
// ─────────────────────────────────────────────────────────────────

impl Inner {
    /// Promote the head of `key`'s queue if its slot is free
    fn process_next(self: &Arc<Self>, key: &str) {
        let mut state = self.state.lock();
        let Some(queue) = state.queues.get_mut(key) else {
            return;
        };
        if queue.active.is_some() {
            return;
        }

        let Some(request) = queue.pending.pop_front() else {
            state.queues.remove(key);
            return;
        };

        let QueuedRequest {
            id,
            client_id,
            payload,
            on_result,
            enqueued_at,
            ..
        } = request;

        debug!(
            request_id = %id,
            resource = key,
            waited_ms = enqueued_at.elapsed().as_millis() as u64,
            "Request active"
        );

        // The slot is claimed before the task exists, so the spawned task
        // can never observe a free slot for its own request
        queue.active = Some(ActiveSlot {
            request_id: id.clone(),
            client_id,
            started_at: Instant::now(),
            on_result: Some(on_result),
            task: None,
        });

        let task = tokio::spawn(Arc::clone(self).execute(key.to_string(), id, payload));
        if let Some(active) = queue.active.as_mut() {
            active.task = Some(task);
        }
    }

    /// Run the handler under the execution deadline, then free the slot
    ///
    /// On timeout the handler future is dropped, which cancels its
    /// outstanding work at the next await point.
    async fn execute(self: Arc<Self>, key: String, request_id: String, payload: Value) {
        let timeout = self.config.request_timeout;
        let handler = Arc::clone(&self.handler);

        let run = AssertUnwindSafe(handler.handle(&key, payload)).catch_unwind();

        let outcome = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(Ok(value))) => QueueOutcome::Completed(value),
            Ok(Ok(Err(e))) => {
                warn!(request_id = %request_id, resource = %key, error = %e, "Request failed");
                QueueOutcome::Failed(e.to_string())
            }
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                error!(request_id = %request_id, resource = %key, panic = %message, "Handler panicked");
                QueueOutcome::Failed(format!("handler panicked: {}", message))
            }
            Err(_) => {
                warn!(
                    request_id = %request_id,
                    resource = %key,
                    timeout_secs = timeout.as_secs(),
                    "Request timed out"
                );
                QueueOutcome::Rejected(RejectCode::Timeout)
            }
        };

        self.finish(&key, &request_id, outcome);
    }

    fn finish(self: &Arc<Self>, key: &str, request_id: &str, outcome: QueueOutcome) {
        let callback = {
            let mut state = self.state.lock();
            let Some(queue) = state.queues.get_mut(key) else {
                return;
            };
            match queue.active.as_ref() {
                Some(active) if active.request_id == request_id => {}
                // Slot was cleared while the handler ran
                _ => return,
            }
            let callback = queue.active.take().and_then(|mut a| {
                debug!(
                    request_id,
                    client = %a.client_id,
                    elapsed_ms = a.started_at.elapsed().as_millis() as u64,
                    "Request finished"
                );
                a.on_result.take()
            });
            if queue.is_idle() {
                state.queues.remove(key);
            }
            callback
        };

        if let Some(cb) = callback {
            cb(outcome);
        }
        self.process_next(key);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Handler whose behaviour is chosen by the payload
    struct TestHandler {
        running: AtomicUsize,
        max_running: AtomicUsize,
        started: PlMutex<Vec<String>>,
    }

    impl TestHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                started: PlMutex::new(Vec::new()),
            })
        }
    }

    struct RunningGuard<'a>(&'a AtomicUsize);

    impl Drop for RunningGuard<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RequestHandler for TestHandler {
        async fn handle(&self, _key: &str, payload: Value) -> Result<Value> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            let _guard = RunningGuard(&self.running);
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.started
                .lock()
                .push(payload["tag"].as_str().unwrap_or_default().to_string());

            if payload["hang"].as_bool().unwrap_or(false) {
                std::future::pending::<()>().await;
            }
            if let Some(ms) = payload["sleep_ms"].as_u64() {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            if payload["fail"].as_bool().unwrap_or(false) {
                return Err(Error::Execution("backend exploded".into()));
            }
            if payload["panic"].as_bool().unwrap_or(false) {
                panic!("handler bug");
            }
            Ok(json!({"echo": payload["tag"]}))
        }
    }

    fn config() -> QueueConfig {
        QueueConfig {
            rate_limit_requests: 10,
            rate_limit_window: Duration::from_secs(60),
            request_timeout: Duration::from_secs(300),
        }
    }

    type Outcomes = Arc<PlMutex<Vec<(String, QueueOutcome)>>>;

    fn recording(id: &str, client: &str, key: &str, payload: Value, out: &Outcomes) -> QueuedRequest {
        let out = Arc::clone(out);
        let rid = id.to_string();
        QueuedRequest::new(id, client, key, payload, move |o| out.lock().push((rid, o)))
    }

    fn outcome_of(out: &Outcomes, id: &str) -> Option<QueueOutcome> {
        out.lock().iter().find(|(r, _)| r == id).map(|(_, o)| o.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_eleventh_request_is_rate_limited() {
        let handler = TestHandler::new();
        let queue = QueueManager::new(config(), handler.clone());
        let out: Outcomes = Default::default();

        for i in 1..=11 {
            let id = format!("r{}", i);
            let accepted = queue.enqueue(recording(&id, "client-a", "llama2", json!({"hang": true}), &out));
            assert_eq!(accepted, i <= 10, "request {}", i);
        }

        assert_eq!(
            outcome_of(&out, "r11"),
            Some(QueueOutcome::Rejected(RejectCode::RateLimited))
        );
        assert_eq!(queue.queue_position("r11", "llama2"), QueuePosition::NotFound);
        assert_eq!(queue.status()["llama2"].queue_length, 9);
        assert_eq!(out.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_positions() {
        let queue = QueueManager::new(config(), TestHandler::new());
        let out: Outcomes = Default::default();

        for id in ["a", "b", "c"] {
            queue.enqueue(recording(id, "client", "phi3", json!({"hang": true}), &out));
        }

        assert_eq!(queue.queue_position("a", "phi3").as_i64(), 0);
        assert_eq!(queue.queue_position("b", "phi3").as_i64(), 1);
        assert_eq!(queue.queue_position("c", "phi3").as_i64(), 2);
        assert_eq!(queue.queue_position("zzz", "phi3").as_i64(), -1);
        assert_eq!(queue.queue_position("a", "other").as_i64(), -1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_shifts_positions() {
        let queue = QueueManager::new(config(), TestHandler::new());
        let out: Outcomes = Default::default();

        for id in ["a", "b", "c"] {
            queue.enqueue(recording(id, "client", "phi3", json!({"hang": true}), &out));
        }

        assert!(queue.cancel("b", "phi3"));
        assert_eq!(outcome_of(&out, "b"), Some(QueueOutcome::Rejected(RejectCode::Cancelled)));
        assert_eq!(queue.queue_position("c", "phi3"), QueuePosition::Pending(1));

        // Unknown ids and the active request are not cancellable
        assert!(!queue.cancel("nope", "phi3"));
        assert!(!queue.cancel("a", "phi3"));
        assert!(!queue.cancel("c", "unknown-model"));
        assert_eq!(queue.queue_position("a", "phi3"), QueuePosition::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_next_starts() {
        let handler = TestHandler::new();
        let queue = QueueManager::new(config(), handler.clone());
        let out: Outcomes = Default::default();

        queue.enqueue(recording("stuck", "c", "llama2", json!({"hang": true, "tag": "stuck"}), &out));
        queue.enqueue(recording("next", "c", "llama2", json!({"hang": true, "tag": "next"}), &out));

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(outcome_of(&out, "stuck").is_none());
        assert_eq!(queue.queue_position("stuck", "llama2"), QueuePosition::Active);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            outcome_of(&out, "stuck"),
            Some(QueueOutcome::Rejected(RejectCode::Timeout))
        );
        assert_eq!(queue.queue_position("next", "llama2"), QueuePosition::Active);

        tokio::task::yield_now().await;
        assert_eq!(*handler.started.lock(), vec!["stuck", "next"]);
        // The timed-out handler future was dropped
        assert_eq!(handler.running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_active_per_key() {
        let handler = TestHandler::new();
        let queue = QueueManager::new(config(), handler.clone());

        let mut waits = Vec::new();
        for i in 0..5 {
            let q = queue.clone();
            waits.push(tokio::spawn(async move {
                q.enqueue_and_wait(format!("r{}", i), format!("c{}", i), "llama2", json!({"sleep_ms": 100}))
                    .await
            }));
        }
        for w in waits {
            assert!(matches!(w.await.unwrap(), QueueOutcome::Completed(_)));
        }

        assert_eq!(handler.max_running.load(Ordering::SeqCst), 1);
        assert!(queue.status().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_run_concurrently() {
        let handler = TestHandler::new();
        let queue = QueueManager::new(config(), handler.clone());
        let out: Outcomes = Default::default();

        queue.enqueue(recording("a", "c", "llama2", json!({"hang": true}), &out));
        queue.enqueue(recording("b", "c", "phi3", json!({"hang": true}), &out));
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let status = queue.status();
        assert!(status["llama2"].has_active);
        assert!(status["phi3"].has_active);
        assert_eq!(handler.max_running.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_fails_and_queue_advances() {
        let handler = TestHandler::new();
        let queue = QueueManager::new(config(), handler.clone());
        let out: Outcomes = Default::default();

        queue.enqueue(recording("p", "c", "llama2", json!({"panic": true, "tag": "p"}), &out));
        queue.enqueue(recording("n", "c", "llama2", json!({"hang": true, "tag": "n"}), &out));

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        match outcome_of(&out, "p") {
            Some(QueueOutcome::Failed(msg)) => assert!(msg.contains("handler bug"), "{}", msg),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(queue.queue_position("n", "llama2"), QueuePosition::Active);
        assert_eq!(handler.running.load(Ordering::SeqCst), 1);

        // The next caller is not stuck behind the panicked slot
        let outcome = queue.enqueue_and_wait("w", "c", "phi3", json!({"tag": "w"})).await;
        assert!(matches!(outcome, QueueOutcome::Completed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_delivered_and_queue_advances() {
        let queue = QueueManager::new(config(), TestHandler::new());

        let failed = queue
            .enqueue_and_wait("f", "c", "llama2", json!({"fail": true}))
            .await;
        assert!(matches!(failed, QueueOutcome::Failed(ref m) if m.contains("backend exploded")));

        let ok = queue.enqueue_and_wait("ok", "c", "llama2", json!({"tag": "x"})).await;
        assert_eq!(ok, QueueOutcome::Completed(json!({"echo": "x"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_rejects_active_and_pending() {
        let handler = TestHandler::new();
        let queue = QueueManager::new(config(), handler.clone());
        let out: Outcomes = Default::default();

        for id in ["a", "b", "c"] {
            queue.enqueue(recording(id, "client", "phi3", json!({"hang": true}), &out));
        }
        queue.enqueue(recording("d", "client", "llama2", json!({"hang": true}), &out));
        tokio::task::yield_now().await;

        assert_eq!(queue.clear("phi3"), 3);
        for id in ["a", "b", "c"] {
            assert_eq!(
                outcome_of(&out, id),
                Some(QueueOutcome::Rejected(RejectCode::QueueCleared))
            );
        }
        assert!(outcome_of(&out, "d").is_none());

        assert_eq!(queue.clear_all(), 1);
        assert!(queue.status().is_empty());

        // Aborted handlers released their guard
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(handler.running.load(Ordering::SeqCst), 0);
    }
}
