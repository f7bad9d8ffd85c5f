//! Priority-ordered, rate-limited, retrying request dispatcher.
//!
//! Callers enqueue a fetch closure for a provider and await its outcome. A
//! single dispatch loop owns the decision of *when* each request runs:
//!
//! 1. Per provider, only the highest non-empty lane is eligible
//! 2. Within a lane, requests leave in enqueue order
//! 3. A request leaves only when the provider's rate-limit window has room
//! 4. Each attempt runs on its own task under the per-call timeout
//!
//! Failed attempts are classified through the [`RetryPolicy`]. Retryable
//! failures go back to their lane after an exponential backoff; upstream
//! rate-limit rejections also saturate the provider's window.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::{sleep, sleep_until, timeout, Instant};

use super::queue::{Priority, ProviderQueue, QueuedRequest, TypedJob};
use super::retry::RetryPolicy;
use super::window::RateLimitWindow;
use crate::errors::MarketDataError;
use crate::models::ProviderId;
use crate::provider::{duration_ms, RateLimit};

/// Dispatcher configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatcherSettings {
    /// Hard timeout of a single attempt.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Total attempts including the first one.
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// How long to saturate a window after an upstream rate-limit rejection
    /// that carried no retry hint.
    #[serde(with = "duration_ms")]
    pub rate_limit_backoff: Duration,
    /// Window applied to providers that were never registered.
    pub default_rate_limit: RateLimit,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            rate_limit_backoff: Duration::from_secs(60),
            default_rate_limit: RateLimit::default(),
        }
    }
}

impl DispatcherSettings {
    /// Retry policy described by these settings (transient errors only).
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.initial_backoff)
            .with_max_backoff(self.max_backoff)
            .with_multiplier(self.backoff_multiplier)
    }
}

/// Queue depth and window usage of one provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderQueueStats {
    pub provider: String,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub in_window: usize,
    pub limit: usize,
}

/// Snapshot of dispatcher counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherStats {
    /// Attempts started (retries included).
    pub dispatched: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub providers: Vec<ProviderQueueStats>,
}

#[derive(Default)]
struct DispatchCounters {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

struct DispatchState {
    providers: HashMap<ProviderId, ProviderQueue>,
    closed: bool,
}

struct DispatcherShared {
    state: Mutex<DispatchState>,
    wakeup: Notify,
    settings: DispatcherSettings,
    policy: RetryPolicy,
    next_seq: AtomicU64,
    counters: DispatchCounters,
}

impl DispatcherShared {
    /// Lock the dispatch state, recovering from poison if necessary.
    fn lock_state(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Dispatcher state mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn queue_for<'a>(
        &self,
        state: &'a mut DispatchState,
        provider: &ProviderId,
    ) -> &'a mut ProviderQueue {
        state
            .providers
            .entry(provider.clone())
            .or_insert_with(|| {
                ProviderQueue::new(RateLimitWindow::new(&self.settings.default_rate_limit))
            })
    }

    /// Put a request into its lane and wake the loop.
    fn push(&self, request: QueuedRequest) {
        let mut state = self.lock_state();
        if state.closed {
            drop(state);
            request.job.reject(MarketDataError::DispatcherClosed);
            return;
        }
        self.queue_for(&mut state, &request.provider).push(request);
        drop(state);
        self.wakeup.notify_one();
    }

    fn saturate(&self, provider: &ProviderId, until: Instant) {
        let mut state = self.lock_state();
        self.queue_for(&mut state, provider).window.saturate(until);
    }

    /// Pop every request that may be dispatched at `now`.
    ///
    /// Returns the requests in priority order, plus the earliest instant a
    /// blocked provider frees up.
    fn take_ready(
        &self,
        state: &mut DispatchState,
        now: Instant,
    ) -> (Vec<QueuedRequest>, Option<Instant>) {
        let mut ready = Vec::new();
        let mut next_wake: Option<Instant> = None;

        for (provider, queue) in state.providers.iter_mut() {
            while let Some(priority) = queue.head_priority() {
                if queue
                    .front(priority)
                    .is_some_and(|request| request.job.is_abandoned())
                {
                    if let Some(request) = queue.pop(priority) {
                        debug!(
                            "Dropping abandoned request '{}' for '{}'",
                            request.label, provider
                        );
                    }
                    continue;
                }

                match queue.window.try_acquire(now) {
                    Ok(()) => {
                        if let Some(request) = queue.pop(priority) {
                            ready.push(request);
                        }
                    }
                    Err(at) => {
                        debug!(
                            "Rate limit window for '{}' saturated, deferring {} lane until {:?}",
                            provider,
                            priority,
                            at.saturating_duration_since(now)
                        );
                        next_wake = Some(next_wake.map_or(at, |current| current.min(at)));
                        break;
                    }
                }
            }
        }

        ready.sort_by_key(|request| (request.priority, request.seq));
        (ready, next_wake)
    }

    fn close(&self) {
        let mut state = self.lock_state();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.wakeup.notify_one();
    }
}

/// Run one attempt of `request`, then retry, requeue, or settle it.
async fn execute(shared: Arc<DispatcherShared>, mut request: QueuedRequest) {
    request.attempts += 1;
    shared.counters.dispatched.fetch_add(1, Ordering::Relaxed);
    debug!(
        "Dispatching '{}' to '{}' (attempt {}, {} lane, queued {:?})",
        request.label,
        request.provider,
        request.attempts,
        request.priority,
        request.enqueued_at.elapsed()
    );

    let outcome = match timeout(shared.settings.request_timeout, request.job.attempt()).await {
        Ok(outcome) => outcome,
        Err(_) => Err(MarketDataError::Timeout {
            provider: request.provider.to_string(),
        }),
    };

    let error = match outcome {
        Ok(()) => {
            shared.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        Err(error) => error,
    };

    let rate_limited = matches!(error, MarketDataError::RateLimited { .. });
    if rate_limited {
        let hold = error
            .retry_after()
            .unwrap_or(shared.settings.rate_limit_backoff);
        warn!(
            "Provider '{}' rate limited '{}', holding its window for {:?}",
            request.provider, request.label, hold
        );
        shared.saturate(&request.provider, Instant::now() + hold);
    }

    if shared.policy.should_retry(&error, request.attempts) {
        shared.counters.retried.fetch_add(1, Ordering::Relaxed);
        // A saturated window already delays the next attempt.
        let delay = if rate_limited {
            Duration::ZERO
        } else {
            shared.policy.backoff(request.attempts)
        };
        info!(
            "Retrying '{}' on '{}' in {:?} (attempt {}/{}): {}",
            request.label,
            request.provider,
            delay,
            request.attempts,
            shared.policy.max_attempts,
            error
        );
        if !delay.is_zero() {
            sleep(delay).await;
        }
        shared.push(request);
        return;
    }

    shared.counters.failed.fetch_add(1, Ordering::Relaxed);
    if shared.policy.is_retryable(&error) {
        warn!(
            "Giving up on '{}' for '{}' after {} attempts: {}",
            request.label, request.provider, request.attempts, error
        );
    } else {
        debug!(
            "Permanent failure for '{}' on '{}': {}",
            request.label, request.provider, error
        );
    }
    request.job.reject(error);
}

/// The dispatch loop. Exits once the dispatcher is closed.
async fn run(shared: Arc<DispatcherShared>) {
    debug!("Request dispatcher loop started");
    loop {
        let (ready, next_wake) = {
            let mut state = shared.lock_state();
            if state.closed {
                let rejected: Vec<QueuedRequest> = state
                    .providers
                    .values_mut()
                    .flat_map(ProviderQueue::drain)
                    .collect();
                drop(state);
                if !rejected.is_empty() {
                    info!(
                        "Request dispatcher closed, rejecting {} queued requests",
                        rejected.len()
                    );
                }
                for request in rejected {
                    request.job.reject(MarketDataError::DispatcherClosed);
                }
                debug!("Request dispatcher loop stopped");
                return;
            }
            shared.take_ready(&mut state, Instant::now())
        };

        if !ready.is_empty() {
            for request in ready {
                tokio::spawn(execute(Arc::clone(&shared), request));
            }
            continue;
        }

        match next_wake {
            Some(at) => {
                tokio::select! {
                    _ = shared.wakeup.notified() => {}
                    _ = sleep_until(at) => {}
                }
            }
            None => shared.wakeup.notified().await,
        }
    }
}

/// Closes the dispatcher when the last handle is dropped.
struct ShutdownGuard {
    shared: Arc<DispatcherShared>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Handle to a running dispatcher. Cloning shares the same loop.
#[derive(Clone)]
pub struct RequestDispatcher {
    shared: Arc<DispatcherShared>,
    _guard: Arc<ShutdownGuard>,
}

impl RequestDispatcher {
    /// Start a dispatcher using the settings' retry policy.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(settings: DispatcherSettings) -> Self {
        let policy = settings.retry_policy();
        Self::with_policy(settings, policy)
    }

    /// Start a dispatcher with an explicit retry policy.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_policy(settings: DispatcherSettings, policy: RetryPolicy) -> Self {
        let shared = Arc::new(DispatcherShared {
            state: Mutex::new(DispatchState {
                providers: HashMap::new(),
                closed: false,
            }),
            wakeup: Notify::new(),
            settings,
            policy,
            next_seq: AtomicU64::new(0),
            counters: DispatchCounters::default(),
        });
        tokio::spawn(run(Arc::clone(&shared)));
        Self {
            _guard: Arc::new(ShutdownGuard {
                shared: Arc::clone(&shared),
            }),
            shared,
        }
    }

    /// Configure the rate-limit window of a provider.
    ///
    /// Replaces any existing window; queued requests are kept.
    pub fn register_provider(&self, provider: ProviderId, rate_limit: &RateLimit) {
        info!(
            "Registering provider '{}' with {} requests per {:?}",
            provider, rate_limit.max_requests, rate_limit.period
        );
        let mut state = self.shared.lock_state();
        let window = RateLimitWindow::new(rate_limit);
        match state.providers.get_mut(&provider) {
            Some(queue) => queue.window = window,
            None => {
                state.providers.insert(provider, ProviderQueue::new(window));
            }
        }
    }

    /// Queue `call` for `provider` and return a future of its outcome.
    ///
    /// The request is queued immediately, before the returned future is
    /// first polled. `call` may run several times when attempts are retried.
    pub fn enqueue<T, F, Fut>(
        &self,
        provider: &ProviderId,
        priority: Priority,
        label: impl Into<String>,
        call: F,
    ) -> impl Future<Output = Result<T, MarketDataError>> + Send + 'static
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, MarketDataError>> + Send + 'static,
    {
        let (job, rx) = TypedJob::new(call);
        self.shared.push(QueuedRequest {
            provider: provider.clone(),
            priority,
            label: label.into(),
            enqueued_at: Instant::now(),
            seq: self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
            attempts: 0,
            job: Box::new(job),
        });

        async move { rx.await.unwrap_or(Err(MarketDataError::DispatcherClosed)) }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.shared.policy
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.shared.settings
    }

    pub fn stats(&self) -> DispatcherStats {
        let now = Instant::now();
        let mut providers: Vec<ProviderQueueStats> = {
            let mut state = self.shared.lock_state();
            state
                .providers
                .iter_mut()
                .map(|(provider, queue)| ProviderQueueStats {
                    provider: provider.to_string(),
                    high: queue.queued(Priority::High),
                    medium: queue.queued(Priority::Medium),
                    low: queue.queued(Priority::Low),
                    in_window: queue.window.in_window(now),
                    limit: queue.window.limit(),
                })
                .collect()
        };
        providers.sort_by(|a, b| a.provider.cmp(&b.provider));

        let counters = &self.shared.counters;
        DispatcherStats {
            dispatched: counters.dispatched.load(Ordering::Relaxed),
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            providers,
        }
    }

    /// Stop the loop. Queued requests and later enqueues are rejected with
    /// [`MarketDataError::DispatcherClosed`]; attempts already running finish.
    pub fn shutdown(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock_state().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use std::sync::atomic::AtomicU32;

    fn settings() -> DispatcherSettings {
        DispatcherSettings {
            request_timeout: Duration::from_secs(5),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            rate_limit_backoff: Duration::from_secs(2),
            default_rate_limit: RateLimit::new(100, Duration::from_secs(1)),
        }
    }

    fn provider() -> ProviderId {
        Cow::Borrowed("TEST")
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_defers_third_request() {
        let dispatcher = RequestDispatcher::start(settings());
        dispatcher.register_provider(provider(), &RateLimit::new(2, Duration::from_millis(1000)));
        let start = Instant::now();

        let requests: Vec<_> = (0..3)
            .map(|i| {
                dispatcher.enqueue(&provider(), Priority::Medium, format!("r{i}"), move || async move {
                    Ok(Instant::now())
                })
            })
            .collect();
        let times: Vec<Instant> = futures::future::join_all(requests)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert!(times[0].duration_since(start) < Duration::from_millis(10));
        assert!(times[1].duration_since(start) < Duration::from_millis(10));
        assert!(times[2].duration_since(start) >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retries_then_succeeds() {
        let dispatcher = RequestDispatcher::start(settings());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = dispatcher
            .enqueue(&provider(), Priority::High, "flaky", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(MarketDataError::ServerError {
                            provider: "TEST".to_string(),
                            status: 503,
                            message: "unavailable".to_string(),
                        })
                    } else {
                        Ok("price")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("price"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let stats = dispatcher.stats();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_surface_last_error() {
        let dispatcher = RequestDispatcher::start(settings());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = dispatcher
            .enqueue(&provider(), Priority::High, "down", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(MarketDataError::Network {
                        provider: "TEST".to_string(),
                        message: "reset".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(MarketDataError::Network { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let dispatcher = RequestDispatcher::start(settings());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = dispatcher
            .enqueue(&provider(), Priority::High, "bad", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(MarketDataError::NotFound("NOPE".to_string())) }
            })
            .await;

        assert_eq!(result, Err(MarketDataError::NotFound("NOPE".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.stats().retried, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_transient() {
        let mut settings = settings();
        settings.request_timeout = Duration::from_millis(50);
        settings.max_attempts = 2;
        let dispatcher = RequestDispatcher::start(settings);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = dispatcher
            .enqueue(&provider(), Priority::Low, "slow", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
            })
            .await;

        assert_eq!(
            result,
            Err(MarketDataError::Timeout {
                provider: "TEST".to_string()
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_rate_limit_saturates_window() {
        let dispatcher = RequestDispatcher::start(settings());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let start = Instant::now();

        let result = dispatcher
            .enqueue(&provider(), Priority::High, "limited", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(MarketDataError::RateLimited {
                            provider: "TEST".to_string(),
                            retry_after: Some(Duration::from_secs(3)),
                        })
                    } else {
                        Ok(Instant::now())
                    }
                }
            })
            .await
            .unwrap();

        assert!(result.duration_since(start) >= Duration::from_secs(3));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_priority_serviced_before_earlier_low() {
        let dispatcher = RequestDispatcher::start(settings());
        dispatcher.register_provider(provider(), &RateLimit::new(1, Duration::from_millis(100)));
        let order = Arc::new(Mutex::new(Vec::new()));

        let record = |name: &'static str| {
            let order = order.clone();
            move || {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(name);
                    Ok(())
                }
            }
        };

        let low = dispatcher.enqueue(&provider(), Priority::Low, "low", record("low"));
        let medium = dispatcher.enqueue(&provider(), Priority::Medium, "medium", record("medium"));
        let high = dispatcher.enqueue(&provider(), Priority::High, "high", record("high"));
        let (a, b, c) = tokio::join!(low, medium, high);
        assert!(a.is_ok() && b.is_ok() && c.is_ok());

        assert_eq!(*order.lock().unwrap(), vec!["high", "medium", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_within_lane() {
        let dispatcher = RequestDispatcher::start(settings());
        dispatcher.register_provider(provider(), &RateLimit::new(1, Duration::from_millis(10)));
        let order = Arc::new(Mutex::new(Vec::new()));

        let requests: Vec<_> = (0..5)
            .map(|i| {
                let order = order.clone();
                dispatcher.enqueue(&provider(), Priority::Medium, format!("r{i}"), move || {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(i);
                        Ok(())
                    }
                })
            })
            .collect();
        futures::future::join_all(requests).await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_providers_have_independent_windows() {
        let dispatcher = RequestDispatcher::start(settings());
        let slow: ProviderId = Cow::Borrowed("SLOW");
        let fast: ProviderId = Cow::Borrowed("FAST");
        dispatcher.register_provider(slow.clone(), &RateLimit::new(1, Duration::from_secs(10)));
        dispatcher.register_provider(fast.clone(), &RateLimit::new(10, Duration::from_secs(10)));
        let start = Instant::now();

        let first = dispatcher.enqueue(&slow, Priority::High, "s1", || async { Ok(Instant::now()) });
        let second = dispatcher.enqueue(&slow, Priority::High, "s2", || async { Ok(Instant::now()) });
        let other = dispatcher.enqueue(&fast, Priority::Low, "f1", || async { Ok(Instant::now()) });

        let other_at = other.await.unwrap();
        assert!(other_at.duration_since(start) < Duration::from_millis(10));
        first.await.unwrap();
        let second_at = second.await.unwrap();
        assert!(second_at.duration_since(start) >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_queued_and_new_requests() {
        let dispatcher = RequestDispatcher::start(settings());
        dispatcher.register_provider(provider(), &RateLimit::new(1, Duration::from_secs(60)));

        let first = dispatcher.enqueue(&provider(), Priority::High, "first", || async { Ok(1) });
        let queued = dispatcher.enqueue(&provider(), Priority::High, "queued", || async { Ok(2) });
        assert_eq!(first.await, Ok(1));

        dispatcher.shutdown();
        assert_eq!(queued.await, Err(MarketDataError::DispatcherClosed));
        assert!(dispatcher.is_closed());

        let late = dispatcher.enqueue(&provider(), Priority::High, "late", || async { Ok(3) });
        assert_eq!(late.await, Err(MarketDataError::DispatcherClosed));
    }
}
