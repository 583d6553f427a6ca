// Backoff, retry and reconnection helpers shared by the transport, the
// negotiation engine, the lifecycle manager and the delivery pipeline.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::Rng;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Broker (re)connection.
    pub const BROKER: RetryConfig = RetryConfig {
        max_attempts: 10,
        initial_delay: Duration::from_millis(1000),
        max_delay: Duration::from_millis(60_000),
        backoff_multiplier: 2.0,
        add_jitter: true,
    };

    /// Peer connection operations and peer reconnection.
    pub const PEER: RetryConfig = RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(500),
        max_delay: Duration::from_millis(10_000),
        backoff_multiplier: 2.0,
        add_jitter: true,
    };

    pub const MESSAGE: RetryConfig = RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(2000),
        max_delay: Duration::from_millis(15_000),
        backoff_multiplier: 2.0,
        add_jitter: true,
    };

    pub const DEFAULT: RetryConfig = RetryConfig {
        max_attempts: 5,
        initial_delay: Duration::from_millis(1000),
        max_delay: Duration::from_millis(30_000),
        backoff_multiplier: 2.0,
        add_jitter: true,
    };

    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Un-jittered delay after failed attempt `attempt` (1-based):
    /// `initial * multiplier^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn wait_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.add_jitter {
            jittered(delay)
        } else {
            delay
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig::DEFAULT
    }
}

/// Spread a delay uniformly over [75%, 125%) of its value.
pub fn jittered(delay: Duration) -> Duration {
    let factor: f64 = 0.75 + rand::thread_rng().gen::<f64>() * 0.5;
    Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
}

/// Result of [`retry`]: how many attempts ran and how the last one ended.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub attempts: u32,
    pub result: Result<T, E>,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

type RetryPredicate<'a, E> = Box<dyn Fn(&E) -> bool + Send + Sync + 'a>;
type RetryObserver<'a, E> = Box<dyn FnMut(u32, &E, Duration) + Send + 'a>;

/// Optional hooks for [`retry`].
pub struct RetryHooks<'a, E> {
    retry_if: Option<RetryPredicate<'a, E>>,
    on_retry: Option<RetryObserver<'a, E>>,
}

impl<'a, E> Default for RetryHooks<'a, E> {
    fn default() -> Self {
        RetryHooks { retry_if: None, on_retry: None }
    }
}

impl<'a, E> RetryHooks<'a, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only errors accepted by `predicate` are retried; others end the run.
    pub fn retry_if(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'a) -> Self {
        self.retry_if = Some(Box::new(predicate));
        self
    }

    /// Called with (failed attempt, error, delay before the next attempt).
    pub fn on_retry(mut self, observer: impl FnMut(u32, &E, Duration) + Send + 'a) -> Self {
        self.on_retry = Some(Box::new(observer));
        self
    }
}

/// Run `operation` until it succeeds, `max_attempts` is reached or the error
/// is not retryable. The closure receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(
    mut operation: F,
    config: &RetryConfig,
    mut hooks: RetryHooks<'_, E>,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("Operation succeeded on attempt {}/{}", attempt, max_attempts);
                }
                return RetryOutcome { attempts: attempt, result: Ok(value) };
            }
            Err(e) => {
                let retryable = hooks.retry_if.as_ref().map(|p| p(&e)).unwrap_or(true);
                if !retryable || attempt >= max_attempts {
                    if retryable {
                        warn!("Operation failed after {} attempts: {}", attempt, e);
                    } else {
                        debug!("Operation failed with non-retryable error: {}", e);
                    }
                    return RetryOutcome { attempts: attempt, result: Err(e) };
                }

                let delay = config.wait_for_attempt(attempt);
                debug!(
                    "Attempt {}/{} failed: {} (retrying in {}ms)",
                    attempt,
                    max_attempts,
                    e,
                    delay.as_millis()
                );
                if let Some(observer) = hooks.on_retry.as_mut() {
                    observer(attempt, &e, delay);
                }
                drop(e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{label} timed out after {}ms", .after.as_millis())]
pub struct TimeoutError {
    pub label: String,
    pub after: Duration,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum WaitError {
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error("{0} was aborted")]
    Aborted(String),
}

/// Wait for `operation` at most `limit`. The operation runs on its own task and
/// is left running when the timer wins; only the wait is abandoned.
pub async fn with_timeout<F>(operation: F, limit: Duration, label: &str) -> Result<F::Output, WaitError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let task = tokio::spawn(operation);
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(join_error)) => {
            error!("{} task ended abnormally: {}", label, join_error);
            Err(WaitError::Aborted(label.to_string()))
        }
        Err(_) => Err(WaitError::Timeout(TimeoutError {
            label: label.to_string(),
            after: limit,
        })),
    }
}

type AttemptHook = Box<dyn Fn(u32, Duration) + Send + Sync>;
type PlainHook = Box<dyn Fn() + Send + Sync>;
type GiveUpHook = Box<dyn Fn(u32) + Send + Sync>;

/// Callbacks for [`ReconnectionManager::reconnect_with_backoff`].
#[derive(Default)]
pub struct ReconnectHooks {
    on_attempt: Option<AttemptHook>,
    on_success: Option<PlainHook>,
    on_give_up: Option<GiveUpHook>,
}

impl ReconnectHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called before each attempt with (attempt, delay that follows a failure).
    pub fn on_attempt(mut self, hook: impl Fn(u32, Duration) + Send + Sync + 'static) -> Self {
        self.on_attempt = Some(Box::new(hook));
        self
    }

    pub fn on_success(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_success = Some(Box::new(hook));
        self
    }

    /// Called with the number of attempts made.
    pub fn on_give_up(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_give_up = Some(Box::new(hook));
        self
    }
}

#[derive(Default)]
struct ReconnectState {
    attempt: AtomicU32,
    reconnecting: AtomicBool,
    generation: AtomicU64,
    wake: Notify,
}

/// Runs at most one reconnection loop at a time. Clones share the same loop.
#[derive(Clone, Default)]
pub struct ReconnectionManager {
    state: Arc<ReconnectState>,
}

impl ReconnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.state.reconnecting.load(Ordering::SeqCst)
    }

    pub fn attempt(&self) -> u32 {
        self.state.attempt.load(Ordering::SeqCst)
    }

    /// Stop the running loop (if any) after its current step.
    pub fn cancel(&self) {
        if self.state.reconnecting.swap(false, Ordering::SeqCst) {
            info!("Reconnection cancelled");
        }
        self.state.generation.fetch_add(1, Ordering::SeqCst);
        self.state.wake.notify_waiters();
    }

    /// Forget attempt history and release the single-loop guard.
    pub fn reset(&self) {
        self.state.attempt.store(0, Ordering::SeqCst);
        self.cancel();
    }

    /// Call `connect_fn` with growing delays until it reports success, attempts
    /// run out, or the loop is cancelled. Returns false immediately when a loop
    /// is already running.
    pub async fn reconnect_with_backoff<F, Fut>(
        &self,
        config: RetryConfig,
        mut connect_fn: F,
        hooks: ReconnectHooks,
    ) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        if self.state.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("Reconnection already in progress");
            return false;
        }
        let generation = self.state.generation.load(Ordering::SeqCst);
        let still_active = |state: &ReconnectState| {
            state.reconnecting.load(Ordering::SeqCst) && state.generation.load(Ordering::SeqCst) == generation
        };

        let max_attempts = config.max_attempts.max(1);
        self.state.attempt.store(0, Ordering::SeqCst);

        loop {
            let attempt = self.state.attempt.fetch_add(1, Ordering::SeqCst) + 1;
            let delay = config.wait_for_attempt(attempt);
            info!("Reconnection attempt {}/{}", attempt, max_attempts);
            if let Some(hook) = &hooks.on_attempt {
                hook(attempt, delay);
            }

            let connected = connect_fn().await;
            if connected {
                info!("Reconnected after {} attempt(s)", attempt);
                self.finish(generation);
                self.state.attempt.store(0, Ordering::SeqCst);
                if let Some(hook) = &hooks.on_success {
                    hook();
                }
                return true;
            }

            // Registered before the check so a cancel() in between still wakes us
            let wake = self.state.wake.notified();
            if !still_active(&self.state) {
                debug!("Reconnection loop stopped after attempt {}", attempt);
                return false;
            }

            if attempt >= max_attempts {
                error!("Giving up reconnection after {} attempts", attempt);
                self.finish(generation);
                if let Some(hook) = &hooks.on_give_up {
                    hook(attempt);
                }
                return false;
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wake => {}
            }
            if !still_active(&self.state) {
                debug!("Reconnection loop cancelled while waiting");
                return false;
            }
        }
    }

    fn finish(&self, generation: u64) {
        if self.state.generation.load(Ordering::SeqCst) == generation {
            self.state.reconnecting.store(false, Ordering::SeqCst);
        }
    }
}
