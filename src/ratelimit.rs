//! Rate limit controller and backoff policy.
//!
//! Every gateway call goes through [`RateLimitController::execute`]. The
//! controller tracks the remaining quota, turns throttling into a `Wait`
//! the driver can sleep on, and retries transient failures with jittered
//! exponential backoff. It never returns an error: every outcome is a value.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::gateway::{GatewayError, Metered, QuotaSnapshot};

/// Exponential backoff curve with proportional jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    /// Fraction of the nominal delay, applied as +/- uniform noise
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given retry (1 = first retry), without jitter
    pub fn nominal(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(32) as i32;
        let secs = self.base.as_secs_f64() * self.factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.cap.as_secs_f64()))
    }

    /// Jittered delay before the given retry, never above `cap`
    pub fn delay(&self, retry: u32) -> Duration {
        let nominal = self.nominal(retry).as_secs_f64();
        let noise = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        let secs = (nominal * (1.0 + noise)).clamp(0.0, self.cap.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Execute an operation with exponential backoff retry.
/// Returns the last error if all attempts fail.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &BackoffPolicy,
    max_attempts: u32,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                let delay = policy.delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Retries after the first attempt for transient failures
    pub max_retries: u32,
    /// Upper bound on a single `Wait`
    pub max_wait: Duration,
    /// Floor on a throttle wait, covers clock skew against the reset header
    pub min_wait: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_wait: Duration::from_secs(2 * 60 * 60),
            min_wait: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    NotFound,
    TransientExhausted { attempts: u32, last_error: String },
}

/// Result of a controlled call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome<T> {
    Ready(T),
    /// Throttled: nothing useful can be done before this elapses
    Wait(Duration),
    Failed(CallFailure),
}

#[derive(Debug, Default)]
struct QuotaState {
    remaining: Option<u32>,
    limit: Option<u32>,
    reset_at: Option<DateTime<Utc>>,
    throttled_until: Option<DateTime<Utc>>,
}

/// Process-wide quota tracker shared by every fetch
pub struct RateLimitController {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<QuotaState>,
}

impl RateLimitController {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(QuotaState::default()),
        }
    }

    /// Active throttle deadline, if any
    pub fn throttled_until(&self) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        let state = self.state.lock().unwrap();
        state.throttled_until.filter(|until| *until > now)
    }

    /// Last known quota: (remaining, limit)
    pub fn quota(&self) -> (Option<u32>, Option<u32>) {
        let state = self.state.lock().unwrap();
        (state.remaining, state.limit)
    }

    /// Restore a throttle that was persisted before a restart
    pub fn restore_throttle(&self, until: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        if state.throttled_until.map(|t| t < until).unwrap_or(true) {
            state.throttled_until = Some(until);
        }
    }

    /// Run one gateway call under quota control
    pub async fn execute<T, F, Fut>(&self, mut call: F) -> CallOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Metered<T>, GatewayError>>,
    {
        if let Some(wait) = self.pending_wait() {
            return CallOutcome::Wait(wait);
        }

        let attempts = self.config.max_retries + 1;
        let mut attempt = 1;

        loop {
            match call().await {
                Ok(metered) => {
                    self.record_success(metered.quota);
                    return CallOutcome::Ready(metered.value);
                }
                Err(GatewayError::RateLimited { reset_at }) => {
                    return CallOutcome::Wait(self.record_throttle(reset_at));
                }
                Err(GatewayError::NotFound) => {
                    return CallOutcome::Failed(CallFailure::NotFound);
                }
                Err(GatewayError::Transient(error)) => {
                    if attempt >= attempts {
                        warn!(attempts = attempt, %error, "transient failure, retries exhausted");
                        return CallOutcome::Failed(CallFailure::TransientExhausted {
                            attempts: attempt,
                            last_error: error,
                        });
                    }
                    let delay = self.config.backoff.delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, %error, "transient failure, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Wait still owed from an earlier throttle or an exhausted quota
    fn pending_wait(&self) -> Option<Duration> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();

        match state.throttled_until {
            Some(until) if until > now => return Some(self.clamp_wait(until, now)),
            Some(_) => state.throttled_until = None,
            None => {}
        }

        match (state.remaining, state.reset_at) {
            (Some(0), Some(reset)) if reset > now => Some(self.clamp_wait(reset, now)),
            (Some(0), _) => {
                // Window rolled over; the next response will report fresh numbers
                state.remaining = None;
                None
            }
            _ => None,
        }
    }

    fn record_success(&self, quota: Option<QuotaSnapshot>) {
        let mut state = self.state.lock().unwrap();
        state.throttled_until = None;
        match quota {
            Some(q) => {
                state.remaining = Some(q.remaining);
                state.limit = Some(q.limit);
                state.reset_at = Some(q.reset_at);
            }
            None => {
                state.remaining = state.remaining.map(|r| r.saturating_sub(1));
            }
        }
    }

    fn record_throttle(&self, reset_at: DateTime<Utc>) -> Duration {
        let now = self.clock.now();
        let floor = now
            + chrono::Duration::from_std(self.config.min_wait).unwrap_or_else(|_| chrono::Duration::zero());
        let until = reset_at.max(floor);
        if until > reset_at {
            debug!(%reset_at, %until, "throttle reset already due, waiting the minimum");
        }
        let mut state = self.state.lock().unwrap();
        state.remaining = Some(0);
        state.reset_at = Some(until);
        state.throttled_until = Some(until);
        self.clamp_wait(until, now)
    }

    fn clamp_wait(&self, until: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        (until - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(self.config.max_wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn controller(clock: Arc<ManualClock>) -> RateLimitController {
        RateLimitController::new(RateLimitConfig::default(), clock)
    }

    #[test]
    fn test_backoff_curve() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.nominal(1), Duration::from_secs(1));
        assert_eq!(policy.nominal(2), Duration::from_secs(2));
        assert_eq!(policy.nominal(4), Duration::from_secs(8));
        // Capped
        assert_eq!(policy.nominal(10), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let policy = BackoffPolicy::default();
        for _ in 0..100 {
            let d = policy.delay(2).as_secs_f64();
            assert!((1.6..=2.4).contains(&d), "delay {} out of range", d);
            // Jitter never pushes past the cap
            assert!(policy.delay(12) <= Duration::from_secs(60));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(&BackoffPolicy::default(), 4, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("attempt {}", n)) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(result.unwrap_err(), "attempt 3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let clock = Arc::new(ManualClock::default());
        let rl = controller(clock);
        let calls = AtomicU32::new(0);

        let outcome = rl
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(GatewayError::Transient("502".into()))
                    } else {
                        Ok(Metered::bare(42))
                    }
                }
            })
            .await;

        assert_eq!(outcome, CallOutcome::Ready(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhausted() {
        let clock = Arc::new(ManualClock::default());
        let rl = controller(clock);
        let calls = AtomicU32::new(0);

        let outcome: CallOutcome<()> = rl
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::Transient("connection reset".into())) }
            })
            .await;

        // One attempt plus max_retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            outcome,
            CallOutcome::Failed(CallFailure::TransientExhausted {
                attempts: 4,
                last_error: "connection reset".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_immediate() {
        let rl = controller(Arc::new(ManualClock::default()));
        let calls = AtomicU32::new(0);

        let outcome: CallOutcome<()> = rl
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::NotFound) }
            })
            .await;

        assert_eq!(outcome, CallOutcome::Failed(CallFailure::NotFound));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_wait_and_short_circuit() {
        let clock = Arc::new(ManualClock::default());
        let rl = controller(clock.clone());
        let reset_at = clock.now() + chrono::Duration::seconds(3600);
        let calls = AtomicU32::new(0);

        let outcome: CallOutcome<()> = rl
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(GatewayError::RateLimited { reset_at }) }
            })
            .await;
        assert_eq!(outcome, CallOutcome::Wait(Duration::from_secs(3600)));
        assert_eq!(rl.throttled_until(), Some(reset_at));

        // Still throttled: the call is not attempted
        let outcome: CallOutcome<u32> = rl
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(Metered::bare(1)) }
            })
            .await;
        assert_eq!(outcome, CallOutcome::Wait(Duration::from_secs(3600)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Past the reset the call goes through
        clock.advance(Duration::from_secs(3601));
        let outcome = rl.execute(|| async { Ok(Metered::bare(7)) }).await;
        assert_eq!(outcome, CallOutcome::Ready(7));
        assert_eq!(rl.throttled_until(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_clamped_to_max_wait() {
        let clock = Arc::new(ManualClock::default());
        let rl = controller(clock.clone());
        let reset_at = clock.now() + chrono::Duration::hours(5);

        let outcome: CallOutcome<()> = rl
            .execute(|| async move { Err(GatewayError::RateLimited { reset_at }) })
            .await;
        assert_eq!(outcome, CallOutcome::Wait(Duration::from_secs(2 * 60 * 60)));

    }

    #[tokio::test(start_paused = true)]
    async fn test_past_reset_waits_the_minimum() {
        let clock = Arc::new(ManualClock::default());
        let rl = controller(clock.clone());
        let past = clock.now() - chrono::Duration::seconds(10);
        let calls = AtomicU32::new(0);

        let outcome: CallOutcome<()> = rl
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(GatewayError::RateLimited { reset_at: past }) }
            })
            .await;
        assert_eq!(outcome, CallOutcome::Wait(Duration::from_secs(5)));
        assert_eq!(rl.throttled_until(), Some(clock.now() + chrono::Duration::seconds(5)));

        // The floor is a real deadline: no call before it passes
        let outcome: CallOutcome<()> = rl.execute(|| async { Ok(Metered::bare(())) }).await;
        assert_eq!(outcome, CallOutcome::Wait(Duration::from_secs(5)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(5));
        let outcome = rl.execute(|| async { Ok(Metered::bare(3)) }).await;
        assert_eq!(outcome, CallOutcome::Ready(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reported_quota_exhaustion_blocks_next_call() {
        let clock = Arc::new(ManualClock::default());
        let rl = controller(clock.clone());
        let quota = QuotaSnapshot {
            remaining: 0,
            limit: 5000,
            reset_at: clock.now() + chrono::Duration::seconds(120),
        };

        let outcome = rl.execute(|| async move { Ok(Metered::new(1, Some(quota))) }).await;
        assert_eq!(outcome, CallOutcome::Ready(1));
        assert_eq!(rl.quota(), (Some(0), Some(5000)));

        let outcome: CallOutcome<u32> = rl.execute(|| async { Ok(Metered::bare(2)) }).await;
        assert_eq!(outcome, CallOutcome::Wait(Duration::from_secs(120)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_estimate_decrements_without_headers() {
        let clock = Arc::new(ManualClock::default());
        let rl = controller(clock.clone());
        let quota = QuotaSnapshot {
            remaining: 2,
            limit: 60,
            reset_at: clock.now() + chrono::Duration::seconds(600),
        };

        rl.execute(|| async move { Ok(Metered::new((), Some(quota))) }).await;
        rl.execute(|| async { Ok(Metered::bare(())) }).await;
        rl.execute(|| async { Ok(Metered::bare(())) }).await;
        // Never below zero
        assert_eq!(rl.quota().0, Some(0));
    }
}
