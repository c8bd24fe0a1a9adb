//! Clock abstraction and bounded retry helpers
//!
//! Business logic never sleeps directly: it goes through a [`Clock`] so that
//! tests can drive retries and cache expiry with [`ManualClock`].

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};

use super::errors::{GridError, GridResult};

/// Source of time for timestamps, sleeps and expiry checks
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Virtual clock; `sleep` advances time instantly
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
    slept_millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
            slept_millis: AtomicI64::new(0),
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        self.millis
            .fetch_add(duration.num_milliseconds(), Ordering::SeqCst);
    }

    /// Total virtual time spent in `sleep`
    pub fn slept(&self) -> Duration {
        Duration::from_millis(self.slept_millis.load(Ordering::SeqCst).max(0) as u64)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.millis.load(Ordering::SeqCst))
            .unwrap_or_else(Utc::now)
    }

    async fn sleep(&self, duration: Duration) {
        let ms = duration.as_millis() as i64;
        self.millis.fetch_add(ms, Ordering::SeqCst);
        self.slept_millis.fetch_add(ms, Ordering::SeqCst);
    }
}

/// Result of polling until a condition holds
#[derive(Debug, Clone, PartialEq)]
pub enum Polled<T> {
    /// The predicate accepted this value
    Ready(T),
    /// The schedule ran out; carries the last value observed
    Exhausted(T),
}

impl<T> Polled<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Polled::Ready(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Polled::Ready(v) | Polled::Exhausted(v) => v,
        }
    }
}

/// Run `operation` until `ready` accepts its value.
///
/// One attempt is made immediately, then one more after each delay in
/// `schedule`. Errors count as "not ready"; if the final attempt errors, that
/// error is returned.
pub async fn poll_until<T, F, Fut, P>(
    clock: &dyn Clock,
    schedule: &[Duration],
    mut operation: F,
    ready: P,
) -> GridResult<Polled<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GridResult<T>>,
    P: Fn(&T) -> bool,
{
    let mut delays = schedule.iter();
    loop {
        let result = operation().await;
        let next_delay = delays.next();

        match result {
            Ok(value) if ready(&value) => return Ok(Polled::Ready(value)),
            Ok(value) => {
                let Some(delay) = next_delay else {
                    return Ok(Polled::Exhausted(value));
                };
                debug!("Condition not met yet, re-checking in {:?}", delay);
                clock.sleep(*delay).await;
            }
            Err(e) => {
                let Some(delay) = next_delay else {
                    return Err(e);
                };
                warn!("Check failed, re-checking in {:?}: {}", delay, e);
                clock.sleep(*delay).await;
            }
        }
    }
}

/// Bounded exponential backoff for exchange writes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
        }
    }

    /// Delay before attempt `attempt + 1` (1-based `attempt`)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(2u64.pow(exp)))
    }

    /// Execute with exponential backoff retry
    pub async fn run<T, F, Fut>(&self, clock: &dyn Clock, operation_name: &str, mut operation: F) -> GridResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GridResult<T>>,
    {
        let mut attempts = 0;
        let mut last_error = GridError::Exchange("Unknown error".into());

        while attempts < self.max_attempts {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    attempts += 1;
                    last_error = e;

                    if !last_error.is_transient() {
                        break;
                    }

                    if attempts < self.max_attempts {
                        let delay = self.delay_after(attempts);
                        warn!(
                            "{} failed (attempt {}/{}), retrying in {}ms: {}",
                            operation_name,
                            attempts,
                            self.max_attempts,
                            delay.as_millis(),
                            last_error
                        );
                        clock.sleep(delay).await;
                    }
                }
            }
        }

        Err(GridError::OrderPlacementFailed {
            attempts,
            reason: last_error.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_poll_until_ready_on_third_attempt() {
        let clock = ManualClock::default();
        let calls = AtomicU32::new(0);
        let schedule = vec![Duration::from_secs(2), Duration::from_secs(5), Duration::from_secs(10)];

        let result = poll_until(
            &clock,
            &schedule,
            || async { Ok(calls.fetch_add(1, Ordering::SeqCst) + 1) },
            |n: &u32| *n >= 3,
        )
        .await
        .unwrap();

        assert_eq!(result, Polled::Ready(3));
        assert_eq!(clock.slept(), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_poll_until_exhausted() {
        let clock = ManualClock::default();
        let schedule = vec![Duration::from_secs(1); 4];
        let calls = AtomicU32::new(0);

        let result = poll_until(
            &clock,
            &schedule,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(0.0)
            },
            |v: &f64| *v > 0.0,
        )
        .await
        .unwrap();

        assert_eq!(result, Polled::Exhausted(0.0));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(clock.slept(), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_poll_until_returns_final_error() {
        let clock = ManualClock::default();
        let result: GridResult<Polled<u32>> = poll_until(
            &clock,
            &[Duration::from_secs(1)],
            || async { Err(GridError::Exchange("timeout".into())) },
            |_| true,
        )
        .await;

        assert!(matches!(result, Err(GridError::Exchange(_))));
    }

    #[tokio::test]
    async fn test_retry_policy_backoff() {
        let clock = ManualClock::default();
        let policy = RetryPolicy::new(3, 100);
        let calls = AtomicU32::new(0);

        let result: GridResult<u32> = policy
            .run(&clock, "place order", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(GridError::Exchange("rate limited".into()))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        // 100ms then 200ms
        assert_eq!(clock.slept(), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_retry_policy_gives_up() {
        let clock = ManualClock::default();
        let policy = RetryPolicy::new(3, 10);

        let result: GridResult<()> = policy
            .run(&clock, "cancel", || async { Err(GridError::Exchange("down".into())) })
            .await;

        match result {
            Err(GridError::OrderPlacementFailed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_policy_stops_on_permanent_error() {
        let clock = ManualClock::default();
        let policy = RetryPolicy::new(5, 10);
        let calls = AtomicU32::new(0);

        let result: GridResult<()> = policy
            .run(&clock, "place order", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GridError::InsufficientBalance {
                    required: 10.0,
                    available: 1.0,
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_manual_clock_advance() {
        let start = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!((clock.now() - start).num_minutes(), 5);
    }
}
