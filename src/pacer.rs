//! Request pacing: minimum spacing between requests and exponential backoff.
//!
//! The collector talks to a single archive host, so pacing is global to the
//! process. Instead of hiding that state in statics, one [`RequestPacer`] is
//! built at startup and handed to the [`FetchClient`](crate::fetch::FetchClient).
//! Time comes from a [`Clock`], which tests replace with a [`ManualClock`].
//!
//! ```text
//! request ─▶ wait_turn()  sleeps until min_interval has passed since the last request
//!        ─▶ HTTP
//!        ─▶ success: record_success()  failures = 0
//!           failure: record_failure()  failures += 1, sleep min(base × 1.5^failures, max)
//! ```

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::FetchConfig;

/// Multiplier applied per consecutive failure.
pub const BACKOFF_FACTOR: f64 = 1.5;

/// Source of monotonic time and sleeping.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;

    async fn sleep(&self, duration: Duration);
}

/// Wall-clock time backed by [`Instant`] and `tokio::time::sleep`.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Simulated clock: sleeping advances time instantly and is recorded.
///
/// Used to test pacing without waiting in real time.
#[derive(Default)]
pub struct ManualClock {
    state: StdMutex<ManualClockState>,
}

#[derive(Default)]
struct ManualClockState {
    now: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward without recording a sleep (simulates work).
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.now += by;
    }

    /// Every duration passed to [`Clock::sleep`], in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.sleeps.clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.now
    }

    async fn sleep(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.now += duration;
        state.sleeps.push(duration);
    }
}

/// Pacing parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacerSettings {
    pub min_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl From<&FetchConfig> for PacerSettings {
    fn from(config: &FetchConfig) -> Self {
        Self {
            min_interval: Duration::from_millis(config.min_interval_ms),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_secs(config.backoff_max_secs),
        }
    }
}

/// Backoff delay after `failures` consecutive failures:
/// `min(base × 1.5^failures, max)`.
pub fn backoff_delay(settings: &PacerSettings, failures: u32) -> Duration {
    let factor = BACKOFF_FACTOR.powi(failures.min(i32::MAX as u32) as i32);
    let secs = settings.backoff_base.as_secs_f64() * factor;
    if !secs.is_finite() || secs >= settings.backoff_max.as_secs_f64() {
        settings.backoff_max
    } else {
        Duration::from_secs_f64(secs)
    }
}

#[derive(Debug, Default)]
struct PacerState {
    last_request: Option<Duration>,
    failures: u32,
}

/// The process-wide request cadence and failure counter.
///
/// [`PacerTurn`] holds the pacer's lock for the duration of one request, so
/// even a shared client never has two requests in flight.
pub struct RequestPacer {
    settings: PacerSettings,
    clock: Arc<dyn Clock>,
    state: Mutex<PacerState>,
}

impl RequestPacer {
    pub fn new(settings: PacerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            state: Mutex::new(PacerState::default()),
        }
    }

    pub fn settings(&self) -> &PacerSettings {
        &self.settings
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.state.lock().await.failures
    }

    /// Wait until a request may be issued, then claim the slot.
    pub async fn wait_turn(&self) -> PacerTurn<'_> {
        let mut state = self.state.lock().await;
        if let Some(last) = state.last_request {
            let elapsed = self.clock.now().saturating_sub(last);
            if elapsed < self.settings.min_interval {
                let remaining = self.settings.min_interval - elapsed;
                tracing::trace!(?remaining, "rate limit: waiting");
                self.clock.sleep(remaining).await;
            }
        }
        state.last_request = Some(self.clock.now());
        PacerTurn { pacer: self, state }
    }
}

/// An exclusive request slot. Report the outcome before dropping it.
pub struct PacerTurn<'a> {
    pacer: &'a RequestPacer,
    state: tokio::sync::MutexGuard<'a, PacerState>,
}

impl PacerTurn<'_> {
    pub fn record_success(mut self) {
        self.state.failures = 0;
    }

    /// Count the failure and sleep for the resulting backoff delay.
    pub async fn record_failure(mut self) -> Duration {
        self.state.failures = self.state.failures.saturating_add(1);
        let delay = backoff_delay(&self.pacer.settings, self.state.failures);
        tracing::debug!(
            failures = self.state.failures,
            ?delay,
            "request failed, backing off"
        );
        self.pacer.clock.sleep(delay).await;
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> PacerSettings {
        PacerSettings {
            min_interval: Duration::from_secs(1),
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let s = settings();
        assert_eq!(backoff_delay(&s, 0), Duration::from_secs(2));
        assert_eq!(backoff_delay(&s, 1), Duration::from_secs(3));
        assert_eq!(backoff_delay(&s, 2), Duration::from_secs_f64(4.5));
        assert_eq!(backoff_delay(&s, 3), Duration::from_secs_f64(6.75));
        assert_eq!(backoff_delay(&s, 4), Duration::from_secs(10));
        assert_eq!(backoff_delay(&s, u32::MAX), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_first_request_does_not_wait() {
        let clock = Arc::new(ManualClock::new());
        let pacer = RequestPacer::new(settings(), clock.clone());
        pacer.wait_turn().await.record_success();
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_early_request_sleeps_for_remainder() {
        let clock = Arc::new(ManualClock::new());
        let pacer = RequestPacer::new(settings(), clock.clone());

        pacer.wait_turn().await.record_success();
        clock.advance(Duration::from_millis(300));
        pacer.wait_turn().await.record_success();
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(700)]);

        clock.advance(Duration::from_secs(5));
        pacer.wait_turn().await.record_success();
        assert_eq!(clock.sleeps().len(), 1);
    }

    #[tokio::test]
    async fn test_failures_back_off_then_reset() {
        let clock = Arc::new(ManualClock::new());
        let pacer = RequestPacer::new(settings(), clock.clone());

        let first = pacer.wait_turn().await.record_failure().await;
        let second = pacer.wait_turn().await.record_failure().await;
        assert_eq!(first, Duration::from_secs(3));
        assert_eq!(second, Duration::from_secs_f64(4.5));
        assert_eq!(pacer.consecutive_failures().await, 2);

        pacer.wait_turn().await.record_success();
        assert_eq!(pacer.consecutive_failures().await, 0);
        let after_reset = pacer.wait_turn().await.record_failure().await;
        assert_eq!(after_reset, Duration::from_secs(3));
    }
}
