//! Circuit breaker guarding individual collector requests.
//!
//! State transitions:
//! - Closed -> Open: within one counting window, at least `min_requests`
//!   calls were made and the failure ratio reached `failure_ratio`
//! - Open -> HalfOpen: `cooldown` elapsed since the breaker opened
//! - HalfOpen -> Closed: a probe succeeded
//! - HalfOpen -> Open: a probe failed, or probes were still outstanding when
//!   `probe_timeout` ran out
//!
//! Every transition starts a new generation. Results reported against an
//! older generation are ignored, so a slow request that started before the
//! breaker tripped cannot flip the new state.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::DeliveryError;

/// Operational state of a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerState {
    /// Requests flow normally; failures are counted.
    Closed,
    /// Requests fail fast without touching the network.
    Open,
    /// A limited number of probe requests are let through.
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Tuning for a [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Length of the counting window while closed.
    pub window: Duration,
    /// Minimum requests in the window before the breaker may trip.
    pub min_requests: u32,
    /// Failure ratio (0.0..=1.0) that trips the breaker.
    pub failure_ratio: f64,
    /// Time spent open before probing.
    pub cooldown: Duration,
    /// Probe requests admitted while half-open.
    pub half_open_max: u32,
    /// How long half-open waits on outstanding probes before reopening.
    pub probe_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            min_requests: 3,
            failure_ratio: 0.6,
            cooldown: Duration::from_secs(30),
            half_open_max: 3,
            probe_timeout: Duration::from_secs(60),
        }
    }
}

/// Admission token returned by [`CircuitBreaker::try_acquire`].
///
/// Report the outcome with [`Ticket::record`]. A ticket dropped without a
/// result (cancelled or timed-out request) frees its slot and counts as
/// neither success nor failure.
#[derive(Debug)]
#[must_use]
pub struct Ticket<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Ticket<'_> {
    /// Report the outcome of the admitted request.
    pub fn record(mut self, success: bool) {
        self.settled = true;
        self.breaker.on_result(self.generation, success);
    }

    /// Give the slot back without reporting a result.
    pub fn abandon(self) {}
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.generation);
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    generation: u64,
    requests: u32,
    failures: u32,
    /// Closed: end of the counting window. Open: end of the cooldown.
    /// HalfOpen: end of the probe timeout.
    expiry: Option<Instant>,
}

/// Explicit closed/open/half-open state machine with a rolling counter.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let expiry = Some(Instant::now() + config.window);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                requests: 0,
                failures: 0,
                expiry,
            }),
        }
    }

    /// Current state, after applying any elapsed timers.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Ask permission to issue one request.
    ///
    /// Fails with [`DeliveryError::CircuitOpen`] while open, or while
    /// half-open once all probe slots are taken.
    pub fn try_acquire(&self) -> Result<Ticket<'_>, DeliveryError> {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        self.refresh(&mut inner, Instant::now());

        match inner.state {
            BreakerState::Open => return Err(DeliveryError::CircuitOpen),
            BreakerState::HalfOpen if inner.requests >= self.config.half_open_max => {
                return Err(DeliveryError::CircuitOpen)
            }
            _ => {}
        }

        inner.requests += 1;
        Ok(Ticket {
            breaker: self,
            generation: inner.generation,
            settled: false,
        })
    }

    fn on_result(&self, generation: u64, success: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        self.refresh(&mut inner, now);

        if inner.generation != generation {
            debug!(breaker = %self.name, "Ignoring result from a previous breaker generation");
            return;
        }

        match (inner.state, success) {
            (BreakerState::Closed, true) => {}
            (BreakerState::Closed, false) => {
                inner.failures += 1;
                let ratio = f64::from(inner.failures) / f64::from(inner.requests.max(1));
                if inner.requests >= self.config.min_requests && ratio >= self.config.failure_ratio
                {
                    self.transition(&mut inner, BreakerState::Open, now);
                }
            }
            (BreakerState::HalfOpen, true) => {
                self.transition(&mut inner, BreakerState::Closed, now);
            }
            (BreakerState::HalfOpen, false) => {
                self.transition(&mut inner, BreakerState::Open, now);
            }
            (BreakerState::Open, _) => {}
        }
    }

    fn release(&self, generation: u64) {
        // Runs from Drop, possibly while unwinding.
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.generation == generation {
            inner.requests = inner.requests.saturating_sub(1);
        }
    }

    fn refresh(&self, inner: &mut Inner, now: Instant) {
        match inner.state {
            BreakerState::Closed => {
                if inner.expiry.is_some_and(|e| now >= e) {
                    // New counting window.
                    inner.generation += 1;
                    inner.requests = 0;
                    inner.failures = 0;
                    inner.expiry = Some(now + self.config.window);
                }
            }
            BreakerState::Open => {
                if inner.expiry.is_some_and(|e| now >= e) {
                    self.transition(inner, BreakerState::HalfOpen, now);
                }
            }
            BreakerState::HalfOpen => {
                if inner.expiry.is_some_and(|e| now >= e) {
                    if inner.requests > 0 {
                        self.transition(inner, BreakerState::Open, now);
                    } else {
                        inner.expiry = Some(now + self.config.probe_timeout);
                    }
                }
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.requests = 0;
        inner.failures = 0;
        inner.expiry = match to {
            BreakerState::Closed => Some(now + self.config.window),
            BreakerState::Open => Some(now + self.config.cooldown),
            BreakerState::HalfOpen => Some(now + self.config.probe_timeout),
        };
        warn!(breaker = %self.name, %from, %to, "Circuit breaker state changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("test", BreakerConfig::default())
    }

    fn fail(b: &CircuitBreaker) {
        b.try_acquire().unwrap().record(false);
    }

    fn succeed(b: &CircuitBreaker) {
        b.try_acquire().unwrap().record(true);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(BreakerState::Closed.to_string(), "closed");
        assert_eq!(BreakerState::Open.to_string(), "open");
        assert_eq!(BreakerState::HalfOpen.to_string(), "half-open");
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_trip_breaker() {
        let b = breaker();
        fail(&b);
        fail(&b);
        assert_eq!(b.state(), BreakerState::Closed);
        fail(&b);
        assert_eq!(b.state(), BreakerState::Open);
        assert!(matches!(b.try_acquire(), Err(DeliveryError::CircuitOpen)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ratio_below_threshold_stays_closed() {
        let b = breaker();
        succeed(&b);
        succeed(&b);
        fail(&b);
        fail(&b);
        // 2 of 4 failed: 0.5 < 0.6.
        assert_eq!(b.state(), BreakerState::Closed);
        fail(&b);
        // 3 of 5: 0.6 trips.
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_resets_counts() {
        let b = breaker();
        fail(&b);
        fail(&b);
        tokio::time::advance(Duration::from_secs(61)).await;
        fail(&b);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_moves_to_half_open() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b);
        }
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_failure_reopens() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b);
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let probe = b.try_acquire().expect("one probe must be admitted");
        probe.record(false);
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_success_closes() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        succeed(&b);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_concurrent_probes() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b);
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let t1 = b.try_acquire().unwrap();
        let t2 = b.try_acquire().unwrap();
        let t3 = b.try_acquire().unwrap();
        assert!(matches!(b.try_acquire(), Err(DeliveryError::CircuitOpen)));

        t3.abandon();
        let t4 = b.try_acquire().unwrap();
        t1.record(true);
        // Later results belong to an older generation and are ignored.
        t2.record(false);
        t4.record(false);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_ticket_ignored_after_trip() {
        let b = breaker();
        let slow = b.try_acquire().unwrap();
        // Three requests in the window, two failed: ratio 0.67 trips.
        fail(&b);
        fail(&b);
        assert_eq!(b.state(), BreakerState::Open);
        slow.record(true);
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_tickets_free_half_open_slots() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b);
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        // Requests whose futures were dropped mid-flight never report back.
        for _ in 0..3 {
            drop(b.try_acquire().unwrap());
        }
        assert_eq!(b.state(), BreakerState::HalfOpen);

        b.try_acquire()
            .expect("slots must be free again")
            .record(true);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_probes_reopen_after_probe_timeout() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b);
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let stuck: Vec<_> = (0..3).map(|_| b.try_acquire().unwrap()).collect();
        assert!(b.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(b.state(), BreakerState::Open);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);

        // Results from the stale generation do not count.
        for t in stuck {
            t.record(false);
        }
        b.try_acquire().unwrap().record(true);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_half_open_waits_for_probe() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b);
        }
        tokio::time::advance(Duration::from_secs(30 + 3600)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.try_acquire().is_ok());
    }
}
