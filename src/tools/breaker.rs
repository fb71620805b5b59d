use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

/// Guard for the read-tool collaborator: closed → open after N consecutive
/// failures → half-open probe after the cooldown → closed again on success.
/// While open, calls fail fast instead of retrying the dependency.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
            threshold,
            cooldown,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// True when a call may proceed. Transitioning open → half-open admits a
    /// single probe; further calls are rejected until the probe reports back.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock_state();
        match *state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { until } => {
                if Instant::now() >= until {
                    *state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => false,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.lock_state();
        *state = BreakerState::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        let mut state = self.lock_state();
        *state = match *state {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.threshold {
                    BreakerState::Open {
                        until: Instant::now() + self.cooldown,
                    }
                } else {
                    BreakerState::Closed { failures }
                }
            }
            // A failed half-open probe re-opens for a full cooldown.
            BreakerState::HalfOpen | BreakerState::Open { .. } => BreakerState::Open {
                until: Instant::now() + self.cooldown,
            },
        };
    }

    pub fn state_name(&self) -> &'static str {
        match *self.lock_state() {
            BreakerState::Closed { .. } => "closed",
            BreakerState::Open { .. } => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stays_closed_below_threshold() {
        let b = CircuitBreaker::new(3, Duration::from_secs(30));
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state_name(), "closed");
        assert!(b.try_acquire());
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let b = CircuitBreaker::new(3, Duration::from_secs(30));
        for _ in 0..3 {
            b.record_failure();
        }
        assert_eq!(b.state_name(), "open");
        assert!(!b.try_acquire());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let b = CircuitBreaker::new(3, Duration::from_secs(30));
        b.record_failure();
        b.record_failure();
        b.record_success();
        for _ in 0..2 {
            b.record_failure();
        }
        assert_eq!(b.state_name(), "closed");
    }

    #[test]
    fn test_half_open_probe_after_cooldown() {
        let b = CircuitBreaker::new(1, Duration::from_millis(0));
        b.record_failure();
        // Cooldown of zero: the next acquire is the probe.
        assert!(b.try_acquire());
        assert_eq!(b.state_name(), "half_open");
        // A second caller is rejected while the probe is in flight.
        assert!(!b.try_acquire());

        b.record_success();
        assert_eq!(b.state_name(), "closed");
        assert!(b.try_acquire());
    }

    #[test]
    fn test_failed_probe_reopens() {
        let b = CircuitBreaker::new(1, Duration::from_millis(0));
        b.record_failure();
        assert!(b.try_acquire());
        b.record_failure();
        // Cooldown is zero, so the breaker is immediately probe-able again,
        // but it did pass through open.
        assert!(b.try_acquire());
        assert_eq!(b.state_name(), "half_open");
    }

    #[test]
    fn test_open_rejects_until_cooldown_elapses() {
        let b = CircuitBreaker::new(1, Duration::from_secs(60));
        b.record_failure();
        assert!(!b.try_acquire());
        assert!(!b.try_acquire());
        assert_eq!(b.state_name(), "open");
    }
}
