// =============================================================================
// Circuit Breaker
// =============================================================================
//
// Trips after M consecutive transient failures for a venue, fails fast for a
// cool-down window, then allows a single half-open probe. Shared across
// workers so it is backed by atomics rather than a lock, matching the
// rate-limit tracker's lock-free style.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

/// Consecutive-failure circuit breaker with a single half-open probe slot.
pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    trip_threshold: u32,
    cooldown: Duration,
    state: AtomicU8,
    opened_at_ms: AtomicU64,
    /// Guards the single half-open probe: `true` means a probe is currently
    /// in flight and further calls must wait.
    probe_in_flight: AtomicU8,
}

impl CircuitBreaker {
    pub fn new(trip_threshold: u32, cooldown: Duration) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            trip_threshold: trip_threshold.max(1),
            cooldown,
            state: AtomicU8::new(State::Closed as u8),
            opened_at_ms: AtomicU64::new(0),
            probe_in_flight: AtomicU8::new(0),
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Whether a call may proceed right now. Also transitions `Open` ->
    /// `HalfOpen` once the cooldown window has elapsed, admitting exactly one
    /// probing call.
    pub fn allow_request(&self) -> bool {
        match self.state.load(Ordering::SeqCst) {
            s if s == State::Closed as u8 => true,
            s if s == State::Open as u8 => {
                let opened_at = self.opened_at_ms.load(Ordering::SeqCst);
                if Self::now_ms().saturating_sub(opened_at) >= self.cooldown.as_millis() as u64 {
                    // Cooldown elapsed: try to claim the single half-open probe.
                    if self
                        .state
                        .compare_exchange(
                            State::Open as u8,
                            State::HalfOpen as u8,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        self.probe_in_flight.store(1, Ordering::SeqCst);
                        true
                    } else {
                        false
                    }
                } else {
                    false
                }
            }
            s if s == State::HalfOpen as u8 => {
                // Only the caller that claimed the probe may proceed; anyone
                // else observing HalfOpen must wait for its outcome.
                self.probe_in_flight
                    .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            }
            _ => true,
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.state.store(State::Closed as u8, Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let was_half_open = self.state.load(Ordering::SeqCst) == State::HalfOpen as u8;
        if was_half_open || failures >= self.trip_threshold {
            self.trip();
        }
    }

    fn trip(&self) {
        self.state.store(State::Open as u8, Ordering::SeqCst);
        self.opened_at_ms.store(Self::now_ms(), Ordering::SeqCst);
        warn!(
            consecutive_failures = self.consecutive_failures.load(Ordering::SeqCst),
            "circuit breaker tripped"
        );
    }

    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::SeqCst) == State::Open as u8
    }
}
