// =============================================================================
// Clock: wall-clock or simulated (backtesting) time source
// =============================================================================
//
// Every component that needs "now" takes a `SharedClock`. A simulated clock is
// driven explicitly by the backtester and may move backward, which relaxes the
// staleness checks in the balance ledger and switches candle reads to
// interpolation.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

pub type SharedClock = Arc<dyn Clock>;

/// Source of the current time, in UNIX milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;

    /// True when time is driven by a backtest rather than the wall clock.
    fn is_simulated(&self) -> bool {
        false
    }

    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_ms())
            .single()
            .unwrap_or_default()
    }
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually driven clock used for backtesting.
#[derive(Debug)]
pub struct SimulatedClock {
    now_ms: AtomicI64,
}

impl SimulatedClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, ms: i64) {
        self.now_ms.store(ms, Ordering::Relaxed);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::Relaxed);
    }
}

impl Clock for SimulatedClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::Relaxed)
    }

    fn is_simulated(&self) -> bool {
        true
    }
}

pub fn system() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_moves_both_ways() {
        let clock = SimulatedClock::new(1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(200);
        assert_eq!(clock.now_ms(), 200);
        assert!(clock.is_simulated());
        assert_eq!(clock.now().timestamp_millis(), 200);
    }

    #[test]
    fn system_clock_is_not_simulated() {
        let clock = system();
        assert!(!clock.is_simulated());
        assert!(clock.now_ms() > 1_600_000_000_000);
    }
}
