use std::time::{Duration, Instant};

/// Length of one sequencer cycle in nanoseconds.
pub const CYCLE_NS: u64 = 10;

/// Converts seconds into sequencer cycles, rounding to the nearest cycle.
///
/// ```
/// use pulsecompiler_backend::utils::*;
/// assert_eq!(secs_to_cycles(1e-6), 100);
/// assert_eq!(cycles_to_duration(100_000), std::time::Duration::from_millis(1));
/// ```
pub fn secs_to_cycles(secs: f64) -> u64 {
    assert!(secs >= 0., "Negative time {} cannot be converted to cycles", secs);
    (secs * 1e9 / CYCLE_NS as f64).round() as u64
}

pub fn cycles_to_secs(cycles: u64) -> f64 {
    cycles as f64 * CYCLE_NS as f64 * 1e-9
}

pub fn cycles_to_duration(cycles: u64) -> Duration {
    Duration::from_nanos(cycles.saturating_mul(CYCLE_NS))
}

pub fn duration_to_cycles(dur: Duration) -> u64 {
    (dur.as_nanos() / CYCLE_NS as u128) as u64
}

// Utility class for time-tracking
pub struct TickTimer {
    last: Instant,
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Milliseconds since the previous tick.
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    pub fn tick_log(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        log::debug!("{}: {:.3} ms", msg, diff);
        diff
    }
}
