use crate::config::NANOS_PER_SEC;
use crate::utils::SignalFlag;
use std::time::{Duration, Instant};

/// Number of equal slices the remaining frame time is slept in. The
/// deadline check between slices keeps drift below one slice.
pub(crate) const SLEEP_SLICES: i64 = 10;

/// Per-worker pacing state. Two feedback multipliers track how the OS
/// actually honors sleeps: the inner one corrects the requested sleep
/// length, the outer one reports the achieved rate relative to the
/// target. A frequency change resets both to 1.0.
pub(crate) struct Pacer {
    last_frequency: u64,
    inner_adjust: f64,
    outer_adjust: f64,
}

impl Pacer {
    pub(crate) fn new() -> Self {
        Self {
            last_frequency: 0,
            inner_adjust: 1.0,
            outer_adjust: 1.0,
        }
    }

    /// Target cycle length in nanoseconds for `frequency`, resetting
    /// the multipliers if the frequency changed since the last cycle.
    pub(crate) fn target_ns(&mut self, frequency: u64) -> u64 {
        if frequency != self.last_frequency {
            self.last_frequency = frequency;
            self.inner_adjust = 1.0;
            self.outer_adjust = 1.0;
        }
        NANOS_PER_SEC / frequency.max(1)
    }

    /// Corrected time still to sleep after the callback took
    /// `measured_ns`. Negative when the callback overran the frame.
    pub(crate) fn remaining_ns(&self, target_ns: u64, measured_ns: u64) -> i64 {
        ((target_ns as f64 - measured_ns as f64) * self.inner_adjust) as i64
    }

    /// Recompute the inner multiplier from how long the sliced sleep
    /// actually took versus what was asked for.
    pub(crate) fn recalibrate_inner(&mut self, intended_ns: i64, actual_ns: u64) {
        if intended_ns > 0 && actual_ns > 0 {
            self.inner_adjust = intended_ns as f64 / actual_ns as f64;
        }
    }

    /// Record the full-cycle duration, updating the outer multiplier.
    pub(crate) fn finish_cycle(&mut self, target_ns: u64, total_ns: u64) {
        if total_ns > 0 {
            self.outer_adjust = target_ns as f64 / total_ns as f64;
        }
    }

    pub(crate) fn inner_adjust(&self) -> f64 {
        self.inner_adjust
    }

    pub(crate) fn outer_adjust(&self) -> f64 {
        self.outer_adjust
    }
}

/// Sleep `slice_ns` at a time until `deadline` passes or `interrupt`
/// is raised. At least one slice is always slept. Returns the measured
/// wall time spent sleeping.
pub(crate) fn sleep_in_slices(slice_ns: i64, deadline: Instant, interrupt: &SignalFlag) -> u64 {
    let slice = Duration::from_nanos(slice_ns as u64);
    let start = Instant::now();
    loop {
        std::thread::sleep(slice);
        if interrupt.take() || Instant::now() >= deadline {
            break;
        }
    }
    start.elapsed().as_nanos() as u64
}
