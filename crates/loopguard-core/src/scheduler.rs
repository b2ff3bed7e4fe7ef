//! Fixed-period tick scheduler with jitter tracking.
//!
//! Grounded on the runtime layer described in `guardrails/dt_guard.py`'s
//! collaborator: a scheduler that claims to tick at a nominal period `dt`
//! but whose *actual* inter-tick gaps are the ground truth `dt` governance
//! measures against.

use std::collections::VecDeque;

/// Default size of the ring buffer used to compute jitter percentiles.
pub const DEFAULT_JITTER_SAMPLES: usize = 256;

/// Tracks a nominal tick period and the actual observed gaps between ticks.
#[derive(Debug, Clone)]
pub struct FixedScheduler {
    dt: f64,
    jitter: VecDeque<f64>,
    capacity: usize,
    tick_count: u64,
}

impl FixedScheduler {
    pub fn new(dt: f64) -> Self {
        Self::with_capacity(dt, DEFAULT_JITTER_SAMPLES)
    }

    pub fn with_capacity(dt: f64, capacity: usize) -> Self {
        Self {
            dt,
            jitter: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            tick_count: 0,
        }
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn set_dt(&mut self, dt: f64) {
        self.dt = dt;
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Record one tick whose actual gap since the previous tick was
    /// `actual_gap_sec`. Jitter is `actual_gap_sec - dt`.
    pub fn tick(&mut self, actual_gap_sec: f64) {
        self.tick_count += 1;
        if self.jitter.len() == self.capacity {
            self.jitter.pop_front();
        }
        self.jitter.push_back(actual_gap_sec - self.dt);
    }

    /// The 95th percentile of the absolute jitter over the retained samples,
    /// or `0.0` with no samples yet.
    pub fn jitter_p95(&self) -> f64 {
        if self.jitter.is_empty() {
            return 0.0;
        }
        let mut abs: Vec<f64> = self.jitter.iter().map(|j| j.abs()).collect();
        abs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = (0.95 * (abs.len() - 1) as f64).round() as usize;
        abs[rank.min(abs.len() - 1)]
    }
}
