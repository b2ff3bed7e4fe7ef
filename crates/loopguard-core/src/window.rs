//! Fixed-length sliding windows of telemetry samples, single- and
//! multi-channel.
//!
//! Grounded on `runtime/windows.py`: a window holds the last `capacity`
//! samples per channel and zero-fills on read until it has enough history,
//! so early estimator calls see a well-formed (if degenerate) series instead
//! of an error.

use std::collections::VecDeque;

/// A fixed-capacity ring buffer of `f64` samples for a single channel.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl SlidingWindow {
    /// Create an empty window with room for `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Push a new sample, evicting the oldest if the window is full.
    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Number of real (non-zero-filled) samples currently held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Return exactly `capacity` samples, oldest first, zero-filling on the
    /// left when fewer than `capacity` samples have been pushed.
    pub fn as_dense(&self) -> Vec<f64> {
        let missing = self.capacity.saturating_sub(self.samples.len());
        let mut out = Vec::with_capacity(self.capacity);
        out.extend(std::iter::repeat(0.0).take(missing));
        out.extend(self.samples.iter().copied());
        out
    }

    /// Whether the window has observed at least `capacity` real samples.
    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }
}

/// A fixed-capacity, multi-channel telemetry window: one [`SlidingWindow`]
/// per named channel, all sharing the same capacity and sample cadence. A
/// sample that omits a known channel zero-fills that channel for the tick,
/// matching the source's `append(sample: dict)` behavior.
#[derive(Debug, Clone)]
pub struct TelemetryWindow {
    capacity: usize,
    channels: Vec<String>,
    series: Vec<SlidingWindow>,
}

impl TelemetryWindow {
    /// Create a window over `channels` (in the fixed order that determines
    /// every matrix row/column produced downstream).
    pub fn new(channels: Vec<String>, capacity: usize) -> Self {
        let series = channels.iter().map(|_| SlidingWindow::new(capacity)).collect();
        Self { capacity, channels, series }
    }

    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one tick of samples, keyed by channel name. Channels absent
    /// from `sample` receive a zero for this tick; unrecognized keys in
    /// `sample` are ignored. Per the external-interfaces contract, a NaN on
    /// any known channel marks stale telemetry (the `read_state` timeout
    /// signal) — such a sample is dropped whole, without advancing any
    /// channel's window, rather than letting the NaN enter the series.
    /// Returns whether the sample was applied.
    pub fn append(&mut self, sample: &std::collections::HashMap<String, f64>) -> bool {
        let has_nan = self
            .channels
            .iter()
            .any(|name| sample.get(name).is_some_and(|v| v.is_nan()));
        if has_nan {
            return false;
        }
        for (name, window) in self.channels.iter().zip(self.series.iter_mut()) {
            window.push(sample.get(name).copied().unwrap_or(0.0));
        }
        true
    }

    /// Whether every channel has observed at least `capacity` real samples.
    pub fn ready(&self) -> bool {
        self.series.iter().all(SlidingWindow::is_full)
    }

    /// Dense `T x N` matrix view: `matrix[t][n]`, oldest tick first, channels
    /// in declared order.
    pub fn get_matrix(&self) -> Vec<Vec<f64>> {
        let columns: Vec<Vec<f64>> = self.series.iter().map(SlidingWindow::as_dense).collect();
        (0..self.capacity)
            .map(|t| columns.iter().map(|col| col[t]).collect())
            .collect()
    }

    /// A single channel's dense series by index.
    pub fn column(&self, idx: usize) -> Vec<f64> {
        self.series[idx].as_dense()
    }
}
