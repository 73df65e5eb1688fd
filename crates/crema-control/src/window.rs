//! Bounded sliding window of recent temperature samples.
//!
//! The control loop pushes one sample per tick; the classifier asks for the
//! rise over the detection window and the recovery detector for the window
//! maximum. Capacity is bounded by sample count, queries by wall-clock age,
//! so the window behaves the same whether ticks are exactly 1 s apart or
//! occasionally stretched by a slow sensor read.

use std::collections::VecDeque;

/// Maximum retained samples.
pub const TEMP_HISTORY_SIZE: usize = 60;
/// Wall-clock span consulted for state detection decisions.
pub const STATE_DETECTION_WINDOW_MS: i64 = 60_000;

/// Sliding window of `(timestamp_ms, temperature)` samples, oldest first.
#[derive(Debug, Default)]
pub struct TempWindow {
    samples: VecDeque<(i64, f64)>,
}

impl TempWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample, evicting the oldest beyond [`TEMP_HISTORY_SIZE`].
    pub fn push(&mut self, timestamp_ms: i64, temperature: f64) {
        self.samples.push_back((timestamp_ms, temperature));
        while self.samples.len() > TEMP_HISTORY_SIZE {
            self.samples.pop_front();
        }
    }

    /// The most recent sample, if any.
    pub fn latest(&self) -> Option<(i64, f64)> {
        self.samples.back().copied()
    }

    /// Temperature change from the oldest sample within the last
    /// `window_ms` to the newest.
    ///
    /// `None` until at least two samples fall inside the window – rise-based
    /// rules must not fire on a cold history.
    pub fn rise_over(&self, window_ms: i64, now_ms: i64) -> Option<f64> {
        let cutoff = now_ms - window_ms;
        let mut in_window = self
            .samples
            .iter()
            .filter(|(ts, _)| *ts >= cutoff)
            .map(|(_, t)| *t);
        let oldest = in_window.next()?;
        let newest = in_window.last()?;
        Some(newest - oldest)
    }

    /// The maximum temperature within the last `window_ms`.
    pub fn max_over(&self, window_ms: i64, now_ms: i64) -> Option<f64> {
        let cutoff = now_ms - window_ms;
        self.samples
            .iter()
            .filter(|(ts, _)| *ts >= cutoff)
            .map(|(_, t)| *t)
            .fold(None, |acc, t| Some(acc.map_or(t, |m: f64| m.max(t))))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_bounded() {
        let mut window = TempWindow::new();
        for i in 0..(TEMP_HISTORY_SIZE as i64 + 10) {
            window.push(i * 1000, 20.0 + i as f64);
        }
        assert_eq!(window.len(), TEMP_HISTORY_SIZE);
        // Oldest samples were evicted.
        assert_eq!(window.latest().unwrap().0, (TEMP_HISTORY_SIZE as i64 + 9) * 1000);
    }

    #[test]
    fn rise_needs_two_samples_in_window() {
        let mut window = TempWindow::new();
        assert_eq!(window.rise_over(60_000, 0), None);
        window.push(0, 50.0);
        assert_eq!(window.rise_over(60_000, 0), None);
        window.push(1000, 52.0);
        assert_eq!(window.rise_over(60_000, 1000), Some(2.0));
    }

    #[test]
    fn rise_ignores_samples_outside_window() {
        let mut window = TempWindow::new();
        window.push(0, 20.0); // too old
        window.push(70_000, 90.0);
        window.push(75_000, 91.5);
        // Only the last two are inside the 60 s window at t=75 s.
        assert_eq!(window.rise_over(60_000, 75_000), Some(1.5));
    }

    #[test]
    fn rise_can_be_negative() {
        let mut window = TempWindow::new();
        window.push(0, 100.0);
        window.push(30_000, 98.0);
        assert_eq!(window.rise_over(60_000, 30_000), Some(-2.0));
    }

    #[test]
    fn max_over_window() {
        let mut window = TempWindow::new();
        window.push(0, 101.0); // outside at t=70s
        window.push(20_000, 100.0);
        window.push(40_000, 96.0);
        window.push(70_000, 80.0);
        assert_eq!(window.max_over(60_000, 70_000), Some(100.0));
        assert_eq!(TempWindow::new().max_over(60_000, 0), None);
    }
}
