use std::collections::VecDeque;

/// A time-bounded sequence of `(timestamp_ms, value)` samples, monotonically
/// non-decreasing in timestamp. Prune is amortized O(1) per append since
/// expired samples are only ever popped from the front.
#[derive(Debug, Clone, Default)]
pub struct RollingWindow {
    samples: VecDeque<(i64, f64)>,
    retain_ms: i64,
}

impl RollingWindow {
    pub fn new(retain_ms: i64) -> Self {
        RollingWindow {
            samples: VecDeque::new(),
            retain_ms,
        }
    }

    /// Appends a sample and prunes anything older than `retain_ms`. Samples
    /// that would go backwards in time are dropped silently.
    pub fn append(&mut self, t_ms: i64, value: f64) {
        if let Some(&(last_t, _)) = self.samples.back() {
            if t_ms < last_t {
                return;
            }
        }
        self.samples.push_back((t_ms, value));
        self.prune(t_ms - self.retain_ms);
    }

    /// Removes every sample with `cutoff_ms >= t`.
    pub fn prune(&mut self, cutoff_ms: i64) {
        while let Some(&(t, _)) = self.samples.front() {
            if t <= cutoff_ms {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last(&self) -> Option<(i64, f64)> {
        self.samples.back().copied()
    }

    /// Values with timestamp >= cutoff, oldest first.
    pub fn values_since(&self, cutoff_ms: i64) -> Vec<f64> {
        self.samples
            .iter()
            .filter(|&&(t, _)| t >= cutoff_ms)
            .map(|&(_, v)| v)
            .collect()
    }

    pub fn min_max_since(&self, cutoff_ms: i64) -> Option<(f64, f64)> {
        let mut iter = self.samples.iter().filter(|&&(t, _)| t >= cutoff_ms).map(|&(_, v)| v);
        let first = iter.next()?;
        let (mut lo, mut hi) = (first, first);
        for v in iter {
            if v < lo {
                lo = v;
            }
            if v > hi {
                hi = v;
            }
        }
        Some((lo, hi))
    }

    /// `(max - min) / last * 10_000`. 0 with fewer than 2 samples; infinite
    /// when the last sample is 0.
    pub fn volatility_bps(&self, cutoff_ms: i64) -> f64 {
        let values = self.values_since(cutoff_ms);
        if values.len() < 2 {
            return 0.0;
        }
        let last = *values.last().unwrap();
        let (lo, hi) = values.iter().fold((f64::MAX, f64::MIN), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
        if last == 0.0 {
            return f64::INFINITY;
        }
        (hi - lo) / last * 10_000.0
    }

    /// `(max - min) / ((max + min) / 2) * 10_000`.
    pub fn amplitude_bps(&self, cutoff_ms: i64) -> f64 {
        let values = self.values_since(cutoff_ms);
        if values.len() < 2 {
            return 0.0;
        }
        let (lo, hi) = values.iter().fold((f64::MAX, f64::MIN), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
        let mid = (hi + lo) / 2.0;
        if mid == 0.0 {
            return 0.0;
        }
        (hi - lo) / mid * 10_000.0
    }

    /// Walks samples newest-to-oldest, counting a consecutive streak of
    /// same-signed diffs (flat diffs are skipped without breaking the
    /// streak). Returns a signed count: positive for an up-trend, negative
    /// for a down-trend.
    pub fn consecutive_direction(&self, cutoff_ms: i64) -> i32 {
        let values = self.values_since(cutoff_ms);
        if values.len() < 2 {
            return 0;
        }
        let mut direction = 0i32;
        let mut count = 0i32;
        for pair in values.windows(2).rev() {
            let diff = pair[1] - pair[0];
            if diff == 0.0 {
                continue;
            }
            let sign = if diff > 0.0 { 1 } else { -1 };
            if direction == 0 {
                direction = sign;
                count = 1;
            } else if sign == direction {
                count += 1;
            } else {
                break;
            }
        }
        direction * count
    }

    /// Ratio of the latest sample to the mean of the rest, gated on having
    /// at least `min_samples + 1` samples in the window. Returns
    /// `(ratio, current, average, count)`.
    pub fn volume_ratio(&self, cutoff_ms: i64, min_samples: usize) -> Option<(f64, f64, f64, usize)> {
        let values = self.values_since(cutoff_ms);
        if values.len() < min_samples + 1 {
            return None;
        }
        let current = *values.last().unwrap();
        let baseline = &values[..values.len() - 1];
        let avg = baseline.iter().sum::<f64>() / baseline.len() as f64;
        let ratio = if avg == 0.0 { 0.0 } else { current / avg };
        Some((ratio, current, avg, values.len()))
    }

    /// Average value over the window, gated on a minimum sample count.
    pub fn average_since(&self, cutoff_ms: i64, min_samples: usize) -> Option<f64> {
        let values = self.values_since(cutoff_ms);
        if values.len() < min_samples {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_has_zero_volatility_and_no_trend() {
        let w = RollingWindow::new(60_000);
        assert_eq!(w.volatility_bps(0), 0.0);
        assert_eq!(w.amplitude_bps(0), 0.0);
        assert_eq!(w.consecutive_direction(0), 0);
    }

    #[test]
    fn prune_removes_sample_when_cutoff_at_or_after_sample_time() {
        let mut w = RollingWindow::new(60_000);
        w.append(1_000, 100.0);
        w.prune(999);
        assert_eq!(w.len(), 1);
        w.prune(1_000);
        assert_eq!(w.len(), 0);
    }

    #[test]
    fn out_of_order_sample_is_dropped() {
        let mut w = RollingWindow::new(60_000);
        w.append(1_000, 100.0);
        w.append(500, 90.0);
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn volatility_bps_matches_formula() {
        let mut w = RollingWindow::new(60_000);
        w.append(0, 60_000.0);
        w.append(1_000, 60_030.0);
        // (60030 - 60000) / 60030 * 10000
        let expected = (60_030.0 - 60_000.0) / 60_030.0 * 10_000.0;
        assert!((w.volatility_bps(0) - expected).abs() < 1e-9);
    }

    #[test]
    fn volatility_is_infinite_when_last_sample_is_zero() {
        let mut w = RollingWindow::new(60_000);
        w.append(0, 5.0);
        w.append(1_000, 0.0);
        assert!(w.volatility_bps(0).is_infinite());
    }

    #[test]
    fn consecutive_direction_skips_flat_diffs() {
        let mut w = RollingWindow::new(60_000);
        for (t, v) in [(0, 100.0), (1, 101.0), (2, 101.0), (3, 102.0), (4, 100.0)] {
            w.append(t, v);
        }
        // newest-first diffs: 100-102=-2 (down, count=1), 102-101=1 stop (sign flip)
        assert_eq!(w.consecutive_direction(0), -1);
    }

    #[test]
    fn volume_ratio_requires_min_samples_plus_one() {
        let mut w = RollingWindow::new(60_000);
        for t in 0..5 {
            w.append(t, 10.0);
        }
        assert!(w.volume_ratio(0, 5).is_none());
        w.append(5, 50.0);
        let (ratio, current, avg, count) = w.volume_ratio(0, 5).unwrap();
        assert_eq!(count, 6);
        assert_eq!(current, 50.0);
        assert_eq!(avg, 10.0);
        assert_eq!(ratio, 5.0);
    }
}
