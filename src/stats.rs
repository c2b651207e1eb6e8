//! Summary statistics shared by the aggregation stages.
//!
//! Percentiles use linear interpolation between the two closest ranks
//! (`rank = q / 100 * (n - 1)` on the sorted values), everywhere in the crate.
//! Every function returns `None` for empty input instead of NaN, so "no data"
//! never turns into a number downstream.

use serde::{Deserialize, Serialize};

/// Arithmetic mean. `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Median (the 50th percentile).
pub fn median(values: &[f64]) -> Option<f64> {
    percentile(values, 50.0)
}

/// Linear-interpolation percentile, `q` in `[0, 100]` (clamped).
///
/// ```
/// use transit_speeds::stats::percentile;
///
/// let v = [10.0, 20.0, 30.0, 40.0, 50.0];
/// assert_eq!(percentile(&v, 5.0), Some(12.0));
/// assert!((percentile(&v, 95.0).unwrap() - 48.0).abs() < 1e-9);
/// ```
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = q.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64))
}

/// Lower and upper percentile of a group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileBand {
    pub low: f64,
    pub high: f64,
}

/// Percentile band at levels `low_q` and `high_q`.
///
/// With fewer than two values there is no spread to measure; both bounds fall
/// back to the mean. `None` only for empty input.
pub fn percentile_band(values: &[f64], low_q: f64, high_q: f64) -> Option<PercentileBand> {
    let m = mean(values)?;
    if values.len() < 2 {
        return Some(PercentileBand { low: m, high: m });
    }
    Some(PercentileBand {
        low: percentile(values, low_q)?,
        high: percentile(values, high_q)?,
    })
}

/// Centered rolling mean over a series with gaps.
///
/// The window at index `i` covers `i - half_width ..= i + half_width`, clipped
/// to the series. Only present values are averaged; a window with no present
/// value yields `None`.
pub fn centered_rolling_mean(series: &[Option<f64>], half_width: usize) -> Vec<Option<f64>> {
    (0..series.len())
        .map(|i| {
            let lo = i.saturating_sub(half_width);
            let hi = (i + half_width).min(series.len() - 1);
            let present: Vec<f64> = series[lo..=hi].iter().flatten().copied().collect();
            mean(&present)
        })
        .collect()
}

/// Running sum and count for a group mean.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeanAccumulator {
    sum: f64,
    count: usize,
}

impl MeanAccumulator {
    pub fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// `None` until a value has been pushed.
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_mean_and_median() {
        assert_eq!(mean(&[20.0, 30.0, 40.0]), Some(30.0));
        assert_eq!(mean(&[]), None);
        assert_eq!(median(&[5.0, 1.0, 3.0]), Some(3.0));
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), Some(2.5));
    }

    #[test]
    fn test_percentile_matches_linear_interpolation() {
        // Same values numpy.percentile gives with its default method
        let v = [12.0, 7.0, 31.0, 18.0];
        assert!(approx_eq(percentile(&v, 5.0).unwrap(), 7.75));
        assert!(approx_eq(percentile(&v, 95.0).unwrap(), 29.05));
        assert_eq!(percentile(&v, 0.0), Some(7.0));
        assert_eq!(percentile(&v, 100.0), Some(31.0));
    }

    #[test]
    fn test_band_falls_back_to_mean() {
        let band = percentile_band(&[42.0], 5.0, 95.0).unwrap();
        assert_eq!(band.low, 42.0);
        assert_eq!(band.high, 42.0);
        assert!(percentile_band(&[], 5.0, 95.0).is_none());
    }

    #[test]
    fn test_band_brackets_median() {
        let v = [10.0, 11.0, 12.0, 13.0, 200.0];
        let band = percentile_band(&v, 5.0, 95.0).unwrap();
        let m = median(&v).unwrap();
        assert!(band.low <= m && m <= band.high);
    }

    #[test]
    fn test_rolling_mean_edges_and_gaps() {
        let series = vec![Some(10.0), Some(20.0), None, None, None, Some(40.0)];
        let rolled = centered_rolling_mean(&series, 1);
        assert_eq!(rolled[0], Some(15.0)); // edge uses in-range neighbour only
        assert_eq!(rolled[1], Some(15.0));
        assert_eq!(rolled[2], Some(20.0));
        assert_eq!(rolled[3], None);
        assert_eq!(rolled[4], Some(40.0));
        assert_eq!(rolled[5], Some(40.0));
    }

    #[test]
    fn test_accumulator_mean() {
        let mut a = MeanAccumulator::default();
        a.push(20.0);
        a.push(30.0);
        a.push(40.0);
        assert_eq!(a.count(), 3);
        assert_eq!(a.mean(), Some(30.0));
        assert_eq!(MeanAccumulator::default().mean(), None);
    }
}
