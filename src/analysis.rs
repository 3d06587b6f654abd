//! Signal processing for the data plane
//!
//! Light per-channel analysis driven by dispatcher tasks: an exponential
//! smoothing filter over the voltage measurement and a least-squares
//! polynomial fit over a sliding window of recent samples. Both publish
//! their outputs back into the measurement table as derived metrics
//! (`voltage_filtered`, `dvdt_fit`) where callbacks can react to them
//! like any other measurement.

use crate::error::Result;
use crate::table::ChannelTable;
use crate::types::{keys, metric, validate_channel, Snapshot, MAX_CHANNELS};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

struct ChannelState {
    ewma: Option<f64>,
    window: VecDeque<(f64, f64)>,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            ewma: None,
            window: VecDeque::new(),
        }
    }
}

/// Per-channel filter and fit state.
pub struct AnalysisEngine {
    channels: Vec<Mutex<ChannelState>>,
    alpha: f64,
    window: usize,
    degree: usize,
}

impl AnalysisEngine {
    /// Create an engine with the given smoothing factor, fit window length
    /// and fit polynomial degree.
    pub fn new(alpha: f64, window: usize, degree: usize) -> Self {
        Self {
            channels: (0..MAX_CHANNELS)
                .map(|_| Mutex::new(ChannelState::new()))
                .collect(),
            alpha,
            window,
            degree,
        }
    }

    fn state(&self, channel: usize) -> Result<&Mutex<ChannelState>> {
        validate_channel(channel)?;
        Ok(&self.channels[channel])
    }

    /// Exponentially smooth the frame's voltage and publish the result.
    ///
    /// Frames without a voltage measurement are ignored.
    pub fn filter(&self, channel: usize, snapshot: &Snapshot, table: &ChannelTable) -> Result<()> {
        let Some(voltage) = metric(snapshot, keys::VOLTAGE) else {
            return Ok(());
        };
        let mut state = self
            .state(channel)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let smoothed = match state.ewma {
            Some(prev) => self.alpha * voltage + (1.0 - self.alpha) * prev,
            None => voltage,
        };
        state.ewma = Some(smoothed);
        drop(state);
        table.insert(channel, keys::VOLTAGE_FILTERED, smoothed)?;
        Ok(())
    }

    /// Add the frame's `(timestamp, voltage)` sample to the sliding window,
    /// refit, and publish the fitted voltage slope at the latest timestamp.
    ///
    /// Frames missing either measurement, or repeating the latest
    /// timestamp, are ignored.
    pub fn fit(&self, channel: usize, snapshot: &Snapshot, table: &ChannelTable) -> Result<()> {
        let (Some(voltage), Some(timestamp)) = (
            metric(snapshot, keys::VOLTAGE),
            metric(snapshot, keys::TIMESTAMP),
        ) else {
            return Ok(());
        };

        let mut state = self
            .state(channel)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.window.back().map(|&(t, _)| t) == Some(timestamp) {
            return Ok(());
        }
        state.window.push_back((timestamp, voltage));
        while state.window.len() > self.window {
            state.window.pop_front();
        }
        if state.window.len() < 2 {
            return Ok(());
        }

        // Shift timestamps to the window start for conditioning; the shift
        // does not change the derivative.
        let t0 = state.window[0].0;
        let xs: Vec<f64> = state.window.iter().map(|&(t, _)| t - t0).collect();
        let ys: Vec<f64> = state.window.iter().map(|&(_, v)| v).collect();
        let degree = self.degree.min(xs.len() - 1);
        let latest = *xs.last().unwrap_or(&0.0);
        drop(state);

        if let Some(coefficients) = polyfit(&xs, &ys, degree) {
            let slope = poly_derivative_at(&coefficients, latest);
            table.insert(channel, keys::DVDT_FIT, slope)?;
        } else {
            tracing::warn!(channel, "polynomial fit is singular, skipping");
        }
        Ok(())
    }
}

/// Least-squares polynomial fit.
///
/// Returns coefficients `c[0] + c[1]*x + ... + c[degree]*x^degree`, or
/// `None` when the normal equations are singular (e.g. repeated abscissae).
pub fn polyfit(xs: &[f64], ys: &[f64], degree: usize) -> Option<Vec<f64>> {
    if xs.len() != ys.len() || xs.len() <= degree {
        return None;
    }
    let n = degree + 1;

    // Normal equations: (Xᵀ X) c = Xᵀ y, built from power sums.
    let mut power_sums = vec![0.0; 2 * n - 1];
    for &x in xs {
        let mut p = 1.0;
        for sum in power_sums.iter_mut() {
            *sum += p;
            p *= x;
        }
    }
    let mut rhs = vec![0.0; n];
    for (&x, &y) in xs.iter().zip(ys) {
        let mut p = 1.0;
        for r in rhs.iter_mut() {
            *r += p * y;
            p *= x;
        }
    }
    let mut matrix: Vec<Vec<f64>> = (0..n)
        .map(|row| (0..n).map(|col| power_sums[row + col]).collect())
        .collect();

    // Gaussian elimination with partial pivoting.
    for col in 0..n {
        let pivot = (col..n).max_by(|&a, &b| {
            matrix[a][col]
                .abs()
                .partial_cmp(&matrix[b][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if matrix[pivot][col].abs() < 1e-12 {
            return None;
        }
        matrix.swap(col, pivot);
        rhs.swap(col, pivot);

        let pivot_row = matrix[col].clone();
        let pivot_rhs = rhs[col];
        for row in (col + 1)..n {
            let factor = matrix[row][col] / pivot_row[col];
            for k in col..n {
                matrix[row][k] -= factor * pivot_row[k];
            }
            rhs[row] -= factor * pivot_rhs;
        }
    }

    let mut coefficients = vec![0.0; n];
    for row in (0..n).rev() {
        let mut acc = rhs[row];
        for col in (row + 1)..n {
            acc -= matrix[row][col] * coefficients[col];
        }
        coefficients[row] = acc / matrix[row][row];
    }
    Some(coefficients)
}

/// Derivative of the fitted polynomial evaluated at `x`.
pub fn poly_derivative_at(coefficients: &[f64], x: f64) -> f64 {
    let mut slope = 0.0;
    let mut p = 1.0;
    for (power, &c) in coefficients.iter().enumerate().skip(1) {
        slope += power as f64 * c * p;
        p *= x;
    }
    slope
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Frame;

    fn frame(entries: &[(&str, f64)]) -> Frame {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_polyfit_recovers_line() {
        let xs: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 2.0 * x + 1.0).collect();
        let c = polyfit(&xs, &ys, 1).unwrap();
        assert!((c[0] - 1.0).abs() < 1e-9);
        assert!((c[1] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_polyfit_quadratic_slope() {
        let xs: Vec<f64> = (0..10).map(|i| i as f64 * 0.5).collect();
        let ys: Vec<f64> = xs.iter().map(|x| x * x).collect();
        let c = polyfit(&xs, &ys, 2).unwrap();
        // d/dx x^2 = 2x
        assert!((poly_derivative_at(&c, 3.0) - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_polyfit_rejects_underdetermined_input() {
        assert!(polyfit(&[1.0], &[2.0], 1).is_none());
        assert!(polyfit(&[1.0, 1.0, 1.0], &[2.0, 2.0, 2.0], 2).is_none());
    }

    #[test]
    fn test_filter_smooths_toward_input() {
        let engine = AnalysisEngine::new(0.5, 16, 2);
        let table = ChannelTable::new();

        engine
            .filter(0, &frame(&[(keys::VOLTAGE, 4.0)]), &table)
            .unwrap();
        assert_eq!(table.snapshot(0).unwrap()[keys::VOLTAGE_FILTERED], 4.0);

        engine
            .filter(0, &frame(&[(keys::VOLTAGE, 2.0)]), &table)
            .unwrap();
        assert_eq!(table.snapshot(0).unwrap()[keys::VOLTAGE_FILTERED], 3.0);
    }

    #[test]
    fn test_filter_ignores_frames_without_voltage() {
        let engine = AnalysisEngine::new(0.5, 16, 2);
        let table = ChannelTable::new();
        engine
            .filter(0, &frame(&[(keys::CURRENT, 1.0)]), &table)
            .unwrap();
        assert!(!table.snapshot(0).unwrap().contains_key(keys::VOLTAGE_FILTERED));
    }

    #[test]
    fn test_fit_publishes_slope_of_ramp() {
        let engine = AnalysisEngine::new(0.2, 8, 2);
        let table = ChannelTable::new();

        // 0.1 V/s ramp.
        for i in 0..8 {
            let t = i as f64;
            engine
                .fit(
                    1,
                    &frame(&[(keys::VOLTAGE, 3.0 + 0.1 * t), (keys::TIMESTAMP, t)]),
                    &table,
                )
                .unwrap();
        }
        let slope = table.snapshot(1).unwrap()[keys::DVDT_FIT];
        assert!((slope - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_fit_skips_repeated_timestamp() {
        let engine = AnalysisEngine::new(0.2, 8, 1);
        let table = ChannelTable::new();
        let f = frame(&[(keys::VOLTAGE, 3.0), (keys::TIMESTAMP, 1.0)]);
        engine.fit(0, &f, &table).unwrap();
        engine.fit(0, &f, &table).unwrap();
        // A single distinct sample is not enough to fit.
        assert!(!table.snapshot(0).unwrap().contains_key(keys::DVDT_FIT));
    }
}
