//! Built-in analysis models.
//!
//! Each model is an independent [`crate::registry::CausalModel`]
//! implementation; the worker knows nothing about what is in here.

mod did;
mod uplift;

pub use did::DifferenceInDifferences;
pub use uplift::ChannelUplift;

use crate::events::Event;

/// String field access into an event payload.
pub(crate) fn payload_str<'a>(event: &'a Event, field: &str) -> Option<&'a str> {
    event.payload.get(field).and_then(|v| v.as_str())
}

/// Numeric field access into an event payload.
pub(crate) fn payload_f64(event: &Event, field: &str) -> Option<f64> {
    event.payload.get(field).and_then(|v| v.as_f64())
}

/// Standard normal CDF via the Abramowitz-Stegun erf approximation.
/// Accurate to about 1.5e-7, plenty for reported p-values.
pub(crate) fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    const P: f64 = 0.327_591_1;
    const A1: f64 = 0.254_829_592;
    const A2: f64 = -0.284_496_736;
    const A3: f64 = 1.421_413_741;
    const A4: f64 = -1.453_152_027;
    const A5: f64 = 1.061_405_429;

    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}

/// Two-sided p-value for a z statistic.
pub(crate) fn two_sided_p(z: f64) -> f64 {
    if !z.is_finite() {
        return 1.0;
    }
    (2.0 * (1.0 - normal_cdf(z.abs()))).clamp(0.0, 1.0)
}

/// Running aggregate for one cell of a comparison.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Cell {
    pub n: u64,
    pub sum: f64,
    pub sum_sq: f64,
}

impl Cell {
    pub fn add(&mut self, outcome: f64) {
        self.n += 1;
        self.sum += outcome;
        self.sum_sq += outcome * outcome;
    }

    pub fn mean(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.sum / self.n as f64
        }
    }

    /// Squared standard error of the cell mean.
    pub fn se_sq(&self) -> f64 {
        if self.n < 2 {
            return 0.0;
        }
        let n = self.n as f64;
        let variance = (self.sum_sq - self.sum * self.sum / n) / (n - 1.0);
        variance.max(0.0) / n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_cdf_anchors() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-6);
        assert!((normal_cdf(1.96) - 0.975).abs() < 1e-3);
        assert!((normal_cdf(-1.96) - 0.025).abs() < 1e-3);
    }

    #[test]
    fn test_two_sided_p() {
        assert!((two_sided_p(0.0) - 1.0).abs() < 1e-6);
        assert!(two_sided_p(1.96) < 0.06);
        assert!(two_sided_p(5.0) < 1e-5);
        assert_eq!(two_sided_p(f64::NAN), 1.0);
    }

    #[test]
    fn test_cell_statistics() {
        let mut cell = Cell::default();
        for outcome in [1.0, 0.0, 1.0, 0.0] {
            cell.add(outcome);
        }
        assert_eq!(cell.n, 4);
        assert!((cell.mean() - 0.5).abs() < 1e-9);
        // Sample variance of {1,0,1,0} is 1/3; SE^2 = (1/3)/4.
        assert!((cell.se_sq() - (1.0 / 3.0) / 4.0).abs() < 1e-9);
    }
}
