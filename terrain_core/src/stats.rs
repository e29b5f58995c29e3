//! Two-pass moment statistics.

use serde::{Deserialize, Serialize};

/// Number of distribution components compared by the matcher: mean, variance,
/// skewness, kurtosis.
pub const COMPONENT_COUNT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub variance: f64,
    pub skewness: f64,
    pub kurtosis: f64,
}

impl Statistics {
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = f64>,
        I::IntoIter: Clone,
    {
        let iter = values.into_iter();
        let mut acc = StatAccumulator::default();
        for v in iter.clone() {
            acc.push(v);
        }
        acc.advance();
        for v in iter {
            acc.push(v);
        }
        acc.finish()
    }

    pub fn stddev(&self) -> f64 {
        self.variance.sqrt()
    }

    pub fn components(&self) -> [f64; COMPONENT_COUNT] {
        [self.mean, self.variance, self.skewness, self.kurtosis]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Pass {
    #[default]
    Gathering,
    Centering,
}

/// Streaming accumulator run over the same data twice: `push*` → `advance` →
/// `push*` → `finish`. The second pass measures central moments against the
/// first pass's mean.
#[derive(Debug, Clone, Default)]
pub struct StatAccumulator {
    pass: Pass,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    mean: f64,
    m2: f64,
    m3: f64,
    m4: f64,
}

impl StatAccumulator {
    pub fn push(&mut self, value: f64) {
        match self.pass {
            Pass::Gathering => {
                if self.count == 0 {
                    self.min = value;
                    self.max = value;
                } else {
                    self.min = self.min.min(value);
                    self.max = self.max.max(value);
                }
                self.count += 1;
                self.sum += value;
            }
            Pass::Centering => {
                let d = value - self.mean;
                let d2 = d * d;
                self.m2 += d2;
                self.m3 += d2 * d;
                self.m4 += d2 * d2;
            }
        }
    }

    /// Finalize the first pass and start re-accumulating against its mean.
    pub fn advance(&mut self) {
        debug_assert_eq!(self.pass, Pass::Gathering);
        self.mean = if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        };
        self.pass = Pass::Centering;
    }

    pub fn finish(&self) -> Statistics {
        if self.count == 0 {
            return Statistics::default();
        }
        let n = self.count as f64;
        let variance = self.m2 / n;
        let (skewness, kurtosis) = if variance > f64::EPSILON {
            (
                (self.m3 / n) / variance.powf(1.5),
                (self.m4 / n) / (variance * variance),
            )
        } else {
            (0.0, 0.0)
        };
        Statistics {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            mean: self.mean,
            variance,
            skewness,
            kurtosis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moments_of_small_set() {
        let stats = Statistics::from_values([1.0, 2.0, 3.0, 4.0]);
        assert_eq!(stats.count, 4);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 4.0);
        assert!((stats.mean - 2.5).abs() < 1e-12);
        assert!((stats.variance - 1.25).abs() < 1e-12);
        assert!(stats.skewness.abs() < 1e-12);
        assert!((stats.kurtosis - 1.64).abs() < 1e-12);
    }

    #[test]
    fn constant_values_have_zero_shape() {
        let stats = Statistics::from_values(std::iter::repeat(3.0).take(10));
        assert_eq!(stats.variance, 0.0);
        assert_eq!(stats.skewness, 0.0);
        assert_eq!(stats.kurtosis, 0.0);
    }

    #[test]
    fn empty_input_is_default() {
        let stats = Statistics::from_values(Vec::<f64>::new());
        assert_eq!(stats, Statistics::default());
    }
}
