use std::time::{Duration, Instant};

use crate::loss::LossValues;

/// Running loss sums over one epoch.
///
/// Null losses are not added, but the epoch mean still divides by the full
/// batch count: a batch without a loss counts as a zero contribution.
#[derive(Debug, Clone)]
pub struct EpochLosses {
    total: f64,
    heads: Vec<f64>,
    batches: usize,
}

impl EpochLosses {
    pub fn new(sub_losses: usize) -> Self {
        Self {
            total: 0.0,
            heads: vec![0.0; sub_losses],
            batches: 0,
        }
    }

    pub fn record(&mut self, values: &LossValues) {
        if let Some(loss) = values.total {
            self.total += loss;
        }
        for (sum, head) in self.heads.iter_mut().zip(&values.heads) {
            if let Some(loss) = head {
                *sum += loss;
            }
        }
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Mean total and per-head losses over `n_batches`.
    pub fn means(&self, n_batches: usize) -> (f64, Vec<f64>) {
        let n = n_batches.max(1) as f64;
        (
            self.total / n,
            self.heads.iter().map(|sum| sum / n).collect(),
        )
    }
}

/// Wall-clock bookkeeping for the batch loop: time spent inside a batch and
/// time spent waiting for the loader between batches.
#[derive(Debug)]
pub struct BatchClock {
    epoch_start: Instant,
    last_batch_end: Instant,
    batch_start: Instant,
}

impl BatchClock {
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            epoch_start: now,
            last_batch_end: now,
            batch_start: now,
        }
    }

    /// Marks the start of a batch and returns the data wait since the last one.
    pub fn begin_batch(&mut self) -> Duration {
        self.batch_start = Instant::now();
        self.batch_start.duration_since(self.last_batch_end)
    }

    pub fn batch_elapsed(&self) -> Duration {
        self.batch_start.elapsed()
    }

    pub fn end_batch(&mut self) {
        self.last_batch_end = Instant::now();
    }

    pub fn epoch_elapsed(&self) -> Duration {
        self.epoch_start.elapsed()
    }
}

/// Rounds half away from zero to `places` decimals.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

pub fn round_optional(value: Option<f64>, places: i32) -> Option<f64> {
    value.map(|v| round_to(v, places))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn means_divide_by_batch_count_and_skip_nulls() {
        let mut losses = EpochLosses::new(2);
        losses.record(&LossValues {
            total: Some(3.0),
            heads: vec![Some(1.0), Some(2.0)],
        });
        losses.record(&LossValues {
            total: None,
            heads: vec![None, None],
        });
        losses.record(&LossValues {
            total: Some(1.5),
            heads: vec![None, Some(1.5)],
        });

        let (total, heads) = losses.means(3);
        assert!((total - 1.5).abs() < 1e-12);
        assert!((heads[0] - 1.0 / 3.0).abs() < 1e-12);
        assert!((heads[1] - 3.5 / 3.0).abs() < 1e-12);
        assert_eq!(losses.batches(), 3);
    }

    #[test]
    fn rounding_matches_requested_precision() {
        assert_eq!(round_to(1.23456, 3), 1.235);
        assert_eq!(round_to(-0.00049, 3), -0.0);
        assert_eq!(round_optional(Some(2.0004), 3), Some(2.0));
        assert_eq!(round_optional(None, 3), None);
    }
}
