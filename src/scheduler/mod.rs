//! Epoch-granular learning-rate schedules.
//!
//! A scheduler starts at epoch counter 0 and every [`LRScheduler::step`]
//! advances the counter by one epoch and returns the new rate. The trainer
//! steps once at the start of each training epoch and pushes the rate into
//! the optimizer.

use std::f64::consts::PI;

use crate::{config, TrainingError};

pub trait LRScheduler {
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    /// Number of steps taken so far.
    fn epoch(&self) -> usize;
}

#[derive(Debug, Clone)]
pub enum SchedulerConfig {
    Constant {
        base_lr: f64,
        warm_up: WarmUp,
    },
    MultiStep {
        base_lr: f64,
        warm_up: WarmUp,
        decay_epochs: Vec<usize>,
        decay_factor: f64,
    },
    Cosine {
        base_lr: f64,
        warm_up: WarmUp,
        total_epochs: usize,
        min_lr: f64,
    },
    Polynomial {
        base_lr: f64,
        warm_up: WarmUp,
        total_epochs: usize,
        min_lr: f64,
        power: f64,
    },
}

/// Exponential warm-up: the rate starts at `factor * base_lr` and reaches
/// `base_lr` after `epochs` epochs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarmUp {
    pub epochs: usize,
    pub factor: f64,
}

impl WarmUp {
    pub const NONE: WarmUp = WarmUp {
        epochs: 0,
        factor: 1.0,
    };

    pub fn multiplier(&self, epoch: usize) -> f64 {
        if epoch >= self.epochs {
            return 1.0;
        }
        self.factor
            .powf(1.0 - epoch as f64 / self.epochs as f64)
    }
}

impl SchedulerConfig {
    /// Translates the file configuration. Returns `None` when scheduling is
    /// disabled.
    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
        total_epochs: usize,
    ) -> Result<Option<Self>, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        let warm_up = WarmUp {
            epochs: cfg.warm_up_epochs,
            factor: cfg.warm_up_factor,
        };
        let min_lr = cfg.min_lr.unwrap_or(0.0);
        if min_lr < 0.0 || min_lr > base_lr {
            return Err(TrainingError::initialization(
                "scheduler min_lr must be in [0, base_lr]",
            ));
        }

        let schedule = match cfg.strategy {
            config::LearningRateSchedule::Disabled => return Ok(None),
            config::LearningRateSchedule::Constant => SchedulerConfig::Constant { base_lr, warm_up },
            config::LearningRateSchedule::MultiStep => SchedulerConfig::MultiStep {
                base_lr,
                warm_up,
                decay_epochs: cfg.decay_epochs.clone(),
                decay_factor: cfg.decay_factor,
            },
            config::LearningRateSchedule::Cosine => SchedulerConfig::Cosine {
                base_lr,
                warm_up,
                total_epochs,
                min_lr,
            },
            config::LearningRateSchedule::Polynomial => SchedulerConfig::Polynomial {
                base_lr,
                warm_up,
                total_epochs,
                min_lr,
                power: if cfg.power <= 0.0 { 1.0 } else { cfg.power },
            },
        };
        Ok(Some(schedule))
    }

    pub fn build(self) -> Box<dyn LRScheduler> {
        Box::new(EpochScheduler::new(self))
    }
}

struct EpochScheduler {
    schedule: SchedulerConfig,
    epoch: usize,
    current_lr: f64,
}

impl EpochScheduler {
    fn new(schedule: SchedulerConfig) -> Self {
        let mut scheduler = Self {
            schedule,
            epoch: 0,
            current_lr: 0.0,
        };
        scheduler.current_lr = scheduler.compute_lr(0);
        scheduler
    }

    fn compute_lr(&self, epoch: usize) -> f64 {
        match &self.schedule {
            SchedulerConfig::Constant { base_lr, warm_up } => base_lr * warm_up.multiplier(epoch),
            SchedulerConfig::MultiStep {
                base_lr,
                warm_up,
                decay_epochs,
                decay_factor,
            } => {
                let decays = decay_epochs.iter().filter(|&&e| epoch >= e).count();
                base_lr * warm_up.multiplier(epoch) * decay_factor.powi(decays as i32)
            }
            SchedulerConfig::Cosine {
                base_lr,
                warm_up,
                total_epochs,
                min_lr,
            } => {
                if epoch < warm_up.epochs {
                    return base_lr * warm_up.multiplier(epoch);
                }
                let progress = decay_progress(epoch, warm_up.epochs, *total_epochs);
                let cosine = 0.5 * (1.0 + f64::cos(PI * progress));
                min_lr + (base_lr - min_lr) * cosine
            }
            SchedulerConfig::Polynomial {
                base_lr,
                warm_up,
                total_epochs,
                min_lr,
                power,
            } => {
                if epoch < warm_up.epochs {
                    return base_lr * warm_up.multiplier(epoch);
                }
                let progress = decay_progress(epoch, warm_up.epochs, *total_epochs);
                let decay = (1.0 - progress).max(0.0).powf(*power);
                min_lr + (base_lr - min_lr) * decay
            }
        }
    }
}

impl LRScheduler for EpochScheduler {
    fn step(&mut self) -> f64 {
        self.epoch = self.epoch.saturating_add(1);
        self.current_lr = self.compute_lr(self.epoch);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn epoch(&self) -> usize {
        self.epoch
    }
}

fn decay_progress(epoch: usize, warm_up_epochs: usize, total_epochs: usize) -> f64 {
    if total_epochs <= warm_up_epochs {
        return 1.0;
    }
    let effective = epoch.saturating_sub(warm_up_epochs) as f64;
    let span = (total_epochs - warm_up_epochs) as f64;
    (effective / span).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12 * b.abs().max(1.0)
    }

    #[test]
    fn multi_step_decays_at_configured_epochs() {
        let mut scheduler = SchedulerConfig::MultiStep {
            base_lr: 1.0,
            warm_up: WarmUp::NONE,
            decay_epochs: vec![2, 4],
            decay_factor: 0.1,
        }
        .build();

        assert!(close(scheduler.learning_rate(), 1.0));
        let rates: Vec<f64> = (0..5).map(|_| scheduler.step()).collect();
        let expected = [1.0, 0.1, 0.1, 0.01, 0.01];
        for (rate, want) in rates.iter().zip(expected) {
            assert!(close(*rate, want), "{rates:?}");
        }
        assert_eq!(scheduler.epoch(), 5);
    }

    #[test]
    fn warm_up_is_exponential_towards_base() {
        let warm_up = WarmUp {
            epochs: 2,
            factor: 0.01,
        };
        assert!(close(warm_up.multiplier(0), 0.01));
        assert!(close(warm_up.multiplier(1), 0.1));
        assert!(close(warm_up.multiplier(2), 1.0));
        assert!(close(warm_up.multiplier(10), 1.0));
    }

    #[test]
    fn cosine_reaches_min_lr_at_the_end() {
        let mut scheduler = SchedulerConfig::Cosine {
            base_lr: 1.0,
            warm_up: WarmUp::NONE,
            total_epochs: 4,
            min_lr: 0.1,
        }
        .build();
        assert!(close(scheduler.learning_rate(), 1.0));
        scheduler.step();
        scheduler.step();
        assert!(close(scheduler.learning_rate(), 0.55));
        scheduler.step();
        scheduler.step();
        assert!(close(scheduler.learning_rate(), 0.1));
        scheduler.step();
        assert!(close(scheduler.learning_rate(), 0.1));
    }

    #[test]
    fn polynomial_decays_linearly_with_unit_power() {
        let mut scheduler = SchedulerConfig::Polynomial {
            base_lr: 2.0,
            warm_up: WarmUp::NONE,
            total_epochs: 4,
            min_lr: 0.0,
            power: 1.0,
        }
        .build();
        assert!(close(scheduler.step(), 1.5));
        assert!(close(scheduler.step(), 1.0));
    }

    #[test]
    fn disabled_strategy_builds_nothing() {
        let cfg = config::SchedulerConfig {
            strategy: config::LearningRateSchedule::Disabled,
            ..config::SchedulerConfig::default()
        };
        assert!(SchedulerConfig::from_training_config(&cfg, 1e-3, 10)
            .unwrap()
            .is_none());
    }
}
