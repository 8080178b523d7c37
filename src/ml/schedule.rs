// ============================================================
// Layer 5 — Learning-Rate / Weight-Decay Schedule
// ============================================================
// One Schedule per optimizer group. Each is a pure function of
// the epoch number plus a single counter, so every process of a
// distributed run computes the same curve with no communication.
//
// Curve (relative epoch e = epoch - start_epoch, W = warmup):
//
//   e <  W : lr = warmup_init_lr + (lr0 - warmup_init_lr) * e / W
//            wd = weight_decay                (warm-up only ramps lr)
//
//   e >= W : p  = (e - W) / (T - 1),   T = end - start - W
//            c  = ½ (1 + cos(π p))
//            lr = lr0 - (lr0 - min_lr) * (1 - c)
//            wd = wd0 - (wd0 - min_wd) * (1 - c)  (only when wd0 > 0)
//
// At e = W the cosine starts at lr0, which is where the linear
// ramp was heading, so the boundary moves by one warm-up step at
// most. At the last epoch p = 1 and the curve sits exactly on
// min_lr / min_wd. W = 0 skips the ramp entirely.
//
// Reference: Loshchilov & Hutter (2017) SGDR: Stochastic Gradient
//            Descent with Warm Restarts
//            Goyal et al. (2017) Accurate, Large Minibatch SGD

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::domain::config::OptimizerGroupConfig;
use crate::domain::error::{Component, OptimizerGroup, TrainError, TrainResult};

/// The two values a Schedule hands to its optimizer each epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupRates {
    pub learning_rate: f64,
    pub weight_decay:  f64,
}

/// Mutable part of a Schedule: the next epoch it will hand out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub current_epoch: usize,
}

#[derive(Debug, Clone)]
pub struct Schedule {
    group:       OptimizerGroup,
    cfg:         OptimizerGroupConfig,
    start_epoch: usize,
    end_epoch:   usize,
    state:       ScheduleState,
}

impl Schedule {
    pub fn new(
        group:       OptimizerGroup,
        cfg:         &OptimizerGroupConfig,
        start_epoch: usize,
        end_epoch:   usize,
    ) -> TrainResult<Self> {
        if end_epoch <= start_epoch {
            return Err(TrainError::config(
                Component::Schedule,
                format!("group '{group}': end_epoch {end_epoch} must exceed start_epoch {start_epoch}"),
            ));
        }
        if cfg.warmup_epochs > end_epoch - start_epoch {
            return Err(TrainError::config(
                Component::Schedule,
                format!(
                    "group '{group}': {} warm-up epochs do not fit in {} epochs",
                    cfg.warmup_epochs,
                    end_epoch - start_epoch
                ),
            ));
        }
        Ok(Self {
            group,
            cfg: cfg.clone(),
            start_epoch,
            end_epoch,
            state: ScheduleState { current_epoch: start_epoch },
        })
    }

    pub fn group(&self) -> OptimizerGroup {
        self.group
    }

    pub fn state(&self) -> ScheduleState {
        self.state
    }

    /// Put the counter back where a checkpoint left it.
    pub fn restore(&mut self, state: ScheduleState) -> TrainResult<()> {
        if state.current_epoch < self.start_epoch || state.current_epoch > self.end_epoch {
            return Err(TrainError::ResumeMismatch {
                component: Component::Schedule,
                group:     Some(self.group),
                path:      Default::default(),
                msg:       format!(
                    "schedule counter {} outside run [{}, {})",
                    state.current_epoch, self.start_epoch, self.end_epoch
                ),
            });
        }
        self.state = state;
        Ok(())
    }

    /// Rates for the counter's epoch, then move the counter on.
    /// Called once per epoch boundary.
    pub fn advance(&mut self) -> (usize, GroupRates) {
        let epoch = self.state.current_epoch;
        let rates = self.rate_for(epoch);
        self.state.current_epoch += 1;
        (epoch, rates)
    }

    /// (learning_rate, weight_decay) for an absolute epoch number.
    /// Epochs past the end stay on the floor.
    pub fn rate_for(&self, epoch: usize) -> GroupRates {
        let cfg    = &self.cfg;
        let e      = epoch.saturating_sub(self.start_epoch);
        let warmup = cfg.warmup_epochs;

        if e < warmup {
            let frac = e as f64 / warmup as f64;
            return GroupRates {
                learning_rate: cfg.warmup_init_lr + (cfg.learning_rate - cfg.warmup_init_lr) * frac,
                weight_decay:  cfg.weight_decay,
            };
        }

        let decay_epochs = self.end_epoch - self.start_epoch - warmup;
        let progress = if decay_epochs <= 1 {
            1.0
        } else {
            (e - warmup) as f64 / (decay_epochs - 1) as f64
        };

        if progress >= 1.0 {
            return GroupRates {
                learning_rate: cfg.min_learning_rate,
                weight_decay:  if cfg.weight_decay > 0.0 { cfg.min_weight_decay } else { 0.0 },
            };
        }

        let cosine = 0.5 * (1.0 + (PI * progress).cos());
        GroupRates {
            learning_rate: cfg.learning_rate - (cfg.learning_rate - cfg.min_learning_rate) * (1.0 - cosine),
            weight_decay:  self.decayed_weight_decay(cosine),
        }
    }

    // Groups configured without weight decay keep it at zero.
    fn decayed_weight_decay(&self, cosine: f64) -> f64 {
        let cfg = &self.cfg;
        if cfg.weight_decay > 0.0 {
            cfg.weight_decay - (cfg.weight_decay - cfg.min_weight_decay) * (1.0 - cosine)
        } else {
            0.0
        }
    }

    /// Every epoch of the run with its rates.
    pub fn table(&self) -> Vec<(usize, GroupRates)> {
        (self.start_epoch..self.end_epoch)
            .map(|epoch| (epoch, self.rate_for(epoch)))
            .collect()
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn group_cfg(warmup: usize) -> OptimizerGroupConfig {
        OptimizerGroupConfig {
            learning_rate:     0.005,
            min_learning_rate: 0.00001,
            warmup_epochs:     warmup,
            warmup_init_lr:    0.0001,
            momentum:          Some(0.9),
            beta1:             None,
            beta2:             None,
            epsilon:           None,
            weight_decay:      0.005,
            min_weight_decay:  0.0005,
            grad_clip_norm:    None,
        }
    }

    fn schedule(warmup: usize, end: usize) -> Schedule {
        Schedule::new(OptimizerGroup::Cnn, &group_cfg(warmup), 0, end).unwrap()
    }

    #[test]
    fn test_pure_decay_hits_both_endpoints() {
        let s = schedule(0, 100);
        assert_eq!(s.rate_for(0).learning_rate, 0.005);
        assert_eq!(s.rate_for(99).learning_rate, 0.00001);
        assert_eq!(s.rate_for(99).weight_decay, 0.0005);
    }

    #[test]
    fn test_warmup_starts_at_init_lr() {
        let s = schedule(5, 100);
        assert_eq!(s.rate_for(0).learning_rate, 0.0001);
        assert_eq!(s.rate_for(0).weight_decay, 0.005);
        assert_eq!(s.rate_for(5).learning_rate, 0.005);
    }

    #[test]
    fn test_post_warmup_is_non_increasing() {
        let s = schedule(5, 100);
        let mut prev = s.rate_for(5);
        for epoch in 6..100 {
            let r = s.rate_for(epoch);
            assert!(r.learning_rate <= prev.learning_rate, "lr rose at epoch {epoch}");
            assert!(r.weight_decay <= prev.weight_decay, "wd rose at epoch {epoch}");
            prev = r;
        }
        assert_eq!(prev.learning_rate, 0.00001);
    }

    #[test]
    fn test_warmup_boundary_is_continuous() {
        let s          = schedule(5, 100);
        let warm_step  = (0.005 - 0.0001) / 5.0;
        let before     = s.rate_for(4).learning_rate;
        let after      = s.rate_for(5).learning_rate;
        assert!((after - before).abs() <= warm_step + 1e-12);
    }

    #[test]
    fn test_single_decay_epoch_lands_on_floor() {
        let s = schedule(2, 3);
        assert_eq!(s.rate_for(2).learning_rate, 0.00001);
        let s = schedule(0, 1);
        assert_eq!(s.rate_for(0).learning_rate, 0.00001);
    }

    #[test]
    fn test_zero_weight_decay_is_never_scheduled() {
        let mut cfg = group_cfg(0);
        cfg.weight_decay     = 0.0;
        cfg.min_weight_decay = 0.0;
        let s = Schedule::new(OptimizerGroup::Cnn, &cfg, 0, 10).unwrap();
        assert!(s.table().iter().all(|(_, r)| r.weight_decay == 0.0));
    }

    #[test]
    fn test_offset_start_epoch_is_relative() {
        let shifted = Schedule::new(OptimizerGroup::Cnn, &group_cfg(3), 10, 60).unwrap();
        let base    = schedule(3, 50);
        for e in 0..50 {
            assert_eq!(shifted.rate_for(10 + e), base.rate_for(e));
        }
    }

    #[test]
    fn test_advance_counts_epochs_and_groups_are_independent() {
        let mut cnn = schedule(2, 10);
        let mut lm  = Schedule::new(OptimizerGroup::LanguageModel, &group_cfg(0), 0, 10).unwrap();
        cnn.advance();
        cnn.advance();
        let (epoch, rates) = cnn.advance();
        assert_eq!(epoch, 2);
        assert_eq!(rates, cnn.rate_for(2));
        assert_eq!(lm.state().current_epoch, 0);
        assert_eq!(lm.advance().0, 0);
    }

    #[test]
    fn test_restore_rejects_foreign_counter() {
        let mut s = schedule(0, 10);
        assert!(s.restore(ScheduleState { current_epoch: 4 }).is_ok());
        assert!(matches!(
            s.restore(ScheduleState { current_epoch: 11 }),
            Err(TrainError::ResumeMismatch { .. })
        ));
    }

    #[test]
    fn test_warmup_longer_than_run_is_configuration_error() {
        let res = Schedule::new(OptimizerGroup::Cnn, &group_cfg(11), 0, 10);
        assert!(matches!(res, Err(TrainError::Configuration { .. })));
    }
}
