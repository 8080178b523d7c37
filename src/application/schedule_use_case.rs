// ============================================================
// Layer 2 — ScheduleUseCase
// ============================================================
// Computes the per-epoch learning rate and weight decay of both
// optimizer groups for a configuration, without training.
// Handy for checking warm-up length and decay floors before a
// long run is launched. The CLI prints the table.
//
// The configuration is validated exactly as `train` would, so a
// config that prints a table is one that can start a run.

use anyhow::{Context, Result};

use crate::domain::config::RunConfig;
use crate::domain::error::OptimizerGroup;
use crate::ml::schedule::{GroupRates, Schedule};

/// One epoch of the combined schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleRow {
    pub epoch: usize,
    pub cnn:   GroupRates,
    pub lm:    GroupRates,
}

pub struct ScheduleUseCase {
    config: RunConfig,
}

impl ScheduleUseCase {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<Vec<ScheduleRow>> {
        let cfg = &self.config;
        cfg.validate().context("invalid configuration")?;
        let cnn = Schedule::new(OptimizerGroup::Cnn, &cfg.optimizer_cnn_hyp, cfg.start_epoch, cfg.end_epoch)
            .context("cannot build CNN schedule")?;
        let lm = Schedule::new(
            OptimizerGroup::LanguageModel,
            &cfg.optimizer_bert_hyp,
            cfg.start_epoch,
            cfg.end_epoch,
        )
        .context("cannot build language-model schedule")?;

        let rows = cnn
            .table()
            .into_iter()
            .zip(lm.table())
            .map(|((epoch, cnn), (_, lm))| ScheduleRow { epoch, cnn, lm })
            .collect();
        Ok(rows)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_row_per_epoch_ending_on_the_floor() {
        let mut cfg = RunConfig::default();
        cfg.start_epoch = 2;
        cfg.end_epoch   = 12;
        let rows = ScheduleUseCase::new(cfg.clone()).execute().unwrap();

        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0].epoch, 2);
        assert_eq!(rows[0].cnn.learning_rate, cfg.optimizer_cnn_hyp.warmup_init_lr);
        let last = rows[9];
        assert_eq!(last.epoch, 11);
        assert_eq!(last.cnn.learning_rate, cfg.optimizer_cnn_hyp.min_learning_rate);
        assert_eq!(last.lm.learning_rate, cfg.optimizer_bert_hyp.min_learning_rate);
        assert_eq!(last.lm.weight_decay, cfg.optimizer_bert_hyp.min_weight_decay);
    }

    #[test]
    fn test_empty_run_is_an_error() {
        let mut cfg = RunConfig::default();
        cfg.end_epoch = cfg.start_epoch;
        assert!(ScheduleUseCase::new(cfg).execute().is_err());
    }

    #[test]
    fn test_config_train_would_reject_is_an_error() {
        let mut cfg = RunConfig::default();
        cfg.optimizer_cnn_hyp.beta1 = Some(0.9);
        assert!(ScheduleUseCase::new(cfg).execute().is_err());
    }
}
