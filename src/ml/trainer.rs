// ============================================================
// Layer 5 — Training Loop Orchestrator
// ============================================================
// Drives a run through its phases:
//
//   Init ──▶ EpochStart ──▶ BatchLoop ──▶ EpochEnd ──┐
//              ▲                                      │
//              └──────────── next epoch ◀─────────────┤
//                                                     ▼
//                                                   Done
//
// Init
//   build both Schedules and both optimizer groups, the loss
//   aggregator and the loss scaler; optionally resume from a
//   checkpoint, all or nothing.
//
// EpochStart
//   advance both Schedules once; hand each group its weight decay
//   and remember its learning rate for the epoch's steps.
//
// BatchLoop, strictly one batch after another:
//   acquire loss scale → forward → aggregate → backward
//   → split gradients per group → unscale → step both groups
//   → settle loss scale
//   Gradients are consumed by the step, so nothing accumulates
//   between batches. Any failure ends the run; a batch is never
//   skipped or retried. The only skipped step is a loss-scale
//   overflow, which leaves both groups untouched.
//
// EpochEnd
//   validate, log a metrics row, write the `latest` checkpoint,
//   and the `best` checkpoint when validation F1 improves.
//
// The two optimizer groups never see each other's gradients:
// `GradientsParams::from_module` takes exactly the gradients of
// one group's parameters out of the shared backward result.
//
// Reference: Burn Book §5 (Custom Training Loop)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use burn::{
    data::dataloader::DataLoader,
    module::Module,
    optim::GradientsParams,
    tensor::backend::AutodiffBackend,
};

use crate::data::batcher::DocumentBatch;
use crate::data::epochs::EpochLoader;
use crate::domain::config::{ClassifierMode, RunConfig};
use crate::domain::error::{Component, OptimizerGroup, TrainError, TrainResult};
use crate::domain::head::HeadId;
use crate::domain::traits::Validator;
use crate::infra::checkpoint::{self, CheckpointManager, RunState, Slot};
use crate::infra::metrics::{EpochMetrics, MetricsLogger};
use crate::ml::loss::LossAggregator;
use crate::ml::model::FieldTagger;
use crate::ml::optim::GroupOptimizer;
use crate::ml::precision::LossScaler;
use crate::ml::schedule::{GroupRates, Schedule};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    EpochStart,
    BatchLoop,
    EpochEnd,
    Done,
}

/// What one training step produced.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub total_loss:    f64,
    pub per_head_loss: BTreeMap<HeadId, f64>,
    /// Loss-scale overflow: neither group was updated
    pub skipped:       bool,
}

/// Running sums over one epoch's batches.
#[derive(Debug, Default)]
struct EpochTally {
    loss_sum:  f64,
    head_sums: BTreeMap<HeadId, f64>,
    batches:   usize,
    skipped:   usize,
}

impl EpochTally {
    fn add(&mut self, report: &StepReport) {
        self.loss_sum += report.total_loss;
        for (head, loss) in &report.per_head_loss {
            *self.head_sums.entry(*head).or_insert(0.0) += loss;
        }
        self.batches += 1;
        self.skipped += usize::from(report.skipped);
    }

    fn mean_loss(&self) -> f64 {
        if self.batches > 0 { self.loss_sum / self.batches as f64 } else { f64::NAN }
    }

    fn head_means(&self) -> BTreeMap<HeadId, f64> {
        self.head_sums
            .iter()
            .map(|(head, sum)| (*head, sum / self.batches as f64))
            .collect()
    }
}

// ─── Trainer ──────────────────────────────────────────────────────────────────
pub struct Trainer<B: AutodiffBackend, M: FieldTagger<B>> {
    mode:         ClassifierMode,
    end_epoch:    usize,
    device:       B::Device,
    cnn_schedule: Schedule,
    lm_schedule:  Schedule,
    cnn_optim:    GroupOptimizer<M::Visual, B>,
    lm_optim:     GroupOptimizer<M::Language, B>,
    cnn_rates:    GroupRates,
    lm_rates:     GroupRates,
    aggregator:   LossAggregator,
    scaler:       LossScaler,
    checkpoints:  CheckpointManager,
    metrics:      MetricsLogger,
    phase:        Phase,
    epoch:        Option<usize>,
    global_step:  usize,
    best_f1:      Option<f64>,
    best_path:    Option<PathBuf>,
    latest_path:  Option<PathBuf>,
}

impl<B: AutodiffBackend, M: FieldTagger<B>> Trainer<B, M> {
    /// Init: everything is built from the configuration, nothing is
    /// restored yet.
    pub fn new(cfg: &RunConfig, device: B::Device) -> TrainResult<Self> {
        cfg.validate()?;

        let cnn_cfg = &cfg.optimizer_cnn_hyp;
        let lm_cfg  = &cfg.optimizer_bert_hyp;
        let cnn_schedule = Schedule::new(OptimizerGroup::Cnn, cnn_cfg, cfg.start_epoch, cfg.end_epoch)?;
        let lm_schedule  = Schedule::new(OptimizerGroup::LanguageModel, lm_cfg, cfg.start_epoch, cfg.end_epoch)?;
        let cnn_rates = cnn_schedule.rate_for(cfg.start_epoch);
        let lm_rates  = lm_schedule.rate_for(cfg.start_epoch);

        let cnn_optim = GroupOptimizer::new(
            OptimizerGroup::Cnn,
            cnn_cfg.update_rule(OptimizerGroup::Cnn)?,
            cnn_cfg.grad_clip_norm,
            cnn_rates.weight_decay,
        );
        let lm_optim = GroupOptimizer::new(
            OptimizerGroup::LanguageModel,
            lm_cfg.update_rule(OptimizerGroup::LanguageModel)?,
            lm_cfg.grad_clip_norm,
            lm_rates.weight_decay,
        );

        let aggregator = LossAggregator::new(cfg);
        let heads: Vec<HeadId> = aggregator.heads().iter().map(|h| h.head_id).collect();

        if cfg.sync_bn {
            tracing::warn!("syncBN is set but this run is single-process; ignored");
        }
        let scaler = LossScaler::new(&cfg.loss_scale, cfg.amp);
        if scaler.is_enabled() {
            tracing::info!("Mixed precision: dynamic loss scaling from {}", scaler.scale());
        }
        tracing::info!(
            "Trainer ready: mode={:?} epochs {}..{} cnn={} bert={}",
            cfg.structure.classifier_mode,
            cfg.start_epoch,
            cfg.end_epoch,
            cnn_optim.rule().kind(),
            lm_optim.rule().kind(),
        );

        Ok(Self {
            mode:        cfg.structure.classifier_mode,
            end_epoch:   cfg.end_epoch,
            device,
            cnn_schedule,
            lm_schedule,
            cnn_optim,
            lm_optim,
            cnn_rates,
            lm_rates,
            aggregator,
            scaler,
            checkpoints: CheckpointManager::new(&cfg.save_top)?,
            metrics:     MetricsLogger::new(&cfg.save_log, heads)?,
            phase:       Phase::Init,
            epoch:       None,
            global_step: 0,
            best_f1:     None,
            best_path:   None,
            latest_path: None,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Epoch currently in progress (or last finished).
    pub fn epoch(&self) -> Option<usize> {
        self.epoch
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn best_f1(&self) -> Option<f64> {
        self.best_f1
    }

    pub fn loss_scale(&self) -> f64 {
        self.scaler.scale()
    }

    // ── Init: resume ─────────────────────────────────────────────────────────

    /// Restore model weights, both optimizer states, both schedule
    /// counters and the run bookkeeping from a checkpoint directory.
    ///
    /// Every check runs and every record is read before any of it
    /// is applied; on error the trainer is exactly as before.
    pub fn resume(&mut self, model: M, dir: &Path) -> TrainResult<M> {
        let state = checkpoint::read_state(dir)?;
        let mismatch = |group: Option<OptimizerGroup>, msg: String| TrainError::ResumeMismatch {
            component: Component::Orchestrator,
            group,
            path: dir.to_path_buf(),
            msg,
        };

        if state.classifier_mode != self.mode {
            return Err(mismatch(
                None,
                format!("checkpoint is {:?} mode, run is {:?}", state.classifier_mode, self.mode),
            ));
        }
        let groups = [
            (OptimizerGroup::Cnn, &state.cnn_rule, self.cnn_optim.rule().kind(), state.cnn_params, model.visual().num_params()),
            (OptimizerGroup::LanguageModel, &state.lm_rule, self.lm_optim.rule().kind(), state.lm_params, model.language().num_params()),
        ];
        for (group, saved_rule, rule, saved_params, params) in groups {
            if saved_rule.as_str() != rule {
                return Err(mismatch(Some(group), format!("checkpoint optimizer is {saved_rule}, run uses {rule}")));
            }
            if saved_params != params {
                return Err(mismatch(Some(group), format!("checkpoint has {saved_params} parameters, model has {params}")));
            }
        }

        let next = state.last_epoch + 1;
        for (group, counter) in [
            (OptimizerGroup::Cnn, state.cnn_schedule.current_epoch),
            (OptimizerGroup::LanguageModel, state.lm_schedule.current_epoch),
        ] {
            if counter != next {
                return Err(mismatch(
                    Some(group),
                    format!("schedule counter {counter} does not follow last epoch {}", state.last_epoch),
                ));
            }
        }

        let at_dir = |err: TrainError| match err {
            TrainError::ResumeMismatch { component, group, msg, .. } => TrainError::ResumeMismatch {
                component,
                group,
                path: dir.to_path_buf(),
                msg,
            },
            other => other,
        };
        let mut cnn_schedule = self.cnn_schedule.clone();
        let mut lm_schedule  = self.lm_schedule.clone();
        cnn_schedule.restore(state.cnn_schedule).map_err(at_dir)?;
        lm_schedule.restore(state.lm_schedule).map_err(at_dir)?;

        // Optimizers were last built with the decay of the saved epoch
        let cnn_rates = cnn_schedule.rate_for(state.last_epoch);
        let lm_rates  = lm_schedule.rate_for(state.last_epoch);
        let (cnn_path, lm_path) = checkpoint::optimizer_paths(dir, state.last_epoch);
        let mut cnn_optim = GroupOptimizer::new(
            OptimizerGroup::Cnn,
            self.cnn_optim.rule(),
            self.cnn_optim.clip_norm(),
            cnn_rates.weight_decay,
        );
        cnn_optim.load(&cnn_path, &self.device)?;
        let mut lm_optim = GroupOptimizer::new(
            OptimizerGroup::LanguageModel,
            self.lm_optim.rule(),
            self.lm_optim.clip_norm(),
            lm_rates.weight_decay,
        );
        lm_optim.load(&lm_path, &self.device)?;

        let (visual, language) = model.into_parts();
        let visual   = checkpoint::load_module(dir, checkpoint::VISUAL, state.last_epoch, visual, &self.device)?;
        let language = checkpoint::load_module(dir, checkpoint::LANGUAGE, state.last_epoch, language, &self.device)?;

        // ── Apply ────────────────────────────────────────────────────────────
        self.cnn_schedule = cnn_schedule;
        self.lm_schedule  = lm_schedule;
        self.cnn_optim    = cnn_optim;
        self.lm_optim     = lm_optim;
        self.cnn_rates    = cnn_rates;
        self.lm_rates     = lm_rates;
        self.scaler.restore(state.loss_scale);
        self.epoch        = Some(state.last_epoch);
        self.global_step  = state.global_step;
        self.best_f1      = state.best_f1;
        self.latest_path  = Some(dir.to_path_buf());
        let best_dir = self.checkpoints.slot_dir(Slot::Best);
        if state.best_f1.is_some() && best_dir.is_dir() {
            self.best_path = Some(best_dir);
        }

        tracing::info!(
            "Resumed from '{}': epoch {} done, continuing at {}",
            dir.display(),
            state.last_epoch,
            next
        );
        Ok(M::from_parts(visual, language))
    }

    // ── EpochStart ───────────────────────────────────────────────────────────

    /// Advance both schedules and apply their rates. `None` once the
    /// last epoch has run.
    pub fn start_epoch(&mut self) -> TrainResult<Option<usize>> {
        self.phase = Phase::EpochStart;
        if self.cnn_schedule.state().current_epoch >= self.end_epoch {
            self.phase = Phase::Done;
            return Ok(None);
        }

        let (epoch, cnn_rates) = self.cnn_schedule.advance();
        let (lm_epoch, lm_rates) = self.lm_schedule.advance();
        if epoch != lm_epoch {
            return Err(TrainError::config(
                Component::Orchestrator,
                format!(
                    "schedules out of step: {} at {epoch}, {} at {lm_epoch}",
                    self.cnn_schedule.group(),
                    self.lm_schedule.group()
                ),
            ));
        }

        self.cnn_optim.set_weight_decay(cnn_rates.weight_decay);
        self.lm_optim.set_weight_decay(lm_rates.weight_decay);
        self.cnn_rates = cnn_rates;
        self.lm_rates  = lm_rates;
        self.epoch     = Some(epoch);

        tracing::info!(
            epoch,
            cnn_lr = cnn_rates.learning_rate,
            cnn_wd = cnn_rates.weight_decay,
            bert_lr = lm_rates.learning_rate,
            bert_wd = lm_rates.weight_decay,
            "epoch start"
        );
        self.phase = Phase::BatchLoop;
        Ok(Some(epoch))
    }

    // ── BatchLoop ────────────────────────────────────────────────────────────

    /// One forward / backward / dual-step cycle.
    pub fn train_batch(&mut self, model: M, batch: &DocumentBatch<B>) -> TrainResult<(M, StepReport)> {
        let scope = self.scaler.acquire();

        let output = model.forward(batch)?;
        let loss   = self.aggregator.compute(&output, &batch.targets)?;

        let mut grads = scope.scale_loss(loss.total).backward();
        let (visual, language) = model.into_parts();
        let cnn_grads = GradientsParams::from_module(&mut grads, &visual);
        let lm_grads  = GradientsParams::from_module(&mut grads, &language);
        let (cnn_grads, cnn_overflow) = scope.unscale(cnn_grads, &visual);
        let (lm_grads, lm_overflow)   = scope.unscale(lm_grads, &language);
        let skipped = cnn_overflow || lm_overflow;

        let (visual, language) = if skipped {
            (visual, language)
        } else {
            (
                self.cnn_optim.step(self.cnn_rates.learning_rate, visual, cnn_grads),
                self.lm_optim.step(self.lm_rates.learning_rate, language, lm_grads),
            )
        };
        scope.settle(skipped);
        self.global_step += 1;

        tracing::debug!(step = self.global_step, loss = loss.total_loss, skipped, "batch");
        let report = StepReport {
            total_loss:    loss.total_loss,
            per_head_loss: loss.per_head_loss,
            skipped,
        };
        Ok((M::from_parts(visual, language), report))
    }

    // ── EpochEnd ─────────────────────────────────────────────────────────────

    fn end_epoch<V: Validator<M>>(
        &mut self,
        model:     &M,
        tally:     &EpochTally,
        validator: &mut V,
    ) -> TrainResult<EpochMetrics> {
        self.phase = Phase::EpochEnd;
        let epoch = self.epoch.ok_or_else(|| {
            TrainError::config(Component::Orchestrator, "epoch ended before it started")
        })?;

        let validation = validator.validate(model)?;
        let metrics = EpochMetrics {
            epoch,
            train_loss: tally.mean_loss(),
            head_loss:  tally.head_means(),
            validation,
            cnn:        self.cnn_rates,
            lm:         self.lm_rates,
            loss_scale: self.scaler.scale(),
        };

        let improved = validation.f1.is_finite() && metrics.is_improvement(self.best_f1);
        if improved {
            self.best_f1 = Some(validation.f1);
        }

        let state = self.run_state(model, epoch);
        self.latest_path = Some(self.checkpoints.save(
            Slot::Latest,
            model.visual(),
            model.language(),
            &self.cnn_optim,
            &self.lm_optim,
            &state,
        )?);
        if improved {
            self.best_path = Some(self.checkpoints.save(
                Slot::Best,
                model.visual(),
                model.language(),
                &self.cnn_optim,
                &self.lm_optim,
                &state,
            )?);
            tracing::info!("New best F1 {:.4} at epoch {}", validation.f1, epoch);
        }
        self.metrics.log(&metrics)?;

        tracing::info!(
            "Epoch {:>3}/{} | train_loss={:.4} | val_loss={:.4} | acc={:.1}% | f1={:.4}{}",
            epoch,
            self.end_epoch,
            metrics.train_loss,
            validation.loss,
            validation.accuracy * 100.0,
            validation.f1,
            if tally.skipped > 0 { format!(" | {} steps skipped", tally.skipped) } else { String::new() },
        );
        Ok(metrics)
    }

    fn run_state(&self, model: &M, epoch: usize) -> RunState {
        RunState {
            last_epoch:      epoch,
            cnn_schedule:    self.cnn_schedule.state(),
            lm_schedule:     self.lm_schedule.state(),
            best_f1:         self.best_f1,
            global_step:     self.global_step,
            loss_scale:      self.scaler.state(),
            classifier_mode: self.mode,
            cnn_rule:        self.cnn_optim.rule().kind().to_string(),
            lm_rule:         self.lm_optim.rule().kind().to_string(),
            cnn_params:      model.visual().num_params(),
            lm_params:       model.language().num_params(),
        }
    }

    // ── Driving loop ─────────────────────────────────────────────────────────

    /// EpochStart → BatchLoop → EpochEnd for one epoch. Returns the
    /// epoch's metrics, or `None` when the run is already done.
    pub fn run_epoch<V: Validator<M>>(
        &mut self,
        mut model: M,
        loader:    &dyn DataLoader<DocumentBatch<B>>,
        validator: &mut V,
    ) -> TrainResult<(M, Option<EpochMetrics>)> {
        if self.start_epoch()?.is_none() {
            return Ok((model, None));
        }

        let mut tally = EpochTally::default();
        for batch in loader.iter() {
            let (next, report) = self.train_batch(model, &batch)?;
            model = next;
            tally.add(&report);
        }

        let metrics = self.end_epoch(&model, &tally, validator)?;
        Ok((model, Some(metrics)))
    }

    /// Train until `end_epoch`. Returns the best checkpoint, or the
    /// latest one if validation F1 never produced a best.
    ///
    /// Each epoch asks `loader` for its batches by epoch number, so
    /// a resumed run sees the order an uninterrupted one would.
    pub fn fit<V: Validator<M>, L: EpochLoader<B>>(
        mut self,
        mut model: M,
        loader:    L,
        validator: &mut V,
    ) -> TrainResult<PathBuf> {
        loop {
            let epoch   = loader.for_epoch(self.cnn_schedule.state().current_epoch);
            let (next, metrics) = self.run_epoch(model, epoch.as_ref(), validator)?;
            model = next;
            if metrics.is_none() {
                break;
            }
        }
        self.phase = Phase::Done;
        tracing::info!(best_f1 = ?self.best_f1(), "Training complete after {} steps", self.global_step);

        self.best_path
            .or(self.latest_path)
            .ok_or_else(|| TrainError::config(Component::Orchestrator, "run finished without a checkpoint"))
    }
}
