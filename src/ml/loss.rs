// ============================================================
// Layer 5 — Multi-Head Loss Aggregator
// ============================================================
// Turns one batch of per-head logits into one scalar loss.
//
// For every head of the configured set:
//   1. copy the head's logits to the host (detached)
//   2. ask the OHEM sampler for hard positive / negative rows
//   3. cross-entropy over the selected rows only:
//        head_loss = mean CE(positives) + mean CE(negatives)
//      an empty side contributes 0
//
// Then combine:
//   total = Σ main heads + pos_neg (if present) + λ · aux
//
// The main heads are summed unweighted. λ only scales the
// auxiliary segmentation head; with λ = 0 the auxiliary loss is
// still computed and reported but never enters the total, so
// total equals the main-head sum exactly.
//
// "crf" mode replaces all of this with the CRF sequence NLL over
// full sequences: no sampling, no auxiliary head.
//
// A non-finite head loss that enters the total, or a non-finite
// total, is a NumericInstability naming the head.
//
// Reference: Lin et al. (2021) ViBERTgrid §3.4 (OHEM loss)

use std::collections::BTreeMap;

use burn::{prelude::*, tensor::activation::log_softmax};

use crate::domain::config::{ClassifierMode, RunConfig};
use crate::domain::error::{Component, TrainError, TrainResult};
use crate::domain::head::{build_head_specs, HeadId, HeadSpec, HeadTarget};
use crate::domain::selection::SampleSelection;
use crate::domain::targets::BatchTargets;
use crate::ml::crf;
use crate::ml::model::ModelOutput;
use crate::ml::ohem::{OhemSampler, ScaleView};

// ─── LossBreakdown ────────────────────────────────────────────────────────────
/// One batch worth of losses. `total` carries the autodiff graph;
/// everything else is plain numbers for logging.
pub struct LossBreakdown<B: Backend> {
    pub total:         Tensor<B, 1>,
    pub total_loss:    f64,
    pub per_head_loss: BTreeMap<HeadId, f64>,
    pub selections:    BTreeMap<HeadId, SampleSelection>,
}

// ─── Objective ────────────────────────────────────────────────────────────────
/// The loss objective, one variant per classifier mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    /// Per-token cross-entropy over OHEM-selected rows (simp, full)
    HardExampleCrossEntropy,
    /// Linear-chain CRF negative log-likelihood (crf)
    SequenceLikelihood,
}

impl From<ClassifierMode> for Objective {
    fn from(mode: ClassifierMode) -> Self {
        match mode {
            ClassifierMode::Simp | ClassifierMode::Full => Objective::HardExampleCrossEntropy,
            ClassifierMode::Crf => Objective::SequenceLikelihood,
        }
    }
}

// ─── LossAggregator ───────────────────────────────────────────────────────────
pub struct LossAggregator {
    objective:      Objective,
    heads:          Vec<HeadSpec>,
    lambda:         f64,
    background_tag: usize,
    sampler:        OhemSampler,
}

impl LossAggregator {
    pub fn new(cfg: &RunConfig) -> Self {
        Self {
            objective:      cfg.structure.classifier_mode.into(),
            heads:          build_head_specs(cfg),
            lambda:         cfg.structure.loss_control_lambda,
            background_tag: cfg.background_tag(),
            sampler:        OhemSampler::new(cfg.seed),
        }
    }

    pub fn heads(&self) -> &[HeadSpec] {
        &self.heads
    }

    pub fn objective(&self) -> Objective {
        self.objective
    }

    pub fn compute<B: Backend>(&mut self, outputs: &ModelOutput<B>, targets: &BatchTargets) -> TrainResult<LossBreakdown<B>> {
        match self.objective {
            Objective::HardExampleCrossEntropy => self.compute_hard_examples(outputs, targets),
            Objective::SequenceLikelihood      => self.compute_sequence(outputs, targets),
        }
    }

    fn compute_hard_examples<B: Backend>(
        &mut self,
        outputs: &ModelOutput<B>,
        targets: &BatchTargets,
    ) -> TrainResult<LossBreakdown<B>> {
        let device = outputs.main_1.device();
        let mut total         = Tensor::<B, 1>::zeros([1], &device);
        let mut per_head_loss = BTreeMap::new();
        let mut selections    = BTreeMap::new();

        // Split borrows: the sampler is mutated while the head list is read.
        let Self { heads, sampler, lambda, background_tag, .. } = self;

        for spec in heads.iter() {
            targets.check(Component::Aggregator, Some(spec.head_id))?;
            let (logits, labels, masks) = head_inputs(spec, outputs, targets, *background_tag)?;
            let host = to_host(&logits, spec.head_id)?;

            let views: Vec<ScaleView<'_>> = scale_views(&host, &labels, &masks, spec.num_classes);
            let selection = sampler.select_scales(&views, spec)?;

            let flat_labels: Vec<usize> = labels.concat();
            let loss  = selected_cross_entropy(logits, &flat_labels, &selection);
            let value = loss.clone().into_scalar().elem::<f64>();

            tracing::debug!(
                head = spec.head_id.as_str(),
                loss = value,
                positive = selection.positive.len(),
                negative = selection.negative.len(),
                "head loss"
            );

            if spec.head_id.is_auxiliary() {
                // λ = 0 keeps the forward pass but drops the term entirely
                if *lambda > 0.0 {
                    ensure_finite(value, spec.head_id)?;
                    total = total + loss * *lambda;
                }
            } else {
                ensure_finite(value, spec.head_id)?;
                total = total + loss;
            }

            per_head_loss.insert(spec.head_id, value);
            selections.insert(spec.head_id, selection);
        }

        let total_loss = total.clone().into_scalar().elem::<f64>();
        if !total_loss.is_finite() {
            return Err(TrainError::NumericInstability {
                component: Component::Aggregator,
                head:      None,
                value:     total_loss,
            });
        }
        Ok(LossBreakdown { total, total_loss, per_head_loss, selections })
    }

    fn compute_sequence<B: Backend>(
        &mut self,
        outputs: &ModelOutput<B>,
        targets: &BatchTargets,
    ) -> TrainResult<LossBreakdown<B>> {
        let transitions = outputs.transitions.clone().ok_or_else(|| {
            TrainError::invalid_batch(Component::Aggregator, Some(HeadId::Crf), "model produced no transition scores")
        })?;

        let total = crf::neg_log_likelihood(outputs.main_1.clone(), transitions, targets)?;
        let total_loss = total.clone().into_scalar().elem::<f64>();
        ensure_finite(total_loss, HeadId::Crf)?;

        tracing::debug!(head = HeadId::Crf.as_str(), loss = total_loss, "sequence loss");

        let per_head_loss = BTreeMap::from([(HeadId::Crf, total_loss)]);
        let selections    = BTreeMap::from([(HeadId::Crf, SampleSelection::default())]);
        Ok(LossBreakdown { total, total_loss, per_head_loss, selections })
    }
}

fn ensure_finite(value: f64, head: HeadId) -> TrainResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(TrainError::NumericInstability { component: Component::Aggregator, head: Some(head), value })
    }
}

/// Logits (all scales concatenated), labels and masks per scale.
fn head_inputs<B: Backend>(
    spec:           &HeadSpec,
    outputs:        &ModelOutput<B>,
    targets:        &BatchTargets,
    background_tag: usize,
) -> TrainResult<(Tensor<B, 2>, Vec<Vec<usize>>, Vec<Vec<bool>>)> {
    let missing = |what: &str| {
        TrainError::invalid_batch(Component::Aggregator, Some(spec.head_id), format!("model produced no {what} logits"))
    };

    let logits = match spec.head_id {
        HeadId::Main1     => outputs.main_1.clone(),
        HeadId::Main2     => outputs.main_2.clone().ok_or_else(|| missing("main_2"))?,
        HeadId::PosNeg    => outputs.pos_neg.clone().ok_or_else(|| missing("pos_neg"))?,
        HeadId::Auxiliary => {
            if outputs.aux_scales.is_empty() {
                return Err(missing("segmentation"));
            }
            Tensor::cat(outputs.aux_scales.clone(), 0)
        }
        HeadId::Crf       => return Err(missing("token")),
    };

    let (labels, masks) = match spec.target {
        HeadTarget::FieldType    => (vec![targets.token_tags.clone()], vec![targets.token_mask.clone()]),
        HeadTarget::KeyFlag      => (vec![targets.key_flags(background_tag)], vec![targets.token_mask.clone()]),
        HeadTarget::Segmentation => (targets.aux_labels.clone(), targets.aux_masks.clone()),
        HeadTarget::Sequence     => return Err(missing("token")),
    };

    let [rows, classes] = logits.dims();
    let expected: usize = labels.iter().map(Vec::len).sum();
    if rows != expected || classes != spec.num_classes {
        return Err(TrainError::invalid_batch(
            Component::Aggregator,
            Some(spec.head_id),
            format!(
                "logits are [{rows}, {classes}], labels need [{expected}, {}]",
                spec.num_classes
            ),
        ));
    }
    Ok((logits, labels, masks))
}

fn to_host<B: Backend>(logits: &Tensor<B, 2>, head: HeadId) -> TrainResult<Vec<f32>> {
    logits
        .clone()
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| TrainError::invalid_batch(Component::Sampler, Some(head), format!("cannot read logits: {e:?}")))
}

fn scale_views<'a>(
    host:        &'a [f32],
    labels:      &'a [Vec<usize>],
    masks:       &'a [Vec<bool>],
    num_classes: usize,
) -> Vec<ScaleView<'a>> {
    let mut offset = 0;
    labels
        .iter()
        .zip(masks)
        .map(|(l, m)| {
            let rows = l.len();
            let view = ScaleView::new(&host[offset * num_classes..(offset + rows) * num_classes], l, m);
            offset += rows;
            view
        })
        .collect()
}

/// Mean CE over the selected positives plus mean CE over the
/// selected negatives. Rows outside the selection get no gradient.
pub fn selected_cross_entropy<B: Backend>(
    logits:    Tensor<B, 2>,
    labels:    &[usize],
    selection: &SampleSelection,
) -> Tensor<B, 1> {
    let device    = logits.device();
    let log_probs = log_softmax(logits, 1);

    let side = |indices: Vec<usize>| -> Tensor<B, 1> {
        if indices.is_empty() {
            return Tensor::zeros([1], &device);
        }
        let n = indices.len();
        let rows: Vec<i64>    = indices.iter().map(|&i| i as i64).collect();
        let targets: Vec<i64> = indices.iter().map(|&i| labels[i] as i64).collect();
        let rows    = Tensor::<B, 1, Int>::from_data(TensorData::new(rows, [n]), &device);
        let targets = Tensor::<B, 2, Int>::from_data(TensorData::new(targets, [n, 1]), &device);
        log_probs.clone().select(0, rows).gather(1, targets).mean().neg()
    };

    side(selection.positive_indices()) + side(selection.negative_indices())
}
