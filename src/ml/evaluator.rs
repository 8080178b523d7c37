// ============================================================
// Layer 5 — Validation
// ============================================================
// Scores the model on the held-out documents after every epoch.
//
// Runs on `B::InnerBackend` with a detached copy of the model, so
// held-out batches never record an autodiff graph. The loader must
// therefore produce inner-backend batches.
//
// Per batch:
//   1. forward pass
//   2. validation loss through the same LossAggregator as training
//   3. one predicted tag per token:
//        simp  argmax of main_1            (gate head may veto)
//        full  argmax of main_2, but tokens main_1 calls
//              "non-key" are forced to background
//        crf   Viterbi path over main_1 emissions
//   4. compare with the gold tags of the real (unpadded) tokens
//
// Reported scores:
//   accuracy          correct tokens / real tokens
//   precision/recall  micro-averaged over fields
//        tag mode B    unit = field token
//        tag mode BIO  unit = entity span (B-x I-x I-x ...), a span
//                      counts only when type, start and end all match
//   f1                2PR / (P + R), the model-selection metric
//
// Reference: Tjong Kim Sang & De Meulder (2003) CoNLL-2003 NER
//            evaluation (span-level micro F1)

use std::sync::Arc;

use burn::{
    data::dataloader::DataLoader,
    prelude::*,
    tensor::backend::AutodiffBackend,
};

use crate::data::batcher::DocumentBatch;
use crate::domain::config::{ClassifierMode, RunConfig, TagMode};
use crate::domain::error::{Component, TrainError, TrainResult};
use crate::domain::head::HeadId;
use crate::domain::targets::BatchTargets;
use crate::domain::traits::{ValidationReport, Validator};
use crate::ml::crf::viterbi_decode;
use crate::ml::loss::LossAggregator;
use crate::ml::model::{FieldInference, FieldTagger, ModelOutput};

// ─── Evaluator ────────────────────────────────────────────────────────────────
/// `B` is the training backend; batches live on its inner backend.
pub struct Evaluator<B: AutodiffBackend> {
    loader:     Arc<dyn DataLoader<DocumentBatch<B::InnerBackend>>>,
    aggregator: LossAggregator,
    mode:       ClassifierMode,
    tag_mode:   TagMode,
    background: usize,
}

impl<B: AutodiffBackend> Evaluator<B> {
    pub fn new(cfg: &RunConfig, loader: Arc<dyn DataLoader<DocumentBatch<B::InnerBackend>>>) -> Self {
        Self {
            loader,
            aggregator: LossAggregator::new(cfg),
            mode:       cfg.structure.classifier_mode,
            tag_mode:   cfg.structure.tag_mode,
            background: cfg.background_tag(),
        }
    }
}

impl<B: AutodiffBackend, M: FieldTagger<B>> Validator<M> for Evaluator<B> {
    fn validate(&mut self, model: &M) -> TrainResult<ValidationReport> {
        let mut tally      = Tally::default();
        let mut loss_sum   = 0.0f64;
        let mut batches    = 0usize;
        let model          = model.inference();

        for batch in self.loader.iter() {
            let output = model.infer(&batch)?;
            let loss   = self.aggregator.compute(&output, &batch.targets)?;
            loss_sum += loss.total_loss;
            batches  += 1;

            let predicted = predict_tags(&output, self.mode, &batch.targets, self.background)?;
            let targets   = &batch.targets;
            for b in 0..targets.batch_size {
                let start = b * targets.seq_len;
                let gold  = targets.sequence_tags(b);
                tally.add_sequence(&predicted[start..start + gold.len()], gold, self.tag_mode, self.background);
            }
        }

        let mean_loss = if batches > 0 { loss_sum / batches as f64 } else { f64::NAN };
        let report = tally.report(mean_loss);
        tracing::debug!(?report, batches, "validation pass");
        Ok(report)
    }
}

// ─── Prediction ───────────────────────────────────────────────────────────────

/// One predicted tag per token slot, flattened [batch * seq_len].
/// Padding slots are filled with the background tag.
pub fn predict_tags<B: Backend>(
    output:     &ModelOutput<B>,
    mode:       ClassifierMode,
    targets:    &BatchTargets,
    background: usize,
) -> TrainResult<Vec<usize>> {
    targets.check(Component::Orchestrator, None)?;
    let [rows, main_1_classes] = output.main_1.dims();
    if rows != targets.num_tokens() {
        return Err(TrainError::invalid_batch(
            Component::Orchestrator,
            Some(HeadId::Main1),
            format!("{rows} logit rows for {} token slots", targets.num_tokens()),
        ));
    }
    let main_1 = to_host(&output.main_1)?;

    let mut tags = match mode {
        ClassifierMode::Simp => {
            let mut tags = argmax_rows(&main_1, main_1_classes);
            if let Some(gate) = &output.pos_neg {
                let gate = argmax_rows(&to_host(gate)?, 2);
                veto(&mut tags, &gate, background);
            }
            tags
        }
        ClassifierMode::Full => {
            let field = output.main_2.as_ref().ok_or_else(|| {
                TrainError::invalid_batch(Component::Orchestrator, None, "full mode needs main_2 logits")
            })?;
            let [_, field_classes] = field.dims();
            let mut tags = argmax_rows(&to_host(field)?, field_classes);
            veto(&mut tags, &argmax_rows(&main_1, main_1_classes), background);
            tags
        }
        ClassifierMode::Crf => {
            let transitions = output.transitions.as_ref().ok_or_else(|| {
                TrainError::invalid_batch(Component::Orchestrator, None, "crf mode needs transition scores")
            })?;
            let transitions = to_host(transitions)?;
            let mut tags = vec![background; rows];
            for b in 0..targets.batch_size {
                let start = b * targets.seq_len;
                let end   = start + targets.seq_lens[b];
                let path  = viterbi_decode(
                    &main_1[start * main_1_classes..end * main_1_classes],
                    &transitions,
                    main_1_classes,
                );
                tags[start..end].copy_from_slice(&path);
            }
            tags
        }
    };

    for (tag, &real) in tags.iter_mut().zip(&targets.token_mask) {
        if !real {
            *tag = background;
        }
    }
    Ok(tags)
}

/// Tokens the binary head calls background (class 0) lose their field tag.
fn veto(tags: &mut [usize], gate: &[usize], background: usize) {
    for (tag, &flag) in tags.iter_mut().zip(gate) {
        if flag == 0 {
            *tag = background;
        }
    }
}

fn argmax_rows(host: &[f32], classes: usize) -> Vec<usize> {
    host.chunks(classes.max(1))
        .map(|row| {
            row.iter()
                .enumerate()
                .max_by(|(i, a), (j, b)| a.total_cmp(b).then(j.cmp(i)))
                .map_or(0, |(i, _)| i)
        })
        .collect()
}

fn to_host<B: Backend>(t: &Tensor<B, 2>) -> TrainResult<Vec<f32>> {
    t.clone()
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| TrainError::invalid_batch(Component::Orchestrator, None, format!("cannot read logits: {e:?}")))
}

// ─── Scoring ──────────────────────────────────────────────────────────────────

/// An entity span: field index and token range [start, end).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Span {
    pub field: usize,
    pub start: usize,
    pub end:   usize,
}

/// Entity spans of a BIO sequence (B-f = 2f, I-f = 2f + 1).
/// An I tag that does not continue a span of the same field opens
/// a new one.
pub fn extract_spans(tags: &[usize], background: usize) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut open: Option<Span> = None;

    for (i, &tag) in tags.iter().enumerate() {
        let continues = tag != background
            && tag % 2 == 1
            && open.is_some_and(|span| span.field == tag / 2);
        if continues {
            continue;
        }
        if let Some(mut span) = open.take() {
            span.end = i;
            spans.push(span);
        }
        if tag != background {
            open = Some(Span { field: tag / 2, start: i, end: i + 1 });
        }
    }
    if let Some(mut span) = open {
        span.end = tags.len();
        spans.push(span);
    }
    spans
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    tokens:    usize,
    correct:   usize,
    matched:   usize,
    predicted: usize,
    actual:    usize,
}

impl Tally {
    fn add_sequence(&mut self, predicted: &[usize], gold: &[usize], tag_mode: TagMode, background: usize) {
        self.tokens  += gold.len();
        self.correct += predicted.iter().zip(gold).filter(|(p, g)| p == g).count();

        match tag_mode {
            TagMode::B => {
                self.predicted += predicted.iter().filter(|&&p| p != background).count();
                self.actual    += gold.iter().filter(|&&g| g != background).count();
                self.matched   += predicted
                    .iter()
                    .zip(gold)
                    .filter(|(p, g)| p == g && **g != background)
                    .count();
            }
            TagMode::Bio => {
                let pred_spans = extract_spans(predicted, background);
                let gold_spans = extract_spans(gold, background);
                self.predicted += pred_spans.len();
                self.actual    += gold_spans.len();
                self.matched   += pred_spans.iter().filter(|s| gold_spans.contains(s)).count();
            }
        }
    }

    fn report(&self, loss: f64) -> ValidationReport {
        let ratio = |n: usize, d: usize| if d == 0 { 0.0 } else { n as f64 / d as f64 };
        let precision = ratio(self.matched, self.predicted);
        let recall    = ratio(self.matched, self.actual);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        ValidationReport {
            loss,
            accuracy: ratio(self.correct, self.tokens),
            precision,
            recall,
            f1,
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn tensor2(values: Vec<f32>, shape: [usize; 2]) -> Tensor<TestBackend, 2> {
        Tensor::from_data(TensorData::new(values, shape), &Default::default())
    }

    fn one_sequence(tags: Vec<usize>) -> BatchTargets {
        let n = tags.len();
        BatchTargets {
            batch_size: 1,
            seq_len:    n,
            token_mask: vec![true; n],
            token_tags: tags,
            seq_lens:   vec![n],
            ..Default::default()
        }
    }

    #[test]
    fn test_extract_spans_bio() {
        // fields: 0 → B=0 I=1, 1 → B=2 I=3; O = 4
        let tags = [0, 1, 4, 2, 3, 3, 1, 4];
        assert_eq!(
            extract_spans(&tags, 4),
            vec![
                Span { field: 0, start: 0, end: 2 },
                Span { field: 1, start: 3, end: 6 },
                Span { field: 0, start: 6, end: 7 },
            ]
        );
        assert!(extract_spans(&[4, 4], 4).is_empty());
    }

    #[test]
    fn test_span_scores_need_exact_boundaries() {
        let mut tally = Tally::default();
        // gold: one field-0 span [0,3); prediction cuts it short
        tally.add_sequence(&[0, 1, 4, 4], &[0, 1, 1, 4], TagMode::Bio, 4);
        let report = tally.report(0.0);
        assert_eq!(report.precision, 0.0);
        assert_eq!(report.recall, 0.0);
        assert_eq!(report.accuracy, 0.75);
    }

    #[test]
    fn test_token_scores_in_b_mode() {
        let mut tally = Tally::default();
        // background = 2
        tally.add_sequence(&[0, 2, 1, 1], &[0, 1, 1, 2], TagMode::B, 2);
        let report = tally.report(1.5);
        // predicted fields 3, gold fields 3, matched 2
        assert!((report.precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((report.recall - 2.0 / 3.0).abs() < 1e-12);
        assert!((report.f1 - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(report.loss, 1.5);
    }

    #[test]
    fn test_full_mode_gate_forces_background() {
        let output = ModelOutput {
            // token 1 is called non-key
            main_1:      tensor2(vec![0.0, 1.0, 1.0, 0.0, 0.0, 1.0], [3, 2]),
            main_2:      Some(tensor2(vec![2.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 3.0, 0.0], [3, 3])),
            pos_neg:     None,
            aux_scales:  Vec::new(),
            transitions: None,
        };
        let tags = predict_tags(&output, ClassifierMode::Full, &one_sequence(vec![0, 2, 1]), 2).unwrap();
        assert_eq!(tags, vec![0, 2, 1]);
    }

    #[test]
    fn test_sequence_past_padded_width_is_invalid_batch() {
        let mut targets = one_sequence(vec![0, 1, 2]);
        targets.seq_lens = vec![5];
        let output = ModelOutput {
            main_1:      tensor2(vec![0.0; 9], [3, 3]),
            main_2:      None,
            pos_neg:     None,
            aux_scales:  Vec::new(),
            transitions: Some(tensor2(vec![0.0; 9], [3, 3])),
        };
        let res = predict_tags(&output, ClassifierMode::Crf, &targets, 2);
        assert!(matches!(res, Err(TrainError::InvalidBatch { .. })));
    }

    #[test]
    fn test_crf_mode_decodes_real_tokens_only() {
        let mut targets = one_sequence(vec![1, 0, 2]);
        targets.seq_lens   = vec![2];
        targets.token_mask = vec![true, true, false];
        let output = ModelOutput {
            main_1:      tensor2(vec![0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 5.0, 5.0, 0.0], [3, 3]),
            main_2:      None,
            pos_neg:     None,
            aux_scales:  Vec::new(),
            transitions: Some(tensor2(vec![0.0; 9], [3, 3])),
        };
        let tags = predict_tags(&output, ClassifierMode::Crf, &targets, 2).unwrap();
        assert_eq!(tags, vec![1, 0, 2]);
    }
}
