// ============================================================
// Layer 5 — OHEM Sampler (Online Hard Example Mining)
// ============================================================
// Real documents are mostly background: a receipt has a few
// dozen field tokens against hundreds of "O" tokens. Training on
// every token lets the easy negatives drown the gradient of the
// rare positives, so each head only learns from a bounded number
// of its hardest examples per batch.
//
// Per head, per scale, per batch:
//
//   1. split valid (mask = 1) indices into positives (label is a
//      field class) and negatives (label is the background class)
//   2. optional: uniformly presample each side down to its cap
//   3. rank
//        positives ascending by p(correct class)   (least sure first)
//        negatives descending by 1 - p(background) (most wrongly
//                                                   confident first)
//   4. keep the top num_hard_positive / num_hard_negative,
//      clamping to what is available (never pad, never error)
//
// The multi-scale auxiliary head runs steps 1–4 on every scale
// with that scale's presample cap and unions the results.
//
// Ties are broken by index so the selection is a pure function
// of its inputs whenever random presampling is off.
//
// Everything here runs on host memory: logits arrive already
// detached and flattened, so the sampler never touches the
// autodiff graph.
//
// Reference: Shrivastava et al. (2016) Training Region-based
//            Object Detectors with Online Hard Example Mining

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::domain::error::{Component, TrainError, TrainResult};
use crate::domain::head::HeadSpec;
use crate::domain::selection::SampleSelection;

// ─── ScaleView ────────────────────────────────────────────────────────────────
/// Host copy of one scale of a head's output.
///
/// `logits` is row-major `[n, num_classes]`; `labels` and `mask`
/// have one entry per row.
#[derive(Debug, Clone, Copy)]
pub struct ScaleView<'a> {
    pub logits: &'a [f32],
    pub labels: &'a [usize],
    pub mask:   &'a [bool],
}

impl<'a> ScaleView<'a> {
    pub fn new(logits: &'a [f32], labels: &'a [usize], mask: &'a [bool]) -> Self {
        Self { logits, labels, mask }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

// A candidate row with its hardness score.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    index: usize,
    score: f32,
}

// ─── OhemSampler ──────────────────────────────────────────────────────────────
/// Owns the only process-local randomness of the training loop.
pub struct OhemSampler {
    rng: StdRng,
}

impl OhemSampler {
    /// A seeded sampler is reproducible; `None` draws from the OS.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None       => StdRng::from_entropy(),
        };
        Self { rng }
    }

    /// Select hard examples of a single-scale head.
    pub fn select(
        &mut self,
        logits: &[f32],
        labels: &[usize],
        mask:   &[bool],
        spec:   &HeadSpec,
    ) -> TrainResult<SampleSelection> {
        self.select_scales(&[ScaleView::new(logits, labels, mask)], spec)
    }

    /// Select hard examples over one or more scales. Indices of
    /// scale k are offset by the row counts of scales 0..k.
    pub fn select_scales(&mut self, scales: &[ScaleView<'_>], spec: &HeadSpec) -> TrainResult<SampleSelection> {
        if !spec.uses_ohem() {
            return Err(TrainError::invalid_batch(
                Component::Sampler,
                Some(spec.head_id),
                "sequence heads train on whole sequences and are never sampled",
            ));
        }
        if scales.len() != spec.num_scales() {
            return Err(TrainError::invalid_batch(
                Component::Sampler,
                Some(spec.head_id),
                format!("expected {} scale(s), got {}", spec.num_scales(), scales.len()),
            ));
        }

        let mut selection = SampleSelection::default();
        let mut offset    = 0usize;
        for (scale, view) in scales.iter().enumerate() {
            let picked = self.select_one_scale(view, spec, scale)?;
            selection.absorb(picked, offset);
            offset += view.len();
        }

        tracing::trace!(
            head = ?spec.head_id,
            positive = selection.positive.len(),
            negative = selection.negative.len(),
            "hard examples selected"
        );
        Ok(selection)
    }

    fn select_one_scale(&mut self, view: &ScaleView<'_>, spec: &HeadSpec, scale: usize) -> TrainResult<SampleSelection> {
        check_shapes(view, spec)?;

        let num_classes = spec.num_classes;
        let mut positives = Vec::new();
        let mut negatives = Vec::new();

        for (index, (&label, &valid)) in view.labels.iter().zip(view.mask).enumerate() {
            if !valid {
                continue;
            }
            let row = &view.logits[index * num_classes..(index + 1) * num_classes];
            if spec.is_positive(label) {
                positives.push(Candidate { index, score: softmax_prob(row, label) });
            } else {
                negatives.push(Candidate { index, score: 1.0 - softmax_prob(row, spec.background_class) });
            }
        }

        if spec.use_random_presample {
            self.presample(&mut positives, spec.presample_cap(scale, spec.num_hard_positive));
            self.presample(&mut negatives, spec.presample_cap(scale, spec.num_hard_negative));
        }

        // Least confident positives first.
        positives.sort_by(|a, b| a.score.total_cmp(&b.score).then(a.index.cmp(&b.index)));
        // Most confident false positives first.
        negatives.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.index.cmp(&b.index)));

        Ok(SampleSelection {
            positive: positives.iter().take(spec.num_hard_positive).map(|c| c.index).collect(),
            negative: negatives.iter().take(spec.num_hard_negative).map(|c| c.index).collect(),
        })
    }

    // Uniform subsample without replacement, in place.
    fn presample(&mut self, candidates: &mut Vec<Candidate>, cap: usize) {
        if candidates.len() <= cap {
            return;
        }
        let chosen = candidates.partial_shuffle(&mut self.rng, cap).0.to_vec();
        *candidates = chosen;
    }
}

fn check_shapes(view: &ScaleView<'_>, spec: &HeadSpec) -> TrainResult<()> {
    let n = view.labels.len();
    let fail = |msg: String| Err(TrainError::invalid_batch(Component::Sampler, Some(spec.head_id), msg));

    if view.mask.len() != n {
        return fail(format!("mask has {} entries for {} labels", view.mask.len(), n));
    }
    if view.logits.len() != n * spec.num_classes {
        return fail(format!(
            "logits hold {} values, expected {} rows x {} classes",
            view.logits.len(),
            n,
            spec.num_classes
        ));
    }
    if let Some((i, &label)) = view
        .labels
        .iter()
        .enumerate()
        .find(|&(i, &label)| view.mask[i] && label >= spec.num_classes)
    {
        return fail(format!("label {label} at index {i} is outside {} classes", spec.num_classes));
    }
    Ok(())
}

/// Softmax probability of `class` in one logit row.
pub fn softmax_prob(row: &[f32], class: usize) -> f32 {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = row.iter().map(|&x| (x - max).exp()).sum();
    (row[class] - max).exp() / sum
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::head::{HeadId, HeadTarget};

    fn spec(pos: usize, neg: usize, random: bool) -> HeadSpec {
        HeadSpec {
            head_id:              HeadId::Main2,
            target:               HeadTarget::FieldType,
            num_classes:          3,
            background_class:     2,
            num_hard_positive:    pos,
            num_hard_negative:    neg,
            presample_sizes:      Vec::new(),
            presample_ratio:      2,
            use_random_presample: random,
        }
    }

    /// Row whose background logit is `bg` and field-0 logit is `field`.
    fn row(field: f32, bg: f32) -> [f32; 3] {
        [field, 0.0, bg]
    }

    fn batch(positives: usize, negatives: usize) -> (Vec<f32>, Vec<usize>, Vec<bool>) {
        let mut logits = Vec::new();
        let mut labels = Vec::new();
        for i in 0..positives {
            logits.extend(row(i as f32 * 0.1, 0.0));
            labels.push(0);
        }
        for i in 0..negatives {
            // Larger i → lower background logit → harder negative.
            logits.extend(row(0.0, 5.0 - i as f32 * 0.004));
            labels.push(2);
        }
        let mask = vec![true; labels.len()];
        (logits, labels, mask)
    }

    #[test]
    fn test_scarce_positives_are_all_taken_and_negatives_are_hardest() {
        let (logits, labels, mask) = batch(5, 1000);
        let mut sampler = OhemSampler::new(Some(7));
        let sel = sampler.select(&logits, &labels, &mask, &spec(16, 16, false)).unwrap();

        assert_eq!(sel.positive_indices(), vec![0, 1, 2, 3, 4]);
        assert_eq!(sel.negative.len(), 16);
        // The 16 hardest negatives are the last 16 rows.
        let expected: Vec<usize> = (5 + 1000 - 16..5 + 1000).collect();
        assert_eq!(sel.negative_indices(), expected);
    }

    #[test]
    fn test_positives_rank_least_confident_first() {
        let (logits, labels, mask) = batch(10, 0);
        let mut sampler = OhemSampler::new(None);
        let sel = sampler.select(&logits, &labels, &mask, &spec(3, 3, false)).unwrap();
        // Row i has field logit 0.1 * i, so the lowest rows are least sure.
        assert_eq!(sel.positive_indices(), vec![0, 1, 2]);
        assert!(sel.negative.is_empty());
    }

    #[test]
    fn test_selection_never_exceeds_budget_or_availability() {
        let mut sampler = OhemSampler::new(Some(1));
        for (p, n) in [(0, 0), (0, 40), (3, 2), (50, 50)] {
            let (logits, labels, mask) = batch(p, n);
            for random in [false, true] {
                let head = spec(8, 12, random);
                let sel  = sampler.select(&logits, &labels, &mask, &head).unwrap();
                assert!(sel.positive.len() <= head.num_hard_positive.min(p));
                assert!(sel.negative.len() <= head.num_hard_negative.min(n));
                assert!(sel.positive.iter().all(|&i| labels[i] != 2));
                assert!(sel.negative.iter().all(|&i| labels[i] == 2));
            }
        }
    }

    #[test]
    fn test_masked_tokens_are_never_selected() {
        let (logits, labels, mut mask) = batch(4, 4);
        mask[0] = false;
        mask[7] = false;
        let mut sampler = OhemSampler::new(None);
        let sel = sampler.select(&logits, &labels, &mask, &spec(10, 10, false)).unwrap();
        assert!(!sel.positive.contains(&0));
        assert!(!sel.negative.contains(&7));
        assert_eq!(sel.len(), 6);
    }

    #[test]
    fn test_deterministic_without_random_presample() {
        let (logits, labels, mask) = batch(20, 200);
        let head = spec(4, 8, false);
        let a = OhemSampler::new(None).select(&logits, &labels, &mask, &head).unwrap();
        let b = OhemSampler::new(None).select(&logits, &labels, &mask, &head).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_random_presample_bounds_the_candidate_pool() {
        // Negative cap = 2 * 4 = 8 candidates, so the 4 picks come
        // from a random pool; with a fixed seed the draw is repeatable.
        let (logits, labels, mask) = batch(0, 300);
        let head = spec(4, 4, true);
        let a = OhemSampler::new(Some(11)).select(&logits, &labels, &mask, &head).unwrap();
        let b = OhemSampler::new(Some(11)).select(&logits, &labels, &mask, &head).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.negative.len(), 4);
    }

    #[test]
    fn test_multi_scale_selects_per_scale_and_offsets() {
        let mut head = spec(2, 2, false);
        head.head_id         = HeadId::Auxiliary;
        head.target          = HeadTarget::Segmentation;
        head.presample_sizes = vec![100, 100];

        let (l0, y0, m0) = batch(3, 3);
        let (l1, y1, m1) = batch(3, 3);
        let scales = [ScaleView::new(&l0, &y0, &m0), ScaleView::new(&l1, &y1, &m1)];

        let sel = OhemSampler::new(None).select_scales(&scales, &head).unwrap();
        assert_eq!(sel.positive_indices(), vec![0, 1, 6, 7]);
        assert_eq!(sel.negative_indices(), vec![4, 5, 10, 11]);
    }

    #[test]
    fn test_shape_mismatch_is_invalid_batch() {
        let (logits, labels, mask) = batch(2, 2);
        let head = spec(1, 1, false);
        let mut sampler = OhemSampler::new(None);

        let err = sampler.select(&logits[..6], &labels, &mask, &head).unwrap_err();
        assert!(matches!(err, TrainError::InvalidBatch { .. }));

        let bad_labels = vec![0, 0, 9, 2];
        let err = sampler.select(&logits, &bad_labels, &mask, &head).unwrap_err();
        assert!(matches!(err, TrainError::InvalidBatch { .. }));
    }

    #[test]
    fn test_softmax_prob_is_normalised() {
        let r = [1.0f32, 2.0, 3.0];
        let total: f32 = (0..3).map(|c| softmax_prob(&r, c)).sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(softmax_prob(&r, 2) > softmax_prob(&r, 0));
    }
}
