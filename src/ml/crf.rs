// ============================================================
// Layer 5 — Linear-Chain CRF
// ============================================================
// In "crf" mode tokens are not classified independently: the
// tag sequence of a document is scored as a whole,
//
//   score(y) = Σ_t emission[t, y_t] + Σ_{t>0} transition[y_{t-1}, y_t]
//
// and the loss is the negative log-likelihood
//
//   nll = log Σ_y' exp(score(y'))  -  score(gold)
//
// The partition term comes from the forward algorithm: a running
// log-space vector α over tags,
//
//   α_0     = emission[0]
//   α_t[j]  = logsumexp_i(α_{t-1}[i] + transition[i, j]) + emission[t, j]
//   log Z   = logsumexp_j α_{T-1}[j]
//
// Only the real tokens of each sequence take part. Padding never
// enters either term. Training loss = mean nll over sequences.
//
// Decoding for validation is Viterbi on host memory.
//
// Reference: Lafferty et al. (2001) Conditional Random Fields
//            Lample et al. (2016) Neural Architectures for NER

use burn::prelude::*;

use crate::domain::error::{Component, TrainError, TrainResult};
use crate::domain::head::HeadId;
use crate::domain::targets::BatchTargets;

/// Numerically stable log Σ exp over `dim`, keeping the dim.
///
/// The shift is detached: the result does not depend on it, and
/// NdArray cannot scatter a max gradient along a leading dim.
fn log_sum_exp<B: Backend>(x: Tensor<B, 2>, dim: usize) -> Tensor<B, 2> {
    let dims = x.dims();
    let max  = x.clone().detach().max_dim(dim);
    let shifted = x - max.clone().expand(dims);
    shifted.exp().sum_dim(dim).log() + max
}

fn int_tensor<B: Backend, const D: usize>(values: &[usize], shape: [usize; D], device: &B::Device) -> Tensor<B, D, Int> {
    let data: Vec<i64> = values.iter().map(|&v| v as i64).collect();
    Tensor::from_data(TensorData::new(data, shape), device)
}

/// Mean negative log-likelihood of the gold tag sequences.
///
/// `emissions` is [batch * seq_len, tags], `transitions` is
/// [tags, tags]. Sequences with no real tokens are skipped; a
/// batch of only empty sequences yields zero.
pub fn neg_log_likelihood<B: Backend>(
    emissions:   Tensor<B, 2>,
    transitions: Tensor<B, 2>,
    targets:     &BatchTargets,
) -> TrainResult<Tensor<B, 1>> {
    targets.check(Component::Aggregator, Some(HeadId::Crf))?;
    let device = emissions.device();
    let [rows, num_tags] = emissions.dims();
    if rows != targets.num_tokens() || transitions.dims() != [num_tags, num_tags] {
        return Err(TrainError::invalid_batch(
            Component::Aggregator,
            Some(HeadId::Crf),
            format!(
                "emissions {:?} / transitions {:?} do not fit {} x {} tokens",
                [rows, num_tags],
                transitions.dims(),
                targets.batch_size,
                targets.seq_len
            ),
        ));
    }

    let flat_transitions = transitions.clone().reshape([num_tags * num_tags]);
    let mut total = Tensor::<B, 1>::zeros([1], &device);
    let mut counted = 0usize;

    for b in 0..targets.batch_size {
        let len = targets.seq_lens[b];
        if len == 0 {
            continue;
        }
        let tags = targets.sequence_tags(b);
        if let Some(&bad) = tags.iter().find(|&&t| t >= num_tags) {
            return Err(TrainError::invalid_batch(
                Component::Aggregator,
                Some(HeadId::Crf),
                format!("tag {bad} outside {num_tags} tags"),
            ));
        }

        let start = b * targets.seq_len;
        let emis  = emissions.clone().slice([start..start + len, 0..num_tags]); // [len, T]

        // ── log Z via the forward algorithm ──────────────────────────────────
        let mut alpha = emis.clone().slice([0..1, 0..num_tags]); // [1, T]
        for t in 1..len {
            let scores = alpha.reshape([num_tags, 1]).expand([num_tags, num_tags]) + transitions.clone();
            alpha = log_sum_exp(scores, 0) + emis.clone().slice([t..t + 1, 0..num_tags]);
        }
        let log_z = log_sum_exp(alpha, 1).reshape([1]);

        // ── Gold path score ──────────────────────────────────────────────────
        let gold_emission = emis.gather(1, int_tensor::<B, 2>(tags, [len, 1], &device)).sum();
        let gold = if len > 1 {
            let pairs: Vec<usize> = tags.windows(2).map(|w| w[0] * num_tags + w[1]).collect();
            let gold_transition = flat_transitions
                .clone()
                .select(0, int_tensor::<B, 1>(&pairs, [len - 1], &device))
                .sum();
            gold_emission + gold_transition
        } else {
            gold_emission
        };

        total = total + (log_z - gold);
        counted += 1;
    }

    if counted == 0 {
        return Ok(total);
    }
    Ok(total / counted as f64)
}

/// Most likely tag sequence for one sequence, on host memory.
///
/// `emissions` is row-major [len, tags], `transitions` [tags, tags].
pub fn viterbi_decode(emissions: &[f32], transitions: &[f32], num_tags: usize) -> Vec<usize> {
    let len = emissions.len() / num_tags.max(1);
    if len == 0 {
        return Vec::new();
    }

    let mut score: Vec<f32> = emissions[..num_tags].to_vec();
    let mut backpointers: Vec<Vec<usize>> = Vec::with_capacity(len - 1);

    for t in 1..len {
        let row = &emissions[t * num_tags..(t + 1) * num_tags];
        let mut next = vec![f32::NEG_INFINITY; num_tags];
        let mut back = vec![0usize; num_tags];
        for j in 0..num_tags {
            for i in 0..num_tags {
                let candidate = score[i] + transitions[i * num_tags + j];
                if candidate > next[j] {
                    next[j] = candidate;
                    back[j] = i;
                }
            }
            next[j] += row[j];
        }
        score = next;
        backpointers.push(back);
    }

    let mut best = (0..num_tags)
        .max_by(|&a, &b| score[a].total_cmp(&score[b]).then(b.cmp(&a)))
        .unwrap_or(0);
    let mut path = vec![best];
    for back in backpointers.iter().rev() {
        best = back[best];
        path.push(best);
    }
    path.reverse();
    path
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray<f32>;

    fn targets(tags: Vec<usize>, seq_lens: Vec<usize>, seq_len: usize) -> BatchTargets {
        BatchTargets {
            batch_size: seq_lens.len(),
            seq_len,
            token_mask: tags.iter().enumerate().map(|(i, _)| i % seq_len < seq_lens[i / seq_len]).collect(),
            token_tags: tags,
            seq_lens,
            ..Default::default()
        }
    }

    fn tensor2(values: &[f32], shape: [usize; 2]) -> Tensor<TestBackend, 2> {
        Tensor::from_data(TensorData::new(values.to_vec(), shape), &Default::default())
    }

    fn scalar(t: Tensor<TestBackend, 1>) -> f64 {
        t.into_scalar().elem::<f64>()
    }

    /// Brute-force NLL over all tag paths of one sequence.
    fn brute_force_nll(emissions: &[f32], transitions: &[f32], tags: &[usize], num_tags: usize) -> f64 {
        let len = tags.len();
        let score = |path: &[usize]| -> f64 {
            let mut s = 0.0f64;
            for t in 0..len {
                s += emissions[t * num_tags + path[t]] as f64;
                if t > 0 {
                    s += transitions[path[t - 1] * num_tags + path[t]] as f64;
                }
            }
            s
        };
        let mut log_terms = Vec::new();
        let total_paths = num_tags.pow(len as u32);
        for mut code in 0..total_paths {
            let mut path = vec![0; len];
            for slot in path.iter_mut() {
                *slot = code % num_tags;
                code /= num_tags;
            }
            log_terms.push(score(&path));
        }
        let max = log_terms.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let log_z = max + log_terms.iter().map(|s| (s - max).exp()).sum::<f64>().ln();
        log_z - score(tags)
    }

    #[test]
    fn test_nll_matches_brute_force_enumeration() {
        let emissions   = [0.5f32, -0.2, 0.1, 1.0, 0.3, -0.7, 0.0, 0.4, 0.9];
        let transitions = [0.2f32, -0.1, 0.0, 0.3, 0.1, -0.4, -0.2, 0.5, 0.05];
        let tags        = vec![0, 2, 1];

        let nll = neg_log_likelihood(
            tensor2(&emissions, [3, 3]),
            tensor2(&transitions, [3, 3]),
            &targets(tags.clone(), vec![3], 3),
        )
        .unwrap();

        let expected = brute_force_nll(&emissions, &transitions, &tags, 3);
        assert!((scalar(nll) - expected).abs() < 1e-4);
    }

    #[test]
    fn test_padding_is_ignored_and_batch_is_averaged() {
        // Two sequences of max length 3; the second has one real token.
        let emissions = [
            0.5f32, -0.2, 0.1, 1.0, 0.3, -0.7, 9.0, 9.0, 9.0,
            0.2, 0.8, -0.5, 7.0, 7.0, 7.0, 7.0, 7.0, 7.0,
        ];
        let transitions = [0.0f32; 9];
        let t = targets(vec![0, 1, 2, 1, 2, 2], vec![2, 1], 3);

        let nll = neg_log_likelihood(tensor2(&emissions, [6, 3]), tensor2(&transitions, [3, 3]), &t).unwrap();

        let first  = brute_force_nll(&emissions[..6], &transitions, &[0, 1], 3);
        let second = brute_force_nll(&emissions[9..12], &transitions, &[1], 3);
        assert!((scalar(nll) - (first + second) / 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_gradient_reaches_transitions() {
        type Ad = Autodiff<TestBackend>;
        let device = Default::default();
        let emissions: Tensor<Ad, 2> =
            Tensor::from_data(TensorData::new(vec![0.1f32, 0.2, 0.3, 0.4], [2, 2]), &device);
        let transitions: Tensor<Ad, 2> =
            Tensor::from_data(TensorData::new(vec![0.0f32; 4], [2, 2]), &device).require_grad();

        let nll   = neg_log_likelihood(emissions, transitions.clone(), &targets(vec![0, 1], vec![2], 2)).unwrap();
        let grads = nll.backward();
        let grad  = transitions.grad(&grads).unwrap().into_data().to_vec::<f32>().unwrap();

        // With zero transitions, d nll / d T[i, j] = P(y0 = i) P(y1 = j) - [gold = (i, j)]
        let p0 = [0.475_021f32, 0.524_979];
        let p1 = [0.475_021f32, 0.524_979];
        let expected = [p0[0] * p1[0], p0[0] * p1[1] - 1.0, p0[1] * p1[0], p0[1] * p1[1]];
        for (g, e) in grad.iter().zip(expected) {
            assert!((g - e).abs() < 1e-4, "{grad:?} vs {expected:?}");
        }
    }

    #[test]
    fn test_viterbi_follows_transitions() {
        // Emissions alone prefer tag 0 everywhere, but 0 → 0 is heavily penalised.
        let emissions   = [1.0f32, 0.0, 1.0, 0.0, 1.0, 0.0];
        let transitions = [-5.0f32, 0.0, 0.0, 0.0];
        assert_eq!(viterbi_decode(&emissions, &transitions, 2), vec![0, 1, 0]);
        assert_eq!(viterbi_decode(&emissions, &[0.0; 4], 2), vec![0, 0, 0]);
        assert!(viterbi_decode(&[], &[0.0; 4], 2).is_empty());
    }

    #[test]
    fn test_sequence_longer_than_batch_is_invalid_batch() {
        let mut t = targets(vec![0, 1, 2], vec![3], 3);
        t.seq_lens = vec![5];
        let res = neg_log_likelihood(tensor2(&[0.0; 9], [3, 3]), tensor2(&[0.0; 9], [3, 3]), &t);
        assert!(matches!(res, Err(TrainError::InvalidBatch { head: Some(HeadId::Crf), .. })));
    }

    #[test]
    fn test_wrong_shape_is_invalid_batch() {
        let res = neg_log_likelihood(
            tensor2(&[0.0; 6], [2, 3]),
            tensor2(&[0.0; 4], [2, 2]),
            &targets(vec![0, 1], vec![2], 2),
        );
        assert!(matches!(res, Err(TrainError::InvalidBatch { .. })));
    }
}
