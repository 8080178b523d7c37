// ============================================================
// Layer 3 — Batch Targets
// ============================================================
// Ground truth for one batch, kept on the host. The sampler
// ranks and the CRF decodes on host memory, so labels never
// need to round-trip through the device.
//
// Layout (row-major, batch first):
//   token_tags / token_mask       [batch * seq_len]
//   aux_labels[k] / aux_masks[k]  [batch * cells_k]   per scale k
//
// The targets come from outside this crate, so every consumer
// calls `check` before indexing into them.

use crate::domain::error::{Component, TrainError, TrainResult};
use crate::domain::head::HeadId;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchTargets {
    pub batch_size: usize,
    pub seq_len:    usize,
    pub token_tags: Vec<usize>,
    pub token_mask: Vec<bool>,
    /// Number of real (unpadded) tokens of each sequence
    pub seq_lens:   Vec<usize>,
    pub aux_labels: Vec<Vec<usize>>,
    pub aux_masks:  Vec<Vec<bool>>,
}

impl BatchTargets {
    pub fn num_tokens(&self) -> usize {
        self.batch_size * self.seq_len
    }

    /// Binary key / non-key labels: 1 for any field tag, 0 for
    /// the background tag.
    pub fn key_flags(&self, background_tag: usize) -> Vec<usize> {
        self.token_tags
            .iter()
            .map(|&tag| usize::from(tag != background_tag))
            .collect()
    }

    /// Reject a token layout that disagrees with the declared shape.
    pub fn check(&self, component: Component, head: Option<HeadId>) -> TrainResult<()> {
        let invalid = |msg: String| Err(TrainError::invalid_batch(component, head, msg));

        if self.seq_lens.len() != self.batch_size {
            return invalid(format!(
                "{} sequence lengths for a batch of {}",
                self.seq_lens.len(),
                self.batch_size
            ));
        }
        if let Some((b, len)) = self.seq_lens.iter().enumerate().find(|(_, &len)| len > self.seq_len) {
            return invalid(format!("sequence {b} has {len} tokens, seq_len is {}", self.seq_len));
        }
        let tokens = self.num_tokens();
        if self.token_tags.len() != tokens || self.token_mask.len() != tokens {
            return invalid(format!(
                "{} tags / {} mask entries for {} x {} tokens",
                self.token_tags.len(),
                self.token_mask.len(),
                self.batch_size,
                self.seq_len
            ));
        }
        Ok(())
    }

    /// Real tags of sequence `b`, without padding. Only valid after `check`.
    pub fn sequence_tags(&self, b: usize) -> &[usize] {
        let start = b * self.seq_len;
        &self.token_tags[start..start + self.seq_lens[b]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_flags_and_sequence_view() {
        let targets = BatchTargets {
            batch_size: 2,
            seq_len:    3,
            token_tags: vec![0, 4, 4, 1, 4, 4],
            token_mask: vec![true, true, false, true, false, false],
            seq_lens:   vec![2, 1],
            ..Default::default()
        };
        assert_eq!(targets.key_flags(4), vec![1, 0, 0, 1, 0, 0]);
        assert_eq!(targets.sequence_tags(0), &[0, 4]);
        assert_eq!(targets.sequence_tags(1), &[1]);
        assert_eq!(targets.num_tokens(), 6);
        assert!(targets.check(Component::Aggregator, None).is_ok());
    }

    #[test]
    fn test_check_rejects_lengths_past_the_padded_width() {
        let targets = BatchTargets {
            batch_size: 1,
            seq_len:    3,
            token_tags: vec![0, 1, 2],
            token_mask: vec![true; 3],
            seq_lens:   vec![5],
            ..Default::default()
        };
        let err = targets.check(Component::Aggregator, Some(HeadId::Crf)).unwrap_err();
        assert!(matches!(err, TrainError::InvalidBatch { head: Some(HeadId::Crf), .. }));

        let missing = BatchTargets { seq_lens: Vec::new(), ..targets.clone() };
        assert!(missing.check(Component::Aggregator, None).is_err());

        let short = BatchTargets { seq_lens: vec![3], token_mask: vec![true; 2], ..targets };
        assert!(short.check(Component::Aggregator, None).is_err());
    }
}
