// ============================================================
// Layer 3 — Sample Selection
// ============================================================
// The output of the OHEM sampler for one head in one batch:
// which flat indices contribute to that head's loss.
//
// For single-scale heads an index addresses a token in the
// flattened [batch * seq_len] layout. For the multi-scale
// auxiliary head the scales are laid end to end, so index
// `offset(k) + i` is cell i of scale k.
//
// Lives for exactly one batch: created by the sampler, read by
// the aggregator, then dropped.

use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleSelection {
    pub positive: BTreeSet<usize>,
    pub negative: BTreeSet<usize>,
}

impl SampleSelection {
    pub fn len(&self) -> usize {
        self.positive.len() + self.negative.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positive.is_empty() && self.negative.is_empty()
    }

    /// Union with a selection made over another scale, shifting its
    /// indices past the ones already covered.
    pub fn absorb(&mut self, other: SampleSelection, offset: usize) {
        self.positive.extend(other.positive.into_iter().map(|i| i + offset));
        self.negative.extend(other.negative.into_iter().map(|i| i + offset));
    }

    pub fn positive_indices(&self) -> Vec<usize> {
        self.positive.iter().copied().collect()
    }

    pub fn negative_indices(&self) -> Vec<usize> {
        self.negative.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_offsets_later_scales() {
        let mut sel = SampleSelection {
            positive: [1, 3].into_iter().collect(),
            negative: [0].into_iter().collect(),
        };
        let scale_two = SampleSelection {
            positive: [0].into_iter().collect(),
            negative: [2, 4].into_iter().collect(),
        };
        sel.absorb(scale_two, 10);
        assert_eq!(sel.positive_indices(), vec![1, 3, 10]);
        assert_eq!(sel.negative_indices(), vec![0, 12, 14]);
        assert_eq!(sel.len(), 6);
    }

    #[test]
    fn test_default_is_empty() {
        assert!(SampleSelection::default().is_empty());
    }
}
