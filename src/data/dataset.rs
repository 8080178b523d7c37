// ============================================================
// Layer 4 — Document Dataset
// ============================================================
// One sample = one document, already tokenised, padded to the
// maximum sequence length and projected onto the visual grid.
//
// The real pipeline (OCR boxes → tokenizer → ROI-align on the
// CNN feature map) lives outside this crate. To train end to
// end without it, `SyntheticReceipts` generates documents with
// the same shape and label statistics:
//
//   - most tokens are background, a few short spans are fields
//   - field tokens draw their ids from a per-field vocabulary band
//   - every token sits in one cell of the finest grid; coarser
//     scales pool cells 2x2, and a cell takes the label of the
//     field token it covers
//   - grid features are a per-class prototype plus noise,
//     normalised with the configured image mean / std
//
// Everything is driven by one seeded RNG, so a seed fixes the
// whole corpus.
//
// Reference: Burn Book §4 (Datasets)
//            Jaume et al. (2019) FUNSD
//            Huang et al. (2019) ICDAR SROIE

use std::sync::Arc;

use burn::data::dataset::Dataset;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::domain::config::{DataConfig, TagMode};
use crate::domain::error::TrainResult;
use crate::domain::traits::DocumentSource;

/// One fully tokenised and padded document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSample {
    /// Token ids, padded with 0 — length max_seq_len
    pub token_ids:    Vec<u32>,
    /// Visual feature under each token — [max_seq_len * grid_dim]
    pub token_grid:   Vec<f32>,
    /// Field tag of each token, padded with the background tag
    pub token_tags:   Vec<usize>,
    /// Number of real tokens
    pub seq_len:      usize,
    /// Per scale: grid-cell features — [cells_k * grid_dim]
    pub scale_cells:  Vec<Vec<f32>>,
    /// Per scale: grid-cell field class — [cells_k]
    pub scale_labels: Vec<Vec<usize>>,
}

/// Clones share the samples.
#[derive(Clone)]
pub struct DocumentDataset {
    samples: Arc<Vec<DocumentSample>>,
}

impl DocumentDataset {
    pub fn new(samples: Vec<DocumentSample>) -> Self { Self { samples: Arc::new(samples) } }
}

impl Dataset<DocumentSample> for DocumentDataset {
    fn get(&self, index: usize) -> Option<DocumentSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

// ─── Synthetic receipts ──────────────────────────────────────────────────────

pub struct SyntheticReceipts {
    cfg:        DataConfig,
    tag_mode:   TagMode,
    num_scales: usize,
    count:      usize,
    seed:       u64,
}

impl SyntheticReceipts {
    pub fn new(cfg: &DataConfig, tag_mode: TagMode, num_scales: usize, count: usize, seed: u64) -> Self {
        Self { cfg: cfg.clone(), tag_mode, num_scales, count, seed }
    }

    fn num_tags(&self) -> usize {
        match self.tag_mode {
            TagMode::B   => self.cfg.num_fields + 1,
            TagMode::Bio => 2 * self.cfg.num_fields + 1,
        }
    }

    fn tag_of(&self, field: usize, inside: bool) -> usize {
        match self.tag_mode {
            TagMode::B   => field,
            TagMode::Bio => 2 * field + usize::from(inside),
        }
    }

    /// Prototype-plus-noise feature of a class, normalised per
    /// channel with the configured image statistics.
    fn feature(&self, class: usize, rng: &mut StdRng) -> Vec<f32> {
        let stride = self.cfg.num_fields + 1;
        (0..self.cfg.grid_dim)
            .map(|d| {
                let prototype = if d % stride == class { 1.0 } else { 0.0 };
                let raw: f32  = prototype + rng.gen_range(-0.3..0.3);
                (raw - self.cfg.image_mean[d % 3]) / self.cfg.image_std[d % 3]
            })
            .collect()
    }

    fn token_id(&self, class: usize, rng: &mut StdRng) -> u32 {
        // id 0 is padding
        let band = ((self.cfg.vocab_size - 1) / (self.cfg.num_fields + 1)).max(1);
        let low  = 1 + class * band;
        rng.gen_range(low..low + band).min(self.cfg.vocab_size - 1) as u32
    }

    fn generate(&self, rng: &mut StdRng) -> DocumentSample {
        let cfg        = &self.cfg;
        let max_len    = cfg.max_seq_len;
        let background = self.num_tags() - 1;
        let side       = cfg.grid_size.max(1);

        let seq_len = rng.gen_range((max_len / 2).max(1)..=max_len);

        // Field spans over the real tokens
        let mut classes = vec![cfg.num_fields; max_len];
        let mut tags    = vec![background; max_len];
        let mut t = 0;
        while t < seq_len {
            if rng.gen_bool(0.15) {
                let field = rng.gen_range(0..cfg.num_fields);
                let span  = rng.gen_range(1..=3).min(seq_len - t);
                for k in 0..span {
                    classes[t + k] = field;
                    tags[t + k]    = self.tag_of(field, k > 0);
                }
                t += span;
            } else {
                t += 1;
            }
        }

        let mut token_ids  = vec![0u32; max_len];
        let mut token_grid = vec![0.0f32; max_len * cfg.grid_dim];
        let mut positions  = Vec::with_capacity(seq_len);
        for t in 0..seq_len {
            token_ids[t] = self.token_id(classes[t], rng);
            let row = self.feature(classes[t], rng);
            token_grid[t * cfg.grid_dim..(t + 1) * cfg.grid_dim].copy_from_slice(&row);
            positions.push((rng.gen_range(0..side), rng.gen_range(0..side)));
        }

        let mut scale_cells  = Vec::with_capacity(self.num_scales);
        let mut scale_labels = Vec::with_capacity(self.num_scales);
        for k in 0..self.num_scales {
            let cells_side = (side >> k).max(1);
            let mut labels = vec![cfg.num_fields; cells_side * cells_side];
            for (t, &(r, c)) in positions.iter().enumerate() {
                if classes[t] < cfg.num_fields {
                    let cell = (r >> k).min(cells_side - 1) * cells_side + (c >> k).min(cells_side - 1);
                    labels[cell] = classes[t];
                }
            }
            let cells: Vec<f32> = labels
                .iter()
                .flat_map(|&class| self.feature(class, rng))
                .collect();
            scale_cells.push(cells);
            scale_labels.push(labels);
        }

        DocumentSample {
            token_ids,
            token_grid,
            token_tags: tags,
            seq_len,
            scale_cells,
            scale_labels,
        }
    }
}

impl DocumentSource for SyntheticReceipts {
    type Document = DocumentSample;

    fn load_all(&self) -> TrainResult<Vec<DocumentSample>> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let docs: Vec<DocumentSample> = (0..self.count).map(|_| self.generate(&mut rng)).collect();
        tracing::debug!("Generated {} synthetic documents (seed {})", docs.len(), self.seed);
        Ok(docs)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg() -> DataConfig {
        DataConfig {
            num_fields:  3,
            vocab_size:  64,
            grid_dim:    8,
            max_seq_len: 12,
            grid_size:   8,
            ..DataConfig::default()
        }
    }

    #[test]
    fn test_shapes_follow_config() {
        let cfg  = small_cfg();
        let docs = SyntheticReceipts::new(&cfg, TagMode::B, 3, 5, 1).load_all().unwrap();
        assert_eq!(docs.len(), 5);
        for doc in &docs {
            assert_eq!(doc.token_ids.len(), 12);
            assert_eq!(doc.token_grid.len(), 12 * 8);
            assert!(doc.seq_len >= 6 && doc.seq_len <= 12);
            assert_eq!(doc.scale_labels.iter().map(Vec::len).collect::<Vec<_>>(), vec![64, 16, 4]);
            assert_eq!(doc.scale_cells[1].len(), 16 * 8);
            // padding is background
            assert!(doc.token_tags[doc.seq_len..].iter().all(|&t| t == 3));
            assert!(doc.token_ids[doc.seq_len..].iter().all(|&id| id == 0));
        }
    }

    #[test]
    fn test_same_seed_same_corpus() {
        let cfg = small_cfg();
        let a = SyntheticReceipts::new(&cfg, TagMode::Bio, 2, 4, 9).load_all().unwrap();
        let b = SyntheticReceipts::new(&cfg, TagMode::Bio, 2, 4, 9).load_all().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.token_ids, y.token_ids);
            assert_eq!(x.token_tags, y.token_tags);
        }
    }

    #[test]
    fn test_bio_tags_stay_in_range() {
        let cfg  = small_cfg();
        let docs = SyntheticReceipts::new(&cfg, TagMode::Bio, 1, 20, 3).load_all().unwrap();
        assert!(docs.iter().flat_map(|d| &d.token_tags).all(|&t| t <= 6));
        assert!(docs.iter().flat_map(|d| &d.token_ids).all(|&id| id < 64));
    }
}
