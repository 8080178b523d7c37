// ============================================================
// Layer 4 — Document Batcher
// ============================================================
// Implements Burn's Batcher trait to stack a Vec<DocumentSample>
// into one DocumentBatch.
//
// Two kinds of output per batch:
//
//   device tensors (model inputs)
//     token_ids    [batch, seq_len]              Int
//     token_grid   [batch, seq_len, grid_dim]    Float
//     scale_cells  [batch, cells_k, grid_dim]    Float, per scale k
//
//   host targets (consumed by the loss layer)
//     BatchTargets — tags, masks, sequence lengths, per-scale
//     segmentation labels, all flattened batch-first
//
// Labels stay on the host because hard-example ranking and
// Viterbi decoding both run there.
//
// Reference: Burn Book §4 (Batcher)

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
};

use crate::data::dataset::DocumentSample;
use crate::domain::targets::BatchTargets;

// ─── DocumentBatch ────────────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct DocumentBatch<B: Backend> {
    pub token_ids:   Tensor<B, 2, Int>,
    pub token_grid:  Tensor<B, 3>,
    pub scale_cells: Vec<Tensor<B, 3>>,
    pub targets:     BatchTargets,
}

impl<B: Backend> DocumentBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.targets.batch_size
    }
}

// ─── DocumentBatcher ──────────────────────────────────────────────────────────
#[derive(Clone, Debug)]
pub struct DocumentBatcher<B: Backend> {
    pub device:   B::Device,
    pub grid_dim: usize,
}

impl<B: Backend> DocumentBatcher<B> {
    pub fn new(device: B::Device, grid_dim: usize) -> Self {
        Self { device, grid_dim }
    }
}

impl<B: Backend> Batcher<DocumentSample, DocumentBatch<B>> for DocumentBatcher<B> {
    fn batch(&self, items: Vec<DocumentSample>) -> DocumentBatch<B> {
        let batch_size = items.len();
        // All documents are padded to the same length
        let seq_len    = items.first().map_or(0, |s| s.token_ids.len());
        let num_scales = items.first().map_or(0, |s| s.scale_labels.len());
        let grid_dim   = self.grid_dim;

        // ── Model inputs ──────────────────────────────────────────────────────
        let ids_flat: Vec<i32> = items
            .iter()
            .flat_map(|s| s.token_ids.iter().map(|&x| x as i32))
            .collect();
        let token_ids = Tensor::<B, 1, Int>::from_ints(ids_flat.as_slice(), &self.device)
            .reshape([batch_size, seq_len]);

        let grid_flat: Vec<f32> = items
            .iter()
            .flat_map(|s| s.token_grid.iter().copied())
            .collect();
        let token_grid = Tensor::<B, 1>::from_floats(grid_flat.as_slice(), &self.device)
            .reshape([batch_size, seq_len, grid_dim]);

        let scale_cells: Vec<Tensor<B, 3>> = (0..num_scales)
            .map(|k| {
                let cells = items[0].scale_labels[k].len();
                let flat: Vec<f32> = items
                    .iter()
                    .flat_map(|s| s.scale_cells[k].iter().copied())
                    .collect();
                Tensor::<B, 1>::from_floats(flat.as_slice(), &self.device)
                    .reshape([batch_size, cells, grid_dim])
            })
            .collect();

        // ── Host targets ──────────────────────────────────────────────────────
        let token_tags: Vec<usize> = items
            .iter()
            .flat_map(|s| s.token_tags.iter().copied())
            .collect();
        let token_mask: Vec<bool> = items
            .iter()
            .flat_map(|s| (0..seq_len).map(move |t| t < s.seq_len))
            .collect();
        let seq_lens: Vec<usize> = items.iter().map(|s| s.seq_len).collect();

        let aux_labels: Vec<Vec<usize>> = (0..num_scales)
            .map(|k| items.iter().flat_map(|s| s.scale_labels[k].iter().copied()).collect())
            .collect();
        let aux_masks: Vec<Vec<bool>> = aux_labels
            .iter()
            .map(|labels| vec![true; labels.len()])
            .collect();

        DocumentBatch {
            token_ids,
            token_grid,
            scale_cells,
            targets: BatchTargets {
                batch_size,
                seq_len,
                token_tags,
                token_mask,
                seq_lens,
                aux_labels,
                aux_masks,
            },
        }
    }
}
