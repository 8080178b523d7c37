// ============================================================
// Layer 4 — Per-Epoch Loaders
// ============================================================
// The training loop asks for a loader at the start of every
// epoch. A shuffled loader is rebuilt with the seed
//
//   seed + epoch
//
// so the batch order of epoch N depends only on the seed and N.
// A run resumed at epoch N therefore sees the same batches an
// uninterrupted run would have seen.
//
// A plain `Arc<dyn DataLoader>` is also an EpochLoader: it hands
// out itself every epoch.
//
// Reference: Burn Book §4 (Dataloaders)

use std::sync::Arc;

use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    prelude::*,
};

use crate::data::batcher::{DocumentBatch, DocumentBatcher};
use crate::data::dataset::DocumentDataset;

pub trait EpochLoader<B: Backend> {
    fn for_epoch(&self, epoch: usize) -> Arc<dyn DataLoader<DocumentBatch<B>>>;
}

impl<B: Backend> EpochLoader<B> for Arc<dyn DataLoader<DocumentBatch<B>>> {
    fn for_epoch(&self, _epoch: usize) -> Arc<dyn DataLoader<DocumentBatch<B>>> {
        Arc::clone(self)
    }
}

// ─── ShuffledEpochs ───────────────────────────────────────────────────────────
pub struct ShuffledEpochs<B: Backend> {
    dataset:    DocumentDataset,
    batcher:    DocumentBatcher<B>,
    batch_size: usize,
    seed:       u64,
}

impl<B: Backend> ShuffledEpochs<B> {
    pub fn new(dataset: DocumentDataset, batcher: DocumentBatcher<B>, batch_size: usize, seed: u64) -> Self {
        Self { dataset, batcher, batch_size, seed }
    }
}

impl<B: Backend> EpochLoader<B> for ShuffledEpochs<B> {
    fn for_epoch(&self, epoch: usize) -> Arc<dyn DataLoader<DocumentBatch<B>>> {
        DataLoaderBuilder::new(self.batcher.clone())
            .batch_size(self.batch_size)
            .shuffle(self.seed.wrapping_add(epoch as u64))
            .num_workers(1)
            .build(self.dataset.clone())
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::{DocumentSample, SyntheticReceipts};
    use crate::domain::config::{DataConfig, TagMode};
    use crate::domain::traits::DocumentSource;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn epochs(count: usize) -> ShuffledEpochs<TestBackend> {
        let mut cfg = DataConfig::default();
        cfg.max_seq_len = 8;
        cfg.grid_dim    = 4;
        cfg.grid_size   = 4;
        let samples: Vec<DocumentSample> = SyntheticReceipts::new(&cfg, TagMode::Bio, 0, count, 5)
            .load_all()
            .unwrap();
        ShuffledEpochs::new(
            DocumentDataset::new(samples),
            DocumentBatcher::new(Default::default(), cfg.grid_dim),
            count,
            11,
        )
    }

    /// Token ids of the single batch an epoch yields.
    fn order(loader: &ShuffledEpochs<TestBackend>, epoch: usize) -> Vec<i64> {
        let batches: Vec<_> = loader.for_epoch(epoch).iter().collect();
        assert_eq!(batches.len(), 1);
        batches[0].token_ids.clone().into_data().convert::<i64>().to_vec::<i64>().unwrap()
    }

    #[test]
    fn test_epoch_order_ignores_earlier_epochs() {
        let uninterrupted = epochs(12);
        for epoch in 0..3 {
            order(&uninterrupted, epoch);
        }
        let resumed = epochs(12);
        assert_eq!(order(&uninterrupted, 3), order(&resumed, 3));
    }

    #[test]
    fn test_epochs_are_shuffled_differently() {
        let loader = epochs(12);
        assert_eq!(order(&loader, 0), order(&loader, 0));
        assert_ne!(order(&loader, 0), order(&loader, 1));
    }

    #[test]
    fn test_plain_loader_is_reused() {
        let plain: Arc<dyn DataLoader<DocumentBatch<TestBackend>>> = epochs(4).for_epoch(0);
        assert!(Arc::ptr_eq(&plain.for_epoch(0), &plain.for_epoch(7)));
    }
}
