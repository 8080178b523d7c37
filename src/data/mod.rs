// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// Everything between "a labelled document" and "a batch the
// training loop can consume".
//
//   DocumentSource     → produces labelled documents
//       │                (SyntheticReceipts stands in for the
//       │                 FUNSD / SROIE loaders)
//       ▼
//   split_train_val    → seeded shuffle + split
//       │
//       ▼
//   DocumentDataset    → implements Burn's Dataset trait
//       │
//       ▼
//   DocumentBatcher    → stacks samples into model tensors and
//       │                host-side BatchTargets
//       ▼
//   ShuffledEpochs     → one DataLoader per epoch, shuffled
//                        with seed + epoch
//
// Reference: Burn Book §4 (Datasets and Dataloaders)

/// Document samples, Burn Dataset impl and the synthetic source
pub mod dataset;

/// Implements Burn's Batcher trait to create tensor batches
pub mod batcher;

/// Shuffles and splits data into train/validation sets
pub mod splitter;

/// Per-epoch loaders with a resumable shuffle order
pub mod epochs;
