// ============================================================
// Layer 5 — ML / Training-Control Layer (Burn)
// ============================================================
// Everything that touches tensors, gradients or optimizers.
//
//   schedule.rs   — per-group warm-up + cosine decay of the
//                   learning rate and weight decay
//
//   ohem.rs       — online hard example mining: picks the
//                   hardest positives and negatives per head
//
//   loss.rs       — multi-head loss aggregator for the three
//                   classifier modes (simp / full / crf)
//
//   crf.rs        — linear-chain CRF likelihood and Viterbi
//
//   optim.rs      — one optimizer per parameter group (SGD or
//                   AdamW), rebuilt when weight decay moves
//
//   precision.rs  — dynamic loss scaling for mixed precision
//
//   model.rs      — a small grid + token tagger exposing the
//                   visual / language parameter split
//
//   evaluator.rs  — validation loss, token accuracy and
//                   field-level precision / recall / F1
//
//   trainer.rs    — the epoch / batch state machine with
//                   checkpointing and resume
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn Book §5 (Training)

pub mod schedule;

pub mod ohem;

/// Multi-head loss aggregation
pub mod loss;

pub mod crf;

/// Per-group optimizers
pub mod optim;

pub mod precision;

/// Reference field-tagging model
pub mod model;

/// Validation metrics
pub mod evaluator;

/// Training loop state machine
pub mod trainer;
