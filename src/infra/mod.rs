// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// File-system concerns the training loop relies on but that
// belong to no single ML component:
//
//   checkpoint.rs — latest / best checkpoint slots: module
//                   weights, optimizer moments and the JSON
//                   run state needed to resume exactly
//
//   metrics.rs    — one CSV row per epoch: per-head training
//                   loss, validation P/R/F1, both groups'
//                   rates and the loss scale
//
// Reference: Rust Book §7 (Modules)
//            Burn Book §5 (Checkpointing)

/// Checkpoint slots and resume state
pub mod checkpoint;

/// Per-epoch CSV metrics log
pub mod metrics;
