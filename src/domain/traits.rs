// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// The training-control layer never looks inside the model or
// the data pipeline. It talks to them through these traits:
//
//   DocumentSource  → whatever produces labelled documents
//                     (the synthetic receipt generator here,
//                      a FUNSD / SROIE loader elsewhere)
//   Validator       → whatever scores a trained model
//
// The model side is a Burn trait (`FieldTagger`) and lives in
// the ML layer, since this layer stays free of Burn types.
//
// Reference: Rust Book §10 (Traits: Defining Shared Behaviour)

use crate::domain::error::TrainResult;

// ─── DocumentSource ───────────────────────────────────────────────────────────
/// Any component that can produce labelled documents.
pub trait DocumentSource {
    type Document;

    /// Produce all documents of this source, in a stable order.
    fn load_all(&self) -> TrainResult<Vec<Self::Document>>;
}

// ─── Validation summary ───────────────────────────────────────────────────────
/// Scores of one validation pass. `f1` drives best-checkpoint
/// selection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ValidationReport {
    pub loss:      f64,
    pub accuracy:  f64,
    pub precision: f64,
    pub recall:    f64,
    pub f1:        f64,
}

// ─── Validator ────────────────────────────────────────────────────────────────
/// Any component that can score a model after an epoch.
pub trait Validator<M> {
    fn validate(&mut self, model: &M) -> TrainResult<ValidationReport>;
}
