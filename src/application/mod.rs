// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// This layer wires the other layers together to accomplish one
// goal at a time (a training run, or a schedule preview).
//
// Rules for this layer:
//   - No tensor math or model code here
//   - No printing here (that's Layer 1)
//   - Only workflow coordination
//
// Reference: Clean Architecture pattern
//            Rust Book §7 (Module System)

// The training workflow: run(config) -> final checkpoint path
pub mod train_use_case;

// Learning-rate / weight-decay table for a configuration
pub mod schedule_use_case;
