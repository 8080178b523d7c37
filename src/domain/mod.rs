// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Pure Rust structs, enums and traits that define what the
// training-control layer talks about: run configuration, loss
// heads, per-batch sample selections and the failure taxonomy.
//
// Rules for this layer:
//   - NO Burn framework types allowed here
//   - NO file I/O except reading the configuration file
//   - Only plain Rust structs, enums, and traits
//
// Everything here is unit-testable without a tensor backend.
//
// Reference: Rust Book §5 (Structs), §10 (Traits)

// JSON run configuration and its validation
pub mod config;

// Error taxonomy shared by every component
pub mod error;

// Loss-head enumeration per classifier mode
pub mod head;

// OHEM output: selected positive / negative indices
pub mod selection;

// Host-side ground truth of one batch
pub mod targets;

// Core abstractions (traits) that other layers implement
pub mod traits;
