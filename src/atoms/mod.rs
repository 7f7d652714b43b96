// ── Paw Atoms ──────────────────────────────────────────────────────────────
// Leaf layer: pure data types, constants, and the canonical error enum.
// Atoms layer rule: no I/O, no side effects, no imports from engine/.

pub mod constants;
pub mod error;
pub mod types;
