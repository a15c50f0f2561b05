//! Derived-data recomputation.
//!
//! Line completion and composite completion are functions of placement
//! state, never authoritative on their own. They are recomputed from
//! source after any write or conflict resolution that could change a
//! cell, and the recomputed deltas go back through the normal store
//! write path so they are versioned and queued like any other edit.

mod bingo;
mod evaluator;
mod recompute;

pub use bingo::{detect_lines, LineReport};
pub use evaluator::evaluate_composite;
pub use recompute::Recomputer;
