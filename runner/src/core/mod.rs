//! Pure, deterministic logic: chunk planning, synthesis, and the attempt
//! state machine. No I/O; fully testable in isolation.

pub mod chunk;
pub mod supervisor;
pub mod synthesize;
pub mod types;
