//! Stable process exit codes. Scripts depend on these; do not renumber.

/// The run passed, or the command completed normally.
pub const OK: i32 = 0;
/// Invalid usage, configuration, or an internal error.
pub const INVALID: i32 = 1;
/// An analysis finished without reaching a confident answer.
pub const INCOMPLETE: i32 = 2;
/// The attempt budget was exhausted without passing verification.
pub const EXHAUSTED: i32 = 3;
/// The run was stopped by the operator.
pub const ABORTED: i32 = 4;
