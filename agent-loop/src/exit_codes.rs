//! Stable exit codes for agent-loop CLI commands.

/// Command succeeded, or a run completed or reached its iteration/runtime limit.
pub const OK: i32 = 0;
/// Invalid config, startup failure or a fatal error during the run.
pub const INVALID: i32 = 1;
/// The run stopped after too many consecutive failed iterations.
pub const FAILED: i32 = 2;
/// A subagent's required capabilities were missing or disabled.
pub const CAPABILITY: i32 = 3;
/// The run was interrupted.
pub const CANCELLED: i32 = 4;
