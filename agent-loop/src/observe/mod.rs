//! Product observability: structured entries fanned out to console, JSONL
//! file, named pipe and callbacks, plus tool-call and context-budget
//! trackers built on top.
//!
//! This is separate from the `tracing` dev diagnostics in [`crate::logging`].

pub mod context_budget;
pub mod entry;
pub mod multiplexer;
pub mod sink;
pub mod tool_calls;
