//! Self-improving agent loop.
//!
//! Drives an agent through repeated iterations, feeds every outcome back into
//! a skillbook of learned strategies and can delegate iterations to
//! specialized subagents. The crate is split the same way throughout:
//!
//! - **[`core`]**: Pure, deterministic logic (skillbook updates, prompt
//!   classification, token counting, time budgets). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem, config, process
//!   execution, prompt rendering).
//! - **[`observe`]**: Structured product logs and the trackers built on them.
//!
//! [`learning`] and [`orchestration`] combine the two layers into the
//! learning cycle and subagent delegation; [`scheduler`] runs the loop and
//! [`start`] wires it from config for the CLI.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod learning;
pub mod logging;
pub mod observe;
pub mod orchestration;
pub mod scheduler;
pub mod start;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
