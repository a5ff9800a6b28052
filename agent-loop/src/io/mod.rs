//! Side-effecting helpers: filesystem state, processes, prompts and config.

pub mod atomic;
pub mod capabilities;
pub mod checkpoint;
pub mod config;
pub mod executor;
pub mod init;
pub mod iteration_log;
pub mod process;
pub mod prompt;
pub mod skillbook_store;
