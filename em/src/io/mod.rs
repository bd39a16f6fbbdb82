//! I/O for em commands: git, the state store, processes and the terminal.

pub mod config;
pub mod confirm;
pub mod git;
pub mod init;
pub mod interrupt;
pub mod job;
pub mod process;
pub mod snapshot;
pub mod state_store;
pub mod worktree_guard;
