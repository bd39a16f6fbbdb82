//! Experiment manager: reproducible, isolated experiments backed by git.
//!
//! Every experiment is a branch plus a checkout under `experiments/<name>`,
//! rooted at a snapshot of the tracked source files, with its lifecycle
//! recorded in `.em/state/<name>.json`. The crate keeps a strict split:
//!
//! - **[`core`]**: pure logic (names, change classification, pattern
//!   selection, the lifecycle state machine). No I/O.
//! - **[`io`]**: git, the state store, snapshots, job supervision and the
//!   terminal.
//!
//! One orchestration module per command ([`run`], [`fork`], [`clean`],
//! [`rename`], [`ctl`], [`show`], [`proj`]) composes the two.

pub mod clean;
pub mod core;
pub mod ctl;
pub mod exit_codes;
pub mod fork;
pub mod io;
pub mod logging;
pub mod proj;
pub mod project;
pub mod rename;
pub mod run;
pub mod show;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
