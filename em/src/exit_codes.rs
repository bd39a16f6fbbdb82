//! Stable exit codes for em commands.

/// Command succeeded, a background job was started, or a foreground job
/// completed or was interrupted.
pub const OK: i32 = 0;
/// Any tooling error (bad project, name conflicts, git failures, ...).
pub const FAILURE: i32 = 1;
/// A foreground job exited with status `error`.
pub const JOB_FAILED: i32 = 2;
