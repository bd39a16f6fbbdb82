//! Per-experiment state machine.
//!
//! ```text
//! starting -> running -> {completed, error, interrupted}
//! {completed, error, interrupted, starting} -> reset
//! running -> reset            (forced only)
//! any -> removed              (cleanup)
//! ```

use crate::core::error::EmError;
use crate::core::types::{ExperimentRecord, ExperimentStatus};

/// A job may start unless the record claims a live process.
pub fn ensure_startable(name: &str, record: Option<&ExperimentRecord>) -> Result<(), EmError> {
    match record {
        Some(record) if record.is_running() => Err(EmError::AlreadyRunning(name.to_string())),
        _ => Ok(()),
    }
}

/// Control operations require a recorded pid.
pub fn running_pid(name: &str, record: Option<&ExperimentRecord>) -> Result<u32, EmError> {
    let record = record.ok_or_else(|| EmError::NoSuchExperiment(name.to_string()))?;
    record
        .pid
        .ok_or_else(|| EmError::NotRunning(name.to_string()))
}

/// True when a reset must be forced (the record claims a live process).
pub fn reset_needs_force(record: &ExperimentRecord) -> bool {
    record.is_running()
}

/// Apply the `reset` transition in place.
pub fn apply_reset(record: &mut ExperimentRecord) {
    record.pid = None;
    record.gpu = None;
    record.status = ExperimentStatus::Reset;
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Code(i32),
    /// Terminated by a signal other than an interrupt.
    Signal(i32),
    /// Terminated by SIGINT, or the supervisor itself was interrupted.
    Interrupted,
}

/// Terminal status for an exited job.
pub fn terminal_status(exit: ExitKind) -> ExperimentStatus {
    match exit {
        ExitKind::Code(0) => ExperimentStatus::Completed,
        ExitKind::Code(_) | ExitKind::Signal(_) => ExperimentStatus::Error,
        ExitKind::Interrupted => ExperimentStatus::Interrupted,
    }
}
