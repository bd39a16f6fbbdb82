//! Experiment lifecycle records.
//!
//! A record is keyed by the experiment name (which is also its branch name);
//! the name itself is not stored inside the record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Starting,
    Running,
    Completed,
    Error,
    Interrupted,
    Reset,
}

impl ExperimentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Interrupted => "interrupted",
            Self::Reset => "reset",
        }
    }

    /// Exit states written once the supervised process is gone.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Interrupted)
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state for one experiment (`.em/state/<name>.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub status: ExperimentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
    /// Present only while the job is supervised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Device selector exported as `CUDA_VISIBLE_DEVICES`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
    /// Parent experiment, set only for forks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_of: Option<String>,
}

impl Default for ExperimentRecord {
    fn default() -> Self {
        Self::starting()
    }
}

impl ExperimentRecord {
    pub fn starting() -> Self {
        Self {
            status: ExperimentStatus::Starting,
            started: None,
            ended: None,
            pid: None,
            hostname: None,
            gpu: None,
            clone_of: None,
        }
    }

    pub fn fork_of(parent: &str) -> Self {
        Self {
            clone_of: Some(parent.to_string()),
            ..Self::starting()
        }
    }

    /// True when the record claims a live job (status or a leftover pid).
    pub fn is_running(&self) -> bool {
        self.status == ExperimentStatus::Running || self.pid.is_some()
    }
}
