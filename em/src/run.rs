//! `em run` and `em resume`.
//!
//! `run` materialises a checkout for the experiment (recreating it on
//! request) and starts the job; `resume` starts the job again in an existing
//! checkout with `--resume [epoch]` appended to the program arguments.

use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::clean::remove_experiment;
use crate::core::error::EmError;
use crate::core::name::validate_name;
use crate::core::types::ExperimentRecord;
use crate::io::confirm::Confirm;
use crate::io::job::{Detacher, JobOutcome, JobSpec, RunMode};
use crate::io::snapshot::{BaseRef, SnapshotRequest};
use crate::project::Project;

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub name: String,
    pub gpu: Option<String>,
    pub mode: RunMode,
    /// Message for the snapshot commit, if one is created.
    pub description: Option<String>,
    /// Arguments appended after the configured program arguments.
    pub extra: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResumeRequest {
    pub name: String,
    pub epoch: Option<String>,
    pub gpu: Option<String>,
    pub mode: RunMode,
    pub extra: Vec<String>,
}

/// Create (or recreate) an experiment and run it.
///
/// Returns `None` when the user declines to recreate an existing experiment.
#[instrument(skip_all, fields(name = %request.name))]
pub fn run_experiment(
    project: &Project,
    request: &RunRequest,
    confirm: &dyn Confirm,
    detacher: &dyn Detacher,
    interrupted: &AtomicBool,
) -> Result<Option<JobOutcome>> {
    let name = request.name.as_str();
    validate_name(name)?;

    if let Some(existing) = project.store.get(name)? {
        if existing.is_running() {
            return Err(EmError::AlreadyRunning(name.to_string()).into());
        }
        let prompt = format!("Experiment {name} already exists. Recreate? [yN] ");
        if !confirm.confirm("", &prompt)? {
            debug!("recreate declined");
            return Ok(None);
        }
        remove_experiment(project, name).context("remove previous experiment")?;
    }
    project.store.put(name, &ExperimentRecord::starting())?;

    let base = match project.git.branch_tip(name)? {
        Some(commit) => {
            debug!(commit = %commit, "reusing existing branch");
            BaseRef::ExistingBranch { commit }
        }
        None => BaseRef::Head,
    };
    let snapshot = project.snapshot_engine().create(
        &project.store,
        &SnapshotRequest {
            name,
            base,
            message: request.description.as_deref(),
        },
    );
    let snapshot = match snapshot {
        Ok(snapshot) => snapshot,
        Err(err) => {
            if let Err(cleanup) = project.store.remove(name) {
                warn!(err = %format!("{cleanup:#}"), "failed to remove starting record");
            }
            return Err(err);
        }
    };
    info!(commit = %snapshot.commit, reused_from = ?snapshot.reused_from, "snapshot ready");

    let spec = JobSpec {
        name: name.to_string(),
        command: project.config.command(&request.extra),
        workdir: snapshot.checkout,
        gpu: request.gpu.clone(),
    };
    let runner = project.job_runner()?;
    runner
        .start(&spec, request.mode, detacher, interrupted)
        .map(Some)
}

/// Start an existing, stopped experiment again.
#[instrument(skip_all, fields(name = %request.name))]
pub fn resume_experiment(
    project: &Project,
    request: &ResumeRequest,
    detacher: &dyn Detacher,
    interrupted: &AtomicBool,
) -> Result<JobOutcome> {
    let name = request.name.as_str();
    let record = project
        .store
        .get(name)?
        .ok_or_else(|| EmError::NoSuchExperiment(name.to_string()))?;
    if record.is_running() {
        return Err(EmError::AlreadyRunning(name.to_string()).into());
    }
    if !project.git.branch_exists(name)? {
        return Err(EmError::NoSuchExperiment(name.to_string()).into());
    }

    let spec = JobSpec {
        name: name.to_string(),
        command: project.config.command(&resume_args(request)),
        workdir: project.paths.experiment_dir(name),
        gpu: request.gpu.clone(),
    };
    project
        .job_runner()?
        .start(&spec, request.mode, detacher, interrupted)
}

fn resume_args(request: &ResumeRequest) -> Vec<String> {
    let mut args = request.extra.clone();
    args.push("--resume".to_string());
    if let Some(epoch) = &request.epoch {
        args.push(epoch.clone());
    }
    args
}
