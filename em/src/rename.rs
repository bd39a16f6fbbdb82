//! `em rename`: move an experiment's directory, branch and record together.

use std::fs;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::error::EmError;
use crate::core::name::validate_name;
use crate::project::Project;

/// Rename `name` to `new_name`.
///
/// The record moves first, then the directory, then the branch. When a step
/// fails, the steps already done are undone in reverse order before the
/// error is returned, so the experiment stays under its old name.
#[instrument(skip(project))]
pub fn rename_experiment(project: &Project, name: &str, new_name: &str) -> Result<()> {
    validate_name(new_name)?;
    let record = project
        .store
        .get(name)?
        .ok_or_else(|| EmError::NoSuchExperiment(name.to_string()))?;
    if record.is_running() {
        return Err(EmError::AlreadyRunning(name.to_string()))
            .context("cannot rename running experiment");
    }
    if project.store.contains(new_name) {
        return Err(EmError::NameAlreadyExists(new_name.to_string()).into());
    }
    if !project.git.branch_exists(name)? {
        return Err(EmError::NoSuchExperiment(name.to_string()))
            .context(format!("no branch for experiment \"{name}\""));
    }
    if project.git.branch_exists(new_name)? {
        return Err(EmError::BranchConflict(new_name.to_string()).into());
    }

    project.store.rename(name, new_name)?;

    let from = project.paths.experiment_dir(name);
    let to = project.paths.experiment_dir(new_name);
    if let Err(source) = fs::rename(&from, &to) {
        undo_record_move(project, name, new_name);
        return Err(EmError::FilesystemMoveFailure { from, to, source }.into());
    }

    if let Err(err) = project.git.rename_branch(name, new_name) {
        if let Err(undo) = fs::rename(&to, &from) {
            warn!(err = %undo, "failed to move experiment directory back");
        }
        undo_record_move(project, name, new_name);
        return Err(err).context("could not rename branch");
    }

    if let Err(err) = project.git.worktree_repair(&to) {
        warn!(err = %format!("{err:#}"), "failed to repair checkout metadata");
    }
    info!(name, new_name, "experiment renamed");
    Ok(())
}

fn undo_record_move(project: &Project, name: &str, new_name: &str) {
    if let Err(err) = project.store.rename(new_name, name) {
        warn!(err = %format!("{err:#}"), "failed to move record back");
    }
}
