//! `em fork`: branch a new experiment off another one's tip.
//!
//! The fork shares the source's code and its run artifacts: `run/opts.*` and
//! every entry of `run/snaps/` are symlinked, never copied, so the fork can
//! resume from the source's checkpoints.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::clean::remove_experiment;
use crate::core::error::EmError;
use crate::core::name::validate_name;
use crate::core::types::ExperimentRecord;
use crate::io::snapshot::{BaseRef, Snapshot, SnapshotRequest, symlink_dir};
use crate::project::Project;

#[instrument(skip(project))]
pub fn fork_experiment(project: &Project, name: &str, fork_name: &str) -> Result<Snapshot> {
    validate_name(fork_name)?;
    if project.store.contains(fork_name) {
        return Err(EmError::NameAlreadyExists(fork_name.to_string()).into());
    }
    if !project.store.contains(name) {
        return Err(EmError::NoSuchExperiment(name.to_string()).into());
    }
    if project.git.branch_exists(fork_name)? {
        return Err(EmError::BranchConflict(fork_name.to_string()).into());
    }
    let commit = project
        .git
        .branch_tip(name)?
        .ok_or_else(|| EmError::NoSuchExperiment(name.to_string()))?;

    project
        .store
        .put(fork_name, &ExperimentRecord::fork_of(name))?;
    let snapshot = project.snapshot_engine().create(
        &project.store,
        &SnapshotRequest {
            name: fork_name,
            base: BaseRef::Fork { commit },
            message: None,
        },
    );
    let snapshot = match snapshot {
        Ok(snapshot) => snapshot,
        Err(err) => {
            if let Err(cleanup) = project.store.remove(fork_name) {
                warn!(err = %format!("{cleanup:#}"), "failed to remove fork record");
            }
            return Err(err);
        }
    };

    if let Err(err) = link_run_artifacts(project, name, fork_name) {
        if let Err(cleanup) = remove_experiment(project, fork_name) {
            warn!(err = %format!("{cleanup:#}"), "failed to remove partial fork");
        }
        return Err(err).context("link run artifacts");
    }
    info!(commit = %snapshot.commit, "fork ready");
    Ok(snapshot)
}

fn link_run_artifacts(project: &Project, name: &str, fork_name: &str) -> Result<()> {
    let fork_snaps = project.paths.snaps_dir(fork_name);
    fs::create_dir_all(&fork_snaps).with_context(|| format!("create {}", fork_snaps.display()))?;

    if let Some(opts) = project.paths.opts_path(name)? {
        let file_name = opts
            .file_name()
            .with_context(|| format!("opts path without file name {}", opts.display()))?;
        link(&opts, &project.paths.run_dir(fork_name).join(file_name))?;
    }

    let source_snaps = project.paths.snaps_dir(name);
    if !source_snaps.is_dir() {
        return Ok(());
    }
    let entries = fs::read_dir(&source_snaps)
        .with_context(|| format!("read {}", source_snaps.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", source_snaps.display()))?;
        link(&entry.path(), &fork_snaps.join(entry.file_name()))?;
    }
    Ok(())
}

fn link(original: &Path, link: &Path) -> Result<()> {
    let target = fs::canonicalize(original)
        .with_context(|| format!("resolve {}", original.display()))?;
    debug!(link = %link.display(), target = %target.display(), "linking run artifact");
    if target.is_dir() {
        symlink_dir(&target, link)
    } else {
        symlink_file(&target, link)
    }
    .with_context(|| format!("link {} -> {}", link.display(), target.display()))
}

#[cfg(unix)]
fn symlink_file(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_file(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}
