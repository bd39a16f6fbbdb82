//! `em clean` and `em reset`.
//!
//! Both select experiments by glob patterns. Running experiments are only
//! touched with `force`. A single exact name acts immediately; anything else
//! is listed and confirmed first.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::lifecycle::{apply_reset, reset_needs_force};
use crate::io::confirm::Confirm;
use crate::project::Project;

#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub patterns: Vec<String>,
    pub exclude: Vec<String>,
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanScope {
    /// Directory, checkout metadata, branch and record.
    Everything,
    /// Only the contents of `run/snaps/`.
    SnapsOnly,
}

/// Names chosen by a selection, split by whether they need `force`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Matched {
    idle: BTreeSet<String>,
    running: BTreeSet<String>,
}

impl Matched {
    fn targets(&self, force: bool) -> BTreeSet<String> {
        if force {
            self.idle.union(&self.running).cloned().collect()
        } else {
            self.idle.clone()
        }
    }
}

fn match_selection(project: &Project, selection: &Selection) -> Result<Matched> {
    let mut matched = Matched::default();
    for name in project
        .store
        .select_by_pattern(&selection.patterns, &selection.exclude)?
    {
        let running = project
            .store
            .get(&name)?
            .is_some_and(|rec| reset_needs_force(&rec));
        if running {
            matched.running.insert(name);
        } else {
            matched.idle.insert(name);
        }
    }
    Ok(matched)
}

fn single_exact<'a>(selection: &'a Selection, targets: &BTreeSet<String>) -> Option<&'a str> {
    match selection.patterns.as_slice() {
        [only] if targets.contains(only) => Some(only.as_str()),
        _ => None,
    }
}

fn bullet_list(out: &mut String, names: &BTreeSet<String>, suffix: &str) {
    for name in names {
        let _ = writeln!(out, "* {name}{suffix}");
    }
}

/// Remove the selected experiments (or their snapshots). Returns the names
/// that were cleaned.
#[instrument(skip_all, fields(patterns = ?selection.patterns, scope = ?scope))]
pub fn clean(
    project: &Project,
    selection: &Selection,
    scope: CleanScope,
    confirm: &dyn Confirm,
) -> Result<Vec<String>> {
    let matched = match_selection(project, selection)?;
    let targets = matched.targets(selection.force);
    if let Some(name) = single_exact(selection, &targets) {
        clean_one(project, name, scope)?;
        return Ok(vec![name.to_string()]);
    }
    if targets.is_empty() {
        debug!("nothing to clean");
        return Ok(Vec::new());
    }

    let mut preamble = String::from(match scope {
        CleanScope::Everything => "The following experiments will be removed:\n",
        CleanScope::SnapsOnly => "The following experiments' snaps will be removed:\n",
    });
    bullet_list(&mut preamble, &matched.idle, "");
    if selection.force {
        bullet_list(&mut preamble, &matched.running, " (running)");
    } else if !matched.running.is_empty() {
        preamble.push_str("The following experiments require --force to be removed:\n");
        bullet_list(&mut preamble, &matched.running, "");
    }
    let prompt = match scope {
        CleanScope::Everything => format!("Clean up {} experiments? [yN] ", targets.len()),
        CleanScope::SnapsOnly => format!("Clean up snaps of {} experiments? [yN] ", targets.len()),
    };
    if !confirm.confirm(preamble.trim_end(), &prompt)? {
        return Ok(Vec::new());
    }

    let mut cleaned = Vec::with_capacity(targets.len());
    for name in targets {
        match clean_one(project, &name, scope) {
            Ok(()) => cleaned.push(name),
            Err(err) => warn!(name = %name, err = %format!("{err:#}"), "could not clean up"),
        }
    }
    Ok(cleaned)
}

fn clean_one(project: &Project, name: &str, scope: CleanScope) -> Result<()> {
    match scope {
        CleanScope::Everything => remove_experiment(project, name),
        CleanScope::SnapsOnly => empty_snaps(project, name),
    }
}

/// Delete an experiment's checkout, branch and record together.
#[instrument(skip(project))]
pub fn remove_experiment(project: &Project, name: &str) -> Result<()> {
    let dir = project.paths.experiment_dir(name);
    if dir.is_dir() {
        fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
    }
    project.git.worktree_prune()?;
    if project.git.branch_exists(name)? {
        project.git.delete_branch(name)?;
    }
    project.store.remove(name)?;
    info!(name, "experiment removed");
    Ok(())
}

fn empty_snaps(project: &Project, name: &str) -> Result<()> {
    let snaps = project.paths.snaps_dir(name);
    if !snaps.is_dir() {
        return Ok(());
    }
    fs::remove_dir_all(&snaps).with_context(|| format!("remove {}", snaps.display()))?;
    fs::create_dir(&snaps).with_context(|| format!("recreate {}", snaps.display()))?;
    debug!(name, "snaps emptied");
    Ok(())
}

/// Mark the selected experiments `reset`. Returns the names that were reset.
#[instrument(skip_all, fields(patterns = ?selection.patterns))]
pub fn reset(project: &Project, selection: &Selection, confirm: &dyn Confirm) -> Result<Vec<String>> {
    let matched = match_selection(project, selection)?;
    let targets = matched.targets(selection.force);
    if let Some(name) = single_exact(selection, &targets) {
        reset_one(project, name)?;
        return Ok(vec![name.to_string()]);
    }
    if targets.is_empty() {
        debug!("nothing to reset");
        return Ok(Vec::new());
    }

    let mut preamble = String::from("The following experiments will be reset:\n");
    bullet_list(&mut preamble, &matched.idle, "");
    if selection.force {
        bullet_list(&mut preamble, &matched.running, " (running)");
    } else if !matched.running.is_empty() {
        preamble.push_str("The following experiments require --force to be reset:\n");
        bullet_list(&mut preamble, &matched.running, "");
    }
    let prompt = format!("Reset {} experiments? [yN] ", targets.len());
    if !confirm.confirm(preamble.trim_end(), &prompt)? {
        return Ok(Vec::new());
    }

    for name in &targets {
        reset_one(project, name)?;
    }
    Ok(targets.into_iter().collect())
}

fn reset_one(project: &Project, name: &str) -> Result<()> {
    project.store.upsert(name, apply_reset)?;
    info!(name, "experiment reset");
    Ok(())
}
