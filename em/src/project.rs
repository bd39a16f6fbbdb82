//! Open-project handle shared by every command except `proj`.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::io::config::{EmConfig, load_config};
use crate::io::git::Git;
use crate::io::init::ProjectPaths;
use crate::io::job::JobRunner;
use crate::io::snapshot::SnapshotEngine;
use crate::io::state_store::StateStore;

/// Paths, repository, state store and configuration of one project.
///
/// The store handle is owned here and passed explicitly to every operation;
/// nothing in the crate keeps a process-wide store.
#[derive(Debug)]
pub struct Project {
    pub paths: ProjectPaths,
    pub git: Git,
    pub store: StateStore,
    pub config: EmConfig,
}

impl Project {
    /// Open the project at `root`, reading `config` or `.em/config.toml`.
    pub fn open(root: &Path, config: Option<&Path>) -> Result<Self> {
        let paths = ProjectPaths::open(root)?;
        let config_path = config.unwrap_or(&paths.config_path);
        let config = load_config(config_path)
            .with_context(|| format!("load config {}", config_path.display()))?;
        let store = StateStore::open(&paths.state_dir)?;
        debug!(root = %paths.root.display(), "project opened");
        Ok(Self {
            git: Git::new(&paths.root),
            paths,
            store,
            config,
        })
    }

    pub fn snapshot_engine(&self) -> SnapshotEngine<'_> {
        SnapshotEngine::new(&self.git, &self.paths, &self.config.experiment.track_files)
    }

    pub fn job_runner(&self) -> Result<JobRunner<'_>> {
        JobRunner::new(&self.store, &self.paths)
    }

    /// Release the store handle.
    pub fn close(self) {
        self.store.close();
    }
}
