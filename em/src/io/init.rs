//! Project layout and `em proj` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::core::error::EmError;
use crate::io::git::Git;

/// Entries every project ignores so state and checkouts never look like source edits.
const IGNORED_DIRS: [&str; 3] = [".em/", "data/", "experiments/"];

/// All canonical paths for a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub em_dir: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub experiments_dir: PathBuf,
    pub data_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let em_dir = root.join(".em");
        Self {
            state_dir: em_dir.join("state"),
            config_path: em_dir.join("config.toml"),
            experiments_dir: root.join("experiments"),
            data_dir: root.join("data"),
            gitignore_path: root.join(".gitignore"),
            em_dir,
            root,
        }
    }

    /// Paths for an existing project, or `NotAProject`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let paths = Self::new(root);
        if !paths.state_dir.is_dir() {
            let shown = fs::canonicalize(&paths.root).unwrap_or_else(|_| paths.root.clone());
            return Err(EmError::NotAProject(shown).into());
        }
        Ok(paths)
    }

    /// Isolated checkout of one experiment.
    pub fn experiment_dir(&self, name: &str) -> PathBuf {
        self.experiments_dir.join(name)
    }

    /// Directory owned by the training program inside a checkout.
    pub fn run_dir(&self, name: &str) -> PathBuf {
        self.experiment_dir(name).join("run")
    }

    pub fn snaps_dir(&self, name: &str) -> PathBuf {
        self.run_dir(name).join("snaps")
    }

    pub fn ctl_path(&self, name: &str) -> PathBuf {
        self.run_dir(name).join("ctl")
    }

    /// First `run/opts.*` file of an experiment, if the program wrote one.
    pub fn opts_path(&self, name: &str) -> Result<Option<PathBuf>> {
        let run_dir = self.run_dir(name);
        if !run_dir.is_dir() {
            return Ok(None);
        }
        let mut found: Vec<PathBuf> = fs::read_dir(&run_dir)
            .with_context(|| format!("read {}", run_dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_stem().and_then(|s| s.to_str()) == Some("opts")
                    && path.extension().is_some()
            })
            .collect();
        found.sort();
        Ok(found.into_iter().next())
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Repository cloned into the destination (history discarded).
    pub template_repo: Option<String>,
}

/// Create (or complete) a project at `dest`.
///
/// - Clones the template when one is given and `dest` does not exist yet.
/// - Otherwise initialises a git repository if `dest` is not inside one.
/// - Creates `experiments/`, `data/` and the state directory.
/// - Ignores `.em/`, `data/` and `experiments/` and makes sure HEAD has a commit.
pub fn init_project(dest: &Path, options: &InitOptions) -> Result<ProjectPaths> {
    debug!(dest = %dest.display(), template = ?options.template_repo, "initializing project");
    let git = match &options.template_repo {
        Some(url) if !dest.exists() => {
            info!(url = %url, "cloning project template");
            Git::clone_into(url, dest)?;
            let history = dest.join(".git");
            fs::remove_dir_all(&history)
                .with_context(|| format!("remove template history {}", history.display()))?;
            Git::init(dest)?
        }
        _ => {
            fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
            let git = Git::new(dest);
            if git.is_repo() {
                git
            } else {
                Git::init(dest)?
            }
        }
    };

    let paths = ProjectPaths::new(dest);
    for dir in [&paths.experiments_dir, &paths.data_dir, &paths.state_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    ensure_gitignore(&paths.gitignore_path)?;

    if git.find_commit("HEAD")?.is_none() {
        git.commit_all("initialize project")?;
    }
    info!(root = %paths.root.display(), "project ready");
    Ok(paths)
}

fn ensure_gitignore(path: &Path) -> Result<()> {
    let existing = if path.exists() {
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
    } else {
        String::new()
    };

    let missing: Vec<&str> = IGNORED_DIRS
        .iter()
        .copied()
        .filter(|req| !existing.lines().any(|l| l.trim() == *req))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    let mut out = existing;
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    for line in missing {
        out.push_str(line);
        out.push('\n');
    }
    fs::write(path, out).with_context(|| format!("write {}", path.display()))
}
