//! Test-only helpers: a scratch project backed by a real git repository.

use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, anyhow};

use crate::io::config::{EmConfig, write_config};
use crate::io::git::Git;
use crate::io::init::{InitOptions, ProjectPaths, init_project};
use crate::io::snapshot::{BaseRef, Snapshot, SnapshotRequest};
use crate::io::state_store::StateStore;
use crate::project::Project;

/// Initialised project in a temp dir with `main.py` committed on `main`.
pub struct TestRepo {
    temp: tempfile::TempDir,
    paths: ProjectPaths,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        let root = temp.path();
        run_git(root, &["init", "--quiet", "--initial-branch=main"])?;
        run_git(root, &["config", "user.name", "em tests"])?;
        run_git(root, &["config", "user.email", "em-tests@example.invalid"])?;
        run_git(root, &["config", "commit.gpgsign", "false"])?;

        let paths = init_project(root, &InitOptions::default())?;
        let repo = Self { temp, paths };
        repo.commit_file("main.py", "print('hello')\n", "add entry point")?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    pub fn store(&self) -> Result<StateStore> {
        StateStore::open(&self.paths.state_dir)
    }

    /// Open the project with default configuration.
    pub fn project(&self) -> Result<Project> {
        Project::open(self.root(), None)
    }

    pub fn config(&self) -> EmConfig {
        EmConfig::default()
    }

    /// Configure the program experiments run (`prog args...`).
    pub fn use_program(&self, prog: &str, args: &[&str]) -> Result<()> {
        let mut cfg = EmConfig::default();
        cfg.experiment.prog = prog.to_string();
        cfg.experiment.prog_args = args.iter().map(|a| a.to_string()).collect();
        write_config(&self.paths.config_path, &cfg)
    }

    /// Write `contents` to `path` (relative to the root) and commit it.
    pub fn commit_file(&self, path: &str, contents: &str, message: &str) -> Result<()> {
        self.write_file(path, contents)?;
        Git::new(self.root()).commit_all(message)
    }

    pub fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        let full = self.root().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&full, contents).with_context(|| format!("write {}", full.display()))
    }

    /// Snapshot `name` with the default tracked extensions.
    pub fn snapshot(&self, name: &str, base: BaseRef) -> Result<Snapshot> {
        let git = Git::new(self.root());
        let store = self.store()?;
        let tracked = self.config().experiment.track_files;
        crate::io::snapshot::SnapshotEngine::new(&git, &self.paths, &tracked).create(
            &store,
            &SnapshotRequest {
                name,
                base,
                message: None,
            },
        )
    }

    /// Run git in the root and return trimmed stdout; panics on failure.
    pub fn git_stdout(&self, args: &[&str]) -> String {
        match run_git(self.root(), args) {
            Ok(out) => out,
            Err(err) => panic!("git {args:?} failed: {err:#}"),
        }
    }
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {args:?}"))?;
    if !out.status.success() {
        return Err(anyhow!(
            "git {args:?}: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}
