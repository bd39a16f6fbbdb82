//! Git adapter for experiment commands.
//!
//! Snapshots, checkouts and branch bookkeeping all go through a small, explicit
//! wrapper around `git` subprocess calls. Lookups that may legitimately find
//! nothing return `Option` instead of an error.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::core::error::EmError;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Where HEAD pointed when it was captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadTarget {
    /// Commit id HEAD resolved to.
    pub commit: String,
    /// Symbolic ref (e.g. `refs/heads/main`), `None` when detached.
    pub symbolic: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Move the ref only; index and working tree untouched.
    Soft,
    /// Move the ref and overwrite index and working tree.
    Hard,
}

impl ResetMode {
    fn flag(self) -> &'static str {
        match self {
            Self::Soft => "--soft",
            Self::Hard => "--hard",
        }
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Initialise a repository in `dir` (no-op if one already exists there).
    pub fn init(dir: &Path) -> Result<Self> {
        let git = Self::new(dir);
        git.run_checked(&["init", "--quiet"])?;
        Ok(git)
    }

    /// Clone `url` into `dest`, which must not exist yet.
    pub fn clone_into(url: &str, dest: &Path) -> Result<Self> {
        let parent = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let dest_arg = dest.to_string_lossy();
        Self::new(parent).run_checked(&["clone", "--quiet", url, &dest_arg])?;
        Ok(Self::new(dest))
    }

    /// True if the working directory is inside a git repository.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--git-dir"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Capture HEAD's commit and the branch it points at.
    #[instrument(skip_all)]
    pub fn head(&self) -> Result<HeadTarget> {
        let commit = self.rev_parse("HEAD^{commit}")?;
        let out = self.run(&["symbolic-ref", "-q", "HEAD"])?;
        let symbolic = if out.status.success() {
            Some(String::from_utf8_lossy(&out.stdout).trim().to_string())
        } else {
            None
        };
        debug!(commit = %commit, symbolic = ?symbolic, "captured HEAD");
        Ok(HeadTarget { commit, symbolic })
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--verify", rev])?;
        Ok(out.trim().to_string())
    }

    /// Resolve `rev` to a commit id, or `None` if it does not name a commit.
    pub fn find_commit(&self, rev: &str) -> Result<Option<String>> {
        let spec = format!("{rev}^{{commit}}");
        let out = self.run(&["rev-parse", "-q", "--verify", &spec])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Tree id (content hash) of a commit.
    pub fn tree_of(&self, commit: &str) -> Result<String> {
        self.rev_parse(&format!("{commit}^{{tree}}"))
    }

    /// Tip commit of a local branch, or `None` if the branch does not exist.
    pub fn branch_tip(&self, branch: &str) -> Result<Option<String>> {
        self.find_commit(&format!("refs/heads/{branch}"))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Branches currently checked out in any worktree (main one included).
    pub fn checked_out_branches(&self) -> Result<BTreeSet<String>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(out
            .lines()
            .filter_map(|line| line.strip_prefix("branch refs/heads/"))
            .map(|name| name.trim().to_string())
            .collect())
    }

    pub fn is_checked_out(&self, branch: &str) -> Result<bool> {
        Ok(self.checked_out_branches()?.contains(branch))
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Location of this worktree's index file.
    pub fn index_path(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--git-path", "index"])?;
        let path = PathBuf::from(out.trim());
        Ok(if path.is_absolute() {
            path
        } else {
            self.workdir.join(path)
        })
    }

    /// Stage `pathspecs` into the index file at `index` and write its tree.
    ///
    /// The repository's own index is left untouched.
    #[instrument(skip_all, fields(index = %index.display()))]
    pub fn write_tree_with_index(&self, index: &Path, pathspecs: &[String]) -> Result<String> {
        let env = [("GIT_INDEX_FILE", index.as_os_str())];
        if !index.exists() {
            self.run_checked_env(&["read-tree", "HEAD"], &env)?;
        }
        if !pathspecs.is_empty() {
            let mut args = vec!["add", "-A", "--"];
            args.extend(pathspecs.iter().map(String::as_str));
            self.run_checked_env(&args, &env)?;
        }
        let out = self.run_checked_env(&["write-tree"], &env)?;
        let tree = String::from_utf8_lossy(&out.stdout).trim().to_string();
        debug!(tree = %tree, "wrote candidate tree");
        Ok(tree)
    }

    /// Reset the current HEAD ref to `commit`.
    #[instrument(skip_all, fields(commit, mode = ?mode))]
    pub fn reset(&self, commit: &str, mode: ResetMode) -> Result<()> {
        self.run_checked(&["reset", "--quiet", mode.flag(), commit])?;
        Ok(())
    }

    fn stash_ref(&self) -> Result<Option<String>> {
        self.find_commit("refs/stash")
    }

    /// Stash all edits including untracked files.
    ///
    /// Returns `true` if a stash entry was actually created.
    #[instrument(skip_all)]
    pub fn stash_push(&self, message: &str) -> Result<bool> {
        let before = self.stash_ref()?;
        self.run_checked(&["stash", "push", "--quiet", "--include-untracked", "-m", message])?;
        let pushed = self.stash_ref()? != before;
        debug!(pushed, "stash push");
        Ok(pushed)
    }

    /// Re-apply and drop the most recent stash entry, restoring the index too.
    #[instrument(skip_all)]
    pub fn stash_pop(&self) -> Result<()> {
        self.run_checked(&["stash", "pop", "--quiet", "--index"])?;
        Ok(())
    }

    /// Add a checkout at `path` on a new branch rooted at the current HEAD.
    #[instrument(skip_all, fields(branch, path = %path.display()))]
    pub fn worktree_add_new_branch(&self, path: &Path, branch: &str) -> Result<()> {
        let path_arg = path.to_string_lossy();
        self.run_checked(&["worktree", "add", "--quiet", "-b", branch, &path_arg])?;
        Ok(())
    }

    /// Add a checkout at `path` bound to an existing branch.
    #[instrument(skip_all, fields(branch, path = %path.display()))]
    pub fn worktree_add_existing(&self, path: &Path, branch: &str) -> Result<()> {
        let path_arg = path.to_string_lossy();
        self.run_checked(&["worktree", "add", "--quiet", &path_arg, branch])?;
        Ok(())
    }

    pub fn worktree_remove_force(&self, path: &Path) -> Result<()> {
        let path_arg = path.to_string_lossy();
        self.run_checked(&["worktree", "remove", "--force", &path_arg])?;
        Ok(())
    }

    /// Drop administrative data for checkouts whose directory is gone.
    pub fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    /// Re-link checkout metadata after its directory moved.
    pub fn worktree_repair(&self, path: &Path) -> Result<()> {
        let path_arg = path.to_string_lossy();
        self.run_checked(&["worktree", "repair", &path_arg])?;
        Ok(())
    }

    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    #[instrument(skip_all, fields(from, to))]
    pub fn rename_branch(&self, from: &str, to: &str) -> Result<()> {
        self.run_checked(&["branch", "-m", from, to])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Stage everything and commit, even if nothing changed.
    #[instrument(skip_all)]
    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.add_all()?;
        debug!("committing all changes");
        self.run_checked(&["commit", "--quiet", "--allow-empty", "-m", message])?;
        Ok(())
    }

    /// Create a commit object for `tree` with a single parent.
    pub fn commit_tree(&self, tree: &str, parent: &str, message: &str) -> Result<String> {
        let out = self.run_capture(&["commit-tree", tree, "-p", parent, "-m", message])?;
        Ok(out.trim().to_string())
    }

    /// Point `refname` at `new`, failing unless it currently points at `old`.
    pub fn update_ref(&self, refname: &str, new: &str, old: &str) -> Result<()> {
        self.run_checked(&["update-ref", refname, new, old])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        self.run_checked_env(args, &[])
    }

    fn run_checked_env(&self, args: &[&str], env: &[(&str, &OsStr)]) -> Result<Output> {
        let output = self.run_env(args, env)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EmError::vcs(args, stderr.trim()).into());
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        self.run_env(args, &[])
    }

    fn run_env(&self, args: &[&str], env: &[(&str, &OsStr)]) -> Result<Output> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: unquote(path.trim()),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry {
        code,
        path: unquote(&path),
    })
}

/// Porcelain quotes paths with unusual characters; keep the inner text.
fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}
