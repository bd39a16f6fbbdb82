//! Snapshot-and-branch materialisation of experiments.
//!
//! [`SnapshotEngine::create`] decides which commit an experiment is rooted at,
//! creates the isolated checkout `experiments/<name>` on branch `<name>`, and
//! links the shared `data/` directory into it. The caller's HEAD, index and
//! working tree are protected by a [`WorkingTreeGuard`] for the whole call.
//!
//! Base selection:
//!
//! - no tracked-file changes: the explicit base if one was given, else HEAD;
//! - changes + fresh experiment: an existing experiment whose tip tree equals
//!   the candidate tree (first in name order), else HEAD plus a new commit;
//! - changes + fork: the fork source, with the edits stashed meanwhile;
//! - changes + reused branch: allowed only if the branch already stores the
//!   candidate tree, otherwise `DirtySourceConflict`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::{ChangeSummary, classify_changed_paths};
use crate::core::error::EmError;
use crate::core::name::validate_name;
use crate::io::git::{Git, ResetMode};
use crate::io::init::ProjectPaths;
use crate::io::state_store::StateStore;
use crate::io::worktree_guard::WorkingTreeGuard;

const DEFAULT_MESSAGE: &str = "setup experiment";

/// Where a new experiment is rooted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseRef {
    /// Current HEAD, deduplicated against existing experiments.
    Head,
    /// A new branch at another experiment's tip; local edits are preserved
    /// but not included.
    Fork { commit: String },
    /// The experiment's own branch already exists and is checked out again.
    ExistingBranch { commit: String },
}

impl BaseRef {
    fn explicit_commit(&self) -> Option<&str> {
        match self {
            Self::Head => None,
            Self::Fork { commit } | Self::ExistingBranch { commit } => Some(commit),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotRequest<'a> {
    pub name: &'a str,
    pub base: BaseRef,
    /// Message for a newly created snapshot commit.
    pub message: Option<&'a str>,
}

/// Result of a successful snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Tip commit of the experiment branch.
    pub commit: String,
    /// Tree id of `commit`.
    pub tree: String,
    /// True if a new commit was written for this experiment.
    pub created_commit: bool,
    /// Experiment whose commit was reused because its tree matched.
    pub reused_from: Option<String>,
    pub checkout: PathBuf,
}

/// Decisions taken before anything is mutated.
#[derive(Debug)]
struct Plan {
    base: String,
    candidate_tree: Option<String>,
    stash: bool,
    commit_candidate: bool,
    reused_from: Option<String>,
}

#[derive(Debug, Default)]
struct Progress {
    checkout_created: bool,
    branch_created: bool,
}

pub struct SnapshotEngine<'a> {
    git: &'a Git,
    paths: &'a ProjectPaths,
    tracked: &'a [String],
}

impl<'a> SnapshotEngine<'a> {
    pub fn new(git: &'a Git, paths: &'a ProjectPaths, tracked: &'a [String]) -> Self {
        Self {
            git,
            paths,
            tracked,
        }
    }

    /// Classify the caller's working tree changes by tracked extension.
    pub fn changes(&self) -> Result<ChangeSummary> {
        let entries = self.git.status_porcelain()?;
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        let summary = classify_changed_paths(&paths, self.tracked);
        debug!(
            has_changes = summary.has_changes,
            source_exts = ?summary.changed_exts,
            "classified working tree"
        );
        Ok(summary)
    }

    /// Tree the tracked files would have if committed now, computed in a
    /// scratch copy of the index.
    pub fn candidate_tree(&self, changes: &ChangeSummary) -> Result<String> {
        let scratch = tempfile::tempdir().context("create scratch index dir")?;
        let scratch_index = scratch.path().join("index");
        let index = self.git.index_path()?;
        if index.exists() {
            fs::copy(&index, &scratch_index)
                .with_context(|| format!("copy index {}", index.display()))?;
        }
        self.git
            .write_tree_with_index(&scratch_index, &changes.pathspecs())
    }

    #[instrument(skip_all, fields(name = request.name, base = ?request.base))]
    pub fn create(&self, store: &StateStore, request: &SnapshotRequest<'_>) -> Result<Snapshot> {
        let name = request.name;
        validate_name(name)?;
        self.check_branch(request)?;

        let mut guard = WorkingTreeGuard::acquire(self.git)?;
        let plan = self.plan(store, request, &guard.original().commit)?;
        debug!(?plan, "snapshot plan");

        let mut progress = Progress::default();
        let outcome = self.materialize(&mut guard, request, &plan, &mut progress);
        if outcome.is_err() {
            self.roll_back(name, &progress);
        }
        let released = guard.release();

        let commit = outcome?;
        released.context("restore working tree after snapshot")?;

        let tree = self.git.tree_of(&commit)?;
        info!(
            name,
            commit = %commit,
            created = plan.commit_candidate,
            reused_from = ?plan.reused_from,
            "experiment checkout ready"
        );
        Ok(Snapshot {
            commit,
            tree,
            created_commit: plan.commit_candidate,
            reused_from: plan.reused_from,
            checkout: self.paths.experiment_dir(name),
        })
    }

    fn check_branch(&self, request: &SnapshotRequest<'_>) -> Result<()> {
        let name = request.name;
        match request.base {
            BaseRef::ExistingBranch { .. } => {
                if self.git.is_checked_out(name)? {
                    return Err(EmError::CheckedOutConflict(name.to_string()).into());
                }
            }
            BaseRef::Head | BaseRef::Fork { .. } => {
                if self.git.branch_exists(name)? {
                    return Err(EmError::BranchConflict(name.to_string()).into());
                }
            }
        }
        Ok(())
    }

    fn plan(&self, store: &StateStore, request: &SnapshotRequest<'_>, head: &str) -> Result<Plan> {
        let changes = self.changes()?;
        let explicit = request.base.explicit_commit();
        if !changes.has_source_changes() {
            return Ok(Plan {
                base: explicit.unwrap_or(head).to_string(),
                candidate_tree: None,
                stash: false,
                commit_candidate: false,
                reused_from: None,
            });
        }

        let candidate = self.candidate_tree(&changes)?;
        let mut plan = Plan {
            base: head.to_string(),
            candidate_tree: Some(candidate.clone()),
            stash: false,
            commit_candidate: false,
            reused_from: None,
        };
        match &request.base {
            BaseRef::Fork { commit } => {
                plan.base = commit.clone();
                plan.stash = self.git.tree_of(commit)? != candidate;
            }
            BaseRef::ExistingBranch { commit } => {
                if self.git.tree_of(commit)? != candidate {
                    return Err(EmError::DirtySourceConflict(request.name.to_string()).into());
                }
                plan.base = commit.clone();
            }
            BaseRef::Head => match self.find_identical(store, request.name, &candidate)? {
                Some((existing, commit)) => {
                    debug!(existing = %existing, commit = %commit, "reusing identical snapshot");
                    plan.base = commit;
                    plan.reused_from = Some(existing);
                }
                None => plan.commit_candidate = true,
            },
        }
        Ok(plan)
    }

    /// First experiment (in name order) whose branch tip stores `tree`.
    fn find_identical(&self, store: &StateStore, exclude: &str, tree: &str) -> Result<Option<(String, String)>> {
        for existing in store.names()? {
            if existing == exclude {
                continue;
            }
            let Some(tip) = self.git.branch_tip(&existing)? else {
                continue;
            };
            if self.git.tree_of(&tip)? == tree {
                return Ok(Some((existing, tip)));
            }
        }
        Ok(None)
    }

    fn materialize(
        &self,
        guard: &mut WorkingTreeGuard<'_>,
        request: &SnapshotRequest<'_>,
        plan: &Plan,
        progress: &mut Progress,
    ) -> Result<String> {
        let name = request.name;
        let checkout = self.paths.experiment_dir(name);
        if let Some(parent) = checkout.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }

        if let BaseRef::ExistingBranch { .. } = request.base {
            self.git.worktree_add_existing(&checkout, name)?;
            progress.checkout_created = true;
        } else {
            if plan.stash {
                guard.stash()?;
            }
            guard.move_head(&plan.base)?;
            // git may create the branch before rejecting the checkout path.
            progress.branch_created = true;
            self.git.worktree_add_new_branch(&checkout, name)?;
            progress.checkout_created = true;
        }

        let mut tip = plan.base.clone();
        if plan.commit_candidate
            && let Some(tree) = &plan.candidate_tree
        {
            let message = request.message.unwrap_or(DEFAULT_MESSAGE);
            tip = self.git.commit_tree(tree, &plan.base, message)?;
            self.git
                .update_ref(&format!("refs/heads/{name}"), &tip, &plan.base)?;
            // The checkout was populated from the base; bring it up to the new tip.
            Git::new(&checkout).reset("HEAD", ResetMode::Hard)?;
            debug!(commit = %tip, "snapshot committed");
        }

        link_data_dir(&self.paths.data_dir, &checkout)?;
        Ok(tip)
    }

    fn roll_back(&self, name: &str, progress: &Progress) {
        let checkout = self.paths.experiment_dir(name);
        if progress.checkout_created {
            if let Err(err) = self.git.worktree_remove_force(&checkout) {
                warn!(err = %format!("{err:#}"), "failed to remove partial checkout");
            }
            if let Err(err) = self.git.worktree_prune() {
                warn!(err = %format!("{err:#}"), "failed to prune checkouts");
            }
        }
        if progress.branch_created
            && matches!(self.git.branch_exists(name), Ok(true))
            && let Err(err) = self.git.delete_branch(name)
        {
            warn!(err = %format!("{err:#}"), "failed to delete partial branch");
        }
    }
}

/// Symlink the shared data directory into a checkout as `data`.
fn link_data_dir(data_dir: &Path, checkout: &Path) -> Result<()> {
    fs::create_dir_all(data_dir).with_context(|| format!("create {}", data_dir.display()))?;
    let target = fs::canonicalize(data_dir)
        .with_context(|| format!("resolve {}", data_dir.display()))?;
    let link = checkout.join("data");
    symlink_dir(&target, &link)
        .with_context(|| format!("link {} -> {}", link.display(), target.display()))
}

#[cfg(unix)]
pub(crate) fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
pub(crate) fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn clean_tree_roots_experiment_at_head() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        let head = git.head().expect("head");

        let snap = repo.snapshot("clean", BaseRef::Head).expect("snapshot");

        assert_eq!(snap.commit, head.commit);
        assert!(!snap.created_commit);
        assert!(snap.checkout.join("main.py").exists());
        assert!(
            fs::symlink_metadata(snap.checkout.join("data"))
                .expect("data link")
                .file_type()
                .is_symlink()
        );
    }

    #[test]
    fn source_edit_creates_commit_on_branch_only() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        let head = git.head().expect("head");
        fs::write(repo.root().join("main.py"), "print('v2')\n").expect("edit");

        let snap = repo.snapshot("edited", BaseRef::Head).expect("snapshot");

        assert!(snap.created_commit);
        assert_ne!(snap.commit, head.commit);
        assert_eq!(git.head().expect("head"), head);
        assert_eq!(git.branch_tip("edited").expect("tip"), Some(snap.commit.clone()));
        assert_eq!(
            fs::read_to_string(snap.checkout.join("main.py")).expect("read"),
            "print('v2')\n"
        );
        // The caller keeps the edit and nothing is staged.
        assert_eq!(
            fs::read_to_string(repo.root().join("main.py")).expect("read"),
            "print('v2')\n"
        );
        let staged = repo.git_stdout(&["diff", "--cached", "--name-only"]);
        assert!(staged.is_empty(), "caller index changed: {staged}");
    }

    #[test]
    fn untracked_extension_edits_do_not_snapshot() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        let head = git.head().expect("head");
        fs::write(repo.root().join("notes.md"), "scratch\n").expect("edit");

        let snap = repo.snapshot("docs", BaseRef::Head).expect("snapshot");

        assert_eq!(snap.commit, head.commit);
        assert!(!snap.checkout.join("notes.md").exists());
    }

    #[test]
    fn existing_branch_name_is_a_conflict() {
        let repo = TestRepo::new().expect("repo");
        repo.git_stdout(&["branch", "taken"]);

        let err = repo.snapshot("taken", BaseRef::Head).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EmError>(),
            Some(EmError::BranchConflict(name)) if name == "taken"
        ));
    }

    #[test]
    fn reused_branch_with_different_source_is_rejected() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        repo.git_stdout(&["branch", "old"]);
        let commit = git.branch_tip("old").expect("tip").expect("exists");
        fs::write(repo.root().join("main.py"), "print('changed')\n").expect("edit");

        let err = repo
            .snapshot("old", BaseRef::ExistingBranch { commit })
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<EmError>(),
            Some(EmError::DirtySourceConflict(_))
        ));
        assert!(!repo.paths().experiment_dir("old").exists());
    }

    #[test]
    fn checked_out_branch_cannot_be_reused() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        let current = git
            .head()
            .expect("head")
            .symbolic
            .expect("on a branch")
            .trim_start_matches("refs/heads/")
            .to_string();
        let commit = git.branch_tip(&current).expect("tip").expect("exists");

        let err = repo
            .snapshot(&current, BaseRef::ExistingBranch { commit })
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EmError>(),
            Some(EmError::CheckedOutConflict(_))
        ));
    }
}
