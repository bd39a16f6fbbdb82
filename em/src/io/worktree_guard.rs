//! Scoped protection of the caller's HEAD and working tree.
//!
//! [`WorkingTreeGuard`] captures HEAD on acquisition. While it is held the
//! snapshot code may stash edits and move HEAD to another commit; on release
//! (explicit, or on drop along an error/panic path) HEAD is reset back to the
//! captured commit and the stash is popped, each exactly once. Nothing else in
//! the crate moves the caller's HEAD or pops stashes.

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::io::git::{Git, HeadTarget, ResetMode};

const STASH_MESSAGE: &str = "em: preserve working tree during snapshot";

pub struct WorkingTreeGuard<'a> {
    git: &'a Git,
    original: HeadTarget,
    stashed: bool,
    moved: bool,
    released: bool,
}

impl<'a> WorkingTreeGuard<'a> {
    pub fn acquire(git: &'a Git) -> Result<Self> {
        let original = git.head().context("capture HEAD")?;
        Ok(Self {
            git,
            original,
            stashed: false,
            moved: false,
            released: false,
        })
    }

    pub fn original(&self) -> &HeadTarget {
        &self.original
    }

    #[cfg(test)]
    fn has_stash(&self) -> bool {
        self.stashed
    }

    /// Stash every edit (untracked files included) so a hard reset cannot lose it.
    pub fn stash(&mut self) -> Result<()> {
        if self.stashed {
            return Ok(());
        }
        self.stashed = self.git.stash_push(STASH_MESSAGE)?;
        Ok(())
    }

    /// Temporarily point HEAD at `commit`.
    ///
    /// The reset is hard only when edits were stashed; otherwise the index and
    /// working tree are left alone.
    pub fn move_head(&mut self, commit: &str) -> Result<()> {
        if commit == self.original.commit {
            return Ok(());
        }
        // Mark first so a half-applied reset is still undone.
        self.moved = true;
        self.git.reset(commit, self.reset_mode())?;
        debug!(commit, "HEAD moved for snapshot");
        Ok(())
    }

    /// Restore HEAD and pop the stash, consuming the guard.
    pub fn release(mut self) -> Result<()> {
        self.restore()
    }

    fn reset_mode(&self) -> ResetMode {
        if self.stashed {
            ResetMode::Hard
        } else {
            ResetMode::Soft
        }
    }

    fn restore(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut first_err = None;
        if (self.moved || self.stashed)
            && let Err(err) = self.git.reset(&self.original.commit, self.reset_mode())
        {
            first_err = Some(err.context("restore HEAD"));
        }
        // Popping onto a tree that was not restored would scatter the edits.
        if self.stashed
            && first_err.is_none()
            && let Err(err) = self.git.stash_pop()
        {
            first_err = Some(err.context("restore stashed edits"));
        }
        match first_err {
            Some(err) => Err(err),
            None => {
                debug!(commit = %self.original.commit, "working tree restored");
                Ok(())
            }
        }
    }
}

impl Drop for WorkingTreeGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.restore() {
            warn!(err = %format!("{err:#}"), "failed to restore working tree");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;
    use std::fs;

    #[test]
    fn release_without_changes_is_a_no_op() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        let before = git.head().expect("head");

        let guard = WorkingTreeGuard::acquire(&git).expect("guard");
        guard.release().expect("release");

        assert_eq!(git.head().expect("head"), before);
    }

    #[test]
    fn drop_restores_soft_moved_head() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        let first = git.head().expect("head");
        repo.commit_file("second.py", "print(2)\n", "second").expect("commit");
        let before = git.head().expect("head");
        fs::write(repo.root().join("main.py"), "print('edited')\n").expect("edit");

        {
            let mut guard = WorkingTreeGuard::acquire(&git).expect("guard");
            guard.move_head(&first.commit).expect("move");
            assert_eq!(git.head().expect("head").commit, first.commit);
        }

        assert_eq!(git.head().expect("head"), before);
        let main = fs::read_to_string(repo.root().join("main.py")).expect("read");
        assert_eq!(main, "print('edited')\n");
    }

    #[test]
    fn stash_and_hard_move_restore_edits() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        let first = git.head().expect("head");
        repo.commit_file("second.py", "print(2)\n", "second").expect("commit");
        let before = git.head().expect("head");
        fs::write(repo.root().join("main.py"), "print('edited')\n").expect("edit");
        fs::write(repo.root().join("new.py"), "print('new')\n").expect("untracked");

        let mut guard = WorkingTreeGuard::acquire(&git).expect("guard");
        guard.stash().expect("stash");
        assert!(guard.has_stash());
        guard.move_head(&first.commit).expect("move");
        assert!(!repo.root().join("second.py").exists());
        assert!(!repo.root().join("new.py").exists());
        guard.release().expect("release");

        assert_eq!(git.head().expect("head"), before);
        assert_eq!(
            fs::read_to_string(repo.root().join("main.py")).expect("read"),
            "print('edited')\n"
        );
        assert!(repo.root().join("new.py").exists());
        assert!(repo.root().join("second.py").exists());
    }
}
