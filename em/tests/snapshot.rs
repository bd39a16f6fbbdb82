//! Snapshot-and-branch behaviour against real repositories.
//!
//! These cover deduplication across experiments and the guarantee that the
//! caller's HEAD, index and working tree survive every snapshot, including
//! one whose checkout step fails halfway.

use std::fs;

use em::core::error::EmError;
use em::core::types::ExperimentRecord;
use em::io::git::Git;
use em::io::snapshot::BaseRef;
use em::test_support::TestRepo;

/// Everything a caller could observe about their repository.
fn observe(repo: &TestRepo) -> (String, String, String, String) {
    (
        repo.git_stdout(&["rev-parse", "HEAD"]),
        repo.git_stdout(&["symbolic-ref", "HEAD"]),
        repo.git_stdout(&["status", "--porcelain=v1", "-uall"]),
        repo.git_stdout(&["stash", "list"]),
    )
}

#[test]
fn identical_sources_share_one_commit() {
    let repo = TestRepo::new().expect("repo");
    let store = repo.store().expect("store");
    let head = repo.git_stdout(&["rev-parse", "HEAD"]);
    repo.write_file("main.py", "print('tuned')\n").expect("edit");

    store.put("a", &ExperimentRecord::starting()).expect("put a");
    let first = repo.snapshot("a", BaseRef::Head).expect("snapshot a");
    store.put("b", &ExperimentRecord::starting()).expect("put b");
    let second = repo.snapshot("b", BaseRef::Head).expect("snapshot b");

    assert!(first.created_commit);
    assert!(!second.created_commit);
    assert_eq!(second.reused_from.as_deref(), Some("a"));
    assert_eq!(first.commit, second.commit);
    assert_eq!(first.tree, second.tree);
    let parent = repo.git_stdout(&["rev-parse", &format!("{}^", first.commit)]);
    assert_eq!(parent, head);
    assert_eq!(
        fs::read_to_string(second.checkout.join("main.py")).expect("read"),
        "print('tuned')\n"
    );
}

#[test]
fn dedup_picks_first_match_by_name() {
    let repo = TestRepo::new().expect("repo");
    let store = repo.store().expect("store");
    let git = Git::new(repo.root());
    repo.write_file("main.py", "print('same')\n").expect("edit");

    // Two branches storing the same tree under different commits.
    store.put("zeta", &ExperimentRecord::starting()).expect("put");
    let zeta = repo.snapshot("zeta", BaseRef::Head).expect("zeta");
    let tree = git.tree_of(&zeta.commit).expect("tree");
    let alpha_commit = git
        .commit_tree(&tree, &zeta.commit, "same tree, other commit")
        .expect("commit-tree");
    repo.git_stdout(&["branch", "alpha", &alpha_commit]);
    store.put("alpha", &ExperimentRecord::starting()).expect("put");

    store.put("mid", &ExperimentRecord::starting()).expect("put");
    let mid = repo.snapshot("mid", BaseRef::Head).expect("mid");

    assert_eq!(mid.reused_from.as_deref(), Some("alpha"));
    assert_eq!(mid.commit, alpha_commit);
}

#[test]
fn caller_state_survives_snapshot_with_mixed_edits() {
    let repo = TestRepo::new().expect("repo");
    repo.commit_file("util.py", "X = 1\n", "add util").expect("commit");
    repo.write_file("util.py", "X = 2\n").expect("edit");
    repo.git_stdout(&["add", "util.py"]);
    repo.write_file("main.py", "print('unstaged')\n").expect("edit");
    repo.write_file("scratch.py", "draft\n").expect("untracked");
    repo.write_file("notes.md", "not tracked by extension\n").expect("untracked");
    let before = observe(&repo);

    let snap = repo.snapshot("mixed", BaseRef::Head).expect("snapshot");

    assert_eq!(observe(&repo), before);
    assert_eq!(
        fs::read_to_string(snap.checkout.join("util.py")).expect("read"),
        "X = 2\n"
    );
    assert!(snap.checkout.join("scratch.py").exists());
    assert!(!snap.checkout.join("notes.md").exists());
}

#[test]
fn fork_with_edits_restores_them_and_empties_stash() {
    let repo = TestRepo::new().expect("repo");
    let store = repo.store().expect("store");
    repo.write_file("main.py", "print('v2')\n").expect("edit");
    store.put("e", &ExperimentRecord::starting()).expect("put");
    let source = repo.snapshot("e", BaseRef::Head).expect("source");

    repo.write_file("main.py", "print('v3')\n").expect("edit again");
    let before = observe(&repo);
    let fork = repo
        .snapshot(
            "f",
            BaseRef::Fork {
                commit: source.commit.clone(),
            },
        )
        .expect("fork");

    assert_eq!(fork.commit, source.commit);
    assert_eq!(observe(&repo), before);
    assert_eq!(
        fs::read_to_string(repo.root().join("main.py")).expect("read"),
        "print('v3')\n"
    );
    assert_eq!(
        fs::read_to_string(fork.checkout.join("main.py")).expect("read"),
        "print('v2')\n"
    );
}

#[test]
fn failed_checkout_restores_caller_and_leaves_no_branch() {
    let repo = TestRepo::new().expect("repo");
    let store = repo.store().expect("store");
    repo.write_file("main.py", "print('v2')\n").expect("edit");
    store.put("e", &ExperimentRecord::starting()).expect("put");
    let source = repo.snapshot("e", BaseRef::Head).expect("source");

    // Edits that force a stash plus a hard reset onto the fork base.
    repo.write_file("main.py", "print('v3')\n").expect("edit again");
    repo.write_file("extra.py", "pending\n").expect("untracked");
    // A non-empty directory where the checkout should go makes `worktree add` fail.
    let blocker = repo.paths().experiment_dir("f");
    fs::create_dir_all(&blocker).expect("blocker dir");
    fs::write(blocker.join("occupied"), "x").expect("blocker file");
    let before = observe(&repo);

    let err = repo
        .snapshot(
            "f",
            BaseRef::Fork {
                commit: source.commit,
            },
        )
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<EmError>(),
        Some(EmError::VcsOperationFailure { .. })
    ));
    assert_eq!(observe(&repo), before);
    assert_eq!(
        fs::read_to_string(repo.root().join("extra.py")).expect("read"),
        "pending\n"
    );
    assert!(!Git::new(repo.root()).branch_exists("f").expect("branch check"));
    assert!(blocker.join("occupied").exists());
}

#[test]
fn existing_branch_with_matching_source_is_reused() {
    let repo = TestRepo::new().expect("repo");
    let git = Git::new(repo.root());
    repo.git_stdout(&["branch", "kept"]);
    let commit = git.branch_tip("kept").expect("tip").expect("exists");

    let snap = repo
        .snapshot(
            "kept",
            BaseRef::ExistingBranch {
                commit: commit.clone(),
            },
        )
        .expect("snapshot");

    assert_eq!(snap.commit, commit);
    assert!(!snap.created_commit);
    assert!(git.is_checked_out("kept").expect("checked out"));
}

#[test]
fn invalid_names_are_rejected_before_touching_git() {
    let repo = TestRepo::new().expect("repo");
    let before = repo.git_stdout(&["branch", "--list"]);

    let err = repo.snapshot("../escape", BaseRef::Head).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<EmError>(),
        Some(EmError::InvalidName { .. })
    ));
    assert_eq!(repo.git_stdout(&["branch", "--list"]), before);
}
