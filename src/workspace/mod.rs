//! Git workspace manager: integration branch, per-issue worktrees, and
//! level merges.
//!
//! Each issue executes in a fully isolated worktree on its own branch, cut
//! from the integration branch's current tip. The main checkout stays on
//! the integration branch for the whole run; merges land there. The
//! repository handle is reopened per operation so no `git2` object is held
//! across scheduler suspension points.

use crate::errors::WorkspaceError;
use crate::issue::Issue;
use git2::build::CheckoutBuilder;
use git2::{BranchType, Repository, RepositoryState, Signature, WorktreeAddOptions, WorktreePruneOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Result of `init_integration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationInit {
    pub integration_branch: String,
    pub original_branch: String,
    pub initial_commit: String,
}

/// A worktree created for one issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub issue_name: String,
    pub branch: String,
    pub path: PathBuf,
}

/// Outcome of one mechanical merge attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeAttempt {
    /// Branch tip already reachable from the integration branch.
    UpToDate,
    FastForward { sha: String },
    Merged { sha: String },
    /// Conflicting paths; the merge is left in progress for resolution.
    Conflicted { files: Vec<String> },
}

/// Per-branch status inside a level merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BranchMergeStatus {
    Merged,
    ConflictResolved { strategy: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchMerge {
    pub branch: String,
    pub issue_name: String,
    #[serde(flatten)]
    pub status: BranchMergeStatus,
    #[serde(default)]
    pub merged_sha: String,
}

/// Result of merging one level's completed branches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MergeResult {
    pub level: usize,
    pub branches: Vec<BranchMerge>,
    pub needs_integration_tests: bool,
    #[serde(default)]
    pub summary: String,
}

impl MergeResult {
    pub fn merged_count(&self) -> usize {
        self.branches
            .iter()
            .filter(|b| !matches!(b.status, BranchMergeStatus::Failed { .. }))
            .count()
    }

    pub fn failed_branches(&self) -> Vec<&str> {
        self.branches
            .iter()
            .filter(|b| matches!(b.status, BranchMergeStatus::Failed { .. }))
            .map(|b| b.branch.as_str())
            .collect()
    }

    pub fn had_conflicts(&self) -> bool {
        self.branches
            .iter()
            .any(|b| matches!(b.status, BranchMergeStatus::ConflictResolved { .. }))
    }
}

/// Post-merge integration test report from the tester agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IntegrationTestReport {
    pub passed: bool,
    #[serde(default)]
    pub tests_run: u32,
    #[serde(default)]
    pub tests_failed: u32,
    #[serde(default)]
    pub summary: String,
}

/// Manages branches, worktrees, and merges for one repository.
pub struct GitWorkspace {
    repo_path: PathBuf,
    worktrees_dir: PathBuf,
}

impl GitWorkspace {
    /// Open the workspace, validating that `repo_path` is a git repository.
    pub fn open(repo_path: &Path) -> Result<Self, WorkspaceError> {
        Repository::open(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            worktrees_dir: repo_path.join(".worktrees"),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn worktrees_dir(&self) -> &Path {
        &self.worktrees_dir
    }

    fn repo(&self) -> Result<Repository, WorkspaceError> {
        Ok(Repository::open(&self.repo_path)?)
    }

    /// Create the integration branch from the current HEAD and check it out.
    ///
    /// Callers treat failure as non-fatal: the run continues without
    /// branch-per-issue semantics.
    pub fn init_integration(&self, goal_slug: &str) -> Result<IntegrationInit, WorkspaceError> {
        let repo = self.repo()?;
        let head = repo.head().map_err(|_| WorkspaceError::UnbornRepository {
            path: self.repo_path.clone(),
        })?;
        let original_branch = head.shorthand().unwrap_or("HEAD").to_string();
        let initial_commit = head
            .peel_to_commit()
            .map_err(|_| WorkspaceError::UnbornRepository {
                path: self.repo_path.clone(),
            })?;

        let integration_branch = format!("integration/{goal_slug}");
        repo.branch(&integration_branch, &initial_commit, true)?;
        repo.set_head(&format!("refs/heads/{integration_branch}"))?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        repo.checkout_head(Some(&mut checkout))?;

        debug!(branch = %integration_branch, sha = %initial_commit.id(), "integration branch ready");
        Ok(IntegrationInit {
            integration_branch,
            original_branch,
            initial_commit: initial_commit.id().to_string(),
        })
    }

    /// Create a detached worktree for an issue on branch
    /// `issue/{seq:02}-{slug}`, starting at the integration tip.
    ///
    /// A stale worktree or branch left by a previous run is pruned and
    /// recreated so resume never inherits a half-built checkout.
    pub fn make_worktree(
        &self,
        issue: &Issue,
        integration_branch: &str,
    ) -> Result<WorktreeInfo, WorkspaceError> {
        let repo = self.repo()?;
        let branch_name = issue.issue_branch();
        let worktree_name = format!("{:02}-{}", issue.sequence_number, issue.slug());
        let worktree_path = self.worktrees_dir.join(&worktree_name);

        self.prune_worktree(&repo, &worktree_name, &worktree_path);

        let tip = repo
            .find_branch(integration_branch, BranchType::Local)
            .map_err(|_| WorkspaceError::MissingBranch {
                branch: integration_branch.to_string(),
            })?
            .get()
            .peel_to_commit()?;

        let branch = repo.branch(&branch_name, &tip, true)?;
        std::fs::create_dir_all(&self.worktrees_dir).map_err(|e| {
            WorkspaceError::WorktreePath {
                path: self.worktrees_dir.clone(),
                source: e,
            }
        })?;

        let reference = branch.into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        repo.worktree(&worktree_name, &worktree_path, Some(&opts))?;

        debug!(issue = %issue.name, branch = %branch_name, path = %worktree_path.display(), "worktree created");
        Ok(WorktreeInfo {
            issue_name: issue.name.clone(),
            branch: branch_name,
            path: worktree_path,
        })
    }

    fn prune_worktree(&self, repo: &Repository, name: &str, path: &Path) {
        if let Ok(worktree) = repo.find_worktree(name) {
            let mut opts = WorktreePruneOptions::new();
            opts.valid(true).locked(true).working_tree(true);
            if let Err(e) = worktree.prune(Some(&mut opts)) {
                warn!(worktree = name, error = %e, "failed to prune stale worktree");
            }
        }
        if path.exists()
            && let Err(e) = std::fs::remove_dir_all(path)
        {
            warn!(path = %path.display(), error = %e, "failed to remove stale worktree dir");
        }
    }

    /// Attempt a mechanical merge of `branch` into the integration branch.
    ///
    /// On conflicts the merge is left in progress (index holds the
    /// conflicting entries) so a merger agent can resolve it in place;
    /// callers must then either commit or `abort_merge`.
    pub fn merge_branch(
        &self,
        branch_name: &str,
        integration_branch: &str,
    ) -> Result<MergeAttempt, WorkspaceError> {
        let repo = self.repo()?;
        let branch = repo
            .find_branch(branch_name, BranchType::Local)
            .map_err(|_| WorkspaceError::MissingBranch {
                branch: branch_name.to_string(),
            })?;
        let their_commit = branch.get().peel_to_commit()?;
        let annotated = repo.find_annotated_commit(their_commit.id())?;
        let (analysis, _) = repo.merge_analysis(&[&annotated])?;

        if analysis.is_up_to_date() {
            return Ok(MergeAttempt::UpToDate);
        }

        if analysis.is_fast_forward() {
            let refname = format!("refs/heads/{integration_branch}");
            let mut reference = repo.find_reference(&refname)?;
            reference.set_target(their_commit.id(), "fast-forward issue branch")?;
            repo.set_head(&refname)?;
            let mut checkout = CheckoutBuilder::new();
            checkout.force();
            repo.checkout_head(Some(&mut checkout))?;
            return Ok(MergeAttempt::FastForward {
                sha: their_commit.id().to_string(),
            });
        }

        repo.merge(&[&annotated], None, None)?;
        let mut index = repo.index()?;
        if index.has_conflicts() {
            let mut files = Vec::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
                if let Some(entry) = entry
                    && let Ok(path) = String::from_utf8(entry.path)
                {
                    files.push(path);
                }
            }
            files.sort();
            files.dedup();
            return Ok(MergeAttempt::Conflicted { files });
        }

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let head_commit = repo.head()?.peel_to_commit()?;
        let sig = Signature::now("foreman", "foreman@localhost")?;
        let message = format!("Merge branch '{branch_name}' into {integration_branch}");
        let sha = repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            &message,
            &tree,
            &[&head_commit, &their_commit],
        )?;
        repo.cleanup_state()?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        repo.checkout_head(Some(&mut checkout))?;

        Ok(MergeAttempt::Merged {
            sha: sha.to_string(),
        })
    }

    /// Whether an in-progress merge (or any other operation) is pending.
    pub fn merge_in_progress(&self) -> bool {
        self.repo()
            .map(|r| r.state() != RepositoryState::Clean)
            .unwrap_or(false)
    }

    /// Abandon an in-progress merge and restore the working tree.
    pub fn abort_merge(&self) -> Result<(), WorkspaceError> {
        let repo = self.repo()?;
        repo.cleanup_state()?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        repo.checkout_head(Some(&mut checkout))?;
        Ok(())
    }

    /// Current integration HEAD SHA.
    pub fn head_sha(&self) -> Result<String, WorkspaceError> {
        let repo = self.repo()?;
        Ok(repo.head()?.peel_to_commit()?.id().to_string())
    }

    /// Remove issue worktrees; optionally delete their branches.
    ///
    /// Best-effort per issue: one failure does not stop the sweep. Returns
    /// the worktree names actually removed.
    pub fn cleanup_worktrees(
        &self,
        issues: &[Issue],
        retain_branches: bool,
    ) -> Result<Vec<String>, WorkspaceError> {
        let repo = self.repo()?;
        let mut cleaned = Vec::new();

        for issue in issues {
            let worktree_name = format!("{:02}-{}", issue.sequence_number, issue.slug());
            let worktree_path = self.worktrees_dir.join(&worktree_name);
            self.prune_worktree(&repo, &worktree_name, &worktree_path);
            if !worktree_path.exists() {
                cleaned.push(worktree_name);
            }

            if !retain_branches
                && let Ok(mut branch) = repo.find_branch(&issue.issue_branch(), BranchType::Local)
                && let Err(e) = branch.delete()
            {
                warn!(branch = %issue.issue_branch(), error = %e, "failed to delete issue branch");
            }
        }

        // Drop the container dir once the last worktree is gone.
        if self.worktrees_dir.exists()
            && std::fs::read_dir(&self.worktrees_dir)
                .map(|mut d| d.next().is_none())
                .unwrap_or(false)
        {
            let _ = std::fs::remove_dir(&self.worktrees_dir);
        }

        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn init_repo(dir: &Path) {
        let repo = Repository::init(dir).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
    }

    fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) {
        let repo = Repository::open(dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("test", "test@test.com").unwrap();
        if let Ok(head) = repo.head() {
            let parent = head.peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
                .unwrap();
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[])
                .unwrap();
        }
    }

    fn issue_with_seq(name: &str, seq: u32) -> Issue {
        let mut issue = Issue::new(name, name);
        issue.sequence_number = seq;
        issue
    }

    fn setup() -> (GitWorkspace, tempfile::TempDir, IntegrationInit) {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        commit_file(dir.path(), "README.md", "hello\n", "init");
        let workspace = GitWorkspace::open(dir.path()).unwrap();
        let init = workspace.init_integration("test-goal").unwrap();
        (workspace, dir, init)
    }

    #[test]
    fn open_rejects_non_repository() {
        let dir = tempdir().unwrap();
        assert!(GitWorkspace::open(dir.path()).is_err());
    }

    #[test]
    fn init_integration_records_original_branch_and_sha() {
        let (workspace, _dir, init) = setup();
        assert_eq!(init.integration_branch, "integration/test-goal");
        assert!(!init.initial_commit.is_empty());
        assert_eq!(init.initial_commit.len(), 40);
        assert_eq!(workspace.head_sha().unwrap(), init.initial_commit);
    }

    #[test]
    fn init_integration_fails_on_unborn_repo() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let workspace = GitWorkspace::open(dir.path()).unwrap();
        assert!(matches!(
            workspace.init_integration("goal"),
            Err(WorkspaceError::UnbornRepository { .. })
        ));
    }

    #[test]
    fn make_worktree_creates_isolated_checkout() {
        let (workspace, _dir, init) = setup();
        let issue = issue_with_seq("codec", 1);
        let info = workspace
            .make_worktree(&issue, &init.integration_branch)
            .unwrap();

        assert_eq!(info.branch, "issue/01-codec");
        assert!(info.path.join("README.md").exists());

        // A second issue gets a disjoint path.
        let other = issue_with_seq("parser", 2);
        let other_info = workspace
            .make_worktree(&other, &init.integration_branch)
            .unwrap();
        assert_ne!(info.path, other_info.path);
    }

    #[test]
    fn make_worktree_recreates_after_stale_leftover() {
        let (workspace, _dir, init) = setup();
        let issue = issue_with_seq("codec", 1);
        let first = workspace
            .make_worktree(&issue, &init.integration_branch)
            .unwrap();
        fs::write(first.path.join("scratch.txt"), "stale").unwrap();

        let second = workspace
            .make_worktree(&issue, &init.integration_branch)
            .unwrap();
        assert_eq!(first.path, second.path);
        assert!(!second.path.join("scratch.txt").exists());
    }

    #[test]
    fn merge_branch_fast_forwards_new_work() {
        let (workspace, _dir, init) = setup();
        let issue = issue_with_seq("feature", 1);
        let info = workspace
            .make_worktree(&issue, &init.integration_branch)
            .unwrap();
        commit_file(&info.path, "feature.rs", "fn feature() {}\n", "add feature");

        let attempt = workspace
            .merge_branch(&info.branch, &init.integration_branch)
            .unwrap();
        assert!(matches!(attempt, MergeAttempt::FastForward { .. }));
        assert!(workspace.repo_path().join("feature.rs").exists());
    }

    #[test]
    fn merge_branch_reports_up_to_date_for_untouched_branch() {
        let (workspace, _dir, init) = setup();
        let issue = issue_with_seq("noop", 1);
        let info = workspace
            .make_worktree(&issue, &init.integration_branch)
            .unwrap();

        let attempt = workspace
            .merge_branch(&info.branch, &init.integration_branch)
            .unwrap();
        assert_eq!(attempt, MergeAttempt::UpToDate);
    }

    #[test]
    fn merge_branch_creates_merge_commit_for_divergent_work() {
        let (workspace, _dir, init) = setup();
        let first = issue_with_seq("one", 1);
        let second = issue_with_seq("two", 2);
        let first_info = workspace
            .make_worktree(&first, &init.integration_branch)
            .unwrap();
        let second_info = workspace
            .make_worktree(&second, &init.integration_branch)
            .unwrap();

        commit_file(&first_info.path, "one.rs", "pub fn one() {}\n", "one");
        commit_file(&second_info.path, "two.rs", "pub fn two() {}\n", "two");

        let a = workspace
            .merge_branch(&first_info.branch, &init.integration_branch)
            .unwrap();
        assert!(matches!(a, MergeAttempt::FastForward { .. }));

        // Integration has advanced, so the second branch needs a true merge.
        let b = workspace
            .merge_branch(&second_info.branch, &init.integration_branch)
            .unwrap();
        assert!(matches!(b, MergeAttempt::Merged { .. }));
        assert!(workspace.repo_path().join("one.rs").exists());
        assert!(workspace.repo_path().join("two.rs").exists());
        assert!(!workspace.merge_in_progress());
    }

    #[test]
    fn merge_branch_detects_conflicts_and_abort_restores() {
        let (workspace, _dir, init) = setup();
        let first = issue_with_seq("one", 1);
        let second = issue_with_seq("two", 2);
        let first_info = workspace
            .make_worktree(&first, &init.integration_branch)
            .unwrap();
        let second_info = workspace
            .make_worktree(&second, &init.integration_branch)
            .unwrap();

        commit_file(&first_info.path, "shared.rs", "version one\n", "one");
        commit_file(&second_info.path, "shared.rs", "version two\n", "two");

        workspace
            .merge_branch(&first_info.branch, &init.integration_branch)
            .unwrap();
        let conflicted = workspace
            .merge_branch(&second_info.branch, &init.integration_branch)
            .unwrap();

        match conflicted {
            MergeAttempt::Conflicted { files } => {
                assert_eq!(files, vec!["shared.rs"]);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert!(workspace.merge_in_progress());

        workspace.abort_merge().unwrap();
        assert!(!workspace.merge_in_progress());
        let content = fs::read_to_string(workspace.repo_path().join("shared.rs")).unwrap();
        assert_eq!(content, "version one\n");
    }

    #[test]
    fn cleanup_removes_worktrees_and_optionally_branches() {
        let (workspace, dir, init) = setup();
        let issue = issue_with_seq("cleanup-me", 1);
        let info = workspace
            .make_worktree(&issue, &init.integration_branch)
            .unwrap();
        assert!(info.path.exists());

        let cleaned = workspace
            .cleanup_worktrees(std::slice::from_ref(&issue), false)
            .unwrap();
        assert_eq!(cleaned.len(), 1);
        assert!(!info.path.exists());

        let repo = Repository::open(dir.path()).unwrap();
        assert!(
            repo.find_branch(&issue.issue_branch(), BranchType::Local)
                .is_err()
        );
    }

    #[test]
    fn cleanup_retains_branches_when_asked() {
        let (workspace, dir, init) = setup();
        let issue = issue_with_seq("keep-branch", 1);
        workspace
            .make_worktree(&issue, &init.integration_branch)
            .unwrap();

        workspace
            .cleanup_worktrees(std::slice::from_ref(&issue), true)
            .unwrap();

        let repo = Repository::open(dir.path()).unwrap();
        assert!(
            repo.find_branch(&issue.issue_branch(), BranchType::Local)
                .is_ok()
        );
    }

    #[test]
    fn merge_result_bookkeeping() {
        let result = MergeResult {
            level: 0,
            branches: vec![
                BranchMerge {
                    branch: "issue/01-a".into(),
                    issue_name: "a".into(),
                    status: BranchMergeStatus::Merged,
                    merged_sha: "abc".into(),
                },
                BranchMerge {
                    branch: "issue/02-b".into(),
                    issue_name: "b".into(),
                    status: BranchMergeStatus::Failed {
                        reason: "conflict unresolvable".into(),
                    },
                    merged_sha: String::new(),
                },
            ],
            needs_integration_tests: true,
            summary: String::new(),
        };
        assert_eq!(result.merged_count(), 1);
        assert_eq!(result.failed_branches(), vec!["issue/02-b"]);
        assert!(!result.had_conflicts());
    }
}
