//! Execution state for a run: the single source of truth.
//!
//! `DagState` owns the issue map; every other record refers to issues by
//! stable name. It is mutated only at gate points by the scheduler, never
//! from inside a per-issue task, and it is the exact payload of the
//! checkpoint file. No wall-clock timestamps live here, so checkpoint
//! round-trips compare equal.

use crate::dag::graph;
use crate::dag::mutation::ReplanRecord;
use crate::errors::PlanningError;
use crate::issue::{DebtItem, Issue, IssueOutcome, IssueResult};
use crate::plan::PlanResult;
use crate::workspace::{IntegrationTestReport, MergeResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Where an issue currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueStatus {
    /// Not yet executed (appears in a level at or after the current one).
    Pending,
    InFlight,
    Completed,
    FailedRecoverable,
    FailedUnrecoverable,
    Skipped,
}

impl IssueStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::InFlight)
    }
}

/// Git bookkeeping for the run. Empty fields mean the run proceeds without
/// branch-per-issue semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GitTracking {
    #[serde(default)]
    pub integration_branch: String,
    #[serde(default)]
    pub original_branch: String,
    #[serde(default)]
    pub initial_commit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktrees_dir: Option<PathBuf>,
}

impl GitTracking {
    pub fn is_active(&self) -> bool {
        !self.integration_branch.is_empty()
    }
}

/// Plan context carried into execution so every later agent can see the
/// big picture without re-reading the plan artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PlanSummary {
    #[serde(default)]
    pub prd_summary: String,
    #[serde(default)]
    pub architecture_summary: String,
    #[serde(default)]
    pub rationale: String,
    /// PRD acceptance criteria, verified at the end of the run.
    #[serde(default)]
    pub prd_criteria: Vec<String>,
}

/// Context handed to per-issue agents.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    pub repo_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub prd_summary: String,
    pub architecture_summary: String,
}

/// Full execution state of the DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagState {
    pub run_id: String,
    pub repo_path: PathBuf,
    pub artifacts_dir: PathBuf,
    #[serde(default)]
    pub plan: PlanSummary,

    /// Authoritative issue map.
    pub issues: BTreeMap<String, Issue>,
    /// Parallel execution levels; recomputed on every graph mutation.
    pub levels: Vec<Vec<String>>,
    pub current_level: usize,

    // Disjoint status lists. An issue name appears in at most one; absent
    // everywhere means pending.
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default)]
    pub failed_recoverable: Vec<String>,
    #[serde(default)]
    pub failed_unrecoverable: Vec<String>,
    #[serde(default)]
    pub skipped: Vec<String>,
    #[serde(default)]
    pub in_flight: Vec<String>,

    #[serde(default)]
    pub issue_results: BTreeMap<String, IssueResult>,

    #[serde(default)]
    pub replan_count: u32,
    #[serde(default)]
    pub replan_history: Vec<ReplanRecord>,

    #[serde(default)]
    pub git: GitTracking,
    #[serde(default)]
    pub merge_results: Vec<MergeResult>,
    #[serde(default)]
    pub integration_test_results: Vec<IntegrationTestReport>,

    #[serde(default)]
    pub accumulated_debt: Vec<DebtItem>,
    /// Human-readable trail of mid-run adaptations (advisor narrowing,
    /// replan fallbacks, verify-fix rounds).
    #[serde(default)]
    pub adaptation_history: Vec<String>,

    /// Monotone checkpoint counter.
    #[serde(default)]
    pub version: u64,
}

impl DagState {
    pub fn new(
        repo_path: &Path,
        artifacts_dir: &Path,
        issues: Vec<Issue>,
        levels: Vec<Vec<String>>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            repo_path: repo_path.to_path_buf(),
            artifacts_dir: artifacts_dir.to_path_buf(),
            plan: PlanSummary::default(),
            issues: issues.into_iter().map(|i| (i.name.clone(), i)).collect(),
            levels,
            current_level: 0,
            completed: Vec::new(),
            failed_recoverable: Vec::new(),
            failed_unrecoverable: Vec::new(),
            skipped: Vec::new(),
            in_flight: Vec::new(),
            issue_results: BTreeMap::new(),
            replan_count: 0,
            replan_history: Vec::new(),
            git: GitTracking::default(),
            merge_results: Vec::new(),
            integration_test_results: Vec::new(),
            accumulated_debt: Vec::new(),
            adaptation_history: Vec::new(),
            version: 0,
        }
    }

    pub fn from_plan(plan: &PlanResult, repo_path: &Path, artifacts_dir: &Path) -> Self {
        let mut state = Self::new(
            repo_path,
            artifacts_dir,
            plan.issues.clone(),
            plan.levels.clone(),
        );
        state.plan = PlanSummary {
            prd_summary: plan.prd.summary(),
            architecture_summary: plan.architecture.summary.clone(),
            rationale: plan.rationale.clone(),
            prd_criteria: plan.prd.acceptance_criteria.clone(),
        };
        state
    }

    pub fn project_context(&self) -> ProjectContext {
        ProjectContext {
            repo_path: self.repo_path.clone(),
            artifacts_dir: self.artifacts_dir.clone(),
            prd_summary: self.plan.prd_summary.clone(),
            architecture_summary: self.plan.architecture_summary.clone(),
        }
    }

    pub fn status_of(&self, name: &str) -> IssueStatus {
        if self.in_flight.iter().any(|n| n == name) {
            IssueStatus::InFlight
        } else if self.completed.iter().any(|n| n == name) {
            IssueStatus::Completed
        } else if self.failed_recoverable.iter().any(|n| n == name) {
            IssueStatus::FailedRecoverable
        } else if self.failed_unrecoverable.iter().any(|n| n == name) {
            IssueStatus::FailedUnrecoverable
        } else if self.skipped.iter().any(|n| n == name) {
            IssueStatus::Skipped
        } else {
            IssueStatus::Pending
        }
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.status_of(name) == IssueStatus::Pending
    }

    /// Issues not yet in any terminal bucket, in sequence order.
    pub fn pending_issues(&self) -> Vec<Issue> {
        let mut pending: Vec<Issue> = self
            .issues
            .values()
            .filter(|i| self.is_pending(&i.name))
            .cloned()
            .collect();
        pending.sort_by_key(|i| (i.sequence_number, i.name.clone()));
        pending
    }

    pub fn completed_set(&self) -> BTreeSet<String> {
        self.completed.iter().cloned().collect()
    }

    /// Record a terminal result for an issue, moving it out of the
    /// in-flight set and into exactly one status list.
    pub fn record_result(&mut self, result: IssueResult) {
        let name = result.issue_name.clone();
        self.in_flight.retain(|n| n != &name);
        self.remove_from_status_lists(&name);

        match result.outcome {
            IssueOutcome::Completed | IssueOutcome::CompletedWithDebt => {
                self.completed.push(name.clone());
            }
            IssueOutcome::FailedNeedsSplit | IssueOutcome::FailedEscalated => {
                self.failed_recoverable.push(name.clone());
            }
            IssueOutcome::FailedUnrecoverable => {
                self.failed_unrecoverable.push(name.clone());
            }
            IssueOutcome::Skipped => {
                self.skipped.push(name.clone());
            }
        }
        self.issue_results.insert(name, result);
    }

    /// Mark a pending issue skipped (scope reduction, downstream of a
    /// failure, or removal by the replanner).
    pub fn mark_skipped(&mut self, name: &str, reason: &str) {
        if self.status_of(name).is_terminal() {
            return;
        }
        self.in_flight.retain(|n| n != name);
        self.skipped.push(name.to_string());
        self.issue_results.insert(
            name.to_string(),
            IssueResult {
                issue_name: name.to_string(),
                outcome: IssueOutcome::Skipped,
                iterations_used: 0,
                advisor_invocations_used: 0,
                branch_name: None,
                debt: Vec::new(),
                sub_issues: Vec::new(),
                diagnostic: reason.to_string(),
            },
        );
    }

    /// Reclassify an escalated issue as unrecoverable (replanning disabled
    /// or exhausted).
    pub fn demote_to_unrecoverable(&mut self, name: &str) {
        if let Some(pos) = self.failed_recoverable.iter().position(|n| n == name) {
            self.failed_recoverable.remove(pos);
            self.failed_unrecoverable.push(name.to_string());
            if let Some(result) = self.issue_results.get_mut(name) {
                result.outcome = IssueOutcome::FailedUnrecoverable;
            }
        }
    }

    fn remove_from_status_lists(&mut self, name: &str) {
        self.completed.retain(|n| n != name);
        self.failed_recoverable.retain(|n| n != name);
        self.failed_unrecoverable.retain(|n| n != name);
        self.skipped.retain(|n| n != name);
    }

    /// Recompute levels over the pending issues, treating completed issues
    /// as already-satisfied dependencies, and reset to level zero.
    pub fn recompute_levels(&mut self) -> Result<(), PlanningError> {
        let pending = self.pending_issues();
        // Anything terminal satisfies a dependency edge for scheduling
        // purposes; failed dependencies are surfaced via failure notes, not
        // by wedging the graph.
        let satisfied: BTreeSet<String> = self
            .issues
            .keys()
            .filter(|n| !self.is_pending(n))
            .cloned()
            .collect();
        self.levels = graph::compute_levels(&pending, &satisfied)?;
        self.current_level = 0;
        Ok(())
    }

    /// Next sequence number for issues added mid-run.
    pub fn next_sequence_number(&self) -> u32 {
        self.issues
            .values()
            .map(|i| i.sequence_number)
            .max()
            .unwrap_or(0)
            + 1
    }

    pub fn bump_version(&mut self) {
        self.version += 1;
    }

    /// Whether every issue has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.current_level >= self.levels.len() && self.in_flight.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{}/{} completed, {} failed, {} skipped, {} replans, {} debt items",
            self.completed.len(),
            self.issues.len(),
            self.failed_recoverable.len() + self.failed_unrecoverable.len(),
            self.skipped.len(),
            self.replan_count,
            self.accumulated_debt.len(),
        )
    }

    /// Structural invariants. Checked after every gate sequence; a
    /// violation is an orchestrator bug, not an agent failure.
    pub fn check_invariants(&self) -> anyhow::Result<()> {
        // I1: status lists are disjoint and cover only known issues.
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for (list_name, list) in [
            ("completed", &self.completed),
            ("failed_recoverable", &self.failed_recoverable),
            ("failed_unrecoverable", &self.failed_unrecoverable),
            ("skipped", &self.skipped),
            ("in_flight", &self.in_flight),
        ] {
            for name in list {
                if !self.issues.contains_key(name) {
                    anyhow::bail!("status list '{list_name}' references unknown issue '{name}'");
                }
                if !seen.insert(name.as_str()) {
                    anyhow::bail!("issue '{name}' appears in more than one status list");
                }
            }
        }

        // I2: every pending issue appears in exactly one level.
        let mut level_members: BTreeSet<&str> = BTreeSet::new();
        let mut level_of: BTreeMap<&str, usize> = BTreeMap::new();
        for (idx, level) in self.levels.iter().enumerate() {
            for name in level {
                if !self.issues.contains_key(name) {
                    anyhow::bail!("level {idx} references unknown issue '{name}'");
                }
                if !level_members.insert(name.as_str()) {
                    anyhow::bail!("issue '{name}' appears in more than one level");
                }
                level_of.insert(name.as_str(), idx);
            }
        }
        for issue in self.issues.values() {
            if self.is_pending(&issue.name) && !level_members.contains(issue.name.as_str()) {
                anyhow::bail!("pending issue '{}' is missing from the levels", issue.name);
            }
        }

        // I3 + I4: pending dependencies are acyclic and strictly earlier.
        for issue in self.issues.values() {
            let Some(&level) = level_of.get(issue.name.as_str()) else {
                continue;
            };
            for dep in &issue.depends_on {
                if let Some(&dep_level) = level_of.get(dep.as_str())
                    && self.is_pending(dep)
                    && dep_level >= level
                {
                    anyhow::bail!(
                        "issue '{}' (level {level}) depends on '{dep}' at level {dep_level}",
                        issue.name
                    );
                }
            }
        }

        // Debt bookkeeping: a completed-with-debt outcome implies at least
        // one matching accumulated debt item.
        for (name, result) in &self.issue_results {
            if result.outcome == IssueOutcome::CompletedWithDebt
                && !self.accumulated_debt.iter().any(|d| &d.issue_name == name)
            {
                anyhow::bail!("issue '{name}' completed with debt but no debt item is recorded");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::DebtItem;

    fn issue(name: &str, deps: &[&str], seq: u32) -> Issue {
        let mut issue = Issue::new(name, name).with_depends_on(deps);
        issue.sequence_number = seq;
        issue
    }

    fn three_issue_state() -> DagState {
        let issues = vec![
            issue("a", &[], 1),
            issue("b", &["a"], 2),
            issue("c", &["a"], 3),
        ];
        let levels = vec![vec!["a".into()], vec!["b".into(), "c".into()]];
        DagState::new(Path::new("/repo"), Path::new("/artifacts"), issues, levels)
    }

    fn completed_result(name: &str) -> IssueResult {
        IssueResult {
            issue_name: name.to_string(),
            outcome: IssueOutcome::Completed,
            iterations_used: 1,
            advisor_invocations_used: 0,
            branch_name: None,
            debt: Vec::new(),
            sub_issues: Vec::new(),
            diagnostic: String::new(),
        }
    }

    #[test]
    fn fresh_state_passes_invariants() {
        three_issue_state().check_invariants().unwrap();
    }

    #[test]
    fn record_result_moves_between_lists() {
        let mut state = three_issue_state();
        state.in_flight.push("a".into());

        state.record_result(completed_result("a"));
        assert_eq!(state.status_of("a"), IssueStatus::Completed);
        assert!(state.in_flight.is_empty());
        state.check_invariants().unwrap();

        // Re-recording with a different outcome replaces, never duplicates.
        let mut failed = completed_result("a");
        failed.outcome = IssueOutcome::FailedUnrecoverable;
        state.record_result(failed);
        assert_eq!(state.status_of("a"), IssueStatus::FailedUnrecoverable);
        assert_eq!(state.completed.len(), 0);
        state.check_invariants().unwrap();
    }

    #[test]
    fn pending_issues_sorted_by_sequence() {
        let mut state = three_issue_state();
        state.record_result(completed_result("a"));
        let pending = state.pending_issues();
        let names: Vec<&str> = pending.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn mark_skipped_is_idempotent_for_terminal_issues() {
        let mut state = three_issue_state();
        state.record_result(completed_result("a"));
        state.mark_skipped("a", "should not apply");
        assert_eq!(state.status_of("a"), IssueStatus::Completed);

        state.mark_skipped("c", "upstream failed");
        assert_eq!(state.status_of("c"), IssueStatus::Skipped);
        state.mark_skipped("c", "again");
        assert_eq!(state.skipped.iter().filter(|n| *n == "c").count(), 1);
    }

    #[test]
    fn demote_moves_escalated_to_unrecoverable() {
        let mut state = three_issue_state();
        let mut result = completed_result("a");
        result.outcome = IssueOutcome::FailedEscalated;
        state.record_result(result);
        assert_eq!(state.status_of("a"), IssueStatus::FailedRecoverable);

        state.demote_to_unrecoverable("a");
        assert_eq!(state.status_of("a"), IssueStatus::FailedUnrecoverable);
        assert_eq!(
            state.issue_results["a"].outcome,
            IssueOutcome::FailedUnrecoverable
        );
        state.check_invariants().unwrap();
    }

    #[test]
    fn recompute_levels_treats_completed_as_satisfied() {
        let mut state = three_issue_state();
        state.record_result(completed_result("a"));
        state.current_level = 1;

        state.recompute_levels().unwrap();
        assert_eq!(state.current_level, 0);
        assert_eq!(state.levels, vec![vec!["b".to_string(), "c".to_string()]]);
        state.check_invariants().unwrap();
    }

    #[test]
    fn recompute_levels_ignores_failed_dependencies() {
        let mut state = three_issue_state();
        let mut failed = completed_result("a");
        failed.outcome = IssueOutcome::FailedUnrecoverable;
        state.record_result(failed);

        state.recompute_levels().unwrap();
        // b and c remain schedulable; their coders see failure notes.
        assert_eq!(state.levels, vec![vec!["b".to_string(), "c".to_string()]]);
    }

    #[test]
    fn invariant_catches_double_listing() {
        let mut state = three_issue_state();
        state.completed.push("a".into());
        state.skipped.push("a".into());
        assert!(state.check_invariants().is_err());
    }

    #[test]
    fn invariant_catches_missing_pending_issue() {
        let mut state = three_issue_state();
        state.levels = vec![vec!["a".into()]];
        let err = state.check_invariants().unwrap_err();
        assert!(err.to_string().contains("missing from the levels"));
    }

    #[test]
    fn invariant_catches_same_level_dependency() {
        let issues = vec![issue("a", &[], 1), issue("b", &["a"], 2)];
        let levels = vec![vec!["a".into(), "b".into()]];
        let state = DagState::new(Path::new("/r"), Path::new("/a"), issues, levels);
        assert!(state.check_invariants().is_err());
    }

    #[test]
    fn invariant_requires_debt_item_for_debt_outcome() {
        let mut state = three_issue_state();
        let mut result = completed_result("a");
        result.outcome = IssueOutcome::CompletedWithDebt;
        state.record_result(result);
        assert!(state.check_invariants().is_err());

        state
            .accumulated_debt
            .push(DebtItem::dropped_criterion("a", "AC2", "dropped by advisor"));
        state.check_invariants().unwrap();
    }

    #[test]
    fn serialization_round_trip_compares_equal() {
        let mut state = three_issue_state();
        state.record_result(completed_result("a"));
        state.bump_version();
        state.adaptation_history.push("note".into());

        let json = serde_json::to_string_pretty(&state).unwrap();
        let reloaded: DagState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, reloaded);
    }

    #[test]
    fn version_is_monotone() {
        let mut state = three_issue_state();
        let v0 = state.version;
        state.bump_version();
        state.bump_version();
        assert_eq!(state.version, v0 + 2);
    }

    #[test]
    fn next_sequence_number_exceeds_existing() {
        let state = three_issue_state();
        assert_eq!(state.next_sequence_number(), 4);
    }
}
