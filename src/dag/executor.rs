//! Level-synchronous DAG executor.
//!
//! All issues in a level run concurrently; the next level starts only
//! after the full gate sequence completes: workspace setup, parallel
//! execution, classification, merge, integration tests, debt, split,
//! replan, failure propagation, checkpoint, advance. `DagState` is mutated
//! only here, between levels, never from inside a per-issue task.

use crate::agent::{AgentInvoker, AgentRole};
use crate::artifacts::ArtifactStore;
use crate::coding::advisor::{self, AdvisorTrigger};
use crate::coding::{CodingLoop, LoopVerdict};
use crate::config::BuildConfig;
use crate::dag::mutation::{
    AdvisorDecision, ReplanDecision, ReplanRecord, annotate_downstream_failures, apply_replan,
    insert_split, skip_downstream_of_failures,
};
use crate::dag::state::{DagState, ProjectContext};
use crate::issue::{DebtItem, DebtKind, DebtSeverity, Issue, IssueOutcome, IssueResult};
use crate::memory::SharedMemory;
use crate::workspace::{
    BranchMerge, BranchMergeStatus, GitWorkspace, IntegrationTestReport, MergeAttempt, MergeResult,
};
use anyhow::Result;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tracing::{info, warn};

/// Scheduler knobs distilled from the build config.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_coding_iterations: u32,
    pub max_advisor_invocations: u32,
    pub max_replans: u32,
    pub enable_advisor: bool,
    pub enable_replanning: bool,
    pub enable_integration_testing: bool,
    pub max_integration_test_retries: u32,
    pub concurrency_cap: Option<usize>,
}

impl ExecutorConfig {
    pub fn from_build(config: &BuildConfig) -> Self {
        Self {
            max_coding_iterations: config.max_coding_iterations,
            max_advisor_invocations: config.max_advisor_invocations,
            max_replans: config.max_replans,
            enable_advisor: config.enable_advisor,
            enable_replanning: config.enable_replanning,
            enable_integration_testing: config.enable_integration_testing,
            max_integration_test_retries: config.max_integration_test_retries,
            concurrency_cap: config.concurrency_cap,
        }
    }
}

/// Cooperative cancel signal for a run.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Create a cancel handle and its receiver half.
pub fn cancel_channel() -> (CancelHandle, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, rx)
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Completed,
    /// The replanner decided the build cannot recover.
    Aborted,
    Cancelled,
}

/// Merger-agent resolution for a conflicted merge.
#[derive(Debug, Clone, Deserialize)]
struct MergerResolution {
    resolved: bool,
    #[serde(default)]
    strategy: String,
    #[serde(default)]
    summary: String,
}

pub struct DagExecutor {
    invoker: Arc<AgentInvoker>,
    store: ArtifactStore,
    config: ExecutorConfig,
    memory: Option<Arc<SharedMemory>>,
    cancel: watch::Receiver<bool>,
}

impl DagExecutor {
    pub fn new(invoker: Arc<AgentInvoker>, store: ArtifactStore, config: ExecutorConfig) -> Self {
        // Without an external handle the receiver reads false forever.
        let (_tx, rx) = watch::channel(false);
        Self {
            invoker,
            store,
            config,
            memory: None,
            cancel: rx,
        }
    }

    pub fn with_memory(mut self, memory: Arc<SharedMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Execute the DAG to a terminal status, mutating `state` in place.
    ///
    /// Resume is the same entry point: a state loaded from a checkpoint
    /// restarts at step 1 of its stored level, never mid-level.
    pub async fn execute(
        &self,
        state: &mut DagState,
        workspace: Option<&GitWorkspace>,
    ) -> Result<ExecutionStatus> {
        state.check_invariants()?;
        self.checkpoint(state);

        while state.current_level < state.levels.len() {
            if self.is_cancelled() {
                return self.finish_cancelled(state, workspace);
            }

            let level_index = state.current_level;
            let (active, setup_failures) =
                self.setup_level_workspaces(state, workspace, level_index);
            if active.is_empty() && setup_failures.is_empty() {
                state.current_level += 1;
                continue;
            }

            let names: Vec<&str> = active.iter().map(|i| i.name.as_str()).collect();
            info!(level = level_index, issues = ?names, "level starting");

            // Gate 2: parallel execution.
            state.in_flight = active.iter().map(|i| i.name.clone()).collect();
            state.bump_version();
            self.checkpoint(state);

            let results = self.run_level(&active, &state.project_context()).await;
            state.in_flight.clear();

            // Cancellation drops the whole level on the floor: gates run as
            // a unit or not at all, and resume re-enters at step 1.
            if self.is_cancelled() {
                return self.finish_cancelled(state, workspace);
            }

            // Gate 3: classification. A `None` means the task observed the
            // cancel signal and left its issue pending. Worktree-setup
            // failures classify alongside the task results so the failure
            // gates see them too.
            let mut level_results = Vec::new();
            for result in setup_failures
                .into_iter()
                .chain(results.into_iter().flatten())
            {
                state.record_result(result.clone());
                level_results.push(result);
            }

            // Gates 4 and 5: merge, then integration tests on demand.
            if let Some(ws) = workspace
                && state.git.is_active()
            {
                let merge = self.run_merge_gate(ws, state, level_index, &level_results).await;
                if merge.needs_integration_tests && self.config.enable_integration_testing {
                    self.run_integration_gate(state, &merge).await;
                }
                state.merge_results.push(merge);

                let level_issues: Vec<Issue> = level_results
                    .iter()
                    .filter_map(|r| state.issues.get(&r.issue_name).cloned())
                    .collect();
                if let Err(e) = ws.cleanup_worktrees(&level_issues, true) {
                    warn!(level = level_index, error = %e, "worktree cleanup failed");
                }
            }

            // Gate 6: debt.
            self.run_debt_gate(state, &level_results);

            // Gate 7: splits.
            let mut graph_mutated = false;
            let mut escalated: Vec<IssueResult> = level_results
                .iter()
                .filter(|r| {
                    matches!(
                        r.outcome,
                        IssueOutcome::FailedEscalated | IssueOutcome::FailedUnrecoverable
                    )
                })
                .cloned()
                .collect();

            for result in &level_results {
                if result.outcome != IssueOutcome::FailedNeedsSplit {
                    continue;
                }
                match insert_split(state, &result.issue_name, result.sub_issues.clone()) {
                    Ok(()) => {
                        graph_mutated = true;
                        state.adaptation_history.push(format!(
                            "split '{}' into {} sub-issues",
                            result.issue_name,
                            result.sub_issues.len(),
                        ));
                    }
                    Err(e) => {
                        warn!(issue = %result.issue_name, error = %e, "split rejected; escalating");
                        state.adaptation_history.push(format!(
                            "split of '{}' rejected ({e}); escalated instead",
                            result.issue_name,
                        ));
                        let mut as_escalated = result.clone();
                        as_escalated.outcome = IssueOutcome::FailedEscalated;
                        as_escalated.sub_issues.clear();
                        state.record_result(as_escalated.clone());
                        escalated.push(as_escalated);
                    }
                }
            }

            // Gates 8 and 9: replanning and failure propagation.
            if !escalated.is_empty() {
                annotate_downstream_failures(state, &escalated);
                match self.run_replan_gate(state, &escalated).await {
                    ReplanOutcome::Proceed { mutated } => graph_mutated |= mutated,
                    ReplanOutcome::Abort => {
                        state.bump_version();
                        self.checkpoint(state);
                        return Ok(ExecutionStatus::Aborted);
                    }
                }
            }

            self.update_memory(state, &level_results);

            // Gate 10: checkpoint.
            state.bump_version();
            state.check_invariants()?;
            self.checkpoint(state);

            info!(level = level_index, summary = %state.summary(), "level complete");

            // Gate 11: advance. A rebuilt graph already reset to level 0.
            if !graph_mutated {
                state.current_level += 1;
            }
        }

        if let Some(ws) = workspace {
            self.final_worktree_sweep(state, ws);
        }
        state.bump_version();
        self.checkpoint(state);
        info!(summary = %state.summary(), "dag execution complete");
        Ok(ExecutionStatus::Completed)
    }

    /// Gate 1: a worktree per pending issue in the level. Creation failure
    /// is terminal for that issue only, never for the run; the failure
    /// result flows through classification with the rest of the level.
    fn setup_level_workspaces(
        &self,
        state: &mut DagState,
        workspace: Option<&GitWorkspace>,
        level_index: usize,
    ) -> (Vec<Issue>, Vec<IssueResult>) {
        let level_names = state.levels[level_index].clone();
        let mut active = Vec::new();
        let mut failures = Vec::new();

        for name in level_names {
            if !state.is_pending(&name) {
                continue;
            }
            let Some(mut issue) = state.issues.get(&name).cloned() else {
                continue;
            };

            if let Some(ws) = workspace
                && state.git.is_active()
            {
                match ws.make_worktree(&issue, &state.git.integration_branch) {
                    Ok(info) => {
                        issue.worktree_path = Some(info.path);
                        issue.branch_name = Some(info.branch);
                        if let Some(stored) = state.issues.get_mut(&name) {
                            stored.worktree_path = issue.worktree_path.clone();
                            stored.branch_name = issue.branch_name.clone();
                        }
                    }
                    Err(e) => {
                        warn!(issue = %name, error = %e, "worktree creation failed");
                        failures.push(IssueResult::unrecoverable(
                            &name,
                            format!("worktree creation failed: {e}"),
                        ));
                        continue;
                    }
                }
            }
            active.push(issue);
        }
        (active, failures)
    }

    /// Run every issue in the level concurrently, bounded by the
    /// concurrency cap. Results come back in issue order.
    async fn run_level(
        &self,
        issues: &[Issue],
        ctx: &ProjectContext,
    ) -> Vec<Option<IssueResult>> {
        let cap = self.config.concurrency_cap.unwrap_or(issues.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(cap));

        let mut handles = Vec::new();
        for issue in issues.iter().cloned() {
            let semaphore = Arc::clone(&semaphore);
            let invoker = Arc::clone(&self.invoker);
            let store = self.store.clone();
            let config = self.config.clone();
            let memory = self.memory.clone();
            let cancel = self.cancel.clone();
            let ctx = ctx.clone();
            let name = issue.name.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                run_issue(invoker, store, config, memory, cancel, issue, ctx).await
            });
            handles.push((name, handle));
        }

        let mut results = Vec::new();
        for (name, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => results.push(Some(IssueResult::unrecoverable(
                    &name,
                    format!("issue task panicked: {e}"),
                ))),
            }
        }
        results
    }

    /// Gate 4: merge completed branches in sequence order, retrying each
    /// once on transient failure, handing conflicts to the merger agent.
    async fn run_merge_gate(
        &self,
        ws: &GitWorkspace,
        state: &DagState,
        level: usize,
        results: &[IssueResult],
    ) -> MergeResult {
        let mut candidates: Vec<(u32, String, String)> = results
            .iter()
            .filter(|r| r.outcome.is_success())
            .filter_map(|r| {
                let issue = state.issues.get(&r.issue_name)?;
                let branch = r.branch_name.clone().or_else(|| issue.branch_name.clone())?;
                Some((issue.sequence_number, r.issue_name.clone(), branch))
            })
            .collect();
        candidates.sort();

        let mut branches = Vec::new();
        let mut advanced = 0usize;
        for (_, issue_name, branch) in candidates {
            let (entry, moved_integration) = self.merge_one(ws, state, &issue_name, &branch).await;
            if moved_integration {
                advanced += 1;
            }
            branches.push(entry);
        }

        let had_conflicts = branches
            .iter()
            .any(|b| matches!(b.status, BranchMergeStatus::ConflictResolved { .. }));
        // One clean merge needs no integration pass; combined or conflicted
        // work does. Up-to-date branches brought nothing new and count for
        // neither.
        let needs_integration_tests = had_conflicts || advanced > 1;

        let summary = format!(
            "level {level}: {}/{} branches merged ({advanced} advanced the integration branch){}",
            branches
                .iter()
                .filter(|b| !matches!(b.status, BranchMergeStatus::Failed { .. }))
                .count(),
            branches.len(),
            if had_conflicts { ", conflicts resolved" } else { "" },
        );
        info!(level, summary = %summary, "merge gate complete");

        MergeResult {
            level,
            branches,
            needs_integration_tests,
            summary,
        }
    }

    /// Returns the per-branch record plus whether the merge advanced the
    /// integration branch.
    async fn merge_one(
        &self,
        ws: &GitWorkspace,
        state: &DagState,
        issue_name: &str,
        branch: &str,
    ) -> (BranchMerge, bool) {
        let integration = &state.git.integration_branch;

        let mut attempt = ws.merge_branch(branch, integration);
        if attempt.is_err() {
            // One retry covers transient failures (locks, fs hiccups).
            attempt = ws.merge_branch(branch, integration);
        }

        match attempt {
            Ok(MergeAttempt::UpToDate) => (
                BranchMerge {
                    branch: branch.to_string(),
                    issue_name: issue_name.to_string(),
                    status: BranchMergeStatus::Merged,
                    merged_sha: ws.head_sha().unwrap_or_default(),
                },
                false,
            ),
            Ok(MergeAttempt::FastForward { sha }) | Ok(MergeAttempt::Merged { sha }) => (
                BranchMerge {
                    branch: branch.to_string(),
                    issue_name: issue_name.to_string(),
                    status: BranchMergeStatus::Merged,
                    merged_sha: sha,
                },
                true,
            ),
            Ok(MergeAttempt::Conflicted { files }) => {
                info!(branch, ?files, "merge conflict; invoking merger agent");
                let resolution = self.invoke_merger(state, issue_name, branch, &files).await;
                match resolution {
                    Ok(res) if res.resolved && !ws.merge_in_progress() => (
                        BranchMerge {
                            branch: branch.to_string(),
                            issue_name: issue_name.to_string(),
                            status: BranchMergeStatus::ConflictResolved {
                                strategy: if res.strategy.is_empty() {
                                    "agent".to_string()
                                } else {
                                    res.strategy
                                },
                            },
                            merged_sha: ws.head_sha().unwrap_or_default(),
                        },
                        true,
                    ),
                    other => {
                        let reason = match other {
                            Ok(res) => format!(
                                "merger did not complete the merge: {}",
                                if res.summary.is_empty() {
                                    "no summary"
                                } else {
                                    res.summary.as_str()
                                },
                            ),
                            Err(e) => format!("merger agent failed: {e}"),
                        };
                        if let Err(e) = ws.abort_merge() {
                            warn!(branch, error = %e, "failed to abort conflicted merge");
                        }
                        (
                            BranchMerge {
                                branch: branch.to_string(),
                                issue_name: issue_name.to_string(),
                                status: BranchMergeStatus::Failed { reason },
                                merged_sha: String::new(),
                            },
                            false,
                        )
                    }
                }
            }
            Err(e) => (
                BranchMerge {
                    branch: branch.to_string(),
                    issue_name: issue_name.to_string(),
                    status: BranchMergeStatus::Failed {
                        reason: e.to_string(),
                    },
                    merged_sha: String::new(),
                },
                false,
            ),
        }
    }

    async fn invoke_merger(
        &self,
        state: &DagState,
        issue_name: &str,
        branch: &str,
        files: &[String],
    ) -> Result<MergerResolution, crate::errors::InvocationError> {
        let inputs = json!({
            "issue_name": issue_name,
            "branch": branch,
            "integration_branch": state.git.integration_branch,
            "conflicting_files": files,
            "prd_summary": state.plan.prd_summary,
            "architecture_summary": state.plan.architecture_summary,
        });
        self.invoker
            .invoke(AgentRole::Merger, inputs, &state.repo_path, Vec::new())
            .await
    }

    /// Gate 5: integration tester on the merged tree, with bounded retries.
    async fn run_integration_gate(&self, state: &mut DagState, merge: &MergeResult) {
        for attempt in 0..=self.config.max_integration_test_retries {
            let inputs = json!({
                "integration_branch": state.git.integration_branch,
                "merged_branches": merge.branches,
                "prd_summary": state.plan.prd_summary,
                "architecture_summary": state.plan.architecture_summary,
                "attempt": attempt,
            });
            let report: Result<IntegrationTestReport, _> = self
                .invoker
                .invoke(AgentRole::IntegrationTester, inputs, &state.repo_path, Vec::new())
                .await;

            match report {
                Ok(report) => {
                    let passed = report.passed;
                    state.integration_test_results.push(report);
                    if passed {
                        return;
                    }
                    if attempt < self.config.max_integration_test_retries {
                        info!(attempt, "integration tests failed; retrying");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "integration tester failed to run");
                    state.integration_test_results.push(IntegrationTestReport {
                        passed: false,
                        tests_run: 0,
                        tests_failed: 0,
                        summary: format!("integration tester unavailable: {e}"),
                    });
                    return;
                }
            }
        }
        warn!("integration tests still failing after retries");
    }

    /// Gate 6: collect debt and propagate it to pending dependents so
    /// their coders see it from the next level onward.
    fn run_debt_gate(&self, state: &mut DagState, results: &[IssueResult]) {
        for result in results {
            for debt in &result.debt {
                // A criterion dropped mid-task becomes visible in the
                // authoritative issue map here, at the gate.
                if debt.kind == DebtKind::DroppedAcceptanceCriterion
                    && let Some(issue) = state.issues.get_mut(&debt.issue_name)
                {
                    issue.acceptance_criteria.retain(|c| c != &debt.criterion);
                }
                state.accumulated_debt.push(debt.clone());
                self.propagate_debt_note(state, debt);
            }
            // Unmet criteria of a failed issue become high-severity debt.
            // Splits are excluded: their sub-issues still carry the work.
            if matches!(
                result.outcome,
                IssueOutcome::FailedEscalated | IssueOutcome::FailedUnrecoverable
            ) && let Some(issue) = state.issues.get(&result.issue_name).cloned()
            {
                for criterion in &issue.acceptance_criteria {
                    let debt = DebtItem::unmet_criterion(
                        &result.issue_name,
                        criterion,
                        "issue failed before satisfying this criterion",
                    );
                    state.accumulated_debt.push(debt.clone());
                    self.propagate_debt_note(state, &debt);
                }
            }
        }
    }

    fn propagate_debt_note(&self, state: &mut DagState, debt: &DebtItem) {
        let note = format!(
            "Upstream debt from '{}': {:?}{}",
            debt.issue_name,
            debt.kind,
            if debt.criterion.is_empty() {
                String::new()
            } else {
                format!(": {}", debt.criterion)
            },
        );
        let dependents: Vec<String> = state
            .issues
            .values()
            .filter(|i| i.depends_on.contains(&debt.issue_name))
            .map(|i| i.name.clone())
            .collect();
        for name in dependents {
            if state.is_pending(&name)
                && let Some(issue) = state.issues.get_mut(&name)
            {
                issue.debt_notes.push(note.clone());
            }
        }
    }

    /// Gate 8: the outer loop. Degrades to CONTINUE on any orchestration
    /// failure; every decision lands in the replan history.
    async fn run_replan_gate(
        &self,
        state: &mut DagState,
        escalated: &[IssueResult],
    ) -> ReplanOutcome {
        let replanning_available =
            self.config.enable_replanning && state.replan_count < self.config.max_replans;

        if !replanning_available {
            for result in escalated {
                state.demote_to_unrecoverable(&result.issue_name);
            }
            skip_downstream_of_failures(state, escalated);
            state.adaptation_history.push(format!(
                "replanning unavailable ({}); skipped downstream of {:?}",
                if self.config.enable_replanning { "budget exhausted" } else { "disabled" },
                escalated.iter().map(|r| r.issue_name.as_str()).collect::<Vec<_>>(),
            ));
            return ReplanOutcome::Proceed { mutated: false };
        }

        let decision = self.invoke_replanner(state, escalated).await;
        state.replan_count += 1;
        info!(
            decision = decision.kind(),
            replan = state.replan_count,
            "replanner decided"
        );

        match &decision {
            ReplanDecision::Abort { rationale } => {
                state.replan_history.push(ReplanRecord {
                    decision: decision.clone(),
                    applied: true,
                    note: String::new(),
                });
                warn!(rationale = %rationale, "replanner aborted the build");
                ReplanOutcome::Abort
            }
            ReplanDecision::Continue { .. } => {
                skip_downstream_of_failures(state, escalated);
                state.replan_history.push(ReplanRecord {
                    decision: decision.clone(),
                    applied: true,
                    note: String::new(),
                });
                ReplanOutcome::Proceed { mutated: false }
            }
            ReplanDecision::ModifyDag { .. } | ReplanDecision::ReduceScope { .. } => {
                match apply_replan(state, &decision) {
                    Ok(()) => {
                        state.replan_history.push(ReplanRecord {
                            decision: decision.clone(),
                            applied: true,
                            note: String::new(),
                        });
                        ReplanOutcome::Proceed { mutated: true }
                    }
                    Err(e) => {
                        warn!(error = %e, "replan rejected; continuing unchanged");
                        skip_downstream_of_failures(state, escalated);
                        state.replan_history.push(ReplanRecord {
                            decision: decision.clone(),
                            applied: false,
                            note: format!("rejected: {e}"),
                        });
                        ReplanOutcome::Proceed { mutated: false }
                    }
                }
            }
        }
    }

    async fn invoke_replanner(
        &self,
        state: &DagState,
        escalated: &[IssueResult],
    ) -> ReplanDecision {
        let context = self
            .memory
            .as_ref()
            .map(|m| m.context_for_advisor())
            .unwrap_or_default();
        let inputs = json!({
            "dag_state": state,
            "failed_issues": escalated,
            "replan_history": state.replan_history,
            "replan_number": state.replan_count + 1,
            "max_replans": self.config.max_replans,
        });
        let decision: Result<ReplanDecision, _> = self
            .invoker
            .invoke(AgentRole::Replanner, inputs, &state.repo_path, context)
            .await;
        decision.unwrap_or_else(|e| {
            warn!(error = %e, "replanner failed; defaulting to continue");
            ReplanDecision::Continue {
                rationale: format!("replanner unavailable: {e}"),
            }
        })
    }

    /// Shared-memory writes are queued for the gate; this is the gate.
    fn update_memory(&self, state: &DagState, results: &[IssueResult]) {
        let Some(memory) = &self.memory else {
            return;
        };
        for result in results {
            if result.outcome.is_success() {
                // First writer wins; later calls are no-ops.
                memory.record_conventions(&result.diagnostic);
                memory.record_interface(&result.issue_name, &result.diagnostic);
            } else {
                memory.record_failure_pattern(&format!(
                    "{}: {}",
                    result.issue_name, result.diagnostic
                ));
                memory.record_bug_pattern(&format!(
                    "{} ({:?})",
                    result.issue_name, result.outcome
                ));
            }
        }
        memory.set_build_health(&state.summary());
    }

    fn finish_cancelled(
        &self,
        state: &mut DagState,
        workspace: Option<&GitWorkspace>,
    ) -> Result<ExecutionStatus> {
        info!("cancellation observed; draining and checkpointing");
        state.in_flight.clear();
        if let Some(ws) = workspace {
            self.final_worktree_sweep(state, ws);
        }
        state.bump_version();
        self.checkpoint(state);
        Ok(ExecutionStatus::Cancelled)
    }

    fn final_worktree_sweep(&self, state: &DagState, ws: &GitWorkspace) {
        let all: Vec<Issue> = state.issues.values().cloned().collect();
        if let Err(e) = ws.cleanup_worktrees(&all, true) {
            warn!(error = %e, "final worktree sweep failed");
        }
    }

    /// Checkpoint failure is logged, never fatal: the next write carries
    /// all unpersisted changes.
    fn checkpoint(&self, state: &DagState) {
        if let Err(e) = self.store.write_checkpoint(state) {
            warn!(error = %e, "checkpoint write failed; continuing");
        }
    }
}

enum ReplanOutcome {
    Proceed { mutated: bool },
    Abort,
}

/// Per-issue task: the inner coding loop wrapped by the bounded advisor
/// loop. Returns `None` when cancellation interrupted the issue, leaving
/// it pending for a later resume.
async fn run_issue(
    invoker: Arc<AgentInvoker>,
    store: ArtifactStore,
    config: ExecutorConfig,
    memory: Option<Arc<SharedMemory>>,
    cancel: watch::Receiver<bool>,
    mut issue: Issue,
    ctx: ProjectContext,
) -> Option<IssueResult> {
    let coding = CodingLoop::new(
        Arc::clone(&invoker),
        store,
        config.max_coding_iterations,
        memory.clone(),
        cancel,
    );

    let mut advisor_used = 0u32;
    let mut dropped_debt: Vec<DebtItem> = Vec::new();

    loop {
        let outcome = coding.run(&issue, &ctx).await;

        let (trigger, diagnostic) = match outcome.verdict {
            LoopVerdict::Approved { summary } => {
                let kind = if dropped_debt.is_empty() {
                    IssueOutcome::Completed
                } else {
                    IssueOutcome::CompletedWithDebt
                };
                return Some(IssueResult {
                    issue_name: issue.name.clone(),
                    outcome: kind,
                    iterations_used: outcome.iterations,
                    advisor_invocations_used: advisor_used,
                    branch_name: issue.branch_name.clone(),
                    debt: dropped_debt,
                    sub_issues: Vec::new(),
                    diagnostic: summary,
                });
            }
            LoopVerdict::Cancelled => return None,
            LoopVerdict::Blocked { reason } => (AdvisorTrigger::Blocked, reason),
            LoopVerdict::Exhausted => (
                AdvisorTrigger::Exhausted,
                format!(
                    "coding loop exhausted after {} iterations without approval",
                    outcome.iterations
                ),
            ),
        };

        if !config.enable_advisor || advisor_used >= config.max_advisor_invocations {
            return Some(IssueResult {
                issue_name: issue.name.clone(),
                outcome: IssueOutcome::FailedEscalated,
                iterations_used: outcome.iterations,
                advisor_invocations_used: advisor_used,
                branch_name: issue.branch_name.clone(),
                debt: dropped_debt,
                sub_issues: Vec::new(),
                diagnostic,
            });
        }

        advisor_used += 1;
        let is_last = advisor_used >= config.max_advisor_invocations;
        let decision = advisor::consult(
            &invoker,
            memory.as_ref(),
            &issue,
            &ctx,
            trigger,
            &outcome.trace,
            advisor_used,
            config.max_advisor_invocations,
        )
        .await;
        let (decision, overridden) = advisor::narrow_for_last_invocation(decision, is_last);
        if overridden {
            info!(issue = %issue.name, "advisor retry overridden on final invocation");
        }

        match decision {
            AdvisorDecision::RetryModified {
                dropped_criteria,
                justification,
            } => {
                for criterion in &dropped_criteria {
                    issue.acceptance_criteria.retain(|c| c != criterion);
                    dropped_debt.push(DebtItem::dropped_criterion(
                        &issue.name,
                        criterion,
                        &justification,
                    ));
                }
                issue.retry_context = format!(
                    "Advisor dropped acceptance criteria {dropped_criteria:?}; retry without them."
                );
                issue.previous_error = diagnostic;
            }
            AdvisorDecision::RetryApproach { approach_changes } => {
                issue.approach_changes = approach_changes;
                issue.previous_error = diagnostic;
            }
            AdvisorDecision::Split { sub_issues } => {
                return Some(IssueResult {
                    issue_name: issue.name.clone(),
                    outcome: IssueOutcome::FailedNeedsSplit,
                    iterations_used: outcome.iterations,
                    advisor_invocations_used: advisor_used,
                    branch_name: issue.branch_name.clone(),
                    debt: dropped_debt,
                    sub_issues,
                    diagnostic,
                });
            }
            AdvisorDecision::AcceptWithDebt { debt } => {
                let mut all_debt = dropped_debt;
                for mut item in debt {
                    item.issue_name = issue.name.clone();
                    all_debt.push(item);
                }
                if all_debt.is_empty() {
                    all_debt.push(DebtItem {
                        kind: DebtKind::Other,
                        criterion: String::new(),
                        issue_name: issue.name.clone(),
                        severity: DebtSeverity::Medium,
                        justification: "advisor accepted with an unspecified shortfall".into(),
                    });
                }
                return Some(IssueResult {
                    issue_name: issue.name.clone(),
                    outcome: IssueOutcome::CompletedWithDebt,
                    iterations_used: outcome.iterations,
                    advisor_invocations_used: advisor_used,
                    branch_name: issue.branch_name.clone(),
                    debt: all_debt,
                    sub_issues: Vec::new(),
                    diagnostic,
                });
            }
            AdvisorDecision::EscalateToReplan { reason } => {
                return Some(IssueResult {
                    issue_name: issue.name.clone(),
                    outcome: IssueOutcome::FailedEscalated,
                    iterations_used: outcome.iterations,
                    advisor_invocations_used: advisor_used,
                    branch_name: issue.branch_name.clone(),
                    debt: dropped_debt,
                    sub_issues: Vec::new(),
                    diagnostic: if reason.is_empty() { diagnostic } else { reason },
                });
            }
        }
        // Retry decisions fall through here and re-enter the coding loop
        // with a reset iteration budget.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_config_mirrors_build_config() {
        let mut build = BuildConfig::default();
        build.max_coding_iterations = 7;
        build.enable_replanning = false;
        build.concurrency_cap = Some(3);

        let config = ExecutorConfig::from_build(&build);
        assert_eq!(config.max_coding_iterations, 7);
        assert!(!config.enable_replanning);
        assert_eq!(config.concurrency_cap, Some(3));
        assert_eq!(config.max_replans, 2);
    }

    #[test]
    fn cancel_channel_flips_the_flag() {
        let (handle, rx) = cancel_channel();
        assert!(!*rx.borrow());
        handle.cancel();
        assert!(*rx.borrow());

        // Clones observe the same signal.
        let clone = rx.clone();
        assert!(*clone.borrow());
    }

    #[test]
    fn cancel_handle_survives_receiver_drop() {
        let (handle, rx) = cancel_channel();
        drop(rx);
        // Sending into a closed channel is a no-op, not a panic.
        handle.cancel();
    }
}
