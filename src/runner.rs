//! The orchestrator facade: the four entry points the outside world calls.
//!
//! `build` runs plan → git init → execute → verify–fix; `plan` and
//! `execute` expose the halves; `resume_build` continues from the last
//! consistent checkpoint. Every failure converges into a `BuildResult`
//! with a status and the accumulated debt register; callers never see a
//! raw panic or stack trace.

use crate::agent::{AgentBackend, AgentInvoker, CliBackend};
use crate::artifacts::ArtifactStore;
use crate::config::BuildConfig;
use crate::dag::executor::{
    CancelHandle, DagExecutor, ExecutionStatus, ExecutorConfig, cancel_channel,
};
use crate::dag::state::DagState;
use crate::errors::{ConfigError, PlanningError};
use crate::issue::{DebtItem, slugify};
use crate::memory::SharedMemory;
use crate::plan::{PlanResult, PlanningPipeline};
use crate::verify::{VerificationReport, VerifyFixLoop};
use crate::workspace::GitWorkspace;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Terminal status of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    /// Execution finished but some issues failed, were skipped, or
    /// verification did not pass.
    CompletedWithIssues,
    PlanningFailed,
    /// The replanner decided the build cannot recover.
    Aborted,
    Cancelled,
}

/// Per-phase counts for the final report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PhaseBreakdown {
    pub planned_issues: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub replans: u32,
    pub verify_passed: Option<bool>,
}

/// User-visible result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    pub status: BuildStatus,
    pub summary: String,
    pub breakdown: PhaseBreakdown,
    /// The accumulated debt register.
    pub debt: Vec<DebtItem>,
    pub verification: Option<VerificationReport>,
    /// Full final state; absent only when planning failed.
    pub state: Option<DagState>,
}

impl BuildResult {
    fn planning_failed(error: &PlanningError) -> Self {
        Self {
            status: BuildStatus::PlanningFailed,
            summary: format!("planning failed: {error}"),
            breakdown: PhaseBreakdown::default(),
            debt: Vec::new(),
            verification: None,
            state: None,
        }
    }

    fn from_state(
        state: DagState,
        execution: ExecutionStatus,
        verification: Option<VerificationReport>,
    ) -> Self {
        let breakdown = PhaseBreakdown {
            planned_issues: state.issues.len(),
            completed: state.completed.len(),
            failed: state.failed_recoverable.len() + state.failed_unrecoverable.len(),
            skipped: state.skipped.len(),
            replans: state.replan_count,
            verify_passed: verification.as_ref().map(|v| v.passed),
        };

        let status = match execution {
            ExecutionStatus::Cancelled => BuildStatus::Cancelled,
            ExecutionStatus::Aborted => BuildStatus::Aborted,
            ExecutionStatus::Completed => {
                let clean = breakdown.failed == 0 && breakdown.skipped == 0;
                let verified = breakdown.verify_passed.unwrap_or(clean);
                if verified && breakdown.failed == 0 {
                    BuildStatus::Success
                } else {
                    BuildStatus::CompletedWithIssues
                }
            }
        };

        let summary = format!("{}: {}", status_label(status), state.summary());
        Self {
            status,
            summary,
            breakdown,
            debt: state.accumulated_debt.clone(),
            verification,
            state: Some(state),
        }
    }

    /// Whether resuming this result again would be a no-op.
    pub fn is_terminal_success(&self) -> bool {
        matches!(
            self.status,
            BuildStatus::Success | BuildStatus::CompletedWithIssues
        )
    }
}

fn status_label(status: BuildStatus) -> &'static str {
    match status {
        BuildStatus::Success => "success",
        BuildStatus::CompletedWithIssues => "completed with issues",
        BuildStatus::PlanningFailed => "planning failed",
        BuildStatus::Aborted => "aborted",
        BuildStatus::Cancelled => "cancelled",
    }
}

/// Library-level entry into the whole system.
pub struct Orchestrator {
    config: BuildConfig,
    backend: Arc<dyn AgentBackend>,
    memory: Option<Arc<SharedMemory>>,
    cancel_handle: CancelHandle,
    cancel_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build an orchestrator with the backend selected by
    /// `config.runtime`. The scripted runtime has no ambient backend and
    /// must come in through [`Orchestrator::with_backend`].
    pub fn new(config: BuildConfig) -> Result<Self, ConfigError> {
        let backend: Arc<dyn AgentBackend> = match config.runtime.as_str() {
            "default" | "cli" => Arc::new(CliBackend::from_env()),
            "scripted" => {
                return Err(ConfigError::Invalid(
                    "runtime 'scripted' requires an injected backend".into(),
                ));
            }
            other => {
                return Err(ConfigError::Invalid(format!("unknown runtime '{other}'")));
            }
        };
        Ok(Self::with_backend(config, backend))
    }

    pub fn with_backend(config: BuildConfig, backend: Arc<dyn AgentBackend>) -> Self {
        let memory = config.enable_learning.then(|| Arc::new(SharedMemory::new()));
        let (cancel_handle, cancel_rx) = cancel_channel();
        Self {
            config,
            backend,
            memory,
            cancel_handle,
            cancel_rx,
        }
    }

    /// Handle for cancelling any in-flight entry point of this
    /// orchestrator.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel_handle.clone()
    }

    pub fn default_artifacts_dir(repo_path: &Path) -> PathBuf {
        repo_path.join(".artifacts")
    }

    fn invoker(&self, store: &ArtifactStore) -> Arc<AgentInvoker> {
        Arc::new(
            AgentInvoker::new(Arc::clone(&self.backend), &self.config)
                .with_log_dir(store.logs_dir()),
        )
    }

    fn executor(&self, invoker: Arc<AgentInvoker>, store: ArtifactStore) -> DagExecutor {
        let mut executor = DagExecutor::new(invoker, store, ExecutorConfig::from_build(&self.config))
            .with_cancel(self.cancel_rx.clone());
        if let Some(memory) = &self.memory {
            executor = executor.with_memory(Arc::clone(memory));
        }
        executor
    }

    /// Run the planning pipeline only.
    pub async fn plan(&self, goal: &str, repo_path: &Path) -> Result<PlanResult, PlanningError> {
        let store = ArtifactStore::new(&Self::default_artifacts_dir(repo_path));
        let invoker = self.invoker(&store);
        PlanningPipeline::new(invoker, store, self.config.max_review_iterations)
            .run(goal, repo_path)
            .await
    }

    /// Execute a pre-made plan, returning the final state.
    pub async fn execute(&self, plan: &PlanResult, repo_path: &Path) -> Result<DagState> {
        let artifacts_dir = Self::default_artifacts_dir(repo_path);
        let mut state = DagState::from_plan(plan, repo_path, &artifacts_dir);
        let workspace = self.attach_workspace(&mut state, &plan.prd.goal);
        self.run_execution(&mut state, workspace.as_ref()).await?;
        Ok(state)
    }

    /// Full pipeline: plan → execute → verify–fix.
    pub async fn build(&self, goal: &str, repo_path: &Path) -> Result<BuildResult> {
        let plan = match self.plan(goal, repo_path).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "planning failed; no execution will occur");
                return Ok(BuildResult::planning_failed(&e));
            }
        };

        let artifacts_dir = Self::default_artifacts_dir(repo_path);
        let mut state = DagState::from_plan(&plan, repo_path, &artifacts_dir);
        let workspace = self.attach_workspace(&mut state, goal);
        self.finish(&mut state, workspace.as_ref()).await
    }

    /// Continue a crashed or cancelled run from its checkpoint.
    ///
    /// Loading a terminal state is a no-op: the stored result is reported
    /// without re-executing anything.
    pub async fn resume_build(
        &self,
        repo_path: &Path,
        artifacts_dir: Option<&Path>,
    ) -> Result<BuildResult> {
        let artifacts_dir = artifacts_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| Self::default_artifacts_dir(repo_path));
        let store = ArtifactStore::new(&artifacts_dir);

        let mut state = store
            .load_checkpoint()
            .with_context(|| format!("no usable checkpoint under {}", artifacts_dir.display()))?;
        info!(
            run_id = %state.run_id,
            level = state.current_level,
            version = state.version,
            "resuming from checkpoint"
        );

        // Interrupted mid-level work resumes from step 1 of the level.
        state.in_flight.clear();

        let workspace = self.reopen_workspace(&state);
        if state.is_terminal() {
            info!("checkpoint is already terminal; resume is a no-op");
            return Ok(BuildResult::from_state(
                state,
                ExecutionStatus::Completed,
                None,
            ));
        }

        if let Some(ws) = &workspace {
            // Reconcile on-disk worktrees: drop everything; the workspace
            // gate recreates exactly what the current level needs.
            let issues: Vec<_> = state.issues.values().cloned().collect();
            if let Err(e) = ws.cleanup_worktrees(&issues, true) {
                warn!(error = %e, "worktree reconciliation failed");
            }
        }

        self.finish(&mut state, workspace.as_ref()).await
    }

    async fn finish(
        &self,
        state: &mut DagState,
        workspace: Option<&GitWorkspace>,
    ) -> Result<BuildResult> {
        let execution = self.run_execution(state, workspace).await?;

        let verification = if execution == ExecutionStatus::Completed {
            let store = ArtifactStore::new(&state.artifacts_dir);
            let invoker = self.invoker(&store);
            let executor = self.executor(Arc::clone(&invoker), store.clone());
            let verify = VerifyFixLoop::new(invoker, store, self.config.max_verify_fix_cycles);
            verify.run(state, &executor, workspace).await?
        } else {
            None
        };

        Ok(BuildResult::from_state(state.clone(), execution, verification))
    }

    async fn run_execution(
        &self,
        state: &mut DagState,
        workspace: Option<&GitWorkspace>,
    ) -> Result<ExecutionStatus> {
        let store = ArtifactStore::new(&state.artifacts_dir);
        store
            .ensure_layout()
            .context("failed to prepare artifact layout")?;
        let invoker = self.invoker(&store);
        let executor = self.executor(invoker, store);
        executor.execute(state, workspace).await
    }

    /// Git initialization between plan and execute. Failure is non-fatal:
    /// the run continues without branch-per-issue semantics.
    fn attach_workspace(&self, state: &mut DagState, goal: &str) -> Option<GitWorkspace> {
        let workspace = match GitWorkspace::open(&state.repo_path) {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "not a usable git repository; running without git workflow");
                return None;
            }
        };
        match workspace.init_integration(&slugify(goal, "build")) {
            Ok(init) => {
                state.git.integration_branch = init.integration_branch;
                state.git.original_branch = init.original_branch;
                state.git.initial_commit = init.initial_commit;
                state.git.worktrees_dir = Some(workspace.worktrees_dir().to_path_buf());
                Some(workspace)
            }
            Err(e) => {
                warn!(error = %e, "git init failed; running without git workflow");
                None
            }
        }
    }

    fn reopen_workspace(&self, state: &DagState) -> Option<GitWorkspace> {
        if !state.git.is_active() {
            return None;
        }
        match GitWorkspace::open(&state.repo_path) {
            Ok(ws) => Some(ws),
            Err(e) => {
                warn!(error = %e, "could not reopen git workspace on resume");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ScriptedBackend;

    #[test]
    fn scripted_runtime_requires_injected_backend() {
        let mut config = BuildConfig::default();
        config.runtime = "scripted".into();
        assert!(matches!(
            Orchestrator::new(config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn unknown_runtime_is_rejected() {
        let mut config = BuildConfig::default();
        config.runtime = "quantum".into();
        let err = Orchestrator::new(config).unwrap_err();
        assert!(err.to_string().contains("quantum"));
    }

    #[test]
    fn with_backend_enables_memory_only_when_learning() {
        let config = BuildConfig::default();
        let orch = Orchestrator::with_backend(config, Arc::new(ScriptedBackend::new()));
        assert!(orch.memory.is_none());

        let mut config = BuildConfig::default();
        config.enable_learning = true;
        let orch = Orchestrator::with_backend(config, Arc::new(ScriptedBackend::new()));
        assert!(orch.memory.is_some());
    }

    #[test]
    fn build_result_status_mapping() {
        let state = DagState::new(
            Path::new("/r"),
            Path::new("/a"),
            vec![crate::issue::Issue::new("a", "A")],
            vec![vec!["a".into()]],
        );
        let mut done = state.clone();
        done.completed.push("a".into());
        done.current_level = 1;

        let result = BuildResult::from_state(done.clone(), ExecutionStatus::Completed, None);
        assert_eq!(result.status, BuildStatus::Success);

        let result = BuildResult::from_state(done.clone(), ExecutionStatus::Cancelled, None);
        assert_eq!(result.status, BuildStatus::Cancelled);

        let mut failed = done;
        failed.completed.clear();
        failed.failed_unrecoverable.push("a".into());
        let result = BuildResult::from_state(failed, ExecutionStatus::Completed, None);
        assert_eq!(result.status, BuildStatus::CompletedWithIssues);
    }

    #[test]
    fn verification_verdict_drives_success() {
        let mut state = DagState::new(
            Path::new("/r"),
            Path::new("/a"),
            vec![crate::issue::Issue::new("a", "A")],
            vec![vec!["a".into()]],
        );
        state.completed.push("a".into());
        state.current_level = 1;

        let failed_verify = VerificationReport {
            passed: false,
            ..Default::default()
        };
        let result = BuildResult::from_state(
            state.clone(),
            ExecutionStatus::Completed,
            Some(failed_verify),
        );
        assert_eq!(result.status, BuildStatus::CompletedWithIssues);
        assert_eq!(result.breakdown.verify_passed, Some(false));
    }
}
