//! The verify–fix loop.
//!
//! After execution, the verifier checks every PRD acceptance criterion
//! against the merged tree. Failures within budget become targeted fix
//! issues that re-enter the scheduler as a fresh level set; failures past
//! the budget become debt.

use crate::agent::{AgentInvoker, AgentRole};
use crate::artifacts::ArtifactStore;
use crate::dag::executor::{DagExecutor, ExecutionStatus};
use crate::dag::state::DagState;
use crate::issue::{DebtItem, Issue};
use crate::workspace::GitWorkspace;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Verdict for one acceptance criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion: String,
    pub passed: bool,
    #[serde(default)]
    pub justification: String,
}

/// Verifier output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VerificationReport {
    pub passed: bool,
    #[serde(default)]
    pub criteria: Vec<CriterionResult>,
    #[serde(default)]
    pub summary: String,
}

impl VerificationReport {
    pub fn failed_criteria(&self) -> Vec<&CriterionResult> {
        self.criteria.iter().filter(|c| !c.passed).collect()
    }
}

/// Fix-generator output: minimal-scope issues for the failed criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FixPlan {
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub rationale: String,
}

pub struct VerifyFixLoop {
    invoker: Arc<AgentInvoker>,
    store: ArtifactStore,
    max_cycles: u32,
}

impl VerifyFixLoop {
    pub fn new(invoker: Arc<AgentInvoker>, store: ArtifactStore, max_cycles: u32) -> Self {
        Self {
            invoker,
            store,
            max_cycles,
        }
    }

    /// Verify, generate fixes, re-execute; terminate on full pass or
    /// budget exhaustion, converting remaining failures to debt.
    pub async fn run(
        &self,
        state: &mut DagState,
        executor: &DagExecutor,
        workspace: Option<&GitWorkspace>,
    ) -> Result<Option<VerificationReport>> {
        if state.plan.prd_criteria.is_empty() {
            info!("no PRD acceptance criteria; skipping verification");
            return Ok(None);
        }

        let mut last_report = None;
        for cycle in 0..=self.max_cycles {
            let report = match self.verify(state, cycle).await {
                Some(report) => report,
                None => return Ok(last_report),
            };
            self.persist(cycle, &report);

            if report.passed {
                info!(cycle, "verification passed");
                return Ok(Some(report));
            }

            let failed: Vec<String> = report
                .failed_criteria()
                .iter()
                .map(|c| c.criterion.clone())
                .collect();
            info!(cycle, failed = failed.len(), "verification found failures");

            if cycle >= self.max_cycles {
                // Budget spent: remaining failures become the debt register's
                // problem, not another execution round.
                for criterion in &failed {
                    state.accumulated_debt.push(DebtItem::unmet_criterion(
                        "verification",
                        criterion,
                        "still failing after the verify-fix budget",
                    ));
                }
                state
                    .adaptation_history
                    .push(format!("verify-fix budget exhausted with {} failures", failed.len()));
                return Ok(Some(report));
            }

            let fix_issues = self.generate_fixes(state, &report).await;
            if fix_issues.is_empty() {
                warn!("fix generator produced no issues; stopping verification loop");
                return Ok(Some(report));
            }

            let mut next_seq = state.next_sequence_number();
            for mut issue in fix_issues {
                if state.issues.contains_key(&issue.name) {
                    warn!(issue = %issue.name, "fix issue collides with an existing name; skipping");
                    continue;
                }
                issue.sequence_number = next_seq;
                next_seq += 1;
                state.issues.insert(issue.name.clone(), issue);
            }
            state.recompute_levels()?;
            state
                .adaptation_history
                .push(format!("verify-fix cycle {} scheduled fixes", cycle + 1));
            state.bump_version();

            match executor.execute(state, workspace).await? {
                ExecutionStatus::Completed => {}
                status => {
                    info!(?status, "fix execution ended early; stopping verification loop");
                    return Ok(Some(report));
                }
            }
            last_report = Some(report);
        }

        Ok(last_report)
    }

    async fn verify(&self, state: &DagState, cycle: u32) -> Option<VerificationReport> {
        let inputs = json!({
            "acceptance_criteria": state.plan.prd_criteria,
            "prd_summary": state.plan.prd_summary,
            "integration_branch": state.git.integration_branch,
            "completed_issues": state.completed,
            "failed_issues": state.failed_unrecoverable,
            "skipped_issues": state.skipped,
            "cycle": cycle,
        });
        let report: Result<VerificationReport, _> = self
            .invoker
            .invoke(AgentRole::Verifier, inputs, &state.repo_path, Vec::new())
            .await;
        match report {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "verifier failed to run; treating verification as unavailable");
                None
            }
        }
    }

    async fn generate_fixes(&self, state: &DagState, report: &VerificationReport) -> Vec<Issue> {
        let inputs = json!({
            "failed_criteria": report.failed_criteria(),
            "prd_summary": state.plan.prd_summary,
            "architecture_summary": state.plan.architecture_summary,
            "completed_issues": state.completed,
        });
        let plan: Result<FixPlan, _> = self
            .invoker
            .invoke(AgentRole::FixGenerator, inputs, &state.repo_path, Vec::new())
            .await;
        match plan {
            Ok(plan) => plan.issues,
            Err(e) => {
                warn!(error = %e, "fix generator failed; no fix issues");
                Vec::new()
            }
        }
    }

    fn persist(&self, cycle: u32, report: &VerificationReport) {
        match serde_json::to_value(report) {
            Ok(value) => {
                if let Err(e) = self.store.write_verification(cycle, &value) {
                    warn!(error = %e, "failed to persist verification report");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize verification report"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_criteria_filters_passed_ones() {
        let report = VerificationReport {
            passed: false,
            criteria: vec![
                CriterionResult {
                    criterion: "ok".into(),
                    passed: true,
                    justification: String::new(),
                },
                CriterionResult {
                    criterion: "broken".into(),
                    passed: false,
                    justification: "file missing".into(),
                },
            ],
            summary: String::new(),
        };
        let failed = report.failed_criteria();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].criterion, "broken");
    }

    #[test]
    fn report_serde_round_trip() {
        let report = VerificationReport {
            passed: true,
            criteria: vec![CriterionResult {
                criterion: "compiles".into(),
                passed: true,
                justification: "cargo build clean".into(),
            }],
            summary: "all green".into(),
        };
        let json = serde_json::to_string(&report).unwrap();
        let parsed: VerificationReport = serde_json::from_str(&json).unwrap();
        assert_eq!(report, parsed);
    }
}
