//! The issue advisor: the middle control loop.
//!
//! Consulted when the inner loop exits on BLOCK or exhaustion. The advisor
//! reads the full iteration trace and the worktree and returns one
//! decision. Invocations are bounded per issue; on the last permitted
//! invocation the decision space narrows to SPLIT, ACCEPT_WITH_DEBT, or
//! ESCALATE. A retry on the final invocation is overridden to ESCALATE
//! so the budget is a real bound, not a suggestion.

use crate::agent::{AgentInvoker, AgentRole};
use crate::coding::IterationRecord;
use crate::dag::mutation::AdvisorDecision;
use crate::dag::state::ProjectContext;
use crate::issue::Issue;
use crate::memory::SharedMemory;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Why the inner loop handed control to the advisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvisorTrigger {
    Blocked,
    Exhausted,
}

impl AdvisorTrigger {
    fn as_str(self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::Exhausted => "exhausted",
        }
    }
}

/// Consult the advisor about a failed coding-loop attempt.
///
/// An advisor that itself fails (transport, schema) degrades to
/// ESCALATE_TO_REPLAN: the run must keep moving on orchestration failure.
pub async fn consult(
    invoker: &Arc<AgentInvoker>,
    memory: Option<&Arc<SharedMemory>>,
    issue: &Issue,
    ctx: &ProjectContext,
    trigger: AdvisorTrigger,
    trace: &[IterationRecord],
    invocation_number: u32,
    max_invocations: u32,
) -> AdvisorDecision {
    let context = memory.map(|m| m.context_for_advisor()).unwrap_or_default();
    let workdir = issue
        .worktree_path
        .clone()
        .unwrap_or_else(|| ctx.repo_path.clone());

    let inputs = json!({
        "issue_name": issue.name,
        "issue": issue,
        "trigger": trigger.as_str(),
        "iteration_trace": trace,
        "invocation_number": invocation_number,
        "max_invocations": max_invocations,
        "is_last_invocation": invocation_number >= max_invocations,
        "prd_summary": ctx.prd_summary,
        "architecture_summary": ctx.architecture_summary,
    });

    let decision: Result<AdvisorDecision, _> = invoker
        .invoke(AgentRole::Advisor, inputs, &workdir, context)
        .await;

    match decision {
        Ok(decision) => {
            info!(issue = %issue.name, decision = decision.kind(), "advisor decided");
            decision
        }
        Err(e) => {
            warn!(issue = %issue.name, error = %e, "advisor failed; escalating to replanner");
            AdvisorDecision::EscalateToReplan {
                reason: format!("advisor unavailable: {e}"),
            }
        }
    }
}

/// Enforce the last-invocation narrowing.
///
/// Returns the (possibly overridden) decision and whether an override
/// happened, so the scheduler can note it in the adaptation history.
pub fn narrow_for_last_invocation(
    decision: AdvisorDecision,
    is_last: bool,
) -> (AdvisorDecision, bool) {
    if is_last && decision.is_retry() {
        let reason = format!(
            "advisor returned '{}' on its final invocation; retries are no longer permitted",
            decision.kind(),
        );
        (AdvisorDecision::EscalateToReplan { reason }, true)
    } else {
        (decision, false)
    }
}
