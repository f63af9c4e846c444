//! The inner coding loop: the tightest of the three nested control loops.
//!
//! Per issue, per iteration:
//! - default path: coder → reviewer
//! - flagged path (`guidance.needs_deeper_qa`): coder → QA ∥ reviewer →
//!   synthesizer
//!
//! The loop ends on APPROVE (success), BLOCK (early exit to the advisor),
//! cancellation, or iteration exhaustion. FIX feeds the accumulated
//! feedback into the coder's next inputs. The path is chosen once per
//! issue and never changes mid-loop.

pub mod advisor;

use crate::agent::{AgentInvoker, AgentRole};
use crate::artifacts::ArtifactStore;
use crate::dag::state::ProjectContext;
use crate::errors::InvocationError;
use crate::issue::Issue;
use crate::memory::SharedMemory;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Coder output: a committed worktree or an explanation of what is left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CoderReport {
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub summary: String,
    /// The coder must leave the working tree committed when this is true.
    #[serde(default)]
    pub committed: bool,
}

/// QA output from the flagged path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaReport {
    pub passed: bool,
    #[serde(default)]
    pub summary: String,
    /// Stable description of the dominant failure, for stuck detection.
    #[serde(default)]
    pub failure_signature: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approve,
    Fix,
    /// Reserved for the highest-severity findings: security, data loss,
    /// crash.
    Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewReport {
    pub verdict: ReviewVerdict,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub block_reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisAction {
    Fix,
    Approve,
    Block,
}

/// Synthesizer output from the flagged path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisReport {
    pub action: SynthesisAction,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub failure_signature: String,
    /// The synthesizer's own stuck-loop verdict.
    #[serde(default)]
    pub stuck: bool,
}

/// One iteration of the loop, persisted to the artifact store and handed
/// to the advisor as the failure trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub action: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub failure_signature: String,
    #[serde(default)]
    pub qa_passed: Option<bool>,
    #[serde(default)]
    pub review_verdict: String,
}

/// Terminal state of one coding-loop attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopVerdict {
    Approved { summary: String },
    Blocked { reason: String },
    Exhausted,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub verdict: LoopVerdict,
    pub iterations: u32,
    pub trace: Vec<IterationRecord>,
    pub files_changed: Vec<String>,
}

/// Runs the coding loop for one issue inside its worktree.
pub struct CodingLoop {
    invoker: Arc<AgentInvoker>,
    store: ArtifactStore,
    max_iterations: u32,
    memory: Option<Arc<SharedMemory>>,
    cancel: watch::Receiver<bool>,
}

impl CodingLoop {
    pub fn new(
        invoker: Arc<AgentInvoker>,
        store: ArtifactStore,
        max_iterations: u32,
        memory: Option<Arc<SharedMemory>>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            invoker,
            store,
            max_iterations,
            memory,
            cancel,
        }
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn workdir(&self, issue: &Issue, ctx: &ProjectContext) -> PathBuf {
        issue
            .worktree_path
            .clone()
            .unwrap_or_else(|| ctx.repo_path.clone())
    }

    /// Run until APPROVE, BLOCK, cancellation, or exhaustion.
    pub async fn run(&self, issue: &Issue, ctx: &ProjectContext) -> LoopOutcome {
        let flagged = issue.guidance.needs_deeper_qa;
        info!(
            issue = %issue.name,
            path = if flagged { "flagged" } else { "default" },
            max_iterations = self.max_iterations,
            "coding loop starting"
        );

        let mut trace: Vec<IterationRecord> = Vec::new();
        let mut files_changed: Vec<String> = Vec::new();
        let mut feedback = String::new();

        for iteration in 1..=self.max_iterations {
            if self.cancelled() {
                return self.finish(issue, LoopVerdict::Cancelled, iteration - 1, trace, files_changed);
            }

            let coder = self.invoke_coder(issue, ctx, iteration, &feedback).await;
            let coder = match coder {
                Ok(report) => report,
                Err(e) => {
                    warn!(issue = %issue.name, iteration, error = %e, "coder invocation failed");
                    let record = IterationRecord {
                        iteration,
                        action: "fix".into(),
                        summary: format!("coder invocation failed: {e}"),
                        failure_signature: "coder_invocation_error".into(),
                        qa_passed: None,
                        review_verdict: String::new(),
                    };
                    self.persist_iteration(issue, &record);
                    trace.push(record);
                    feedback = format!("The previous coder attempt failed to run: {e}");
                    continue;
                }
            };
            for file in &coder.files_changed {
                if !files_changed.contains(file) {
                    files_changed.push(file.clone());
                }
            }

            let (record, verdict) = if flagged {
                self.flagged_iteration(issue, ctx, iteration, &coder, &trace).await
            } else {
                self.default_iteration(issue, ctx, iteration, &coder).await
            };

            self.persist_iteration(issue, &record);
            trace.push(record);

            match verdict {
                IterationVerdict::Approve(summary) => {
                    return self.finish(
                        issue,
                        LoopVerdict::Approved { summary },
                        iteration,
                        trace,
                        files_changed,
                    );
                }
                IterationVerdict::Block(reason) => {
                    return self.finish(
                        issue,
                        LoopVerdict::Blocked { reason },
                        iteration,
                        trace,
                        files_changed,
                    );
                }
                IterationVerdict::Fix(merged_feedback) => {
                    feedback = merged_feedback;
                }
            }
        }

        self.finish(
            issue,
            LoopVerdict::Exhausted,
            self.max_iterations,
            trace,
            files_changed,
        )
    }

    fn finish(
        &self,
        issue: &Issue,
        verdict: LoopVerdict,
        iterations: u32,
        trace: Vec<IterationRecord>,
        files_changed: Vec<String>,
    ) -> LoopOutcome {
        match &verdict {
            LoopVerdict::Approved { .. } => {
                info!(issue = %issue.name, iterations, "coding loop approved")
            }
            LoopVerdict::Blocked { reason } => {
                info!(issue = %issue.name, iterations, reason = %reason, "coding loop blocked")
            }
            LoopVerdict::Exhausted => {
                info!(issue = %issue.name, iterations, "coding loop exhausted")
            }
            LoopVerdict::Cancelled => {
                info!(issue = %issue.name, iterations, "coding loop cancelled")
            }
        }
        LoopOutcome {
            verdict,
            iterations,
            trace,
            files_changed,
        }
    }

    async fn invoke_coder(
        &self,
        issue: &Issue,
        ctx: &ProjectContext,
        iteration: u32,
        feedback: &str,
    ) -> Result<CoderReport, InvocationError> {
        let mut context = self
            .memory
            .as_ref()
            .map(|m| m.context_for_coder(issue))
            .unwrap_or_default();
        if !feedback.is_empty() {
            context.push(format!("Feedback from the previous iteration: {feedback}"));
        }

        let inputs = json!({
            "issue_name": issue.name,
            "issue": issue,
            "iteration": iteration,
            "prd_summary": ctx.prd_summary,
            "architecture_summary": ctx.architecture_summary,
            "artifacts_dir": ctx.artifacts_dir,
        });
        self.invoker
            .invoke(AgentRole::Coder, inputs, &self.workdir(issue, ctx), context)
            .await
    }

    /// Default path: the reviewer alone decides.
    async fn default_iteration(
        &self,
        issue: &Issue,
        ctx: &ProjectContext,
        iteration: u32,
        coder: &CoderReport,
    ) -> (IterationRecord, IterationVerdict) {
        let inputs = json!({
            "issue_name": issue.name,
            "issue": issue,
            "coder_summary": coder.summary,
            "files_changed": coder.files_changed,
            "review_focus": issue.guidance.review_focus,
        });
        let review: Result<ReviewReport, _> = self
            .invoker
            .invoke(AgentRole::Reviewer, inputs, &self.workdir(issue, ctx), Vec::new())
            .await;

        match review {
            Ok(report) => {
                let record = IterationRecord {
                    iteration,
                    action: verdict_name(report.verdict).into(),
                    summary: report.feedback.clone(),
                    failure_signature: String::new(),
                    qa_passed: None,
                    review_verdict: verdict_name(report.verdict).into(),
                };
                let verdict = match report.verdict {
                    ReviewVerdict::Approve => IterationVerdict::Approve(coder.summary.clone()),
                    ReviewVerdict::Block => IterationVerdict::Block(if report.block_reason.is_empty() {
                        report.feedback
                    } else {
                        report.block_reason
                    }),
                    ReviewVerdict::Fix => IterationVerdict::Fix(report.feedback),
                };
                (record, verdict)
            }
            Err(e) => {
                // A reviewer that cannot run is a FIX with the error as
                // feedback; the loop budget still bounds us.
                warn!(issue = %issue.name, iteration, error = %e, "reviewer invocation failed");
                let record = IterationRecord {
                    iteration,
                    action: "fix".into(),
                    summary: format!("reviewer invocation failed: {e}"),
                    failure_signature: "reviewer_invocation_error".into(),
                    qa_passed: None,
                    review_verdict: String::new(),
                };
                (
                    record,
                    IterationVerdict::Fix("reviewer unavailable; address prior feedback".into()),
                )
            }
        }
    }

    /// Flagged path: QA and reviewer in parallel, then the synthesizer.
    async fn flagged_iteration(
        &self,
        issue: &Issue,
        ctx: &ProjectContext,
        iteration: u32,
        coder: &CoderReport,
        trace: &[IterationRecord],
    ) -> (IterationRecord, IterationVerdict) {
        let workdir = self.workdir(issue, ctx);
        let qa_inputs = json!({
            "issue_name": issue.name,
            "issue": issue,
            "coder_summary": coder.summary,
            "files_changed": coder.files_changed,
            "testing_guidance": issue.guidance.testing_guidance,
        });
        let review_inputs = json!({
            "issue_name": issue.name,
            "issue": issue,
            "coder_summary": coder.summary,
            "files_changed": coder.files_changed,
            "review_focus": issue.guidance.review_focus,
        });

        let (qa, review) = tokio::join!(
            self.invoker
                .invoke::<QaReport>(AgentRole::Qa, qa_inputs, &workdir, Vec::new()),
            self.invoker
                .invoke::<ReviewReport>(AgentRole::Reviewer, review_inputs, &workdir, Vec::new()),
        );

        let qa_summary = match &qa {
            Ok(report) => json!({
                "passed": report.passed,
                "summary": report.summary,
                "failure_signature": report.failure_signature,
            }),
            Err(e) => json!({"passed": false, "summary": format!("qa failed to run: {e}")}),
        };
        let review_summary = match &review {
            Ok(report) => json!({
                "verdict": verdict_name(report.verdict),
                "feedback": report.feedback,
                "block_reason": report.block_reason,
            }),
            Err(e) => json!({"verdict": "fix", "feedback": format!("review failed to run: {e}")}),
        };

        let synth_inputs = json!({
            "issue_name": issue.name,
            "issue_title": issue.title,
            "acceptance_criteria": issue.acceptance_criteria,
            "qa": qa_summary,
            "review": review_summary,
            "iteration": iteration,
            "iteration_history": trace,
        });
        let synthesis: Result<SynthesisReport, _> = self
            .invoker
            .invoke(AgentRole::Synthesizer, synth_inputs, &workdir, Vec::new())
            .await;

        let report = match synthesis {
            Ok(report) => report,
            Err(e) => {
                warn!(issue = %issue.name, iteration, error = %e, "synthesizer invocation failed");
                SynthesisReport {
                    action: SynthesisAction::Fix,
                    summary: format!("synthesizer unavailable: {e}"),
                    failure_signature: "synthesizer_invocation_error".into(),
                    stuck: false,
                }
            }
        };

        let qa_passed = qa.as_ref().ok().map(|q| q.passed);
        let review_verdict = review
            .as_ref()
            .ok()
            .map(|r| verdict_name(r.verdict).to_string())
            .unwrap_or_default();

        let mut action = report.action;
        let mut summary = report.summary.clone();

        // Stuck-loop enforcement: two consecutive FIX decisions with the
        // same failure signature force a BLOCK, whatever the synthesizer
        // said. The synthesizer's own `stuck` flag gets the same treatment.
        if action == SynthesisAction::Fix {
            let repeated = !report.failure_signature.is_empty()
                && trace
                    .last()
                    .map(|prev| {
                        prev.action == "fix" && prev.failure_signature == report.failure_signature
                    })
                    .unwrap_or(false);
            if report.stuck || repeated {
                debug!(issue = %issue.name, signature = %report.failure_signature, "stuck loop detected");
                action = SynthesisAction::Block;
                summary = format!("stuck loop detected: {}", report.failure_signature);
            }
        }

        let record = IterationRecord {
            iteration,
            action: synthesis_name(action).into(),
            summary: summary.clone(),
            failure_signature: report.failure_signature.clone(),
            qa_passed,
            review_verdict,
        };

        let verdict = match action {
            SynthesisAction::Approve => IterationVerdict::Approve(summary),
            SynthesisAction::Block => IterationVerdict::Block(summary),
            SynthesisAction::Fix => IterationVerdict::Fix(summary),
        };
        (record, verdict)
    }

    fn persist_iteration(&self, issue: &Issue, record: &IterationRecord) {
        let value = match serde_json::to_value(record) {
            Ok(value) => value,
            Err(_) => return,
        };
        if let Err(e) = self.store.write_iteration(&issue.name, record.iteration, &value) {
            warn!(issue = %issue.name, error = %e, "failed to persist iteration record");
        }
    }
}

enum IterationVerdict {
    Approve(String),
    Fix(String),
    Block(String),
}

fn verdict_name(verdict: ReviewVerdict) -> &'static str {
    match verdict {
        ReviewVerdict::Approve => "approve",
        ReviewVerdict::Fix => "fix",
        ReviewVerdict::Block => "block",
    }
}

fn synthesis_name(action: SynthesisAction) -> &'static str {
    match action {
        SynthesisAction::Approve => "approve",
        SynthesisAction::Fix => "fix",
        SynthesisAction::Block => "block",
    }
}
