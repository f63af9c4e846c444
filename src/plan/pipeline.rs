//! The planning pipeline: goal in, sequenced issue graph out.
//!
//! Strictly ordered: product manager → architect → bounded tech-lead
//! review loop → sprint planner → parallel issue-writer fan-out. The only
//! fatal outcomes are an unusable early-stage artifact and a cyclic issue
//! graph; an unapproved architecture after the review budget is accepted
//! as-is rather than blocking the build.

use crate::agent::{AgentInvoker, AgentRole};
use crate::artifacts::ArtifactStore;
use crate::dag::graph;
use crate::errors::PlanningError;
use crate::plan::schemas::{ArchReview, Architecture, IssueSpec, PlanResult, Prd, SprintPlan};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub struct PlanningPipeline {
    invoker: Arc<AgentInvoker>,
    store: ArtifactStore,
    max_review_iterations: u32,
}

impl PlanningPipeline {
    pub fn new(invoker: Arc<AgentInvoker>, store: ArtifactStore, max_review_iterations: u32) -> Self {
        Self {
            invoker,
            store,
            max_review_iterations,
        }
    }

    pub async fn run(&self, goal: &str, repo_path: &Path) -> Result<PlanResult, PlanningError> {
        info!(goal, "planning pipeline starting");

        // 1. Product manager reads the repo and scopes the goal.
        let mut prd: Prd = self
            .invoker
            .invoke(
                AgentRole::ProductManager,
                json!({"goal": goal, "repo_path": repo_path}),
                repo_path,
                Vec::new(),
            )
            .await?;
        prd.goal = goal.to_string();
        if prd.validated_description.is_empty() && prd.acceptance_criteria.is_empty() {
            return Err(PlanningError::Unparseable {
                stage: "product manager".into(),
                details: "PRD carries neither a description nor acceptance criteria".into(),
            });
        }

        // 2 + 3. Architect, then the tech-lead review loop. The first
        // review is round zero; each rejection buys one revision, up to
        // the budget.
        let mut architecture: Architecture = self
            .invoker
            .invoke(
                AgentRole::Architect,
                json!({"prd": prd, "repo_path": repo_path}),
                repo_path,
                Vec::new(),
            )
            .await?;

        let mut review = self.review_architecture(&prd, &architecture, repo_path, 0).await?;
        let mut round = 0;
        while !review.approved && round < self.max_review_iterations {
            round += 1;
            info!(round, "architecture revision requested");
            architecture = self
                .invoker
                .invoke(
                    AgentRole::Architect,
                    json!({
                        "prd": prd,
                        "repo_path": repo_path,
                        "feedback": review.feedback,
                        "revision": round,
                    }),
                    repo_path,
                    Vec::new(),
                )
                .await?;
            review = self
                .review_architecture(&prd, &architecture, repo_path, round)
                .await?;
        }
        if !review.approved {
            // Never block: the last revision ships, annotated.
            warn!("review budget exhausted; accepting the last architecture revision");
            review.approved = true;
            review.summary = format!("{} [accepted after review budget]", review.summary);
        }

        // 4. Sprint planner decomposes into issues with guidance.
        let sprint: SprintPlan = self
            .invoker
            .invoke(
                AgentRole::SprintPlanner,
                json!({"prd": prd, "architecture": architecture, "repo_path": repo_path}),
                repo_path,
                Vec::new(),
            )
            .await?;
        let mut issues = sprint.issues;

        // Levels, sequence numbers, and advisory conflicts. A cycle here
        // is fatal; nothing has executed yet.
        let levels = graph::compute_levels(&issues, &BTreeSet::new())?;
        graph::assign_sequence_numbers(&mut issues, &levels);
        let file_conflicts = graph::detect_file_conflicts(&issues, &levels);
        if !file_conflicts.is_empty() {
            info!(
                conflicts = file_conflicts.len(),
                "same-level file conflicts detected (advisory)"
            );
        }

        // 5. Issue writers fan out, one per issue. Failures degrade: the
        // issue still executes from its planner-provided description.
        let mut writer_tasks = Vec::new();
        for issue in &issues {
            let invoker = Arc::clone(&self.invoker);
            let inputs = json!({
                "issue_name": issue.name,
                "issue": issue,
                "prd_summary": prd.summary(),
                "architecture_summary": architecture.summary,
                "repo_path": repo_path,
            });
            let workdir = repo_path.to_path_buf();
            let name = issue.name.clone();
            writer_tasks.push(tokio::spawn(async move {
                let spec: Result<IssueSpec, _> = invoker
                    .invoke(AgentRole::IssueWriter, inputs, &workdir, Vec::new())
                    .await;
                (name, spec)
            }));
        }
        let mut written = 0usize;
        for task in writer_tasks {
            match task.await {
                Ok((name, Ok(spec))) => {
                    written += 1;
                    if !spec.spec_markdown.is_empty() {
                        self.persist_issue_spec(&name, &spec);
                    }
                }
                Ok((name, Err(e))) => {
                    warn!(issue = %name, error = %e, "issue writer failed; using planner description");
                }
                Err(e) => warn!(error = %e, "issue writer task panicked"),
            }
        }
        info!(written, total = issues.len(), "issue writers complete");

        let plan = PlanResult {
            prd,
            architecture,
            review,
            issues,
            levels,
            file_conflicts,
            rationale: sprint.rationale,
        };

        if let Err(e) = self.store.write_plan(&plan) {
            warn!(error = %e, "failed to persist plan artifacts");
        }

        info!(
            issues = plan.issues.len(),
            levels = plan.levels.len(),
            "planning pipeline complete"
        );
        Ok(plan)
    }

    async fn review_architecture(
        &self,
        prd: &Prd,
        architecture: &Architecture,
        repo_path: &Path,
        revision: u32,
    ) -> Result<ArchReview, PlanningError> {
        Ok(self
            .invoker
            .invoke(
                AgentRole::TechLead,
                json!({
                    "prd": prd,
                    "architecture": architecture,
                    "repo_path": repo_path,
                    "revision": revision,
                }),
                repo_path,
                Vec::new(),
            )
            .await?)
    }

    fn persist_issue_spec(&self, issue: &str, spec: &IssueSpec) {
        let path = self.store.plan_dir().join("issues").join(format!("{issue}.md"));
        if let Some(parent) = path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            warn!(error = %e, "failed to create issue spec dir");
            return;
        }
        if let Err(e) = std::fs::write(&path, &spec.spec_markdown) {
            warn!(issue, error = %e, "failed to write issue spec");
        }
    }
}
