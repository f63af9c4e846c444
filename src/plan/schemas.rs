//! Structured artifacts produced by the planning pipeline.

use crate::dag::graph::FileConflict;
use crate::issue::Issue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Product requirements document from the product manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Prd {
    #[serde(default)]
    pub goal: String,
    /// The goal restated after reading the repository.
    #[serde(default)]
    pub validated_description: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub out_of_scope: Vec<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
}

impl Prd {
    /// Compact summary carried into the DAG state for downstream agents.
    pub fn summary(&self) -> String {
        let mut parts = vec![self.validated_description.clone()];
        if !self.acceptance_criteria.is_empty() {
            parts.push("\nAcceptance Criteria:".to_string());
            for criterion in &self.acceptance_criteria {
                parts.push(format!("- {criterion}"));
            }
        }
        parts.join("\n")
    }
}

/// A single component in the architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureComponent {
    pub name: String,
    pub responsibility: String,
    #[serde(default)]
    pub touches_files: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A key architectural decision with rationale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureDecision {
    pub decision: String,
    pub rationale: String,
}

/// Architecture document from the architect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Architecture {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub components: Vec<ArchitectureComponent>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<ArchitectureDecision>,
    #[serde(default)]
    pub file_changes_overview: String,
}

/// Tech-lead review of the architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ArchReview {
    pub approved: bool,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub scope_issues: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

/// Sprint planner output: the issue list plus the plan rationale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SprintPlan {
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub rationale: String,
}

/// Issue-writer output for one issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IssueSpec {
    #[serde(default)]
    pub success: bool,
    /// Self-contained per-issue specification in markdown.
    #[serde(default)]
    pub spec_markdown: String,
}

/// Output of the planning pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    pub prd: Prd,
    pub architecture: Architecture,
    pub review: ArchReview,
    /// Sequenced issues, in plan order.
    pub issues: Vec<Issue>,
    /// Parallel execution levels from topological sort.
    pub levels: Vec<Vec<String>>,
    /// Same-level file overlaps; advisory, passed to the merger.
    #[serde(default)]
    pub file_conflicts: Vec<FileConflict>,
    #[serde(default)]
    pub rationale: String,
}

impl PlanResult {
    pub fn issue_map(&self) -> BTreeMap<String, Issue> {
        self.issues
            .iter()
            .map(|i| (i.name.clone(), i.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prd_summary_lists_criteria() {
        let prd = Prd {
            validated_description: "Build a cache".into(),
            acceptance_criteria: vec!["hit ratio reported".into(), "LRU eviction".into()],
            ..Default::default()
        };
        let summary = prd.summary();
        assert!(summary.starts_with("Build a cache"));
        assert!(summary.contains("- hit ratio reported"));
        assert!(summary.contains("- LRU eviction"));
    }

    #[test]
    fn plan_result_round_trips() {
        let plan = PlanResult {
            prd: Prd::default(),
            architecture: Architecture::default(),
            review: ArchReview {
                approved: true,
                ..Default::default()
            },
            issues: vec![Issue::new("a", "A")],
            levels: vec![vec!["a".into()]],
            file_conflicts: Vec::new(),
            rationale: "single issue".into(),
        };
        let json = serde_json::to_string(&plan).unwrap();
        let parsed: PlanResult = serde_json::from_str(&json).unwrap();
        assert_eq!(plan, parsed);
    }
}
