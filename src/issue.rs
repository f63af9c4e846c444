//! Issue definitions: the unit of work the scheduler plans, executes, and
//! tracks through the DAG.
//!
//! An issue is created by the sprint planner, becomes a git branch and a
//! worktree at execution time, and ends in exactly one terminal outcome.
//! Issues refer to each other by stable name; the state owns the issue map
//! and everything else holds lookup keys.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Rough size estimate attached by the sprint planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScopeEstimate {
    Trivial,
    Small,
    #[default]
    Medium,
    Large,
}

/// Risk-routing record produced by the sprint planner per issue.
///
/// `needs_deeper_qa` is the routing flag: it selects the flagged coding-loop
/// path (coder → QA ∥ reviewer → synthesizer) over the default two-agent
/// path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IssueGuidance {
    #[serde(default)]
    pub needs_new_tests: bool,
    #[serde(default)]
    pub estimated_scope: ScopeEstimate,
    #[serde(default)]
    pub touches_interfaces: bool,
    #[serde(default)]
    pub needs_deeper_qa: bool,
    #[serde(default)]
    pub testing_guidance: String,
    #[serde(default)]
    pub review_focus: String,
    #[serde(default)]
    pub risk_rationale: String,
}

/// A unit of work.
///
/// Planner-assigned fields are immutable after planning; the runtime fields
/// below the divider are mutated only by the scheduler and advisor between
/// coding-loop attempts, never from inside a sibling issue's task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    /// Stable identifier; kebab-case, used in the branch name.
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Ordered, verifier-checkable predicates drawn from the PRD.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Advisory: used for same-level file-conflict detection only.
    #[serde(default)]
    pub files_to_create: BTreeSet<String>,
    #[serde(default)]
    pub files_to_modify: BTreeSet<String>,
    #[serde(default)]
    pub guidance: IssueGuidance,
    /// Assigned at plan time from topo-sorted level order; used for ordering
    /// and branch naming. Zero means "not yet assigned".
    #[serde(default)]
    pub sequence_number: u32,

    // --- runtime fields ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    /// Debt propagated from upstream issues, visible to this issue's coder.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub debt_notes: Vec<String>,
    /// Warnings about upstream failures this issue must work around.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_notes: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub retry_context: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub previous_error: String,
    /// Advisor-directed change of approach for the next coding attempt.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub approach_changes: String,
}

impl Issue {
    pub fn new(name: &str, title: &str) -> Self {
        Self {
            name: name.to_string(),
            title: title.to_string(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            depends_on: BTreeSet::new(),
            files_to_create: BTreeSet::new(),
            files_to_modify: BTreeSet::new(),
            guidance: IssueGuidance::default(),
            sequence_number: 0,
            worktree_path: None,
            branch_name: None,
            debt_notes: Vec::new(),
            failure_notes: Vec::new(),
            retry_context: String::new(),
            previous_error: String::new(),
            approach_changes: String::new(),
        }
    }

    pub fn with_depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_acceptance_criteria(mut self, criteria: &[&str]) -> Self {
        self.acceptance_criteria = criteria.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Branch-safe slug derived from the issue name.
    pub fn slug(&self) -> String {
        slugify(&self.name, "issue")
    }

    /// The branch this issue executes on: `issue/{seq:02}-{slug}`.
    pub fn issue_branch(&self) -> String {
        format!("issue/{:02}-{}", self.sequence_number, self.slug())
    }

    /// Union of files this issue expects to touch (advisory).
    pub fn touched_files(&self) -> BTreeSet<String> {
        self.files_to_create
            .union(&self.files_to_modify)
            .cloned()
            .collect()
    }
}

/// Lowercase, dash-separated, branch-safe rendering of a free-form name.
/// Falls back to `fallback` when nothing survives sanitization.
pub fn slugify(name: &str, fallback: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str(fallback);
    }
    slug
}

/// Terminal outcome of executing a single issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueOutcome {
    Completed,
    CompletedWithDebt,
    /// The advisor decided to split; sub-issues replace this issue.
    FailedNeedsSplit,
    /// Escalated to the replanner.
    FailedEscalated,
    FailedUnrecoverable,
    Skipped,
}

impl IssueOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Completed | Self::CompletedWithDebt)
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::FailedNeedsSplit | Self::FailedEscalated | Self::FailedUnrecoverable
        )
    }
}

/// Category of a recorded debt item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebtKind {
    DroppedAcceptanceCriterion,
    MissingFunctionality,
    UnmetAcceptanceCriterion,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebtSeverity {
    Low,
    Medium,
    High,
}

/// A typed record of incompleteness attached to an issue and surfaced in
/// the final result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebtItem {
    pub kind: DebtKind,
    /// The acceptance criterion involved; may be empty for `Other`.
    #[serde(default)]
    pub criterion: String,
    pub issue_name: String,
    pub severity: DebtSeverity,
    #[serde(default)]
    pub justification: String,
}

impl DebtItem {
    pub fn dropped_criterion(issue: &str, criterion: &str, justification: &str) -> Self {
        Self {
            kind: DebtKind::DroppedAcceptanceCriterion,
            criterion: criterion.to_string(),
            issue_name: issue.to_string(),
            severity: DebtSeverity::Medium,
            justification: justification.to_string(),
        }
    }

    pub fn unmet_criterion(issue: &str, criterion: &str, justification: &str) -> Self {
        Self {
            kind: DebtKind::UnmetAcceptanceCriterion,
            criterion: criterion.to_string(),
            issue_name: issue.to_string(),
            severity: DebtSeverity::High,
            justification: justification.to_string(),
        }
    }
}

/// Result of executing a single issue through the coding and advisor loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueResult {
    pub issue_name: String,
    pub outcome: IssueOutcome,
    /// Iterations used by the final coding-loop attempt. Advisor retries
    /// reset the counter, so this never exceeds `max_coding_iterations`.
    #[serde(default)]
    pub iterations_used: u32,
    #[serde(default)]
    pub advisor_invocations_used: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub debt: Vec<DebtItem>,
    /// Replacement issues when the outcome is `FailedNeedsSplit`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_issues: Vec<Issue>,
    #[serde(default)]
    pub diagnostic: String,
}

impl IssueResult {
    pub fn completed(issue: &Issue, iterations: u32, diagnostic: String) -> Self {
        Self {
            issue_name: issue.name.clone(),
            outcome: IssueOutcome::Completed,
            iterations_used: iterations,
            advisor_invocations_used: 0,
            branch_name: issue.branch_name.clone(),
            debt: Vec::new(),
            sub_issues: Vec::new(),
            diagnostic,
        }
    }

    pub fn unrecoverable(issue_name: &str, diagnostic: String) -> Self {
        Self {
            issue_name: issue_name.to_string(),
            outcome: IssueOutcome::FailedUnrecoverable,
            iterations_used: 0,
            advisor_invocations_used: 0,
            branch_name: None,
            debt: Vec::new(),
            sub_issues: Vec::new(),
            diagnostic,
        }
    }
}
