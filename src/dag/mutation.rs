//! Runtime graph mutation: advisor decisions, replan application, splits,
//! and failure propagation.
//!
//! Agents only *decide*; the scheduler applies every mutation here so the
//! graph invariants live in one place. An invalid mutation (cycle, orphaned
//! dependency) is rejected and the run degrades to CONTINUE rather than
//! aborting on an orchestration failure.

use crate::dag::graph::find_downstream;
use crate::dag::state::DagState;
use crate::issue::{DebtItem, Issue, IssueResult};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Decision returned by the issue advisor after an inner-loop failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdvisorDecision {
    /// Drop the named acceptance criteria (recording them as debt) and
    /// retry the coding loop.
    RetryModified {
        dropped_criteria: Vec<String>,
        #[serde(default)]
        justification: String,
    },
    /// Retry with a changed approach.
    RetryApproach { approach_changes: String },
    /// Replace the issue with smaller sub-issues.
    Split { sub_issues: Vec<Issue> },
    /// Accept the work as-is, recording the shortfall as debt.
    AcceptWithDebt { debt: Vec<DebtItem> },
    /// Hand the failure to the replanner.
    EscalateToReplan {
        #[serde(default)]
        reason: String,
    },
}

impl AdvisorDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::RetryModified { .. } | Self::RetryApproach { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::RetryModified { .. } => "retry_modified",
            Self::RetryApproach { .. } => "retry_approach",
            Self::Split { .. } => "split",
            Self::AcceptWithDebt { .. } => "accept_with_debt",
            Self::EscalateToReplan { .. } => "escalate_to_replan",
        }
    }
}

/// Field-level update to a pending issue, from the replanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueUpdate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub acceptance_criteria: Option<Vec<String>>,
    #[serde(default)]
    pub depends_on: Option<BTreeSet<String>>,
    #[serde(default)]
    pub approach_notes: Option<String>,
}

/// Decision returned by the replanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReplanDecision {
    /// Proceed unchanged; downstream of the failures is skipped and
    /// annotated.
    Continue {
        #[serde(default)]
        rationale: String,
    },
    /// Restructure the remaining graph.
    ModifyDag {
        #[serde(default)]
        remove: Vec<String>,
        #[serde(default)]
        skip: Vec<String>,
        #[serde(default)]
        update: Vec<IssueUpdate>,
        #[serde(default)]
        add: Vec<Issue>,
        #[serde(default)]
        rationale: String,
    },
    /// Drop non-essential issues.
    ReduceScope {
        skip: Vec<String>,
        #[serde(default)]
        rationale: String,
    },
    /// The build cannot recover.
    Abort {
        #[serde(default)]
        rationale: String,
    },
}

impl ReplanDecision {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Continue { .. } => "continue",
            Self::ModifyDag { .. } => "modify_dag",
            Self::ReduceScope { .. } => "reduce_scope",
            Self::Abort { .. } => "abort",
        }
    }

    pub fn rationale(&self) -> &str {
        match self {
            Self::Continue { rationale }
            | Self::ModifyDag { rationale, .. }
            | Self::ReduceScope { rationale, .. }
            | Self::Abort { rationale } => rationale,
        }
    }
}

/// One replan invocation, preserved in history and fed back to the
/// replanner on its next invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplanRecord {
    pub decision: ReplanDecision,
    /// Whether the decision was applied as-is or degraded to CONTINUE.
    pub applied: bool,
    #[serde(default)]
    pub note: String,
}

/// Apply a MODIFY_DAG or REDUCE_SCOPE decision.
///
/// Mutation order: remove, skip, update, add, then validate by recomputing
/// levels over the remaining issues (completed issues count as satisfied).
/// On validation failure the state is left untouched and an error is
/// returned; the caller falls back to CONTINUE.
pub fn apply_replan(state: &mut DagState, decision: &ReplanDecision) -> Result<()> {
    let (remove, skip, update, add) = match decision {
        ReplanDecision::ModifyDag {
            remove,
            skip,
            update,
            add,
            ..
        } => (remove.clone(), skip.clone(), update.clone(), add.clone()),
        ReplanDecision::ReduceScope { skip, .. } => {
            (Vec::new(), skip.clone(), Vec::new(), Vec::new())
        }
        other => anyhow::bail!("decision '{}' is not a graph mutation", other.kind()),
    };

    // Work on a scratch copy so a rejected mutation leaves no trace.
    let mut scratch = state.clone();

    for name in &remove {
        if !scratch.is_pending(name) {
            warn!(issue = %name, "replanner tried to remove a non-pending issue; ignoring");
            continue;
        }
        // Removed issues stay in the state as skipped so the final result
        // accounts for them.
        scratch.mark_skipped(name, "removed by replanner");
    }

    for name in &skip {
        if scratch.is_pending(name) {
            scratch.mark_skipped(name, "descoped by replanner");
        }
    }

    for patch in &update {
        if !scratch.issues.contains_key(&patch.name) {
            anyhow::bail!("replanner updated unknown issue '{}'", patch.name);
        }
        if !scratch.is_pending(&patch.name) {
            warn!(issue = %patch.name, "replanner tried to update a non-pending issue; ignoring");
            continue;
        }
        let Some(issue) = scratch.issues.get_mut(&patch.name) else {
            continue;
        };
        if let Some(description) = &patch.description {
            issue.description = description.clone();
        }
        if let Some(criteria) = &patch.acceptance_criteria {
            issue.acceptance_criteria = criteria.clone();
        }
        if let Some(deps) = &patch.depends_on {
            issue.depends_on = deps.clone();
        }
        if let Some(notes) = &patch.approach_notes {
            issue.approach_changes = notes.clone();
        }
    }

    let mut next_seq = scratch.next_sequence_number();
    for mut issue in add {
        if scratch.issues.contains_key(&issue.name) {
            anyhow::bail!("replanner added duplicate issue '{}'", issue.name);
        }
        if issue.sequence_number == 0 {
            issue.sequence_number = next_seq;
            next_seq += 1;
        }
        scratch.issues.insert(issue.name.clone(), issue);
    }

    // Validation: a cycle or orphaned dependency rejects the whole decision.
    scratch.recompute_levels()?;
    scratch.check_invariants()?;

    *state = scratch;
    info!(levels = state.levels.len(), "replan applied; levels rebuilt");
    Ok(())
}

/// Insert split sub-issues in place of a failed parent.
///
/// Sub-issues inherit the parent's upstream dependencies and the parent's
/// dependents: every pending issue that depended on the parent now depends
/// on each sub-issue. Fresh sequence numbers keep branch names unique.
pub fn insert_split(state: &mut DagState, parent: &str, sub_issues: Vec<Issue>) -> Result<()> {
    if sub_issues.is_empty() {
        anyhow::bail!("split of '{parent}' produced no sub-issues");
    }
    let parent_issue = state
        .issues
        .get(parent)
        .ok_or_else(|| anyhow::anyhow!("split parent '{parent}' is unknown"))?
        .clone();

    let mut scratch = state.clone();
    let sub_names: Vec<String> = sub_issues.iter().map(|i| i.name.clone()).collect();

    let mut next_seq = scratch.next_sequence_number();
    for mut sub in sub_issues {
        if scratch.issues.contains_key(&sub.name) {
            anyhow::bail!("split sub-issue '{}' collides with an existing issue", sub.name);
        }
        // Carry the parent's upstream edges; deps on completed issues are
        // satisfied at level computation.
        for dep in &parent_issue.depends_on {
            sub.depends_on.insert(dep.clone());
        }
        sub.debt_notes.extend(parent_issue.debt_notes.iter().cloned());
        if sub.sequence_number == 0 {
            sub.sequence_number = next_seq;
            next_seq += 1;
        }
        scratch.issues.insert(sub.name.clone(), sub);
    }

    // Dependents of the parent now wait on every sub-issue.
    for issue in scratch.issues.values_mut() {
        if issue.depends_on.remove(parent) {
            for sub_name in &sub_names {
                issue.depends_on.insert(sub_name.clone());
            }
        }
    }

    scratch.recompute_levels()?;
    scratch.check_invariants()?;

    *state = scratch;
    info!(parent, subs = ?sub_names, "split applied; levels rebuilt");
    Ok(())
}

/// Skip everything transitively downstream of the given failures and
/// annotate surviving dependents with what was not delivered.
pub fn skip_downstream_of_failures(state: &mut DagState, failed: &[IssueResult]) {
    let issues: Vec<Issue> = state.issues.values().cloned().collect();
    for failure in failed {
        for name in find_downstream(&failure.issue_name, &issues) {
            if state.is_pending(&name) {
                state.mark_skipped(
                    &name,
                    &format!("skipped: upstream issue '{}' failed", failure.issue_name),
                );
            }
        }
    }
}

/// Append failure notes to pending transitive dependents of each failure.
pub fn annotate_downstream_failures(state: &mut DagState, failed: &[IssueResult]) {
    let issues: Vec<Issue> = state.issues.values().cloned().collect();
    for failure in failed {
        let note = format!(
            "Upstream issue '{}' was not delivered ({}). You may need workarounds or stubs \
             for functionality it was supposed to provide.",
            failure.issue_name,
            if failure.diagnostic.is_empty() {
                "no diagnostic"
            } else {
                &failure.diagnostic
            },
        );
        for name in find_downstream(&failure.issue_name, &issues) {
            if state.is_pending(&name)
                && let Some(issue) = state.issues.get_mut(&name)
            {
                issue.failure_notes.push(note.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::state::IssueStatus;
    use crate::issue::IssueOutcome;
    use std::path::Path;

    fn issue(name: &str, deps: &[&str], seq: u32) -> Issue {
        let mut issue = Issue::new(name, name).with_depends_on(deps);
        issue.sequence_number = seq;
        issue
    }

    fn state_with(issues: Vec<Issue>, levels: Vec<Vec<&str>>) -> DagState {
        let levels = levels
            .into_iter()
            .map(|l| l.into_iter().map(String::from).collect())
            .collect();
        DagState::new(Path::new("/repo"), Path::new("/artifacts"), issues, levels)
    }

    fn failed(name: &str) -> IssueResult {
        IssueResult {
            issue_name: name.to_string(),
            outcome: IssueOutcome::FailedUnrecoverable,
            iterations_used: 5,
            advisor_invocations_used: 2,
            branch_name: None,
            debt: Vec::new(),
            sub_issues: Vec::new(),
            diagnostic: "kept failing tests".into(),
        }
    }

    #[test]
    fn modify_dag_removes_updates_and_relevels() {
        // a failed; b and c depend on it.
        let mut state = state_with(
            vec![
                issue("a", &[], 1),
                issue("b", &["a"], 2),
                issue("c", &["a"], 3),
            ],
            vec![vec!["a"], vec!["b", "c"]],
        );
        state.record_result(failed("a"));
        state.current_level = 1;

        let decision = ReplanDecision::ModifyDag {
            remove: vec!["c".into()],
            skip: Vec::new(),
            update: vec![IssueUpdate {
                name: "b".into(),
                description: None,
                acceptance_criteria: None,
                depends_on: Some(BTreeSet::new()),
                approach_notes: Some("stub the missing interface".into()),
            }],
            add: Vec::new(),
            rationale: "drop c, unblock b".into(),
        };

        apply_replan(&mut state, &decision).unwrap();

        assert_eq!(state.current_level, 0);
        assert_eq!(state.levels, vec![vec!["b".to_string()]]);
        assert_eq!(state.status_of("c"), IssueStatus::Skipped);
        assert_eq!(state.issues["b"].approach_changes, "stub the missing interface");
        state.check_invariants().unwrap();
    }

    #[test]
    fn modify_dag_assigns_fresh_sequence_numbers_to_added_issues() {
        let mut state = state_with(vec![issue("a", &[], 7)], vec![vec!["a"]]);
        state.record_result(failed("a"));

        let decision = ReplanDecision::ModifyDag {
            remove: Vec::new(),
            skip: Vec::new(),
            update: Vec::new(),
            add: vec![Issue::new("a-lite", "smaller attempt")],
            rationale: "retry smaller".into(),
        };
        apply_replan(&mut state, &decision).unwrap();
        assert_eq!(state.issues["a-lite"].sequence_number, 8);
    }

    #[test]
    fn replan_cycle_is_rejected_and_state_untouched() {
        let mut state = state_with(
            vec![issue("a", &[], 1), issue("b", &["a"], 2)],
            vec![vec!["a"], vec!["b"]],
        );
        let before = state.clone();

        let decision = ReplanDecision::ModifyDag {
            remove: Vec::new(),
            skip: Vec::new(),
            update: vec![IssueUpdate {
                name: "a".into(),
                description: None,
                acceptance_criteria: None,
                depends_on: Some(["b".to_string()].into()),
                approach_notes: None,
            }],
            add: Vec::new(),
            rationale: "oops".into(),
        };

        assert!(apply_replan(&mut state, &decision).is_err());
        assert_eq!(state, before);
    }

    #[test]
    fn replan_orphan_dependency_is_rejected() {
        let mut state = state_with(vec![issue("a", &[], 1)], vec![vec!["a"]]);
        let decision = ReplanDecision::ModifyDag {
            remove: Vec::new(),
            skip: Vec::new(),
            update: Vec::new(),
            add: vec![Issue::new("new", "new").with_depends_on(&["ghost"])],
            rationale: "bad add".into(),
        };
        assert!(apply_replan(&mut state, &decision).is_err());
    }

    #[test]
    fn remove_of_completed_issue_is_ignored() {
        let mut state = state_with(
            vec![issue("a", &[], 1), issue("b", &["a"], 2)],
            vec![vec!["a"], vec!["b"]],
        );
        let mut done = failed("a");
        done.outcome = IssueOutcome::Completed;
        state.record_result(done);

        let decision = ReplanDecision::ModifyDag {
            remove: vec!["a".into()],
            skip: Vec::new(),
            update: Vec::new(),
            add: Vec::new(),
            rationale: "cannot remove completed work".into(),
        };
        apply_replan(&mut state, &decision).unwrap();
        assert_eq!(state.status_of("a"), IssueStatus::Completed);
    }

    #[test]
    fn reduce_scope_skips_issues() {
        let mut state = state_with(
            vec![issue("a", &[], 1), issue("b", &[], 2)],
            vec![vec!["a", "b"]],
        );
        let decision = ReplanDecision::ReduceScope {
            skip: vec!["b".into()],
            rationale: "not essential".into(),
        };
        apply_replan(&mut state, &decision).unwrap();
        assert_eq!(state.status_of("b"), IssueStatus::Skipped);
        assert_eq!(state.levels, vec![vec!["a".to_string()]]);
    }

    #[test]
    fn split_inherits_dependents_and_upstream_deps() {
        // upstream -> parent -> dependent
        let mut state = state_with(
            vec![
                issue("upstream", &[], 1),
                issue("parent", &["upstream"], 2),
                issue("dependent", &["parent"], 3),
            ],
            vec![vec!["upstream"], vec!["parent"], vec!["dependent"]],
        );
        let mut done = failed("upstream");
        done.outcome = IssueOutcome::Completed;
        state.record_result(done);

        let mut split_result = failed("parent");
        split_result.outcome = IssueOutcome::FailedNeedsSplit;
        state.record_result(split_result);

        let subs = vec![
            Issue::new("parent-core", "core"),
            Issue::new("parent-edge", "edge").with_depends_on(&["parent-core"]),
        ];
        insert_split(&mut state, "parent", subs).unwrap();

        // Sub-issues carry the parent's upstream dependency.
        assert!(state.issues["parent-core"].depends_on.contains("upstream"));
        // The dependent now waits on both sub-issues.
        let deps = &state.issues["dependent"].depends_on;
        assert!(deps.contains("parent-core"));
        assert!(deps.contains("parent-edge"));
        assert!(!deps.contains("parent"));

        // Levels: core, then edge, then dependent.
        assert_eq!(
            state.levels,
            vec![
                vec!["parent-core".to_string()],
                vec!["parent-edge".to_string()],
                vec!["dependent".to_string()],
            ]
        );
        state.check_invariants().unwrap();
    }

    #[test]
    fn split_sub_issues_get_fresh_sequence_numbers() {
        let mut state = state_with(vec![issue("parent", &[], 5)], vec![vec!["parent"]]);
        let mut split_result = failed("parent");
        split_result.outcome = IssueOutcome::FailedNeedsSplit;
        state.record_result(split_result);

        insert_split(
            &mut state,
            "parent",
            vec![Issue::new("s1", "s1"), Issue::new("s2", "s2")],
        )
        .unwrap();
        assert_eq!(state.issues["s1"].sequence_number, 6);
        assert_eq!(state.issues["s2"].sequence_number, 7);
    }

    #[test]
    fn empty_split_is_rejected() {
        let mut state = state_with(vec![issue("parent", &[], 1)], vec![vec!["parent"]]);
        assert!(insert_split(&mut state, "parent", Vec::new()).is_err());
    }

    #[test]
    fn skip_downstream_marks_transitive_dependents() {
        let mut state = state_with(
            vec![
                issue("a", &[], 1),
                issue("b", &["a"], 2),
                issue("c", &["b"], 3),
                issue("d", &[], 4),
            ],
            vec![vec!["a", "d"], vec!["b"], vec!["c"]],
        );
        state.record_result(failed("a"));

        skip_downstream_of_failures(&mut state, &[failed("a")]);
        assert_eq!(state.status_of("b"), IssueStatus::Skipped);
        assert_eq!(state.status_of("c"), IssueStatus::Skipped);
        assert_eq!(state.status_of("d"), IssueStatus::Pending);
    }

    #[test]
    fn annotate_downstream_adds_failure_notes() {
        let mut state = state_with(
            vec![issue("a", &[], 1), issue("b", &["a"], 2)],
            vec![vec!["a"], vec!["b"]],
        );
        state.record_result(failed("a"));

        annotate_downstream_failures(&mut state, &[failed("a")]);
        let notes = &state.issues["b"].failure_notes;
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("'a'"));
        assert!(notes[0].contains("kept failing tests"));
    }

    #[test]
    fn advisor_decision_serde_round_trip() {
        let decision = AdvisorDecision::RetryModified {
            dropped_criteria: vec!["AC2".into()],
            justification: "cannot satisfy with current design".into(),
        };
        let json = serde_json::to_string(&decision).unwrap();
        assert!(json.contains("\"decision\":\"retry_modified\""));
        let parsed: AdvisorDecision = serde_json::from_str(&json).unwrap();
        assert_eq!(decision, parsed);
    }

    #[test]
    fn replan_decision_serde_uses_action_tag() {
        let json = r#"{"action":"reduce_scope","skip":["x"],"rationale":"cut"}"#;
        let decision: ReplanDecision = serde_json::from_str(json).unwrap();
        assert_eq!(decision.kind(), "reduce_scope");
        assert_eq!(decision.rationale(), "cut");
    }
}
