//! Pure dependency-graph algorithms over issues.
//!
//! These functions never touch state; the planner uses them once at plan
//! time and the scheduler re-runs them after every graph mutation. Level
//! ordering is deterministic: issues keep the order of the input slice
//! within a level, so callers control stability (planner order at plan
//! time, sequence-number order on recompute).

use crate::errors::PlanningError;
use crate::issue::Issue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// A same-level file overlap between issues. Advisory: it informs the
/// merger, it never blocks scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileConflict {
    pub level: usize,
    pub file: String,
    pub issues: Vec<String>,
}

/// Compute parallel execution levels with Kahn's algorithm.
///
/// Dependencies named in `satisfied` are treated as already met (completed
/// issues on recompute). A dependency that is neither in the issue slice
/// nor satisfied is an error, as is any cycle among the given issues.
pub fn compute_levels(
    issues: &[Issue],
    satisfied: &BTreeSet<String>,
) -> Result<Vec<Vec<String>>, PlanningError> {
    let mut seen = BTreeSet::new();
    for issue in issues {
        if !seen.insert(issue.name.clone()) {
            return Err(PlanningError::DuplicateIssue {
                name: issue.name.clone(),
            });
        }
    }
    let name_set: BTreeSet<&str> = issues.iter().map(|i| i.name.as_str()).collect();

    let mut in_degree: HashMap<&str, usize> = issues.iter().map(|i| (i.name.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for issue in issues {
        for dep in &issue.depends_on {
            if satisfied.contains(dep) {
                continue;
            }
            if !name_set.contains(dep.as_str()) {
                return Err(PlanningError::UnknownDependency {
                    issue: issue.name.clone(),
                    dependency: dep.clone(),
                });
            }
            *in_degree.get_mut(issue.name.as_str()).expect("known issue") += 1;
            dependents.entry(dep.as_str()).or_default().push(&issue.name);
        }
    }

    let mut levels: Vec<Vec<String>> = Vec::new();
    let mut ready: VecDeque<&str> = issues
        .iter()
        .map(|i| i.name.as_str())
        .filter(|n| in_degree[n] == 0)
        .collect();
    let mut processed = 0usize;

    while !ready.is_empty() {
        let level: Vec<&str> = ready.drain(..).collect();
        processed += level.len();

        let mut unlocked: BTreeSet<&str> = BTreeSet::new();
        for name in &level {
            if let Some(deps) = dependents.get(name) {
                for dep_name in deps {
                    let degree = in_degree.get_mut(dep_name).expect("known issue");
                    *degree -= 1;
                    if *degree == 0 {
                        unlocked.insert(dep_name);
                    }
                }
            }
        }
        // Preserve input-slice order within the next level.
        for issue in issues {
            if unlocked.contains(issue.name.as_str()) {
                ready.push_back(issue.name.as_str());
            }
        }
        levels.push(level.into_iter().map(String::from).collect());
    }

    if processed != issues.len() {
        let members: Vec<String> = issues
            .iter()
            .map(|i| i.name.as_str())
            .filter(|n| in_degree[n] > 0)
            .map(String::from)
            .collect();
        return Err(PlanningError::Cycle { members });
    }

    Ok(levels)
}

/// All issues transitively dependent on `name`, excluding `name` itself.
pub fn find_downstream(name: &str, issues: &[Issue]) -> BTreeSet<String> {
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for issue in issues {
        for dep in &issue.depends_on {
            dependents.entry(dep.as_str()).or_default().push(&issue.name);
        }
    }

    let mut visited = BTreeSet::new();
    let mut queue: VecDeque<&str> = dependents.get(name).cloned().unwrap_or_default().into();
    while let Some(current) = queue.pop_front() {
        if !visited.insert(current.to_string()) {
            continue;
        }
        if let Some(next) = dependents.get(current) {
            queue.extend(next.iter().copied());
        }
    }
    visited
}

/// Detect files touched by more than one issue within the same level.
pub fn detect_file_conflicts(issues: &[Issue], levels: &[Vec<String>]) -> Vec<FileConflict> {
    let by_name: BTreeMap<&str, &Issue> = issues.iter().map(|i| (i.name.as_str(), i)).collect();
    let mut conflicts = Vec::new();

    for (level_idx, level) in levels.iter().enumerate() {
        let mut file_to_issues: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in level {
            let Some(issue) = by_name.get(name.as_str()) else {
                continue;
            };
            for file in issue.touched_files() {
                file_to_issues.entry(file).or_default().push(name.clone());
            }
        }
        for (file, touching) in file_to_issues {
            if touching.len() > 1 {
                conflicts.push(FileConflict {
                    level: level_idx,
                    file,
                    issues: touching,
                });
            }
        }
    }

    conflicts
}

/// Assign 1-based sequence numbers by flattening levels in order.
///
/// Within a level the input ordering of `issues` is preserved, so the
/// sprint planner's ordering survives into branch names.
pub fn assign_sequence_numbers(issues: &mut [Issue], levels: &[Vec<String>]) {
    let mut counter = 1u32;
    for level in levels {
        let members: BTreeSet<&str> = level.iter().map(String::as_str).collect();
        for issue in issues.iter_mut() {
            if members.contains(issue.name.as_str()) {
                issue.sequence_number = counter;
                counter += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(name: &str, deps: &[&str]) -> Issue {
        Issue::new(name, name).with_depends_on(deps)
    }

    #[test]
    fn levels_linear_chain() {
        let issues = vec![issue("a", &[]), issue("b", &["a"]), issue("c", &["b"])];
        let levels = compute_levels(&issues, &BTreeSet::new()).unwrap();
        assert_eq!(levels, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn levels_diamond() {
        let issues = vec![
            issue("root", &[]),
            issue("left", &["root"]),
            issue("right", &["root"]),
            issue("join", &["left", "right"]),
        ];
        let levels = compute_levels(&issues, &BTreeSet::new()).unwrap();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec!["root"]);
        assert_eq!(levels[1], vec!["left", "right"]);
        assert_eq!(levels[2], vec!["join"]);
    }

    #[test]
    fn levels_single_root_fanout() {
        let issues = vec![
            issue("root", &[]),
            issue("x", &["root"]),
            issue("y", &["root"]),
            issue("z", &["root"]),
        ];
        let levels = compute_levels(&issues, &BTreeSet::new()).unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0], vec!["root"]);
        assert_eq!(levels[1].len(), 3);
    }

    #[test]
    fn empty_issue_list_yields_no_levels() {
        let levels = compute_levels(&[], &BTreeSet::new()).unwrap();
        assert!(levels.is_empty());
    }

    #[test]
    fn cycle_is_fatal_and_names_members() {
        let issues = vec![issue("a", &["b"]), issue("b", &["a"]), issue("c", &[])];
        let err = compute_levels(&issues, &BTreeSet::new()).unwrap_err();
        match err {
            PlanningError::Cycle { members } => {
                assert!(members.contains(&"a".to_string()));
                assert!(members.contains(&"b".to_string()));
                assert!(!members.contains(&"c".to_string()));
            }
            other => panic!("expected Cycle, got {other:?}"),
        }
    }

    #[test]
    fn unknown_dependency_is_fatal() {
        let issues = vec![issue("a", &["ghost"])];
        let err = compute_levels(&issues, &BTreeSet::new()).unwrap_err();
        assert!(matches!(err, PlanningError::UnknownDependency { .. }));
    }

    #[test]
    fn satisfied_dependencies_are_skipped() {
        let satisfied: BTreeSet<String> = ["done".to_string()].into();
        let issues = vec![issue("a", &["done"]), issue("b", &["a"])];
        let levels = compute_levels(&issues, &satisfied).unwrap();
        assert_eq!(levels, vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn duplicate_issue_names_are_rejected() {
        let issues = vec![issue("a", &[]), issue("a", &[])];
        let err = compute_levels(&issues, &BTreeSet::new()).unwrap_err();
        assert!(matches!(err, PlanningError::DuplicateIssue { .. }));
    }

    #[test]
    fn recompute_is_stable_over_unchanged_graph() {
        let mut issues = vec![
            issue("root", &[]),
            issue("mid-b", &["root"]),
            issue("mid-a", &["root"]),
            issue("leaf", &["mid-a", "mid-b"]),
        ];
        let first = compute_levels(&issues, &BTreeSet::new()).unwrap();
        assign_sequence_numbers(&mut issues, &first);

        // Re-sort by sequence number, as the scheduler does on recompute.
        issues.sort_by_key(|i| i.sequence_number);
        let second = compute_levels(&issues, &BTreeSet::new()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn downstream_is_transitive() {
        let issues = vec![
            issue("a", &[]),
            issue("b", &["a"]),
            issue("c", &["b"]),
            issue("d", &[]),
        ];
        let downstream = find_downstream("a", &issues);
        assert_eq!(downstream, ["b".to_string(), "c".to_string()].into());
        assert!(find_downstream("d", &issues).is_empty());
    }

    #[test]
    fn file_conflicts_detected_within_level_only() {
        let mut a = issue("a", &[]);
        a.files_to_modify.insert("src/shared.rs".into());
        let mut b = issue("b", &[]);
        b.files_to_create.insert("src/shared.rs".into());
        let mut c = issue("c", &["a", "b"]);
        c.files_to_modify.insert("src/shared.rs".into());

        let issues = vec![a, b, c];
        let levels = compute_levels(&issues, &BTreeSet::new()).unwrap();
        let conflicts = detect_file_conflicts(&issues, &levels);

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].level, 0);
        assert_eq!(conflicts[0].file, "src/shared.rs");
        assert_eq!(conflicts[0].issues, vec!["a", "b"]);
    }

    #[test]
    fn sequence_numbers_flatten_levels_in_order() {
        let mut issues = vec![
            issue("second", &["first"]),
            issue("first", &[]),
            issue("third", &["second"]),
        ];
        let levels = compute_levels(&issues, &BTreeSet::new()).unwrap();
        assign_sequence_numbers(&mut issues, &levels);

        let by_name: BTreeMap<&str, u32> = issues
            .iter()
            .map(|i| (i.name.as_str(), i.sequence_number))
            .collect();
        assert_eq!(by_name["first"], 1);
        assert_eq!(by_name["second"], 2);
        assert_eq!(by_name["third"], 3);
    }
}
