//! Shared memory: a small key/value store updated at gate lifecycle points
//! and injected into later agents' context.
//!
//! Fixed keys, fixed caps, plain lookup. The store is passed explicitly
//! into the invocation path rather than living as process-wide state, and
//! all writes happen at gate points so sibling issues never observe each
//! other mid-level.

use crate::issue::Issue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

const FAILURE_PATTERN_CAP: usize = 10;
const BUG_PATTERN_CAP: usize = 20;

#[derive(Debug, Default)]
struct MemoryInner {
    codebase_conventions: Option<String>,
    failure_patterns: VecDeque<String>,
    bug_patterns: VecDeque<String>,
    interfaces: BTreeMap<String, String>,
    build_health: Option<String>,
}

/// Serializable snapshot, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MemorySnapshot {
    pub codebase_conventions: Option<String>,
    pub failure_patterns: Vec<String>,
    pub bug_patterns: Vec<String>,
    pub interfaces: BTreeMap<String, String>,
    pub build_health: Option<String>,
}

#[derive(Debug, Default)]
pub struct SharedMemory {
    inner: Mutex<MemoryInner>,
}

impl SharedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Written once, by the first completed coder. Later writes are ignored
    /// so conventions stay stable for the whole run.
    pub fn record_conventions(&self, conventions: &str) {
        let mut inner = self.inner.lock().expect("memory lock");
        if inner.codebase_conventions.is_none() && !conventions.is_empty() {
            inner.codebase_conventions = Some(conventions.to_string());
        }
    }

    pub fn record_failure_pattern(&self, pattern: &str) {
        let mut inner = self.inner.lock().expect("memory lock");
        push_capped(&mut inner.failure_patterns, pattern, FAILURE_PATTERN_CAP);
    }

    pub fn record_bug_pattern(&self, pattern: &str) {
        let mut inner = self.inner.lock().expect("memory lock");
        push_capped(&mut inner.bug_patterns, pattern, BUG_PATTERN_CAP);
    }

    /// Written when an issue completes; read by every dependent's coder.
    pub fn record_interface(&self, issue: &str, summary: &str) {
        let mut inner = self.inner.lock().expect("memory lock");
        inner.interfaces.insert(issue.to_string(), summary.to_string());
    }

    pub fn set_build_health(&self, health: &str) {
        let mut inner = self.inner.lock().expect("memory lock");
        inner.build_health = Some(health.to_string());
    }

    /// Context snippets for a coder working on `issue`.
    pub fn context_for_coder(&self, issue: &Issue) -> Vec<String> {
        let inner = self.inner.lock().expect("memory lock");
        let mut context = Vec::new();
        if let Some(conventions) = &inner.codebase_conventions {
            context.push(format!("Codebase conventions: {conventions}"));
        }
        for dep in &issue.depends_on {
            if let Some(interface) = inner.interfaces.get(dep) {
                context.push(format!("Interface from '{dep}': {interface}"));
            }
        }
        for pattern in &inner.failure_patterns {
            context.push(format!("Known failure pattern: {pattern}"));
        }
        context
    }

    /// Context snippets for advisors and the replanner.
    pub fn context_for_advisor(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("memory lock");
        let mut context = Vec::new();
        if let Some(health) = &inner.build_health {
            context.push(format!("Build health: {health}"));
        }
        for pattern in &inner.failure_patterns {
            context.push(format!("Known failure pattern: {pattern}"));
        }
        for pattern in &inner.bug_patterns {
            context.push(format!("Known bug pattern: {pattern}"));
        }
        context
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let inner = self.inner.lock().expect("memory lock");
        MemorySnapshot {
            codebase_conventions: inner.codebase_conventions.clone(),
            failure_patterns: inner.failure_patterns.iter().cloned().collect(),
            bug_patterns: inner.bug_patterns.iter().cloned().collect(),
            interfaces: inner.interfaces.clone(),
            build_health: inner.build_health.clone(),
        }
    }
}

fn push_capped(queue: &mut VecDeque<String>, entry: &str, cap: usize) {
    if entry.is_empty() {
        return;
    }
    queue.push_back(entry.to_string());
    while queue.len() > cap {
        queue.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conventions_write_once() {
        let memory = SharedMemory::new();
        memory.record_conventions("snake_case modules");
        memory.record_conventions("overwrite attempt");
        assert_eq!(
            memory.snapshot().codebase_conventions.as_deref(),
            Some("snake_case modules")
        );
    }

    #[test]
    fn failure_patterns_are_fifo_capped_at_ten() {
        let memory = SharedMemory::new();
        for i in 0..15 {
            memory.record_failure_pattern(&format!("pattern {i}"));
        }
        let snapshot = memory.snapshot();
        assert_eq!(snapshot.failure_patterns.len(), 10);
        assert_eq!(snapshot.failure_patterns[0], "pattern 5");
        assert_eq!(snapshot.failure_patterns[9], "pattern 14");
    }

    #[test]
    fn bug_patterns_are_fifo_capped_at_twenty() {
        let memory = SharedMemory::new();
        for i in 0..25 {
            memory.record_bug_pattern(&format!("bug {i}"));
        }
        let snapshot = memory.snapshot();
        assert_eq!(snapshot.bug_patterns.len(), 20);
        assert_eq!(snapshot.bug_patterns[0], "bug 5");
    }

    #[test]
    fn coder_context_includes_dependency_interfaces_only() {
        let memory = SharedMemory::new();
        memory.record_conventions("use anyhow");
        memory.record_interface("dep-a", "exports parse()");
        memory.record_interface("unrelated", "exports other()");

        let issue = Issue::new("child", "child").with_depends_on(&["dep-a"]);
        let context = memory.context_for_coder(&issue);
        assert!(context.iter().any(|c| c.contains("use anyhow")));
        assert!(context.iter().any(|c| c.contains("exports parse()")));
        assert!(!context.iter().any(|c| c.contains("exports other()")));
    }

    #[test]
    fn advisor_context_includes_health_and_patterns() {
        let memory = SharedMemory::new();
        memory.set_build_health("2/3 levels merged");
        memory.record_failure_pattern("flaky integration test");
        let context = memory.context_for_advisor();
        assert!(context.iter().any(|c| c.contains("2/3 levels merged")));
        assert!(context.iter().any(|c| c.contains("flaky integration test")));
    }
}
