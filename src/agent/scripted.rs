//! Deterministic scripted backend.
//!
//! Replays pre-loaded envelopes instead of talking to a language model.
//! Used by the test suite and by dry runs (`runtime = "scripted"`).
//! Responses resolve in order: per-issue queue, per-role queue, per-issue
//! default, per-role default. A miss is a transport error so a test that
//! under-scripts a scenario fails loudly instead of hanging.

use crate::agent::backend::{AgentBackend, InvocationRequest};
use crate::agent::envelope::AgentEnvelope;
use crate::agent::role::AgentRole;
use crate::errors::InvocationError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    queues: HashMap<String, VecDeque<AgentEnvelope>>,
    defaults: HashMap<String, AgentEnvelope>,
    calls: Vec<String>,
}

/// A backend whose every response was scripted up front.
#[derive(Default)]
pub struct ScriptedBackend {
    inner: Mutex<Inner>,
}

fn role_key(role: AgentRole) -> String {
    role.key().to_string()
}

fn issue_key(role: AgentRole, issue: &str) -> String {
    format!("{}:{}", role.key(), issue)
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one envelope for the next invocation of a role.
    pub fn enqueue(&self, role: AgentRole, envelope: AgentEnvelope) {
        let mut inner = self.inner.lock().expect("scripted backend lock");
        inner
            .queues
            .entry(role_key(role))
            .or_default()
            .push_back(envelope);
    }

    /// Queue one envelope for the next invocation of a role scoped to an
    /// issue (matched against the request's `issue_name` input).
    pub fn enqueue_for_issue(&self, role: AgentRole, issue: &str, envelope: AgentEnvelope) {
        let mut inner = self.inner.lock().expect("scripted backend lock");
        inner
            .queues
            .entry(issue_key(role, issue))
            .or_default()
            .push_back(envelope);
    }

    /// Set the fallback envelope replayed whenever a role's queue is empty.
    pub fn set_default(&self, role: AgentRole, envelope: AgentEnvelope) {
        let mut inner = self.inner.lock().expect("scripted backend lock");
        inner.defaults.insert(role_key(role), envelope);
    }

    /// Set the fallback envelope for a role scoped to one issue.
    pub fn set_default_for_issue(&self, role: AgentRole, issue: &str, envelope: AgentEnvelope) {
        let mut inner = self.inner.lock().expect("scripted backend lock");
        inner.defaults.insert(issue_key(role, issue), envelope);
    }

    pub fn enqueue_success(&self, role: AgentRole, payload: serde_json::Value) {
        self.enqueue(role, AgentEnvelope::success(payload));
    }

    pub fn default_success(&self, role: AgentRole, payload: serde_json::Value) {
        self.set_default(role, AgentEnvelope::success(payload));
    }

    /// Roles invoked so far, in order. Lets tests assert an agent was never
    /// consulted.
    pub fn call_log(&self) -> Vec<String> {
        self.inner.lock().expect("scripted backend lock").calls.clone()
    }

    fn resolve(&self, request: &InvocationRequest) -> Option<AgentEnvelope> {
        let mut inner = self.inner.lock().expect("scripted backend lock");
        let role = request.role;
        let issue = request.issue_name().map(|s| s.to_string());

        let log_entry = match &issue {
            Some(name) => format!("{}:{}", role.key(), name),
            None => role.key().to_string(),
        };
        inner.calls.push(log_entry);

        if let Some(name) = &issue {
            let key = issue_key(role, name);
            if let Some(queue) = inner.queues.get_mut(&key)
                && let Some(envelope) = queue.pop_front()
            {
                return Some(envelope);
            }
        }
        if let Some(queue) = inner.queues.get_mut(&role_key(role))
            && let Some(envelope) = queue.pop_front()
        {
            return Some(envelope);
        }
        if let Some(name) = &issue
            && let Some(envelope) = inner.defaults.get(&issue_key(role, name))
        {
            return Some(envelope.clone());
        }
        inner.defaults.get(&role_key(role)).cloned()
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn run(&self, request: &InvocationRequest) -> Result<AgentEnvelope, InvocationError> {
        self.resolve(request).ok_or_else(|| {
            InvocationError::Transport(format!(
                "no scripted response for role '{}'{}",
                request.role.key(),
                request
                    .issue_name()
                    .map(|n| format!(" (issue '{n}')"))
                    .unwrap_or_default(),
            ))
        })
    }
}
