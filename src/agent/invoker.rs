//! The uniform invocation contract over any backend.
//!
//! One call per role: build the request from the role's tool matrix and the
//! resolved model, enforce the per-call timeout, map the envelope to a typed
//! result, and append a transcript line. The layer performs no retries of
//! its own; retry policy belongs to the scheduler.

use crate::agent::backend::{AgentBackend, InvocationRequest};
use crate::agent::envelope::parse_payload;
use crate::agent::role::AgentRole;
use crate::config::BuildConfig;
use crate::errors::InvocationError;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Stateless invoker shared by every subsystem that calls agents.
pub struct AgentInvoker {
    backend: Arc<dyn AgentBackend>,
    timeout: Duration,
    max_turns: u32,
    permission_mode: Option<String>,
    models: std::collections::BTreeMap<String, String>,
    runtime_default_model: String,
    /// When set, one JSONL transcript line is appended per invocation.
    log_dir: Option<PathBuf>,
}

impl AgentInvoker {
    pub fn new(backend: Arc<dyn AgentBackend>, config: &BuildConfig) -> Self {
        Self {
            backend,
            timeout: config.agent_timeout(),
            max_turns: config.agent_max_turns,
            permission_mode: config.permission_mode.clone(),
            models: config.models.clone(),
            runtime_default_model: "sonnet".to_string(),
            log_dir: None,
        }
    }

    pub fn with_log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = Some(dir);
        self
    }

    fn model_for(&self, role: AgentRole) -> String {
        self.models
            .get(role.key())
            .or_else(|| self.models.get("default"))
            .cloned()
            .unwrap_or_else(|| self.runtime_default_model.clone())
    }

    /// Invoke one role and validate the payload against `T`.
    ///
    /// Every terminal condition arrives as an `InvocationError`; nothing
    /// here panics or raises past the caller.
    pub async fn invoke<T: DeserializeOwned>(
        &self,
        role: AgentRole,
        inputs: serde_json::Value,
        workdir: &Path,
        context: Vec<String>,
    ) -> Result<T, InvocationError> {
        let request = InvocationRequest {
            role,
            inputs,
            context,
            tools: role.tools().to_vec(),
            model: self.model_for(role),
            max_turns: self.max_turns,
            permission_mode: self.permission_mode.clone(),
            workdir: workdir.to_path_buf(),
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.backend.run(&request)).await;

        let result = match outcome {
            Ok(inner) => inner,
            Err(_) => Err(InvocationError::Timeout {
                seconds: self.timeout.as_secs(),
            }),
        };

        let elapsed = started.elapsed();
        match &result {
            Ok(envelope) => {
                debug!(role = role.key(), status = %envelope.status, ?elapsed, "agent returned");
                self.append_transcript(role, &request, &envelope.status.to_string(), elapsed);
            }
            Err(err) => {
                debug!(role = role.key(), error = %err, ?elapsed, "agent failed");
                self.append_transcript(role, &request, "transport_error", elapsed);
            }
        }

        let payload = result?.into_payload()?;
        parse_payload(role, payload)
    }

    /// Transcript lines carry structured metadata, never prompt text.
    fn append_transcript(
        &self,
        role: AgentRole,
        request: &InvocationRequest,
        status: &str,
        elapsed: Duration,
    ) {
        let Some(dir) = &self.log_dir else {
            return;
        };
        let line = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "role": role.key(),
            "issue": request.issue_name(),
            "model": request.model,
            "status": status,
            "duration_ms": elapsed.as_millis() as u64,
        });
        let path = dir.join(format!("{}.jsonl", role.key()));
        let entry = format!("{line}\n");
        if let Err(e) = append_line(&path, &entry) {
            warn!(path = %path.display(), error = %e, "failed to append agent transcript");
        }
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::envelope::{AgentEnvelope, EnvelopeStatus};
    use crate::agent::scripted::ScriptedBackend;
    use serde_json::json;

    #[derive(Debug, serde::Deserialize)]
    struct Verdict {
        approved: bool,
    }

    fn invoker_with(backend: ScriptedBackend) -> AgentInvoker {
        AgentInvoker::new(Arc::new(backend), &BuildConfig::default())
    }

    #[tokio::test]
    async fn invoke_returns_typed_payload() {
        let backend = ScriptedBackend::new();
        backend.enqueue_success(AgentRole::TechLead, json!({"approved": true}));
        let invoker = invoker_with(backend);

        let verdict: Verdict = invoker
            .invoke(AgentRole::TechLead, json!({}), Path::new("."), Vec::new())
            .await
            .unwrap();
        assert!(verdict.approved);
    }

    #[tokio::test]
    async fn invoke_surfaces_schema_mismatch() {
        let backend = ScriptedBackend::new();
        backend.enqueue_success(AgentRole::TechLead, json!({"approved": "maybe"}));
        let invoker = invoker_with(backend);

        let result: Result<Verdict, _> = invoker
            .invoke(AgentRole::TechLead, json!({}), Path::new("."), Vec::new())
            .await;
        assert!(matches!(
            result,
            Err(InvocationError::SchemaMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn invoke_maps_terminal_statuses() {
        let backend = ScriptedBackend::new();
        backend.enqueue(
            AgentRole::Coder,
            AgentEnvelope::failure(EnvelopeStatus::TimedOut, "ran out of budget"),
        );
        let invoker = invoker_with(backend);

        let result: Result<Verdict, _> = invoker
            .invoke(
                AgentRole::Coder,
                json!({"issue_name": "a"}),
                Path::new("."),
                Vec::new(),
            )
            .await;
        match result {
            Err(InvocationError::Status { status, .. }) => assert_eq!(status, "timed_out"),
            other => panic!("expected Status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transcript_line_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend::new();
        backend.enqueue_success(AgentRole::Verifier, json!({"approved": true}));
        let invoker = invoker_with(backend).with_log_dir(dir.path().to_path_buf());

        let _: Verdict = invoker
            .invoke(AgentRole::Verifier, json!({}), Path::new("."), Vec::new())
            .await
            .unwrap();

        let log = std::fs::read_to_string(dir.path().join("verifier.jsonl")).unwrap();
        assert!(log.contains("\"role\":\"verifier\""));
        assert!(log.contains("\"status\":\"success\""));
    }
}
