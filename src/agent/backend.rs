//! Agent backends: the transport under the invocation layer.
//!
//! The `CliBackend` spawns an agent CLI process per invocation, feeds it the
//! role prompt, and extracts the response envelope from the tail of stdout.
//! The process is spawned with `kill_on_drop` so an invoker-level timeout
//! also reaps the child.

use crate::agent::envelope::AgentEnvelope;
use crate::agent::role::{AgentRole, Tool};
use crate::errors::InvocationError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Everything a backend needs to run one agent invocation.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub role: AgentRole,
    /// Role-specific structured inputs. Issue-scoped roles carry an
    /// `issue_name` key so transcripts and scripted routing can key on it.
    pub inputs: serde_json::Value,
    /// Injected context snippets (shared-memory entries, feedback).
    pub context: Vec<String>,
    pub tools: Vec<Tool>,
    pub model: String,
    pub max_turns: u32,
    pub permission_mode: Option<String>,
    /// Directory the agent operates in (repo root or issue worktree).
    pub workdir: PathBuf,
}

impl InvocationRequest {
    /// The issue this invocation is scoped to, if any.
    pub fn issue_name(&self) -> Option<&str> {
        self.inputs.get("issue_name").and_then(|v| v.as_str())
    }
}

/// A language-model backend able to run one stateless agent invocation.
///
/// Implementations must not keep conversational memory across calls; any
/// cross-agent knowledge flows through the DAG state or the shared-memory
/// store.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn run(&self, request: &InvocationRequest) -> Result<AgentEnvelope, InvocationError>;
}

/// Default backend: one CLI process per invocation.
pub struct CliBackend {
    command: String,
}

impl CliBackend {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }

    /// Resolve the command from `FOREMAN_AGENT_CMD`, defaulting to `claude`.
    pub fn from_env() -> Self {
        let command =
            std::env::var("FOREMAN_AGENT_CMD").unwrap_or_else(|_| "claude".to_string());
        Self::new(&command)
    }

    fn build_args(&self, request: &InvocationRequest) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
            "--model".to_string(),
            request.model.clone(),
            "--max-turns".to_string(),
            request.max_turns.to_string(),
        ];
        let tools: Vec<String> = request.tools.iter().map(|t| t.to_string()).collect();
        args.push("--allowed-tools".to_string());
        args.push(tools.join(","));
        if let Some(mode) = &request.permission_mode {
            args.push("--permission-mode".to_string());
            args.push(mode.clone());
        }
        args
    }

    fn build_prompt(&self, request: &InvocationRequest) -> String {
        let mut prompt = format!(
            "You are the {} agent in an autonomous software-engineering build.\n\n\
             Structured inputs:\n{}\n",
            request.role.key(),
            serde_json::to_string_pretty(&request.inputs).unwrap_or_default(),
        );
        if !request.context.is_empty() {
            prompt.push_str("\nContext from earlier in this build:\n");
            for snippet in &request.context {
                prompt.push_str("- ");
                prompt.push_str(snippet);
                prompt.push('\n');
            }
        }
        prompt.push_str(
            "\nWork inside the current directory. When finished, print exactly one JSON \
             envelope as the final line of output:\n\
             {\"status\":\"success\",\"payload\":{...}}\n\
             Valid statuses: success, failed, error, cancelled, timed_out. On non-success, \
             include an \"error_message\" field instead of a payload.\n",
        );
        prompt
    }

    /// The envelope is the last stdout line that parses as one. Agents are
    /// free to print progress above it.
    fn extract_envelope(stdout: &str) -> Option<AgentEnvelope> {
        for line in stdout.lines().rev() {
            let trimmed = line.trim();
            if !trimmed.starts_with('{') {
                continue;
            }
            if let Ok(envelope) = serde_json::from_str::<AgentEnvelope>(trimmed) {
                return Some(envelope);
            }
        }
        None
    }
}

#[async_trait]
impl AgentBackend for CliBackend {
    async fn run(&self, request: &InvocationRequest) -> Result<AgentEnvelope, InvocationError> {
        let prompt = self.build_prompt(request);
        let args = self.build_args(request);

        debug!(role = request.role.key(), model = %request.model, "spawning agent process");

        let mut child = Command::new(&self.command)
            .args(&args)
            .current_dir(&request.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InvocationError::Transport(format!("spawn {}: {e}", self.command)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| InvocationError::Transport(format!("write prompt: {e}")))?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| InvocationError::Transport(format!("wait for agent: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Some(envelope) = Self::extract_envelope(&stdout) {
            return Ok(envelope);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(InvocationError::Transport(format!(
            "agent exited with {} and produced no envelope; stderr: {}",
            output.status,
            stderr.chars().take(500).collect::<String>(),
        )))
    }
}
