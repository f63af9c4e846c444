//! Build configuration.
//!
//! One flat table of recognized knobs with the defaults from the external
//! contract. Unknown options are rejected at parse time; the model map
//! resolves per role as: runtime default < `models.default` < `models.<role>`.

use crate::agent::AgentRole;
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Per-invocation wall-clock cap.
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 2700;

/// Per-invocation tool-use cap.
pub const DEFAULT_AGENT_MAX_TURNS: u32 = 150;

/// Configuration for a full build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Inner-loop cap per issue.
    pub max_coding_iterations: u32,
    /// Middle-loop cap per issue.
    pub max_advisor_invocations: u32,
    /// Outer-loop cap per build.
    pub max_replans: u32,
    /// Architect/tech-lead review loop cap.
    pub max_review_iterations: u32,
    /// Post-verify fix-loop cap.
    pub max_verify_fix_cycles: u32,
    /// Disable to treat inner-loop exhaustion as FAILED_ESCALATED immediately.
    pub enable_advisor: bool,
    /// Disable to treat ESCALATED as UNRECOVERABLE.
    pub enable_replanning: bool,
    /// Run the integration tester when the merger asks for it.
    pub enable_integration_testing: bool,
    /// Retries for a failing post-merge integration test run.
    pub max_integration_test_retries: u32,
    /// Toggles the shared-memory store.
    pub enable_learning: bool,
    pub agent_timeout_seconds: u64,
    pub agent_max_turns: u32,
    /// Forwarded to the backend; controls file/shell permissions.
    pub permission_mode: Option<String>,
    /// Backend family: "default"/"cli" spawns the agent CLI, "scripted"
    /// requires an injected backend (tests, dry runs).
    pub runtime: String,
    /// Role → model map. The key "default" overrides the runtime default
    /// for every role; a role key overrides both.
    pub models: BTreeMap<String, String>,
    /// Max parallel issues per level. None means unbounded within a level.
    pub concurrency_cap: Option<usize>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_coding_iterations: 5,
            max_advisor_invocations: 2,
            max_replans: 2,
            max_review_iterations: 1,
            max_verify_fix_cycles: 1,
            enable_advisor: true,
            enable_replanning: true,
            enable_integration_testing: true,
            max_integration_test_retries: 1,
            enable_learning: false,
            agent_timeout_seconds: DEFAULT_AGENT_TIMEOUT_SECS,
            agent_max_turns: DEFAULT_AGENT_MAX_TURNS,
            permission_mode: None,
            runtime: "default".to_string(),
            models: BTreeMap::new(),
            concurrency_cap: None,
        }
    }
}

impl BuildConfig {
    /// Parse a config from a JSON value, rejecting unknown options.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(|e| {
            let msg = e.to_string();
            if let Some(field) = extract_unknown_field(&msg) {
                ConfigError::UnknownOption(field)
            } else {
                ConfigError::Invalid(msg)
            }
        })
    }

    /// Resolve the model for a role: runtime default < models.default <
    /// models.<role>.
    pub fn model_for(&self, role: AgentRole) -> String {
        if let Some(model) = self.models.get(role.key()) {
            return model.clone();
        }
        if let Some(model) = self.models.get("default") {
            return model.clone();
        }
        self.runtime_default_model().to_string()
    }

    fn runtime_default_model(&self) -> &str {
        "sonnet"
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_seconds)
    }
}

fn extract_unknown_field(message: &str) -> Option<String> {
    let rest = message.strip_prefix("unknown field `")?;
    let end = rest.find('`')?;
    Some(rest[..end].to_string())
}
