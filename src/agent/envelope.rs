//! The self-describing response envelope every backend must produce.
//!
//! A backend returns one envelope per invocation: a status discriminant, a
//! payload on success, and an error message otherwise. The invoker maps
//! non-success statuses to typed failures and validates success payloads
//! against the role's response schema.

use crate::agent::AgentRole;
use crate::errors::InvocationError;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;

/// Status discriminant of an agent envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Success,
    Failed,
    Error,
    Cancelled,
    TimedOut,
}

impl fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvelopeStatus::Success => "success",
            EnvelopeStatus::Failed => "failed",
            EnvelopeStatus::Error => "error",
            EnvelopeStatus::Cancelled => "cancelled",
            EnvelopeStatus::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// One agent invocation's result envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEnvelope {
    pub status: EnvelopeStatus,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub turns_used: u32,
}

impl AgentEnvelope {
    pub fn success(payload: serde_json::Value) -> Self {
        Self {
            status: EnvelopeStatus::Success,
            payload,
            error_message: String::new(),
            turns_used: 0,
        }
    }

    pub fn failure(status: EnvelopeStatus, message: &str) -> Self {
        Self {
            status,
            payload: serde_json::Value::Null,
            error_message: message.to_string(),
            turns_used: 0,
        }
    }

    /// Unwrap the payload or convert the terminal status into a typed error.
    pub fn into_payload(self) -> Result<serde_json::Value, InvocationError> {
        match self.status {
            EnvelopeStatus::Success => Ok(self.payload),
            EnvelopeStatus::Cancelled => Err(InvocationError::Cancelled),
            status => Err(InvocationError::Status {
                status: status.to_string(),
                message: self.error_message,
            }),
        }
    }
}

/// Validate a success payload against a role's response schema.
pub fn parse_payload<T: DeserializeOwned>(
    role: AgentRole,
    payload: serde_json::Value,
) -> Result<T, InvocationError> {
    serde_json::from_value(payload).map_err(|e| InvocationError::SchemaMismatch {
        role: role.key().to_string(),
        details: e.to_string(),
    })
}
