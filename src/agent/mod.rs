//! Agent invocation layer.
//!
//! Turns each agent role into a uniform call contract over a pluggable
//! backend: `invoke(role, inputs, tools, constraints) → typed result or
//! tagged failure`. Invocations are stateless with respect to each other;
//! any knowledge shared across agents flows through the DAG state or the
//! shared-memory store, never through hidden conversational history.

mod backend;
mod envelope;
mod invoker;
mod role;
mod scripted;

pub use backend::{AgentBackend, CliBackend, InvocationRequest};
pub use envelope::{AgentEnvelope, EnvelopeStatus, parse_payload};
pub use invoker::AgentInvoker;
pub use role::{AgentRole, Tool};
pub use scripted::ScriptedBackend;
