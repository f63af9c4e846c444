//! Agent roles and the per-role tool matrix.
//!
//! Each role gets exactly the capability set it needs; read-only roles can
//! run shell commands only in read mode. The matrix bounds the blast radius
//! of a misbehaving agent.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tool capabilities an agent invocation may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    Read,
    Write,
    Edit,
    Bash,
    /// Shell restricted to read-only commands.
    BashRead,
    Glob,
    Grep,
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tool::Read => "Read",
            Tool::Write => "Write",
            Tool::Edit => "Edit",
            Tool::Bash => "Bash",
            Tool::BashRead => "Bash(read-only)",
            Tool::Glob => "Glob",
            Tool::Grep => "Grep",
        };
        f.write_str(name)
    }
}

const READ_TOOLS: &[Tool] = &[Tool::Read, Tool::Glob, Tool::Grep, Tool::BashRead];
const WRITE_TOOLS: &[Tool] = &[
    Tool::Read,
    Tool::Write,
    Tool::Edit,
    Tool::Bash,
    Tool::Glob,
    Tool::Grep,
];

/// Every agent role the orchestrator invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    ProductManager,
    Architect,
    TechLead,
    SprintPlanner,
    IssueWriter,
    Coder,
    Qa,
    Reviewer,
    Synthesizer,
    Advisor,
    Replanner,
    Merger,
    IntegrationTester,
    Verifier,
    FixGenerator,
}

impl AgentRole {
    pub const ALL: [AgentRole; 15] = [
        AgentRole::ProductManager,
        AgentRole::Architect,
        AgentRole::TechLead,
        AgentRole::SprintPlanner,
        AgentRole::IssueWriter,
        AgentRole::Coder,
        AgentRole::Qa,
        AgentRole::Reviewer,
        AgentRole::Synthesizer,
        AgentRole::Advisor,
        AgentRole::Replanner,
        AgentRole::Merger,
        AgentRole::IntegrationTester,
        AgentRole::Verifier,
        AgentRole::FixGenerator,
    ];

    /// Stable key used in the model map, log file names, and transcripts.
    pub fn key(self) -> &'static str {
        match self {
            AgentRole::ProductManager => "product_manager",
            AgentRole::Architect => "architect",
            AgentRole::TechLead => "tech_lead",
            AgentRole::SprintPlanner => "sprint_planner",
            AgentRole::IssueWriter => "issue_writer",
            AgentRole::Coder => "coder",
            AgentRole::Qa => "qa",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Synthesizer => "synthesizer",
            AgentRole::Advisor => "advisor",
            AgentRole::Replanner => "replanner",
            AgentRole::Merger => "merger",
            AgentRole::IntegrationTester => "integration_tester",
            AgentRole::Verifier => "verifier",
            AgentRole::FixGenerator => "fix_generator",
        }
    }

    /// The tool matrix. Write roles get file and shell tools; everything
    /// else reads.
    pub fn tools(self) -> &'static [Tool] {
        match self {
            AgentRole::Architect
            | AgentRole::Coder
            | AgentRole::Qa
            | AgentRole::IssueWriter
            | AgentRole::Merger
            | AgentRole::IntegrationTester
            | AgentRole::FixGenerator => WRITE_TOOLS,
            AgentRole::ProductManager
            | AgentRole::TechLead
            | AgentRole::SprintPlanner
            | AgentRole::Reviewer
            | AgentRole::Synthesizer
            | AgentRole::Advisor
            | AgentRole::Replanner
            | AgentRole::Verifier => READ_TOOLS,
        }
    }

    pub fn can_write(self) -> bool {
        self.tools().contains(&Tool::Write)
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}
