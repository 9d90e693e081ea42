//! Instance model — the validated building blocks of a swarm.
//!
//! An [`AgentInstance`] is immutable once validation in `config` has
//! accepted it; everything downstream (topology, worktrees, serve mode)
//! reads these fields and never writes them back.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which executor backend an instance runs on. Selected once at
/// construction; there is no runtime re-dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Openai,
}

impl Default for Provider {
    fn default() -> Self {
        Self::Claude
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Claude => f.write_str("claude"),
            Self::Openai => f.write_str("openai"),
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Self::Claude),
            "openai" => Ok(Self::Openai),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

/// Per-instance worktree setting. `Inherit` defers to the run-wide
/// policy given on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorktreePolicy {
    Inherit,
    Disabled,
    Shared,
    Custom(String),
}

impl Default for WorktreePolicy {
    fn default() -> Self {
        Self::Inherit
    }
}

/// A static tool integration declared on an instance: an external tool
/// server the instance's executor connects to, either a local stdio
/// process or a remote http endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolServer {
    pub name: String,
    #[serde(flatten)]
    pub kind: ToolServerKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolServerKind {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Http {
        url: String,
    },
}

/// Settings only meaningful for the http backend. Rejected by
/// validation on claude instances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenaiSettings {
    pub temperature: Option<f64>,
    pub api_version: Option<String>,
    pub token_env: Option<String>,
    pub base_url: Option<String>,
}

/// One configured agent role. Field values are fully resolved:
/// directories are absolute and verified to exist, the first entry is
/// the primary working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstance {
    pub name: String,
    pub description: String,
    pub model: String,
    pub directories: Vec<PathBuf>,
    pub prompt: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    #[serde(default)]
    pub connections: Vec<String>,
    #[serde(default)]
    pub tool_servers: Vec<ToolServer>,
    #[serde(default)]
    pub provider: Provider,
    /// Unrestricted mode: no permission gate is generated.
    #[serde(default)]
    pub vibe: bool,
    #[serde(default)]
    pub worktree: WorktreePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai: Option<OpenaiSettings>,
}

impl AgentInstance {
    /// Primary working directory (validation guarantees at least one).
    pub fn primary_directory(&self) -> &PathBuf {
        &self.directories[0]
    }
}
