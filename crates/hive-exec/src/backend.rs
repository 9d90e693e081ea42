//! Executor backend contract.
//!
//! One backend instance drives one agent's language-model executor.
//! The two concrete backends are a tagged variant selected once at
//! construction; nothing downstream branches on provider strings.

use serde_json::Value;
use std::sync::Arc;

/// Result type for executor operations.
pub type ExecResult<T> = Result<T, ExecError>;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The backend invocation itself failed (spawn error, non-zero
    /// exit, transport failure).
    #[error("execution failed: {0}")]
    Execution(String),

    /// The backend ran but produced output we cannot interpret.
    #[error("unparseable backend output: {0}")]
    Parse(String),
}

/// Per-call options shared by every backend.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Start a fresh backend session even if one could be resumed.
    pub new_session: bool,
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
}

/// What an executor call yields.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub result_text: String,
    pub cost_usd: f64,
    pub duration_ms: u64,
    /// Backend session id, usable to resume a later call.
    pub session_id: Option<String>,
}

/// Observer for raw backend events (streamed JSON lines, tool calls).
/// The serve layer uses this to append to the session record without
/// the backend knowing about session storage.
pub type EventHook = Arc<dyn Fn(&Value) + Send + Sync>;

#[async_trait::async_trait]
pub trait ExecutorBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Run one prompt to completion. Implementations must be resumable:
    /// unless `options.new_session` is set, a second call continues the
    /// session identified by the previous outcome's `session_id`.
    async fn execute(&self, prompt: &str, options: &ExecOptions) -> ExecResult<ExecOutcome>;
}

/// The concrete backend kinds, selected once at construction.
pub enum Backend {
    Cli(crate::cli::CliBackend),
    Http(crate::http::HttpBackend),
}

#[async_trait::async_trait]
impl ExecutorBackend for Backend {
    fn name(&self) -> &str {
        match self {
            Self::Cli(b) => b.name(),
            Self::Http(b) => b.name(),
        }
    }

    async fn execute(&self, prompt: &str, options: &ExecOptions) -> ExecResult<ExecOutcome> {
        match self {
            Self::Cli(b) => b.execute(prompt, options).await,
            Self::Http(b) => b.execute(prompt, options).await,
        }
    }
}
