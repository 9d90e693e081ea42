//! hive-exec — language-model executor backends.
//!
//! The CLI backend wraps the `claude` CLI and parses its streaming
//! JSON output; the HTTP backend drives an OpenAI-style chat endpoint
//! and runs the tool-call loop itself.

pub mod backend;
pub mod cli;
pub mod http;

pub use backend::{
    Backend, EventHook, ExecError, ExecOptions, ExecOutcome, ExecResult, ExecutorBackend,
};
pub use cli::CliBackend;
pub use http::{
    run_tool_calls, CompletedToolCall, HttpBackend, NoTools, PendingToolCall, ToolDefinition,
    ToolDispatcher,
};
