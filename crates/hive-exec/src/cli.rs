//! CLI-wrapping backend.
//!
//! Spawns the `claude` CLI in print mode with streaming JSON output,
//! reads its line-buffered stdout, and folds the stream into one
//! [`ExecOutcome`]. The CLI owns its own tool loop; connections and the
//! permission gate reach it through the generated mcp-config file.

use crate::backend::{EventHook, ExecError, ExecOptions, ExecOutcome, ExecResult, ExecutorBackend};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub struct CliBackend {
    command: String,
    model: String,
    working_dir: PathBuf,
    mcp_config: Option<PathBuf>,
    permission_prompt_tool: Option<String>,
    session: Mutex<Option<String>>,
    event_hook: Option<EventHook>,
}

impl CliBackend {
    pub fn new(model: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: "claude".to_string(),
            model: model.into(),
            working_dir: working_dir.into(),
            mcp_config: None,
            permission_prompt_tool: None,
            session: Mutex::new(None),
            event_hook: None,
        }
    }

    /// Override the executable (tests point this at a stub script).
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn with_mcp_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.mcp_config = Some(path.into());
        self
    }

    pub fn with_permission_prompt_tool(mut self, tool: impl Into<String>) -> Self {
        self.permission_prompt_tool = Some(tool.into());
        self
    }

    /// Seed a session id so the first call resumes a prior session.
    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session = Mutex::new(session_id);
        self
    }

    pub fn with_event_hook(mut self, hook: EventHook) -> Self {
        self.event_hook = Some(hook);
        self
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session.lock().await.clone()
    }

    /// Without a prompt the CLI is launched interactively: no print
    /// mode, no output-format, the terminal stays with the CLI.
    fn build_args(
        &self,
        prompt: Option<&str>,
        options: &ExecOptions,
        resume: Option<&str>,
    ) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        if prompt.is_some() {
            args.extend([
                "--print".into(),
                "--verbose".into(),
                "--output-format".into(),
                "stream-json".into(),
            ]);
        }
        args.push("--model".into());
        args.push(self.model.clone());
        if let Some(id) = resume {
            args.push("--resume".into());
            args.push(id.to_string());
        }
        if let Some(system) = &options.system_prompt {
            args.push("--append-system-prompt".into());
            args.push(system.clone());
        }
        if !options.allowed_tools.is_empty() {
            args.push("--allowedTools".into());
            args.push(options.allowed_tools.join(","));
        }
        if !options.disallowed_tools.is_empty() {
            args.push("--disallowedTools".into());
            args.push(options.disallowed_tools.join(","));
        }
        if let Some(mcp) = &self.mcp_config {
            args.push("--mcp-config".into());
            args.push(mcp.display().to_string());
        }
        if let Some(tool) = &self.permission_prompt_tool {
            args.push("--permission-prompt-tool".into());
            args.push(tool.clone());
        }
        if let Some(prompt) = prompt {
            args.push(prompt.to_string());
        }
        args
    }

    /// Hand the terminal to the executor CLI: inherited stdio, no
    /// streaming. Returns the CLI's exit code. Used for a promptless
    /// root instance.
    pub async fn run_interactive(&self, options: &ExecOptions) -> ExecResult<i32> {
        let resume = self.session.lock().await.clone();
        let args = self.build_args(None, options, resume.as_deref());
        debug!(command = %self.command, "spawning executor cli interactively");

        let status = Command::new(&self.command)
            .args(&args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| ExecError::Execution(format!("failed to spawn {}: {e}", self.command)))?;
        Ok(status.code().unwrap_or(1))
    }
}

#[async_trait::async_trait]
impl ExecutorBackend for CliBackend {
    fn name(&self) -> &str {
        "cli"
    }

    async fn execute(&self, prompt: &str, options: &ExecOptions) -> ExecResult<ExecOutcome> {
        let resume = if options.new_session {
            None
        } else {
            self.session.lock().await.clone()
        };
        let args = self.build_args(Some(prompt), options, resume.as_deref());
        debug!(command = %self.command, "spawning executor cli");

        let started = Instant::now();
        let mut child = Command::new(&self.command)
            .args(&args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecError::Execution(format!("failed to spawn {}: {e}", self.command)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::Execution("executor stdout not captured".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecError::Execution("executor stderr not captured".into()))?;

        let mut lines = BufReader::new(stdout).lines();
        let mut outcome: Option<ExecOutcome> = None;
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| ExecError::Execution(format!("reading executor stdout: {e}")))?
        {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let event: Value = match serde_json::from_str(trimmed) {
                Ok(v) => v,
                Err(e) => {
                    warn!("skipping unparseable executor line: {e}");
                    continue;
                }
            };
            if let Some(hook) = &self.event_hook {
                hook(&event);
            }
            if let Some(id) = event.get("session_id").and_then(Value::as_str) {
                *self.session.lock().await = Some(id.to_string());
            }
            if event.get("type").and_then(Value::as_str) == Some("result") {
                outcome = Some(parse_result_event(&event, started.elapsed().as_millis() as u64)?);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| ExecError::Execution(format!("waiting for executor: {e}")))?;
        if !status.success() {
            let mut err_text = String::new();
            let _ = stderr.read_to_string(&mut err_text).await;
            return Err(ExecError::Execution(format!(
                "executor exited with {}: {}",
                status.code().unwrap_or(-1),
                err_text.trim()
            )));
        }

        outcome.ok_or_else(|| {
            ExecError::Parse("executor stream ended without a result event".into())
        })
    }
}

/// Fold the CLI's terminal `result` event into an outcome.
fn parse_result_event(event: &Value, fallback_duration_ms: u64) -> ExecResult<ExecOutcome> {
    if event.get("is_error").and_then(Value::as_bool) == Some(true) {
        let detail = event
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or("unknown executor error");
        return Err(ExecError::Execution(detail.to_string()));
    }
    let result_text = event
        .get("result")
        .and_then(Value::as_str)
        .ok_or_else(|| ExecError::Parse(format!("result event without result text: {event}")))?
        .to_string();
    Ok(ExecOutcome {
        result_text,
        cost_usd: event
            .get("total_cost_usd")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        duration_ms: event
            .get("duration_ms")
            .and_then(Value::as_u64)
            .unwrap_or(fallback_duration_ms),
        session_id: event
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_args_includes_tool_lists_and_resume() {
        let backend = CliBackend::new("sonnet", "/tmp").with_mcp_config("/tmp/lead.mcp.json");
        let options = ExecOptions {
            allowed_tools: vec!["Read".into(), "Edit".into()],
            disallowed_tools: vec!["WebSearch".into()],
            ..Default::default()
        };
        let args = backend.build_args(Some("do the thing"), &options, Some("sess-1"));
        let joined = args.join(" ");
        assert!(joined.contains("--output-format stream-json"));
        assert!(joined.contains("--resume sess-1"));
        assert!(joined.contains("--allowedTools Read,Edit"));
        assert!(joined.contains("--disallowedTools WebSearch"));
        assert!(joined.contains("--mcp-config /tmp/lead.mcp.json"));
        assert_eq!(args.last().unwrap(), "do the thing");
    }

    #[test]
    fn new_session_skips_resume() {
        let backend = CliBackend::new("sonnet", "/tmp");
        let options = ExecOptions {
            new_session: true,
            ..Default::default()
        };
        let args = backend.build_args(Some("p"), &options, None);
        assert!(!args.iter().any(|a| a == "--resume"));
    }

    #[test]
    fn interactive_args_skip_print_mode_and_prompt() {
        let backend = CliBackend::new("sonnet", "/tmp").with_mcp_config("/tmp/lead.mcp.json");
        let options = ExecOptions {
            system_prompt: Some("be brief".into()),
            ..Default::default()
        };
        let args = backend.build_args(None, &options, Some("sess-1"));
        assert!(!args.iter().any(|a| a == "--print"));
        assert!(!args.iter().any(|a| a == "--output-format"));
        let joined = args.join(" ");
        assert!(joined.contains("--resume sess-1"));
        assert!(joined.contains("--append-system-prompt be brief"));
        assert_eq!(args.last().unwrap(), "/tmp/lead.mcp.json");
    }

    #[test]
    fn parses_success_result_event() {
        let event = json!({
            "type": "result",
            "subtype": "success",
            "is_error": false,
            "result": "done",
            "total_cost_usd": 0.0421,
            "duration_ms": 950,
            "session_id": "abc-123"
        });
        let outcome = parse_result_event(&event, 0).unwrap();
        assert_eq!(outcome.result_text, "done");
        assert!((outcome.cost_usd - 0.0421).abs() < f64::EPSILON);
        assert_eq!(outcome.duration_ms, 950);
        assert_eq!(outcome.session_id.as_deref(), Some("abc-123"));
    }

    #[test]
    fn error_result_event_is_execution_error() {
        let event = json!({"type": "result", "is_error": true, "result": "budget exceeded"});
        let err = parse_result_event(&event, 0).unwrap_err();
        assert!(matches!(err, ExecError::Execution(_)));
        assert!(err.to_string().contains("budget exceeded"));
    }

    #[test]
    fn result_without_text_is_parse_error() {
        let event = json!({"type": "result", "is_error": false});
        assert!(matches!(
            parse_result_event(&event, 0),
            Err(ExecError::Parse(_))
        ));
    }
}
