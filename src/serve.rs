//! Serve mode: one process per active instance.
//!
//! Re-entered by the generated topology, never run by hand. With
//! `--prompt` the process executes once and prints the answer (the
//! supervisor uses this for the root instance, and http-backed parents
//! use it for their children). Without a prompt, a user-launched root
//! hands the terminal to the executor CLI; when the caller is another
//! instance it speaks a stdio tool-server protocol instead, which is
//! how cli-backed parents reach their connections and the permission
//! gate.

use crate::permission::{Decision, PermissionGate};
use crate::session::{Event, EventKind, InstanceState, SessionPaths, SessionStore};
use crate::supervisor::registry::PidRegistry;
use crate::topology::{permission_prompt_tool, InstanceManifest, ManifestEntry, PERMISSION_TOOL_NAME};
use hive_core::{Error, Provider, Result};
use hive_exec::{
    Backend, CliBackend, ExecOptions, ExecOutcome, ExecutorBackend, HttpBackend, NoTools,
    ToolDefinition, ToolDispatcher,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

pub struct ServeOptions {
    pub session_path: PathBuf,
    pub instance: String,
    pub caller: String,
    pub prompt: Option<String>,
    /// One-shot output as a single JSON line instead of plain text.
    pub task_json: bool,
}

struct ServeContext {
    store: Arc<SessionStore>,
    manifest: InstanceManifest,
    caller: String,
    caller_id: String,
    backend: Backend,
}

pub async fn run(options: ServeOptions) -> Result<i32> {
    let paths = SessionPaths::new(&options.session_path);
    let store = Arc::new(SessionStore::open(paths.clone())?);
    let manifest = InstanceManifest::load(&paths, &options.instance)?;

    let registry = PidRegistry::new(paths.pids_dir());
    registry.register_self(&format!(
        "{} ({}) <- {}",
        manifest.instance, manifest.instance_id, options.caller
    ))?;

    // The caller's session-unique id, when the caller is an instance.
    let caller_id = InstanceManifest::load(&paths, &options.caller)
        .map(|m| m.instance_id)
        .unwrap_or_else(|_| options.caller.clone());

    let backend = build_backend(&paths, &store, &manifest).await?;
    let context = ServeContext {
        store,
        manifest,
        caller: options.caller,
        caller_id,
        backend,
    };

    let code = match options.prompt {
        Some(prompt) => one_shot(&context, &prompt, options.task_json).await,
        // A promptless launch by the user is an interactive session;
        // only instance callers get the stdio tool-server face.
        None if context.caller == "user" => interactive(&context).await,
        None => {
            let face = ConnectionFace { context };
            run_stdio_face(&face).await?;
            Ok(0)
        }
    };
    registry.deregister(std::process::id())?;
    code
}

async fn build_backend(
    paths: &SessionPaths,
    store: &Arc<SessionStore>,
    manifest: &InstanceManifest,
) -> Result<Backend> {
    let state = store.load_instance_state(&manifest.instance);
    let working_dir = manifest.primary_directory();
    let hook = event_hook(store.clone(), manifest);

    match manifest.provider {
        Provider::Claude => {
            let mut backend = CliBackend::new(&manifest.model, &working_dir)
                .with_mcp_config(InstanceManifest::mcp_file(paths, &manifest.instance))
                .with_session(state.backend_session_id)
                .with_event_hook(hook);
            if !manifest.unrestricted {
                backend = backend.with_permission_prompt_tool(permission_prompt_tool());
            }
            Ok(Backend::Cli(backend))
        }
        Provider::Openai => {
            let config = store.load_config()?;
            let settings = config
                .instances
                .get(&manifest.instance)
                .and_then(|decl| decl.openai.clone())
                .unwrap_or_default();
            let token_env = settings
                .token_env
                .unwrap_or_else(|| "OPENAI_API_KEY".to_string());
            let api_key = std::env::var(&token_env)
                .map_err(|_| Error::config(format!("environment variable '{token_env}' is not set")))?;

            let dispatcher =
                http_dispatcher(store, paths, manifest, &working_dir, std::env::current_exe()?)?;
            let mut backend = HttpBackend::new(&manifest.model, api_key, dispatcher)
                .with_temperature(settings.temperature)
                .with_event_hook(hook);
            if let Some(base_url) = settings.base_url {
                backend = backend.with_base_url(base_url);
            }
            Ok(Backend::Http(backend))
        }
    }
}

/// Tool dispatcher for an http-backed instance: connection targets
/// become callables; a leaf with no connections gets the empty
/// dispatcher so the model sees no tools at all.
fn http_dispatcher(
    store: &Arc<SessionStore>,
    paths: &SessionPaths,
    manifest: &InstanceManifest,
    working_dir: &std::path::Path,
    program: PathBuf,
) -> Result<Arc<dyn ToolDispatcher>> {
    if manifest.connections().next().is_none() {
        return Ok(Arc::new(NoTools));
    }
    let gate = PermissionGate::compile(
        &manifest.allowed_tools,
        &manifest.disallowed_tools,
        manifest.unrestricted,
        working_dir,
    )?;
    Ok(Arc::new(ConnectionDispatcher {
        store: store.clone(),
        paths: paths.clone(),
        manifest: manifest.clone(),
        gate,
        program,
    }))
}

/// Mirror backend stream events into the session log.
fn event_hook(store: Arc<SessionStore>, manifest: &InstanceManifest) -> hive_exec::EventHook {
    let instance = manifest.instance.clone();
    let instance_id = manifest.instance_id.clone();
    Arc::new(move |event: &Value| {
        let kind = match event.get("type").and_then(Value::as_str) {
            Some("tool_call") => Some(EventKind::ToolCall {
                tool: event
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                input: event.get("arguments").cloned().unwrap_or(Value::Null),
            }),
            Some("tool_result") | Some("tool_error") => {
                let output = event
                    .get("output")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let tool = event
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                if event.get("type").and_then(Value::as_str) == Some("tool_error") {
                    Some(EventKind::ToolError {
                        tool,
                        message: output,
                    })
                } else {
                    Some(EventKind::ToolResult { tool, output })
                }
            }
            Some("assistant") => {
                // Executor-cli stream: tool invocations ride inside the
                // assistant message's content items.
                if let Some(items) = event.pointer("/message/content").and_then(Value::as_array) {
                    for item in items {
                        if item.get("type").and_then(Value::as_str) == Some("tool_use") {
                            let _ = store.append(&Event::new(
                                instance.clone(),
                                instance_id.clone(),
                                None,
                                EventKind::ToolCall {
                                    tool: item
                                        .get("name")
                                        .and_then(Value::as_str)
                                        .unwrap_or("unknown")
                                        .to_string(),
                                    input: item.get("input").cloned().unwrap_or(Value::Null),
                                },
                            ));
                        }
                    }
                }
                None
            }
            _ => None,
        };
        if let Some(kind) = kind {
            let _ = store.append(&Event::new(instance.clone(), instance_id.clone(), None, kind));
        }
    })
}

fn exec_options(manifest: &InstanceManifest, new_session: bool) -> ExecOptions {
    ExecOptions {
        new_session,
        system_prompt: manifest.prompt.clone(),
        allowed_tools: manifest.allowed_tools.clone(),
        disallowed_tools: manifest.disallowed_tools.clone(),
    }
}

async fn execute_task(context: &ServeContext, prompt: &str) -> Result<ExecOutcome> {
    let state = context.store.load_instance_state(&context.manifest.instance);
    let options = exec_options(&context.manifest, state.backend_session_id.is_none());

    let outcome = context
        .backend
        .execute(prompt, &options)
        .await
        .map_err(|e| Error::session(e.to_string()))?;

    if outcome.session_id != state.backend_session_id {
        context.store.save_instance_state(
            &context.manifest.instance,
            &InstanceState {
                backend_session_id: outcome.session_id.clone(),
            },
        )?;
    }
    context.store.append(&Event::new(
        context.manifest.instance.clone(),
        context.manifest.instance_id.clone(),
        Some(context.caller.clone()),
        EventKind::Response {
            text: outcome.result_text.clone(),
            cost_usd: outcome.cost_usd,
            duration_ms: outcome.duration_ms,
        },
    ))?;
    context.store.log_line(&format!(
        "{} answered {} (${:.4}, {}ms)",
        context.manifest.instance, context.caller, outcome.cost_usd, outcome.duration_ms
    ))?;
    Ok(outcome)
}

async fn one_shot(context: &ServeContext, prompt: &str, task_json: bool) -> Result<i32> {
    info!(instance = %context.manifest.instance, "executing one-shot task");
    match execute_task(context, prompt).await {
        Ok(outcome) => {
            if task_json {
                println!(
                    "{}",
                    json!({
                        "result": outcome.result_text,
                        "cost_usd": outcome.cost_usd,
                        "duration_ms": outcome.duration_ms,
                        "session_id": outcome.session_id,
                    })
                );
            } else {
                println!("{}", outcome.result_text);
            }
            Ok(0)
        }
        Err(e) => {
            eprintln!("error: {e}");
            Ok(1)
        }
    }
}

/// Hand the terminal to the root instance's executor. Only the CLI
/// backend has an interactive face; http-backed roots need a prompt.
async fn interactive(context: &ServeContext) -> Result<i32> {
    match &context.backend {
        Backend::Cli(cli) => {
            info!(instance = %context.manifest.instance, "starting interactive session");
            context.store.log_line(&format!(
                "{} running interactively",
                context.manifest.instance
            ))?;
            let options = exec_options(&context.manifest, false);
            cli.run_interactive(&options)
                .await
                .map_err(|e| Error::session(e.to_string()))
        }
        Backend::Http(_) => Err(Error::config(format!(
            "instance '{}' uses an http backend with no interactive mode; pass --prompt",
            context.manifest.instance
        ))),
    }
}

/// Tool dispatcher for http-backed instances: each declared connection
/// becomes a callable that spawns the target as a one-shot child
/// process, gated by this instance's permission patterns.
struct ConnectionDispatcher {
    store: Arc<SessionStore>,
    paths: SessionPaths,
    manifest: InstanceManifest,
    gate: PermissionGate,
    program: PathBuf,
}

fn task_tool_name(target: &str) -> String {
    format!("{target}__task")
}

fn task_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "prompt": {
                "type": "string",
                "description": format!("Task for this agent: {description}"),
            }
        },
        "required": ["prompt"],
    })
}

#[async_trait::async_trait]
impl ToolDispatcher for ConnectionDispatcher {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.manifest
            .connections()
            .filter_map(|entry| match entry {
                ManifestEntry::Connection {
                    target,
                    description,
                    ..
                } => Some(ToolDefinition {
                    name: task_tool_name(target),
                    description: format!("Delegate a task to '{target}': {description}"),
                    parameters: task_schema(description),
                }),
                _ => None,
            })
            .collect()
    }

    async fn dispatch(&self, name: &str, arguments: Value) -> std::result::Result<String, String> {
        if let Decision::Deny { reason } = self.gate.decide(name, &arguments) {
            return Err(reason);
        }
        let target = self
            .manifest
            .connections()
            .find_map(|entry| match entry {
                ManifestEntry::Connection { target, .. } if task_tool_name(target) == name => {
                    Some(target.clone())
                }
                _ => None,
            })
            .ok_or_else(|| format!("unknown tool: {name}"))?;
        let prompt = arguments
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing required argument 'prompt'".to_string())?;

        run_connection_child(
            &self.store,
            &self.paths,
            &self.program,
            &self.manifest.instance,
            &self.manifest.instance_id,
            &target,
            prompt,
        )
        .await
    }
}

/// Spawn `serve --prompt` for a connection target and return its answer
/// text. The request is logged on behalf of the calling instance.
async fn run_connection_child(
    store: &SessionStore,
    paths: &SessionPaths,
    program: &PathBuf,
    caller: &str,
    caller_id: &str,
    target: &str,
    prompt: &str,
) -> std::result::Result<String, String> {
    store
        .append(&Event::new(
            caller.to_string(),
            caller_id.to_string(),
            None,
            EventKind::Request {
                to: target.to_string(),
                prompt: prompt.to_string(),
            },
        ))
        .map_err(|e| e.to_string())?;

    let output = tokio::process::Command::new(program)
        .arg("serve")
        .arg("--session-path")
        .arg(paths.root())
        .arg("--instance")
        .arg(target)
        .arg("--caller")
        .arg(caller)
        .arg("--prompt")
        .arg(prompt)
        .arg("--task-json")
        .output()
        .await
        .map_err(|e| format!("spawning '{target}': {e}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("'{target}' failed: {}", stderr.trim()));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let last = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| format!("'{target}' produced no output"))?;
    let parsed: Value =
        serde_json::from_str(last).map_err(|e| format!("unparseable answer from '{target}': {e}"))?;
    parsed
        .get("result")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("answer from '{target}' had no result text"))
}

/// Minimal stdio tool-server protocol: newline-delimited JSON-RPC with
/// initialize, tools/list and tools/call.
#[async_trait::async_trait]
trait ToolFace: Send + Sync {
    fn server_name(&self) -> String;
    fn tools(&self) -> Vec<Value>;
    async fn call(&self, name: &str, arguments: Value) -> std::result::Result<String, String>;
}

async fn run_stdio_face(face: &dyn ToolFace) -> Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!("invalid request line: {e}");
                continue;
            }
        };
        let id = request.get("id").cloned();
        let method = request.get("method").and_then(Value::as_str).unwrap_or("");
        debug!(method, "stdio request");

        let result = match method {
            "initialize" => json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {
                    "name": face.server_name(),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
            "notifications/initialized" => continue,
            "ping" => json!({}),
            "tools/list" => json!({"tools": face.tools()}),
            "tools/call" => {
                let name = request
                    .pointer("/params/name")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let arguments = request
                    .pointer("/params/arguments")
                    .cloned()
                    .unwrap_or(Value::Null);
                match face.call(name, arguments).await {
                    Ok(text) => json!({
                        "content": [{"type": "text", "text": text}],
                        "isError": false,
                    }),
                    Err(message) => json!({
                        "content": [{"type": "text", "text": message}],
                        "isError": true,
                    }),
                }
            }
            _ => {
                let Some(id) = id else { continue };
                let response = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": format!("unknown method '{method}'")},
                });
                write_line(&mut stdout, &response).await?;
                continue;
            }
        };
        let Some(id) = id else { continue };
        let response = json!({"jsonrpc": "2.0", "id": id, "result": result});
        write_line(&mut stdout, &response).await?;
    }
    Ok(())
}

async fn write_line(stdout: &mut tokio::io::Stdout, value: &Value) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    stdout.write_all(&line).await?;
    stdout.flush().await?;
    Ok(())
}

/// Persistent face of one instance, exposed to its caller's executor:
/// a single `task` tool that runs this instance's backend.
struct ConnectionFace {
    context: ServeContext,
}

#[async_trait::async_trait]
impl ToolFace for ConnectionFace {
    fn server_name(&self) -> String {
        self.context.manifest.instance.clone()
    }

    fn tools(&self) -> Vec<Value> {
        let manifest = &self.context.manifest;
        let description = manifest
            .prompt
            .clone()
            .unwrap_or_else(|| format!("agent '{}'", manifest.instance));
        vec![json!({
            "name": "task",
            "description": format!("Execute a task with agent '{}'", manifest.instance),
            "inputSchema": task_schema(&description),
        })]
    }

    async fn call(&self, name: &str, arguments: Value) -> std::result::Result<String, String> {
        if name != "task" {
            return Err(format!("unknown tool: {name}"));
        }
        let prompt = arguments
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing required argument 'prompt'".to_string())?;

        self.context
            .store
            .append(&Event::new(
                self.context.caller.clone(),
                self.context.caller_id.clone(),
                None,
                EventKind::Request {
                    to: self.context.manifest.instance.clone(),
                    prompt: prompt.to_string(),
                },
            ))
            .map_err(|e| e.to_string())?;

        execute_task(&self.context, prompt)
            .await
            .map(|outcome| outcome.result_text)
            .map_err(|e| e.to_string())
    }
}

/// Permission-server face: the executor CLI calls `check_permission`
/// before each gated tool invocation.
pub struct PermissionServeOptions {
    pub session_path: PathBuf,
    pub instance: String,
}

pub async fn run_permission_stdio(options: PermissionServeOptions) -> Result<i32> {
    let paths = SessionPaths::new(&options.session_path);
    let store = Arc::new(SessionStore::open(paths.clone())?);
    let manifest = InstanceManifest::load(&paths, &options.instance)?;
    let gate = PermissionGate::compile(
        &manifest.allowed_tools,
        &manifest.disallowed_tools,
        manifest.unrestricted,
        &manifest.primary_directory(),
    )?;

    let face = PermissionFace {
        store,
        manifest,
        gate,
    };
    run_stdio_face(&face).await?;
    Ok(0)
}

struct PermissionFace {
    store: Arc<SessionStore>,
    manifest: InstanceManifest,
    gate: PermissionGate,
}

#[async_trait::async_trait]
impl ToolFace for PermissionFace {
    fn server_name(&self) -> String {
        format!("{}-permissions", self.manifest.instance)
    }

    fn tools(&self) -> Vec<Value> {
        vec![json!({
            "name": PERMISSION_TOOL_NAME,
            "description": "Decide whether a tool invocation is allowed",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "tool_name": {"type": "string"},
                    "input": {"type": "object"},
                },
                "required": ["tool_name"],
            },
        })]
    }

    async fn call(&self, name: &str, arguments: Value) -> std::result::Result<String, String> {
        if name != PERMISSION_TOOL_NAME {
            return Err(format!("unknown tool: {name}"));
        }
        let tool = arguments
            .get("tool_name")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing required argument 'tool_name'".to_string())?;
        let input = arguments.get("input").cloned().unwrap_or(json!({}));

        let verdict = match self.gate.decide(tool, &input) {
            Decision::Allow { updated_input } => {
                json!({
                    "behavior": "allow",
                    "updatedInput": updated_input.unwrap_or(input),
                })
            }
            Decision::Deny { reason } => {
                let _ = self.store.append(&Event::new(
                    self.manifest.instance.clone(),
                    self.manifest.instance_id.clone(),
                    None,
                    EventKind::ToolError {
                        tool: tool.to_string(),
                        message: reason.clone(),
                    },
                ));
                json!({"behavior": "deny", "message": reason})
            }
        };
        serde_json::to_string(&verdict).map_err(|e| e.to_string())
    }
}
