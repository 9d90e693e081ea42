//! HTTP-API backend.
//!
//! Talks to an OpenAI-style chat-completions endpoint and runs the
//! tool-call loop itself: an explicit iterative loop with an
//! accumulator and a max-turns guard. Tool calls returned in a single
//! model turn execute concurrently, one task per call, and the turn
//! only advances once every result is collected; results are merged
//! back in original request order regardless of completion order.

use crate::backend::{EventHook, ExecError, ExecOptions, ExecOutcome, ExecResult, ExecutorBackend};
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MAX_TURNS: usize = 25;

/// A callable the model may invoke.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Executes tool calls on behalf of the backend. The serve layer
/// provides an implementation that spawns connection processes and
/// consults the permission gate.
#[async_trait::async_trait]
pub trait ToolDispatcher: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Run one tool call. `Err` becomes an error result fed back to
    /// the model, never a backend failure.
    async fn dispatch(&self, name: &str, arguments: Value) -> Result<String, String>;
}

/// A dispatcher with no tools, for leaf instances.
pub struct NoTools;

#[async_trait::async_trait]
impl ToolDispatcher for NoTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    async fn dispatch(&self, name: &str, _arguments: Value) -> Result<String, String> {
        Err(format!("unknown tool: {name}"))
    }
}

/// One tool call as requested by the model, in request order.
#[derive(Debug, Clone)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A finished tool call, re-associated with its originating id.
#[derive(Debug, Clone)]
pub struct CompletedToolCall {
    pub id: String,
    pub name: String,
    pub output: String,
    pub is_error: bool,
}

/// Execute every call concurrently and return completions in the same
/// order the calls were requested, keyed by call id.
pub async fn run_tool_calls(
    dispatcher: Arc<dyn ToolDispatcher>,
    calls: Vec<PendingToolCall>,
) -> Vec<CompletedToolCall> {
    let tasks = calls.into_iter().enumerate().map(|(index, call)| {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let completed = match dispatcher.dispatch(&call.name, call.arguments).await {
                Ok(output) => CompletedToolCall {
                    id: call.id,
                    name: call.name,
                    output,
                    is_error: false,
                },
                Err(message) => CompletedToolCall {
                    id: call.id,
                    name: call.name,
                    output: message,
                    is_error: true,
                },
            };
            (index, completed)
        })
    });

    let mut indexed: Vec<(usize, CompletedToolCall)> = join_all(tasks)
        .await
        .into_iter()
        .filter_map(|joined| joined.ok())
        .collect();
    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, completed)| completed).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<RawToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: RawFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<RawToolCall>>,
}

struct HttpState {
    session_id: String,
    messages: Vec<ChatMessage>,
}

pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: Option<f64>,
    max_turns: usize,
    dispatcher: Arc<dyn ToolDispatcher>,
    state: Mutex<HttpState>,
    event_hook: Option<EventHook>,
}

impl HttpBackend {
    pub fn new(
        model: impl Into<String>,
        api_key: impl Into<String>,
        dispatcher: Arc<dyn ToolDispatcher>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: None,
            max_turns: DEFAULT_MAX_TURNS,
            dispatcher,
            state: Mutex::new(HttpState {
                session_id: new_session_id(),
                messages: Vec::new(),
            }),
            event_hook: None,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f64>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_event_hook(mut self, hook: EventHook) -> Self {
        self.event_hook = Some(hook);
        self
    }

    async fn post_turn(
        &self,
        system: Option<&str>,
        history: &[ChatMessage],
    ) -> ExecResult<ChoiceMessage> {
        let mut messages: Vec<Value> = Vec::with_capacity(history.len() + 1);
        if let Some(system) = system {
            messages.push(json!({"role": "system", "content": system}));
        }
        for msg in history {
            messages.push(serde_json::to_value(msg).map_err(|e| ExecError::Parse(e.to_string()))?);
        }

        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        let definitions = self.dispatcher.definitions();
        if !definitions.is_empty() {
            let tools: Vec<Value> = definitions
                .iter()
                .map(|d| json!({"type": "function", "function": d}))
                .collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExecError::Execution(format!("chat request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExecError::Execution(format!("reading chat response: {e}")))?;
        if !status.is_success() {
            return Err(ExecError::Execution(format!("chat API {status}: {text}")));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| ExecError::Parse(format!("chat response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| ExecError::Parse("chat response contained no choices".into()))
    }
}

#[async_trait::async_trait]
impl ExecutorBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, prompt: &str, options: &ExecOptions) -> ExecResult<ExecOutcome> {
        let started = Instant::now();
        let mut state = self.state.lock().await;
        if options.new_session {
            state.session_id = new_session_id();
            state.messages.clear();
        }
        state.messages.push(ChatMessage {
            role: "user".into(),
            content: Some(prompt.to_string()),
            tool_calls: None,
            tool_call_id: None,
        });

        for turn in 0..self.max_turns {
            let reply = self
                .post_turn(options.system_prompt.as_deref(), &state.messages)
                .await?;

            let tool_calls = reply.tool_calls.unwrap_or_default();
            if tool_calls.is_empty() {
                let text = reply.content.unwrap_or_default();
                state.messages.push(ChatMessage {
                    role: "assistant".into(),
                    content: Some(text.clone()),
                    tool_calls: None,
                    tool_call_id: None,
                });
                return Ok(ExecOutcome {
                    result_text: text,
                    cost_usd: 0.0,
                    duration_ms: started.elapsed().as_millis() as u64,
                    session_id: Some(state.session_id.clone()),
                });
            }

            debug!(turn, calls = tool_calls.len(), "executing tool calls");
            if let Some(hook) = &self.event_hook {
                for call in &tool_calls {
                    hook(&json!({
                        "type": "tool_call",
                        "id": call.id,
                        "name": call.function.name,
                        "arguments": call.function.arguments,
                    }));
                }
            }

            state.messages.push(ChatMessage {
                role: "assistant".into(),
                content: reply.content.clone(),
                tool_calls: Some(tool_calls.clone()),
                tool_call_id: None,
            });

            let pending: Vec<PendingToolCall> = tool_calls
                .iter()
                .map(|call| PendingToolCall {
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    arguments: serde_json::from_str(&call.function.arguments)
                        .unwrap_or(Value::Null),
                })
                .collect();

            let completed = run_tool_calls(self.dispatcher.clone(), pending).await;
            for done in completed {
                if let Some(hook) = &self.event_hook {
                    hook(&json!({
                        "type": if done.is_error { "tool_error" } else { "tool_result" },
                        "id": done.id,
                        "name": done.name,
                        "output": done.output,
                    }));
                }
                state.messages.push(ChatMessage {
                    role: "tool".into(),
                    content: Some(done.output),
                    tool_calls: None,
                    tool_call_id: Some(done.id),
                });
            }
        }

        Err(ExecError::Execution(format!(
            "tool loop did not settle within {} turns",
            self.max_turns
        )))
    }
}

fn new_session_id() -> String {
    format!("http-{}", uuid::Uuid::new_v4())
}
