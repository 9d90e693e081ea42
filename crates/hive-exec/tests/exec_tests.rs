//! Executor backend tests: parallel tool-call merging and the CLI
//! backend against a stub executor script.

use hive_exec::{
    run_tool_calls, CliBackend, ExecError, ExecOptions, ExecutorBackend, PendingToolCall,
    ToolDefinition, ToolDispatcher,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Dispatcher whose calls finish in reverse request order.
struct SlowFirst;

#[async_trait::async_trait]
impl ToolDispatcher for SlowFirst {
    fn definitions(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "sleepy".into(),
            description: "sleeps then echoes".into(),
            parameters: json!({"type": "object"}),
        }]
    }

    async fn dispatch(&self, _name: &str, arguments: Value) -> Result<String, String> {
        let delay_ms = arguments["delay_ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        match arguments["fail"].as_bool() {
            Some(true) => Err(format!("failed after {delay_ms}ms")),
            _ => Ok(format!("slept {delay_ms}ms")),
        }
    }
}

#[tokio::test]
async fn parallel_results_merge_in_request_order() {
    let calls = vec![
        PendingToolCall {
            id: "call_a".into(),
            name: "sleepy".into(),
            arguments: json!({"delay_ms": 120}),
        },
        PendingToolCall {
            id: "call_b".into(),
            name: "sleepy".into(),
            arguments: json!({"delay_ms": 40}),
        },
        PendingToolCall {
            id: "call_c".into(),
            name: "sleepy".into(),
            arguments: json!({"delay_ms": 5}),
        },
    ];

    let started = std::time::Instant::now();
    let completed = run_tool_calls(Arc::new(SlowFirst), calls).await;

    // All three ran concurrently: total wall time is bounded by the
    // slowest call, not the sum.
    assert!(started.elapsed() < Duration::from_millis(300));

    let ids: Vec<&str> = completed.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["call_a", "call_b", "call_c"]);
    assert_eq!(completed[0].output, "slept 120ms");
    assert_eq!(completed[2].output, "slept 5ms");
    // Completions keep the tool name alongside the call id.
    assert!(completed.iter().all(|c| c.name == "sleepy"));
}

#[tokio::test]
async fn tool_failure_becomes_error_result_not_backend_failure() {
    let calls = vec![
        PendingToolCall {
            id: "ok".into(),
            name: "sleepy".into(),
            arguments: json!({"delay_ms": 1}),
        },
        PendingToolCall {
            id: "bad".into(),
            name: "sleepy".into(),
            arguments: json!({"delay_ms": 1, "fail": true}),
        },
    ];
    let completed = run_tool_calls(Arc::new(SlowFirst), calls).await;
    assert!(!completed[0].is_error);
    assert!(completed[1].is_error);
    assert!(completed[1].output.contains("failed"));
}

fn write_stub(dir: &std::path::Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("stub-executor");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

#[tokio::test]
async fn cli_backend_folds_stream_into_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let stub = write_stub(
        dir.path(),
        r#"echo '{"type":"system","subtype":"init","session_id":"sess-9"}'
echo '{"type":"assistant","message":{"content":"thinking"}}'
echo '{"type":"result","subtype":"success","is_error":false,"result":"all done","total_cost_usd":0.015,"duration_ms":42,"session_id":"sess-9"}'"#,
    );

    let backend = CliBackend::new("sonnet", dir.path()).with_command(stub.display().to_string());
    let outcome = backend
        .execute("hello", &ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.result_text, "all done");
    assert_eq!(outcome.session_id.as_deref(), Some("sess-9"));
    assert_eq!(outcome.duration_ms, 42);
    // Session id is retained for resumption.
    assert_eq!(backend.session_id().await.as_deref(), Some("sess-9"));
}

#[tokio::test]
async fn cli_backend_reports_nonzero_exit_as_execution_error() {
    let dir = tempfile::tempdir().unwrap();
    let stub = write_stub(dir.path(), "echo 'boom' >&2\nexit 3");
    let backend = CliBackend::new("sonnet", dir.path()).with_command(stub.display().to_string());
    let err = backend
        .execute("hello", &ExecOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::Execution(_)));
    assert!(err.to_string().contains("boom"));
}

#[tokio::test]
async fn interactive_mode_passes_the_exit_code_through() {
    let dir = tempfile::tempdir().unwrap();
    let stub = write_stub(dir.path(), "exit 7");
    let backend = CliBackend::new("sonnet", dir.path()).with_command(stub.display().to_string());
    let code = backend
        .run_interactive(&ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(code, 7);
}

#[tokio::test]
async fn cli_backend_missing_result_is_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let stub = write_stub(
        dir.path(),
        r#"echo '{"type":"system","subtype":"init","session_id":"s"}'"#,
    );
    let backend = CliBackend::new("sonnet", dir.path()).with_command(stub.display().to_string());
    let err = backend
        .execute("hello", &ExecOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::Parse(_)));
}
