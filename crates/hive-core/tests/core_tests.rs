//! Declaration parsing and validation tests.

use hive_core::{Error, Provider, SwarmConfig, WorktreePolicy};
use std::path::Path;

fn parse(raw: &str, base: &Path) -> Result<SwarmConfig, Error> {
    SwarmConfig::parse(raw, base)
}

fn minimal(base: &Path) -> SwarmConfig {
    let raw = r#"
version: 1
swarm:
  name: "Test Swarm"
  main: lead
  instances:
    lead:
      description: "Lead instance"
"#;
    parse(raw, base).unwrap()
}

#[test]
fn parses_minimal_declaration() {
    let dir = tempfile::tempdir().unwrap();
    let config = minimal(dir.path());
    assert_eq!(config.name, "Test Swarm");
    assert_eq!(config.main, "lead");
    let lead = &config.instances["lead"];
    assert_eq!(lead.description, "Lead instance");
    assert_eq!(lead.provider, Provider::Claude);
    assert_eq!(lead.worktree, WorktreePolicy::Inherit);
    // directory defaults to "." resolved against base_dir
    assert_eq!(lead.directories.len(), 1);
    assert_eq!(lead.directories[0], dir.path().canonicalize().unwrap());
}

#[test]
fn rejects_missing_version() {
    let dir = tempfile::tempdir().unwrap();
    let raw = "swarm:\n  name: x\n  main: a\n  instances:\n    a: {description: d}\n";
    let err = parse(raw, dir.path()).unwrap_err();
    assert!(err.to_string().contains("version"));
}

#[test]
fn rejects_unsupported_version() {
    let dir = tempfile::tempdir().unwrap();
    let raw = "version: 2\nswarm:\n  name: x\n  main: a\n  instances:\n    a: {description: d}\n";
    let err = parse(raw, dir.path()).unwrap_err();
    assert!(err.to_string().contains("unsupported version"));
}

#[test]
fn rejects_undeclared_main() {
    let dir = tempfile::tempdir().unwrap();
    let raw = "version: 1\nswarm:\n  name: x\n  main: ghost\n  instances:\n    a: {description: d}\n";
    let err = parse(raw, dir.path()).unwrap_err();
    assert!(err.to_string().contains("main instance 'ghost'"));
}

#[test]
fn rejects_empty_instances() {
    let dir = tempfile::tempdir().unwrap();
    let raw = "version: 1\nswarm:\n  name: x\n  main: a\n  instances: {}\n";
    let err = parse(raw, dir.path()).unwrap_err();
    assert!(err.to_string().contains("must not be empty"));
}

#[test]
fn rejects_missing_description() {
    let dir = tempfile::tempdir().unwrap();
    let raw = "version: 1\nswarm:\n  name: x\n  main: a\n  instances:\n    a: {model: opus}\n";
    let err = parse(raw, dir.path()).unwrap_err();
    assert!(err.to_string().contains("requires a 'description'"));
}

#[test]
fn rejects_non_array_tool_list() {
    let dir = tempfile::tempdir().unwrap();
    let raw = r#"
version: 1
swarm:
  name: x
  main: a
  instances:
    a:
      description: d
      allowed_tools: "Read"
"#;
    let err = parse(raw, dir.path()).unwrap_err();
    assert!(err.to_string().contains("'allowed_tools' must be an array"));
}

#[test]
fn rejects_unknown_provider() {
    let dir = tempfile::tempdir().unwrap();
    let raw = r#"
version: 1
swarm:
  name: x
  main: a
  instances:
    a:
      description: d
      provider: gemini
"#;
    let err = parse(raw, dir.path()).unwrap_err();
    assert!(err.to_string().contains("unknown provider 'gemini'"));
}

#[test]
fn rejects_openai_fields_on_claude_instance() {
    let dir = tempfile::tempdir().unwrap();
    let raw = r#"
version: 1
swarm:
  name: x
  main: a
  instances:
    a:
      description: d
      temperature: 0.4
"#;
    let err = parse(raw, dir.path()).unwrap_err();
    assert!(err
        .to_string()
        .contains("'temperature' is only valid for provider 'openai'"));
}

#[test]
fn accepts_openai_settings_on_openai_instance() {
    let dir = tempfile::tempdir().unwrap();
    let raw = r#"
version: 1
swarm:
  name: x
  main: a
  instances:
    a:
      description: d
      provider: openai
      temperature: 0.4
      base_url: "https://llm.internal/v1"
"#;
    let config = parse(raw, dir.path()).unwrap();
    let a = &config.instances["a"];
    assert_eq!(a.provider, Provider::Openai);
    let openai = a.openai.as_ref().unwrap();
    assert_eq!(openai.temperature, Some(0.4));
    assert_eq!(openai.base_url.as_deref(), Some("https://llm.internal/v1"));
}

#[test]
fn rejects_nonexistent_directory() {
    let dir = tempfile::tempdir().unwrap();
    let raw = r#"
version: 1
swarm:
  name: x
  main: a
  instances:
    a:
      description: d
      directory: does/not/exist
"#;
    let err = parse(raw, dir.path()).unwrap_err();
    assert!(err.to_string().contains("does not exist"));
}

#[test]
fn resolves_directory_list_in_order() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("one")).unwrap();
    std::fs::create_dir(dir.path().join("two")).unwrap();
    let raw = r#"
version: 1
swarm:
  name: x
  main: a
  instances:
    a:
      description: d
      directory: [one, two]
"#;
    let config = parse(raw, dir.path()).unwrap();
    let a = &config.instances["a"];
    assert_eq!(a.directories.len(), 2);
    assert!(a.primary_directory().ends_with("one"));
}

#[test]
fn rejects_undeclared_connection() {
    let dir = tempfile::tempdir().unwrap();
    let raw = r#"
version: 1
swarm:
  name: x
  main: a
  instances:
    a:
      description: d
      connections: [ghost]
"#;
    let err = parse(raw, dir.path()).unwrap_err();
    assert!(err.to_string().contains("undeclared instance 'ghost'"));
}

#[test]
fn rejects_connection_cycle_with_exact_path() {
    let dir = tempfile::tempdir().unwrap();
    let raw = r#"
version: 1
swarm:
  name: x
  main: A
  instances:
    A:
      description: a
      connections: [B]
    B:
      description: b
      connections: [C]
    C:
      description: c
      connections: [A]
"#;
    let err = parse(raw, dir.path()).unwrap_err();
    assert!(matches!(err, Error::Graph(_)), "expected GraphError, got {err}");
    assert!(err.to_string().contains("A -> B -> C -> A"));
}

#[test]
fn worktree_policy_variants() {
    let dir = tempfile::tempdir().unwrap();
    let raw = r#"
version: 1
swarm:
  name: x
  main: a
  instances:
    a:
      description: d
      worktree: true
    b:
      description: d
      worktree: false
    c:
      description: d
      worktree: feature-x
"#;
    let config = parse(raw, dir.path()).unwrap();
    assert_eq!(config.instances["a"].worktree, WorktreePolicy::Shared);
    assert_eq!(config.instances["b"].worktree, WorktreePolicy::Disabled);
    assert_eq!(
        config.instances["c"].worktree,
        WorktreePolicy::Custom("feature-x".into())
    );
}

#[test]
fn parsing_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let raw = r#"
version: 1
swarm:
  name: x
  main: a
  instances:
    a:
      description: d
      connections: [b]
      allowed_tools: [Read, Edit]
    b:
      description: d
"#;
    let first = parse(raw, dir.path()).unwrap();
    let second = parse(raw, dir.path()).unwrap();
    assert_eq!(format!("{:?}", first.instances), format!("{:?}", second.instances));
    let g1 = first.graph().unwrap();
    let g2 = second.graph().unwrap();
    assert_eq!(
        g1.instances().collect::<Vec<_>>(),
        g2.instances().collect::<Vec<_>>()
    );
}

#[test]
fn parses_tool_servers() {
    let dir = tempfile::tempdir().unwrap();
    let raw = r#"
version: 1
swarm:
  name: x
  main: a
  instances:
    a:
      description: d
      mcps:
        - name: headless_browser
          type: stdio
          command: browser-mcp
          args: ["--headless"]
        - name: docs
          type: http
          url: "https://docs.internal/mcp"
"#;
    let config = parse(raw, dir.path()).unwrap();
    assert_eq!(config.instances["a"].tool_servers.len(), 2);
}
