//! Pattern-based allow/deny engine for tool invocations.
//!
//! Patterns compile into one of five classes: exact tool literals,
//! tool-name wildcards, shell command patterns, file-scoped globs for
//! read/write/edit tools, and parameterized field maps. Deny rules are
//! evaluated first and always win; an empty allow list is default-allow.

use globset::{Glob, GlobMatcher};
use hive_core::{Error, Result};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const FILE_TOOLS: &[&str] = &["Read", "Write", "Edit", "MultiEdit", "NotebookEdit"];

#[derive(Debug, Clone)]
pub enum Pattern {
    /// `Read` — matches the tool name exactly, any input.
    Exact(String),
    /// `Bash*` or `mcp__*` — anchored wildcard over the tool name.
    ToolWildcard { raw: String, regex: Regex },
    /// `Bash(npm:*)` — anchored regex over the `command` field.
    Shell { tool: String, command: Regex },
    /// `Read(/src/**/*.rs)` — glob over the `file_path` field,
    /// normalized to an absolute path.
    FileScope { tool: String, glob: GlobMatcher },
    /// `Tool(key: value, …)` — every listed field must match.
    Parameterized {
        tool: String,
        fields: BTreeMap<String, String>,
    },
}

impl Pattern {
    /// Classify and compile one configured pattern. `base_dir` anchors
    /// relative file globs.
    pub fn compile(raw: &str, base_dir: &Path) -> Result<Self> {
        if let Some((tool, body)) = split_parenthesized(raw) {
            if FILE_TOOLS.contains(&tool) {
                let absolute = if body.starts_with('/') {
                    body.to_string()
                } else {
                    format!("{}/{body}", base_dir.display())
                };
                let glob = Glob::new(&absolute)
                    .map_err(|e| Error::config(format!("invalid pattern '{raw}': {e}")))?
                    .compile_matcher();
                return Ok(Pattern::FileScope {
                    tool: tool.to_string(),
                    glob,
                });
            }
            if body.contains(": ") {
                let mut fields = BTreeMap::new();
                for pair in body.split(',') {
                    let (key, value) = pair.split_once(':').ok_or_else(|| {
                        Error::config(format!("invalid pattern '{raw}': expected 'key: value'"))
                    })?;
                    fields.insert(key.trim().to_string(), value.trim().to_string());
                }
                return Ok(Pattern::Parameterized {
                    tool: tool.to_string(),
                    fields,
                });
            }
            return Ok(Pattern::Shell {
                tool: tool.to_string(),
                command: shell_regex(body)
                    .map_err(|e| Error::config(format!("invalid pattern '{raw}': {e}")))?,
            });
        }

        if raw.contains('*') {
            let regex = Regex::new(&format!("^{}$", escape_with_wildcards(raw)))
                .map_err(|e| Error::config(format!("invalid pattern '{raw}': {e}")))?;
            return Ok(Pattern::ToolWildcard {
                raw: raw.to_string(),
                regex,
            });
        }
        Ok(Pattern::Exact(raw.to_string()))
    }

    fn matches(&self, tool: &str, input: &Value) -> bool {
        match self {
            Pattern::Exact(name) => name == tool,
            Pattern::ToolWildcard { regex, .. } => regex.is_match(tool),
            Pattern::Shell {
                tool: pattern_tool,
                command,
            } => {
                pattern_tool == tool
                    && input
                        .get("command")
                        .and_then(Value::as_str)
                        .is_some_and(|c| command.is_match(c.trim()))
            }
            Pattern::FileScope {
                tool: pattern_tool,
                glob,
            } => {
                pattern_tool == tool
                    && input_path(input).is_some_and(|path| glob.is_match(&path))
            }
            Pattern::Parameterized {
                tool: pattern_tool,
                fields,
            } => {
                pattern_tool == tool
                    && fields.iter().all(|(key, want)| {
                        let got = match input.get(key) {
                            Some(Value::String(s)) => s.clone(),
                            Some(other) => other.to_string(),
                            None => return false,
                        };
                        want == "*" || *want == got
                    })
            }
        }
    }
}

/// `Tool(body)` → `(tool, body)`.
fn split_parenthesized(raw: &str) -> Option<(&str, &str)> {
    let open = raw.find('(')?;
    if !raw.ends_with(')') || open == 0 {
        return None;
    }
    Some((&raw[..open], &raw[open + 1..raw.len() - 1]))
}

/// Shell command pattern → anchored regex. Colon-delimited segments are
/// joined with a space; `*` widens to `.*`, everything else is literal.
fn shell_regex(body: &str) -> std::result::Result<Regex, regex::Error> {
    let translated = if body.contains(':') {
        body.split(':')
            .map(escape_with_wildcards)
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        escape_with_wildcards(body)
    };
    Regex::new(&format!("^{translated}"))
}

fn escape_with_wildcards(segment: &str) -> String {
    regex::escape(segment).replace("\\*", ".*")
}

fn input_path(input: &Value) -> Option<String> {
    input
        .get("file_path")
        .or_else(|| input.get("path"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// The outcome of one permission check. Denial is a normal decision,
/// not an error.
#[derive(Debug, Clone)]
pub enum Decision {
    Allow { updated_input: Option<Value> },
    Deny { reason: String },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }
}

pub struct PermissionGate {
    allow: Vec<Pattern>,
    deny: Vec<Pattern>,
    unrestricted: bool,
    base_dir: PathBuf,
}

impl PermissionGate {
    pub fn compile(
        allowed: &[String],
        disallowed: &[String],
        unrestricted: bool,
        base_dir: &Path,
    ) -> Result<Self> {
        let allow = allowed
            .iter()
            .map(|raw| Pattern::compile(raw, base_dir))
            .collect::<Result<Vec<_>>>()?;
        let deny = disallowed
            .iter()
            .map(|raw| Pattern::compile(raw, base_dir))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            allow,
            deny,
            unrestricted,
            base_dir: base_dir.to_path_buf(),
        })
    }

    /// Deny rules first — any match denies regardless of allow rules.
    /// Then an empty allow list is default-allow; a non-empty one needs
    /// at least one match.
    pub fn decide(&self, tool: &str, input: &Value) -> Decision {
        if self.unrestricted {
            return Decision::Allow {
                updated_input: None,
            };
        }
        if self.deny.iter().any(|p| p.matches(tool, input)) {
            return Decision::Deny {
                reason: format!("'{tool}' is denied by configured patterns"),
            };
        }
        if self.allow.is_empty() || self.allow.iter().any(|p| p.matches(tool, input)) {
            return Decision::Allow {
                updated_input: self.normalized_input(tool, input),
            };
        }
        Decision::Deny {
            reason: format!("'{tool}' is not allowed by configured patterns"),
        }
    }

    /// File tools get their relative `file_path` rewritten to an
    /// absolute path so downstream checks see one canonical form.
    fn normalized_input(&self, tool: &str, input: &Value) -> Option<Value> {
        if !FILE_TOOLS.contains(&tool) {
            return None;
        }
        let path = input_path(input)?;
        if path.starts_with('/') {
            return None;
        }
        let mut updated = input.clone();
        if let Some(object) = updated.as_object_mut() {
            let absolute = format!("{}/{path}", self.base_dir.display());
            object.insert("file_path".into(), Value::String(absolute));
            return Some(updated);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gate(allow: &[&str], deny: &[&str]) -> PermissionGate {
        let allow: Vec<String> = allow.iter().map(|s| s.to_string()).collect();
        let deny: Vec<String> = deny.iter().map(|s| s.to_string()).collect();
        PermissionGate::compile(&allow, &deny, false, Path::new("/work")).unwrap()
    }

    #[test]
    fn deny_wins_over_allow() {
        let gate = gate(&["Bash*"], &["Bash(rm*)"]);
        assert!(!gate
            .decide("Bash", &json!({"command": "rm -rf /"}))
            .is_allowed());
        assert!(gate.decide("Bash", &json!({"command": "ls"})).is_allowed());
    }

    #[test]
    fn empty_lists_default_allow() {
        let gate = gate(&[], &[]);
        assert!(gate.decide("AnythingAtAll", &json!({})).is_allowed());
    }

    #[test]
    fn nonempty_allow_requires_a_match() {
        let gate = gate(&["Read", "Edit"], &[]);
        assert!(gate.decide("Read", &json!({})).is_allowed());
        let decision = gate.decide("WebSearch", &json!({}));
        match decision {
            Decision::Deny { reason } => assert!(reason.contains("not allowed")),
            Decision::Allow { .. } => panic!("expected deny"),
        }
    }

    #[test]
    fn colon_pattern_matches_command_prefix_with_arguments() {
        let gate = gate(&["Bash(npm:*)"], &[]);
        assert!(gate
            .decide("Bash", &json!({"command": "npm install serde"}))
            .is_allowed());
        assert!(!gate
            .decide("Bash", &json!({"command": "cargo build"}))
            .is_allowed());
    }

    #[test]
    fn file_glob_scopes_by_absolute_path() {
        let gate = gate(&["Read(/work/src/**/*.rs)"], &[]);
        assert!(gate
            .decide("Read", &json!({"file_path": "/work/src/lib.rs"}))
            .is_allowed());
        assert!(!gate
            .decide("Read", &json!({"file_path": "/etc/passwd"}))
            .is_allowed());
    }

    #[test]
    fn relative_file_glob_is_anchored_to_base_dir() {
        let gate = gate(&["Edit(src/*.rs)"], &[]);
        assert!(gate
            .decide("Edit", &json!({"file_path": "/work/src/main.rs"}))
            .is_allowed());
    }

    #[test]
    fn allowed_file_tool_normalizes_relative_paths() {
        let gate = gate(&[], &[]);
        match gate.decide("Read", &json!({"file_path": "notes.md"})) {
            Decision::Allow {
                updated_input: Some(updated),
            } => assert_eq!(updated["file_path"], "/work/notes.md"),
            other => panic!("expected rewritten input, got {other:?}"),
        }
    }

    #[test]
    fn parameterized_pattern_matches_field_map() {
        let gate = gate(&["mcp__browser__click(button: left, count: *)"], &[]);
        assert!(gate
            .decide(
                "mcp__browser__click",
                &json!({"button": "left", "count": 2})
            )
            .is_allowed());
        assert!(!gate
            .decide(
                "mcp__browser__click",
                &json!({"button": "right", "count": 2})
            )
            .is_allowed());
    }

    #[test]
    fn tool_wildcard_matches_namespaces() {
        let gate = gate(&["mcp__worker__*"], &[]);
        assert!(gate.decide("mcp__worker__task", &json!({})).is_allowed());
        assert!(!gate.decide("mcp__other__task", &json!({})).is_allowed());
    }

    #[test]
    fn unrestricted_gate_allows_everything() {
        let gate =
            PermissionGate::compile(&["Read".into()], &["Bash*".into()], true, Path::new("/w"))
                .unwrap();
        assert!(gate
            .decide("Bash", &json!({"command": "rm -rf /"}))
            .is_allowed());
    }
}
