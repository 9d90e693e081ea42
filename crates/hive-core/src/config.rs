//! Swarm declaration — parsing and validation.
//!
//! A declaration is a YAML file naming a set of instances and the
//! connections between them. `SwarmConfig::parse` either yields a fully
//! resolved, immutable configuration or fails with a `ConfigError`
//! naming the offending field. Parsing is deterministic: identical
//! input always yields a structurally identical configuration.

use crate::error::{Error, Result};
use crate::graph::InstanceGraph;
use crate::types::{
    AgentInstance, OpenaiSettings, Provider, ToolServer, ToolServerKind, WorktreePolicy,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The only declaration schema this build understands.
pub const SUPPORTED_VERSION: u64 = 1;

const DEFAULT_CLAUDE_MODEL: &str = "sonnet";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";

#[derive(Debug, Deserialize)]
struct RawFile {
    version: Option<serde_yaml::Value>,
    swarm: Option<RawSwarm>,
}

#[derive(Debug, Deserialize)]
struct RawSwarm {
    name: Option<String>,
    main: Option<String>,
    instances: Option<BTreeMap<String, RawInstance>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawInstance {
    description: Option<String>,
    model: Option<String>,
    directory: Option<serde_yaml::Value>,
    prompt: Option<String>,
    allowed_tools: Option<serde_yaml::Value>,
    disallowed_tools: Option<serde_yaml::Value>,
    connections: Option<Vec<String>>,
    mcps: Option<Vec<RawToolServer>>,
    provider: Option<String>,
    vibe: Option<bool>,
    worktree: Option<serde_yaml::Value>,
    // http-backend settings, invalid for claude instances
    temperature: Option<f64>,
    api_version: Option<String>,
    openai_token_env: Option<String>,
    base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawToolServer {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    url: Option<String>,
}

/// A validated swarm declaration.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub name: String,
    pub main: String,
    pub instances: BTreeMap<String, AgentInstance>,
    /// The raw declaration text, kept for the session snapshot.
    pub raw: String,
    /// Directory the declaration was resolved against.
    pub base_dir: PathBuf,
}

impl SwarmConfig {
    /// Load and validate a declaration file. Directories are resolved
    /// relative to the file's parent directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&raw, &base_dir)
    }

    /// Parse and validate a declaration from a string.
    pub fn parse(raw: &str, base_dir: &Path) -> Result<Self> {
        let file: RawFile = serde_yaml::from_str(raw)?;

        match &file.version {
            None => return Err(Error::config("missing required field 'version'")),
            Some(v) => match v.as_u64() {
                Some(SUPPORTED_VERSION) => {}
                _ => {
                    return Err(Error::config(format!(
                        "unsupported version {v:?}, expected {SUPPORTED_VERSION}"
                    )))
                }
            },
        }

        let swarm = file
            .swarm
            .ok_or_else(|| Error::config("missing required section 'swarm'"))?;
        let name = swarm
            .name
            .ok_or_else(|| Error::config("missing required field 'swarm.name'"))?;
        let main = swarm
            .main
            .ok_or_else(|| Error::config("missing required field 'swarm.main'"))?;
        let raw_instances = swarm
            .instances
            .ok_or_else(|| Error::config("missing required field 'swarm.instances'"))?;
        if raw_instances.is_empty() {
            return Err(Error::config("'swarm.instances' must not be empty"));
        }
        if !raw_instances.contains_key(&main) {
            return Err(Error::config(format!(
                "main instance '{main}' is not declared in 'swarm.instances'"
            )));
        }

        let base_dir = base_dir
            .canonicalize()
            .map_err(|e| Error::config(format!("base directory {}: {e}", base_dir.display())))?;

        let mut instances = BTreeMap::new();
        for (iname, raw_inst) in &raw_instances {
            let inst = validate_instance(iname, raw_inst, &base_dir)?;
            instances.insert(iname.clone(), inst);
        }

        // Every connection must point at a declared instance.
        for (iname, inst) in &instances {
            for conn in &inst.connections {
                if !instances.contains_key(conn) {
                    return Err(Error::config(format!(
                        "instance '{iname}' connects to undeclared instance '{conn}'"
                    )));
                }
            }
        }

        let config = Self {
            name,
            main,
            instances,
            raw: raw.to_string(),
            base_dir,
        };

        // Reject cyclic connection topologies up front.
        config.graph()?;

        Ok(config)
    }

    /// Build the validated instance graph (root + acyclic edge set).
    pub fn graph(&self) -> Result<InstanceGraph> {
        let edges: BTreeMap<String, Vec<String>> = self
            .instances
            .iter()
            .map(|(name, inst)| (name.clone(), inst.connections.clone()))
            .collect();
        InstanceGraph::new(self.main.clone(), edges)
    }
}

fn validate_instance(name: &str, raw: &RawInstance, base_dir: &Path) -> Result<AgentInstance> {
    let description = raw
        .description
        .clone()
        .ok_or_else(|| Error::config(format!("instance '{name}' requires a 'description'")))?;

    let allowed_tools = tool_list(name, "allowed_tools", &raw.allowed_tools)?;
    let disallowed_tools = tool_list(name, "disallowed_tools", &raw.disallowed_tools)?;

    let provider = match raw.provider.as_deref() {
        None => Provider::Claude,
        Some(p) => p
            .parse::<Provider>()
            .map_err(|e| Error::config(format!("instance '{name}': {e}")))?,
    };

    let openai = match provider {
        Provider::Openai => Some(OpenaiSettings {
            temperature: raw.temperature,
            api_version: raw.api_version.clone(),
            token_env: raw.openai_token_env.clone(),
            base_url: raw.base_url.clone(),
        }),
        Provider::Claude => {
            for (field, present) in [
                ("temperature", raw.temperature.is_some()),
                ("api_version", raw.api_version.is_some()),
                ("openai_token_env", raw.openai_token_env.is_some()),
                ("base_url", raw.base_url.is_some()),
            ] {
                if present {
                    return Err(Error::config(format!(
                        "instance '{name}': field '{field}' is only valid for provider 'openai'"
                    )));
                }
            }
            None
        }
    };

    let directories = resolve_directories(name, &raw.directory, base_dir)?;

    let model = raw.model.clone().unwrap_or_else(|| match provider {
        Provider::Claude => DEFAULT_CLAUDE_MODEL.to_string(),
        Provider::Openai => DEFAULT_OPENAI_MODEL.to_string(),
    });

    let worktree = match &raw.worktree {
        None => WorktreePolicy::Inherit,
        Some(serde_yaml::Value::Bool(true)) => WorktreePolicy::Shared,
        Some(serde_yaml::Value::Bool(false)) => WorktreePolicy::Disabled,
        Some(serde_yaml::Value::String(label)) if !label.is_empty() => {
            WorktreePolicy::Custom(label.clone())
        }
        Some(other) => {
            return Err(Error::config(format!(
                "instance '{name}': 'worktree' must be true, false or a label, got {other:?}"
            )))
        }
    };

    let tool_servers = raw
        .mcps
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|ts| tool_server(name, ts))
        .collect::<Result<Vec<_>>>()?;

    Ok(AgentInstance {
        name: name.to_string(),
        description,
        model,
        directories,
        prompt: raw.prompt.clone(),
        allowed_tools,
        disallowed_tools,
        connections: raw.connections.clone().unwrap_or_default(),
        tool_servers,
        provider,
        vibe: raw.vibe.unwrap_or(false),
        worktree,
        openai,
    })
}

/// Tool lists must be YAML sequences of strings when present.
fn tool_list(instance: &str, field: &str, value: &Option<serde_yaml::Value>) -> Result<Vec<String>> {
    match value {
        None => Ok(Vec::new()),
        Some(serde_yaml::Value::Sequence(seq)) => seq
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    Error::config(format!(
                        "instance '{instance}': '{field}' entries must be strings"
                    ))
                })
            })
            .collect(),
        Some(_) => Err(Error::config(format!(
            "instance '{instance}': '{field}' must be an array"
        ))),
    }
}

/// `directory` accepts a single path or a list; defaults to ".".
/// Every entry is resolved against `base_dir` and must exist.
fn resolve_directories(
    instance: &str,
    value: &Option<serde_yaml::Value>,
    base_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let raw_dirs: Vec<String> = match value {
        None => vec![".".to_string()],
        Some(serde_yaml::Value::String(s)) => vec![s.clone()],
        Some(serde_yaml::Value::Sequence(seq)) => {
            let mut dirs = Vec::with_capacity(seq.len());
            for v in seq {
                match v.as_str() {
                    Some(s) => dirs.push(s.to_string()),
                    None => {
                        return Err(Error::config(format!(
                            "instance '{instance}': 'directory' entries must be strings"
                        )))
                    }
                }
            }
            if dirs.is_empty() {
                vec![".".to_string()]
            } else {
                dirs
            }
        }
        Some(other) => {
            return Err(Error::config(format!(
                "instance '{instance}': 'directory' must be a path or list of paths, got {other:?}"
            )))
        }
    };

    raw_dirs
        .iter()
        .map(|d| {
            let joined = if Path::new(d).is_absolute() {
                PathBuf::from(d)
            } else {
                base_dir.join(d)
            };
            joined.canonicalize().map_err(|_| {
                Error::config(format!(
                    "instance '{instance}': directory '{d}' does not exist"
                ))
            })
        })
        .collect()
}

fn tool_server(instance: &str, raw: &RawToolServer) -> Result<ToolServer> {
    let kind = match raw.kind.as_str() {
        "stdio" => {
            let command = raw.command.clone().ok_or_else(|| {
                Error::config(format!(
                    "instance '{instance}': stdio tool server '{}' requires 'command'",
                    raw.name
                ))
            })?;
            ToolServerKind::Stdio {
                command,
                args: raw.args.clone(),
            }
        }
        "http" | "sse" => {
            let url = raw.url.clone().ok_or_else(|| {
                Error::config(format!(
                    "instance '{instance}': http tool server '{}' requires 'url'",
                    raw.name
                ))
            })?;
            ToolServerKind::Http { url }
        }
        other => {
            return Err(Error::config(format!(
                "instance '{instance}': tool server '{}' has unknown type '{other}'",
                raw.name
            )))
        }
    };
    Ok(ToolServer {
        name: raw.name.clone(),
        kind,
    })
}
