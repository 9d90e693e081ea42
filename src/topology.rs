//! Per-instance manifest generation.
//!
//! Manifests are generated once per session, before the root process
//! starts, and never regenerated mid-session. Each instance gets two
//! files under `manifests/`: `<name>.json`, the manifest this program
//! reads back in serve mode, and `<name>.mcp.json`, the same topology
//! in the executor CLI's mcp-server format.

use crate::session::SessionPaths;
use crate::worktree::WorktreeManager;
use hive_core::{AgentInstance, Error, Provider, Result, SwarmConfig, ToolServerKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

pub const PERMISSION_SERVER_NAME: &str = "permissions";
pub const PERMISSION_TOOL_NAME: &str = "check_permission";

/// Tool name the executor CLI calls before each gated invocation.
pub fn permission_prompt_tool() -> String {
    format!("mcp__{PERMISSION_SERVER_NAME}__{PERMISSION_TOOL_NAME}")
}

/// Session-unique id for one instance: the shared name plus a fresh
/// suffix, so concurrent sessions of the same swarm stay distinct.
pub fn new_instance_id(name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{name}_{}", &suffix[..12])
}

/// One invocable integration in an instance's manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ManifestEntry {
    /// A static tool server declared in the configuration.
    ToolServer { name: String, server: ToolServerKind },
    /// A declared connection: re-enters this program in serve mode
    /// scoped to the target, with calling-instance attribution.
    Connection {
        target: String,
        instance_id: String,
        caller: String,
        model: String,
        provider: Provider,
        directories: Vec<PathBuf>,
        prompt: Option<String>,
        description: String,
        allowed_tools: Vec<String>,
        disallowed_tools: Vec<String>,
    },
    /// The permission gate, present unless the instance is unrestricted.
    PermissionGate {
        allowed_tools: Vec<String>,
        disallowed_tools: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceManifest {
    pub instance: String,
    pub instance_id: String,
    pub model: String,
    pub provider: Provider,
    pub directories: Vec<PathBuf>,
    pub prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub unrestricted: bool,
    pub entries: Vec<ManifestEntry>,
}

impl InstanceManifest {
    pub fn file(session: &SessionPaths, instance: &str) -> PathBuf {
        session.manifests_dir().join(format!("{instance}.json"))
    }

    pub fn mcp_file(session: &SessionPaths, instance: &str) -> PathBuf {
        session.manifests_dir().join(format!("{instance}.mcp.json"))
    }

    pub fn load(session: &SessionPaths, instance: &str) -> Result<Self> {
        let path = Self::file(session, instance);
        let raw = fs::read_to_string(&path).map_err(|e| {
            Error::session(format!("reading manifest {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn connections(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry, ManifestEntry::Connection { .. }))
    }

    pub fn primary_directory(&self) -> PathBuf {
        self.directories
            .first()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

pub struct TopologyGenerator<'a> {
    config: &'a SwarmConfig,
    session: &'a SessionPaths,
    /// Path to this executable, re-entered by serve descriptors.
    program: PathBuf,
}

impl<'a> TopologyGenerator<'a> {
    pub fn new(config: &'a SwarmConfig, session: &'a SessionPaths, program: PathBuf) -> Self {
        Self {
            config,
            session,
            program,
        }
    }

    /// Generate and persist every instance's manifest. Instance ids are
    /// minted here, once, so every descriptor referring to the same
    /// instance carries the same id for the whole session.
    pub async fn generate(&self, worktrees: &WorktreeManager) -> Result<BTreeMap<String, InstanceManifest>> {
        let ids: BTreeMap<String, String> = self
            .config
            .instances
            .keys()
            .map(|name| (name.clone(), new_instance_id(name)))
            .collect();

        let mut manifests = BTreeMap::new();
        for (name, instance) in &self.config.instances {
            let manifest = self
                .build_manifest(name, instance, &ids, worktrees)
                .await?;
            self.write_manifest(&manifest)?;
            manifests.insert(name.clone(), manifest);
        }
        Ok(manifests)
    }

    async fn build_manifest(
        &self,
        name: &str,
        instance: &AgentInstance,
        ids: &BTreeMap<String, String>,
        worktrees: &WorktreeManager,
    ) -> Result<InstanceManifest> {
        let directories = self.isolated_directories(instance, worktrees).await;
        let mut entries: Vec<ManifestEntry> = Vec::new();

        for server in &instance.tool_servers {
            entries.push(ManifestEntry::ToolServer {
                name: server.name.clone(),
                server: server.kind.clone(),
            });
        }

        for target in &instance.connections {
            let connected = self.config.instances.get(target).ok_or_else(|| {
                Error::graph(format!("'{name}' connects to undeclared instance '{target}'"))
            })?;
            let target_dirs = self.isolated_directories(connected, worktrees).await;
            entries.push(ManifestEntry::Connection {
                target: target.clone(),
                instance_id: ids[target].clone(),
                caller: name.to_string(),
                model: connected.model.clone(),
                provider: connected.provider,
                directories: target_dirs,
                prompt: connected.prompt.clone(),
                description: connected.description.clone(),
                allowed_tools: connected.allowed_tools.clone(),
                disallowed_tools: connected.disallowed_tools.clone(),
            });
        }

        if !instance.vibe {
            entries.push(ManifestEntry::PermissionGate {
                allowed_tools: instance.allowed_tools.clone(),
                disallowed_tools: instance.disallowed_tools.clone(),
            });
        }

        debug!(instance = name, entries = entries.len(), "manifest built");
        Ok(InstanceManifest {
            instance: name.to_string(),
            instance_id: ids[name].clone(),
            model: instance.model.clone(),
            provider: instance.provider,
            directories,
            prompt: instance.prompt.clone(),
            allowed_tools: instance.allowed_tools.clone(),
            disallowed_tools: instance.disallowed_tools.clone(),
            unrestricted: instance.vibe,
            entries,
        })
    }

    async fn isolated_directories(
        &self,
        instance: &AgentInstance,
        worktrees: &WorktreeManager,
    ) -> Vec<PathBuf> {
        match worktrees.determine_policy(instance) {
            Some(label) => {
                let mut mapped = Vec::with_capacity(instance.directories.len());
                for dir in &instance.directories {
                    mapped.push(worktrees.map_path(dir, &label).await);
                }
                mapped
            }
            None => instance.directories.clone(),
        }
    }

    fn write_manifest(&self, manifest: &InstanceManifest) -> Result<()> {
        fs::create_dir_all(self.session.manifests_dir())?;
        fs::write(
            InstanceManifest::file(self.session, &manifest.instance),
            serde_json::to_string_pretty(manifest)?,
        )?;
        fs::write(
            InstanceManifest::mcp_file(self.session, &manifest.instance),
            serde_json::to_string_pretty(&self.mcp_servers(manifest))?,
        )?;
        Ok(())
    }

    /// The same topology in the executor CLI's `mcpServers` format.
    fn mcp_servers(&self, manifest: &InstanceManifest) -> Value {
        let session_root = self.session.root().display().to_string();
        let program = self.program.display().to_string();
        let mut servers = Map::new();

        for entry in &manifest.entries {
            match entry {
                ManifestEntry::ToolServer { name, server } => {
                    let value = match server {
                        ToolServerKind::Stdio { command, args } => json!({
                            "type": "stdio",
                            "command": command,
                            "args": args,
                        }),
                        ToolServerKind::Http { url } => json!({
                            "type": "http",
                            "url": url,
                        }),
                    };
                    servers.insert(name.clone(), value);
                }
                ManifestEntry::Connection { target, caller, .. } => {
                    servers.insert(
                        target.clone(),
                        json!({
                            "type": "stdio",
                            "command": program,
                            "args": [
                                "serve",
                                "--session-path", session_root,
                                "--instance", target,
                                "--caller", caller,
                            ],
                        }),
                    );
                }
                ManifestEntry::PermissionGate { .. } => {
                    servers.insert(
                        PERMISSION_SERVER_NAME.to_string(),
                        json!({
                            "type": "stdio",
                            "command": program,
                            "args": [
                                "permission-stdio",
                                "--session-path", session_root,
                                "--instance", manifest.instance,
                            ],
                        }),
                    );
                }
            }
        }
        json!({ "mcpServers": Value::Object(servers) })
    }
}
