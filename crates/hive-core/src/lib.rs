//! hive-core — swarm declaration parsing, validation and the instance graph.

pub mod config;
pub mod error;
pub mod graph;
pub mod types;

pub use config::{SwarmConfig, SUPPORTED_VERSION};
pub use error::{Error, Result};
pub use graph::InstanceGraph;
pub use types::{
    AgentInstance, OpenaiSettings, Provider, ToolServer, ToolServerKind, WorktreePolicy,
};
