//! hive — hierarchical agent-swarm orchestration.
//!
//! A swarm is declared in one YAML file: named instances, a designated
//! main instance, and acyclic connections between them. The supervisor
//! validates the declaration, generates per-instance manifests, spawns
//! the main instance as a foreground process, and tears everything down
//! when it finishes. Instances re-enter this same executable in serve
//! mode to reach their declared connections.

pub mod permission;
pub mod serve;
pub mod session;
pub mod supervisor;
pub mod topology;
pub mod worktree;
