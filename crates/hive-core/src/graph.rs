//! Instance graph — directed "may invoke" edges with cycle rejection.
//!
//! The walk is a depth-first traversal per starting instance with a
//! recursion path and a separate global visited set. Revisiting a node
//! already on the current path reports the cycle as the path slice from
//! that node's first occurrence plus the repeat, e.g. `A -> B -> C -> A`.

use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Validated, acyclic invocation graph over instance names.
#[derive(Debug, Clone)]
pub struct InstanceGraph {
    root: String,
    edges: BTreeMap<String, Vec<String>>,
}

impl InstanceGraph {
    /// Build a graph, verifying every edge target is declared and the
    /// graph is acyclic.
    pub fn new(root: String, edges: BTreeMap<String, Vec<String>>) -> Result<Self> {
        if !edges.contains_key(&root) {
            return Err(Error::graph(format!("root instance '{root}' is not declared")));
        }
        for (from, targets) in &edges {
            for to in targets {
                if !edges.contains_key(to) {
                    return Err(Error::graph(format!(
                        "instance '{from}' references undeclared instance '{to}'"
                    )));
                }
            }
        }
        ensure_acyclic(&edges)?;
        Ok(Self { root, edges })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn instances(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }

    pub fn connections(&self, instance: &str) -> &[String] {
        self.edges.get(instance).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Instances reachable from the root, root included.
    pub fn reachable(&self) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![self.root.clone()];
        while let Some(node) = stack.pop() {
            if seen.insert(node.clone()) {
                for next in self.connections(&node) {
                    stack.push(next.clone());
                }
            }
        }
        seen
    }
}

fn ensure_acyclic(edges: &BTreeMap<String, Vec<String>>) -> Result<()> {
    let mut visited = BTreeSet::new();
    for start in edges.keys() {
        let mut path = Vec::new();
        walk(start, edges, &mut visited, &mut path)?;
    }
    Ok(())
}

fn walk(
    node: &str,
    edges: &BTreeMap<String, Vec<String>>,
    visited: &mut BTreeSet<String>,
    path: &mut Vec<String>,
) -> Result<()> {
    if let Some(pos) = path.iter().position(|n| n == node) {
        let mut cycle: Vec<&str> = path[pos..].iter().map(String::as_str).collect();
        cycle.push(node);
        return Err(Error::graph(format!(
            "cycle detected: {}",
            cycle.join(" -> ")
        )));
    }
    if visited.contains(node) {
        return Ok(());
    }
    path.push(node.to_string());
    for next in edges.get(node).map(Vec::as_slice).unwrap_or(&[]) {
        walk(next, edges, visited, path)?;
    }
    path.pop();
    visited.insert(node.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn accepts_tree() {
        let g = InstanceGraph::new(
            "main".into(),
            edges(&[("main", &["a", "b"]), ("a", &[]), ("b", &["a"])]),
        );
        assert!(g.is_ok());
    }

    #[test]
    fn rejects_three_node_cycle_with_exact_path() {
        let err = InstanceGraph::new(
            "A".into(),
            edges(&[("A", &["B"]), ("B", &["C"]), ("C", &["A"])]),
        )
        .unwrap_err();
        assert!(
            err.to_string().contains("A -> B -> C -> A"),
            "unexpected message: {err}"
        );
    }

    #[test]
    fn rejects_self_loop() {
        let err = InstanceGraph::new("A".into(), edges(&[("A", &["A"])])).unwrap_err();
        assert!(err.to_string().contains("A -> A"));
    }

    #[test]
    fn rejects_dangling_reference() {
        let err = InstanceGraph::new("A".into(), edges(&[("A", &["ghost"])])).unwrap_err();
        assert!(err.to_string().contains("undeclared instance 'ghost'"));
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let g = InstanceGraph::new(
            "top".into(),
            edges(&[
                ("top", &["left", "right"]),
                ("left", &["bottom"]),
                ("right", &["bottom"]),
                ("bottom", &[]),
            ]),
        )
        .unwrap();
        assert_eq!(g.reachable().len(), 4);
    }

    #[test]
    fn reachable_ignores_disconnected_instances() {
        let g = InstanceGraph::new(
            "main".into(),
            edges(&[("main", &["a"]), ("a", &[]), ("island", &[])]),
        )
        .unwrap();
        let reachable = g.reachable();
        assert!(reachable.contains("main"));
        assert!(reachable.contains("a"));
        assert!(!reachable.contains("island"));
    }
}
