use std::collections::{BTreeMap, BTreeSet};

use crate::oracle::OracleOutput;

/// Undirected similarity graph keyed by original filenames.
///
/// Always symmetric: `b ∈ neighbours(a)` iff `a ∈ neighbours(b)`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimilarityGraph {
    adjacency: BTreeMap<String, BTreeSet<String>>,
}

impl SimilarityGraph {
    /// Build from possibly one-directional oracle output, translating stored
    /// names back to originals through `rename_map` (identity when absent).
    pub fn build(output: &OracleOutput, rename_map: &BTreeMap<String, String>) -> Self {
        let original = |stored: &str| rename_map.get(stored).cloned().unwrap_or_else(|| stored.to_string());
        let mut graph = Self::default();
        for (key, candidates) in output {
            let a = original(key);
            graph.add_node(&a);
            for c in candidates {
                let b = original(&c.name);
                graph.add_edge(&a, &b);
            }
        }
        graph
    }

    pub fn add_node(&mut self, name: &str) {
        if !self.adjacency.contains_key(name) {
            self.adjacency.insert(name.to_string(), BTreeSet::new());
        }
    }

    /// Insert `a ↔ b`. A self-observation only registers the node.
    pub fn add_edge(&mut self, a: &str, b: &str) {
        self.add_node(a);
        self.add_node(b);
        if a == b {
            return;
        }
        if let Some(n) = self.adjacency.get_mut(a) {
            n.insert(b.to_string());
        }
        if let Some(n) = self.adjacency.get_mut(b) {
            n.insert(a.to_string());
        }
    }

    pub fn neighbours(&self, name: &str) -> Option<&BTreeSet<String>> { self.adjacency.get(name) }

    pub fn nodes(&self) -> impl Iterator<Item = &str> { self.adjacency.keys().map(String::as_str) }

    pub fn len(&self) -> usize { self.adjacency.len() }

    pub fn is_empty(&self) -> bool { self.adjacency.is_empty() }

    pub fn edge_count(&self) -> usize { self.adjacency.values().map(BTreeSet::len).sum::<usize>() / 2 }
}
