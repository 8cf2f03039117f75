use std::collections::BTreeSet;

use crate::graph::SimilarityGraph;

/// Connected components of `graph` with at least two members.
///
/// Iterative DFS; the visited set belongs to this call. Groups come out in
/// order of their smallest member, members sorted.
pub fn find_components(graph: &SimilarityGraph) -> Vec<Vec<String>> {
    let mut visited: BTreeSet<&str> = BTreeSet::new();
    let mut groups = Vec::new();

    for start in graph.nodes() {
        if !visited.insert(start) {
            continue;
        }
        let mut component = vec![start];
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for next in graph.neighbours(node).into_iter().flatten() {
                if visited.insert(next.as_str()) {
                    component.push(next.as_str());
                    stack.push(next.as_str());
                }
            }
        }
        if component.len() > 1 {
            component.sort_unstable();
            groups.push(component.into_iter().map(str::to_string).collect());
        }
    }
    groups
}
