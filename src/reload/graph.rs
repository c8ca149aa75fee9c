//! Pure dependency-graph logic for the Reload Driver (G): nodes are files,
//! edges are "imports". Kept free of actix/notify so it can be exercised
//! directly in tests (spec §8 "reload containment").

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

pub struct DependencyGraph {
    graph: DiGraph<PathBuf, ()>,
    nodes: HashMap<PathBuf, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self { graph: DiGraph::new(), nodes: HashMap::new() }
    }

    fn node(&mut self, path: &Path) -> NodeIndex {
        if let Some(&idx) = self.nodes.get(path) {
            return idx;
        }
        let idx = self.graph.add_node(path.to_path_buf());
        self.nodes.insert(path.to_path_buf(), idx);
        idx
    }

    /// Rewrites `path`'s outgoing "imports" edges to exactly `imports`,
    /// creating nodes for any import not already in the graph.
    pub fn set_imports(&mut self, path: &Path, imports: Vec<PathBuf>) {
        let from = self.node(path);
        let stale: Vec<_> = self.graph.edges_directed(from, Direction::Outgoing).map(|e| e.id()).collect();
        for edge in stale {
            self.graph.remove_edge(edge);
        }
        for import in imports {
            let to = self.node(&import);
            self.graph.update_edge(from, to, ());
        }
    }

    /// Drops `path` and every edge touching it (spec §4.5 "on deletion").
    pub fn remove_node(&mut self, path: &Path) {
        if let Some(idx) = self.nodes.remove(path) {
            self.graph.remove_node(idx);
            // `remove_node` swaps the last index into the freed slot; keep
            // `nodes` consistent with whatever `petgraph` did.
            self.nodes = self.graph.node_indices().map(|i| (self.graph[i].clone(), i)).collect();
        }
    }

    /// Nodes reachable by following "imports" edges forward from `path`
    /// (inclusive of `path` itself): the files `path` needs loaded first.
    pub fn forward_closure(&self, path: &Path) -> HashSet<PathBuf> {
        self.closure(path, Direction::Outgoing)
    }

    /// Nodes that transitively import `path` (inclusive of `path` itself):
    /// the files that need reloading when `path` changes.
    pub fn reverse_closure(&self, path: &Path) -> HashSet<PathBuf> {
        self.closure(path, Direction::Incoming)
    }

    fn closure(&self, path: &Path, direction: Direction) -> HashSet<PathBuf> {
        let mut seen = HashSet::new();
        let Some(&start) = self.nodes.get(path) else {
            seen.insert(path.to_path_buf());
            return seen;
        };
        let mut stack = vec![start];
        let mut visited = HashSet::new();
        while let Some(idx) = stack.pop() {
            if !visited.insert(idx) {
                continue;
            }
            seen.insert(self.graph[idx].clone());
            for neighbor in self.graph.neighbors_directed(idx, direction) {
                stack.push(neighbor);
            }
        }
        seen
    }

    /// Orders `nodes` so that a file always appears after everything it
    /// imports (spec §4.5 "dependency order, leaves first"), via Kahn's
    /// algorithm restricted to the given node set. Nodes not in the graph at
    /// all are appended last.
    pub fn leaves_first(&self, nodes: &HashSet<PathBuf>) -> Vec<PathBuf> {
        let indices: HashSet<NodeIndex> = nodes.iter().filter_map(|p| self.nodes.get(p).copied()).collect();

        // Kahn's algorithm over "imports" edges restricted to `indices`: a
        // node is ready once every file it imports has already loaded.
        let mut remaining_imports: HashMap<NodeIndex, usize> = indices
            .iter()
            .map(|&idx| (idx, self.graph.neighbors_directed(idx, Direction::Outgoing).filter(|n| indices.contains(n)).count()))
            .collect();

        let mut ready: Vec<NodeIndex> = remaining_imports.iter().filter(|(_, &c)| c == 0).map(|(&idx, _)| idx).collect();
        let mut order = Vec::with_capacity(indices.len());

        while let Some(idx) = ready.pop() {
            order.push(idx);
            // `idx` just loaded; anything that imports it may now be ready.
            for importer in self.graph.neighbors_directed(idx, Direction::Incoming) {
                if let Some(count) = remaining_imports.get_mut(&importer) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(importer);
                    }
                }
            }
        }

        // A cycle shouldn't occur for well-formed imports; append whatever
        // Kahn's algorithm couldn't resolve rather than dropping it.
        for &idx in &indices {
            if !order.contains(&idx) {
                order.push(idx);
            }
        }

        let mut result: Vec<PathBuf> = order.into_iter().map(|idx| self.graph[idx].clone()).collect();
        for path in nodes {
            if !self.nodes.contains_key(path) {
                result.push(path.clone());
            }
        }
        result
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn forward_closure_includes_transitive_imports() {
        let mut g = DependencyGraph::new();
        g.set_imports(&p("a.rs"), vec![p("b.rs")]);
        g.set_imports(&p("b.rs"), vec![p("c.rs")]);
        let closure = g.forward_closure(&p("a.rs"));
        assert_eq!(closure, HashSet::from([p("a.rs"), p("b.rs"), p("c.rs")]));
    }

    #[test]
    fn reverse_closure_includes_transitive_importers() {
        let mut g = DependencyGraph::new();
        g.set_imports(&p("a.rs"), vec![p("b.rs")]);
        g.set_imports(&p("b.rs"), vec![p("c.rs")]);
        let closure = g.reverse_closure(&p("c.rs"));
        assert_eq!(closure, HashSet::from([p("a.rs"), p("b.rs"), p("c.rs")]));
    }

    #[test]
    fn unknown_path_closure_is_itself() {
        let g = DependencyGraph::new();
        assert_eq!(g.forward_closure(&p("missing.rs")), HashSet::from([p("missing.rs")]));
    }

    #[test]
    fn leaves_first_orders_imports_before_importers() {
        let mut g = DependencyGraph::new();
        g.set_imports(&p("a.rs"), vec![p("b.rs")]);
        g.set_imports(&p("b.rs"), vec![p("c.rs")]);
        let nodes = HashSet::from([p("a.rs"), p("b.rs"), p("c.rs")]);
        let order = g.leaves_first(&nodes);
        let pos = |path: &PathBuf| order.iter().position(|n| n == path).unwrap();
        assert!(pos(&p("c.rs")) < pos(&p("b.rs")));
        assert!(pos(&p("b.rs")) < pos(&p("a.rs")));
    }

    #[test]
    fn re_setting_imports_drops_stale_edges() {
        let mut g = DependencyGraph::new();
        g.set_imports(&p("a.rs"), vec![p("b.rs")]);
        g.set_imports(&p("a.rs"), vec![p("c.rs")]);
        assert_eq!(g.forward_closure(&p("a.rs")), HashSet::from([p("a.rs"), p("c.rs")]));
    }

    #[test]
    fn remove_node_clears_its_edges() {
        let mut g = DependencyGraph::new();
        g.set_imports(&p("a.rs"), vec![p("b.rs")]);
        g.remove_node(&p("b.rs"));
        assert_eq!(g.forward_closure(&p("a.rs")), HashSet::from([p("a.rs")]));
    }
}
