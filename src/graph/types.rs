//! Graph type definitions.
//!
//! This module defines the dependency graph:
//! - `Graph`: arena of vertices with an index by name
//! - `GraphSnapshot`: the serializable form used by plans
//!
//! An edge `A -> B` means "A depends on B": B must complete before A starts.

use super::vertex::{MetaVertex, Vertex, VertexKind};
use crate::error::{EngineError, Result};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// The dependency graph structure.
///
/// # Structure
///
/// ```text
/// Graph
/// ├── inner: StableDiGraph<Vertex, ()>   // vertices keep their index on removal
/// └── index: HashMap<String, NodeIndex>  // fast lookup by name
/// ```
///
/// The graph is mutated only while it is built and transformed. Walks share
/// it read-only behind an `Arc`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(into = "GraphSnapshot", try_from = "GraphSnapshot")]
pub struct Graph {
    inner: StableDiGraph<Vertex, ()>,
    index: HashMap<String, NodeIndex>,
}

impl Graph {
    /// Create a new empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vertex. Names must be unique.
    pub fn add_vertex(&mut self, vertex: Vertex) -> Result<()> {
        if self.index.contains_key(&vertex.name) {
            return Err(crate::err!(DuplicateVertex { name: vertex.name }));
        }
        let name = vertex.name.clone();
        let idx = self.inner.add_node(vertex);
        self.index.insert(name, idx);
        Ok(())
    }

    /// Remove a vertex and all of its edges.
    pub fn remove_vertex(&mut self, name: &str) -> Option<Vertex> {
        let idx = self.index.remove(name)?;
        self.inner.remove_node(idx)
    }

    /// Add the edge `from -> to` ("from depends on to").
    ///
    /// Returns `false` if the edge already existed.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<bool> {
        if from == to {
            return Err(crate::err!(SelfEdge { vertex: from.to_string() }));
        }
        let (from_idx, to_idx) = (self.require(from)?, self.require(to)?);
        if self.inner.find_edge(from_idx, to_idx).is_some() {
            return Ok(false);
        }
        self.inner.add_edge(from_idx, to_idx, ());
        Ok(true)
    }

    /// Remove the edge `from -> to`. Returns whether it existed.
    pub fn disconnect(&mut self, from: &str, to: &str) -> bool {
        let (Some(&from_idx), Some(&to_idx)) = (self.index.get(from), self.index.get(to)) else {
            return false;
        };
        match self.inner.find_edge(from_idx, to_idx) {
            Some(edge) => self.inner.remove_edge(edge).is_some(),
            None => false,
        }
    }

    fn require(&self, name: &str) -> Result<NodeIndex> {
        self.index.get(name).copied().ok_or_else(|| {
            crate::err!(GraphBuild { message: format!("unknown vertex '{name}'") })
        })
    }

    /// Whether a vertex exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Get a vertex by name.
    #[must_use]
    pub fn vertex(&self, name: &str) -> Option<&Vertex> {
        self.index.get(name).map(|&idx| &self.inner[idx])
    }

    /// Get a mutable vertex by name. The name itself must not be changed.
    pub fn vertex_mut(&mut self, name: &str) -> Option<&mut Vertex> {
        let idx = *self.index.get(name)?;
        self.inner.node_weight_mut(idx)
    }

    /// Get the number of vertices in the graph.
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.inner.node_count()
    }

    /// Get the number of edges in the graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    /// Iterate over all vertices (unordered).
    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.inner.node_weights()
    }

    /// All vertex names, sorted.
    #[must_use]
    pub fn vertex_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.index.keys().cloned().collect();
        names.sort();
        names
    }

    /// All edges as `(from, to)` pairs, sorted.
    #[must_use]
    pub fn edges(&self) -> Vec<(String, String)> {
        let mut edges: Vec<(String, String)> = self
            .inner
            .edge_references()
            .map(|e| (self.inner[e.source()].name.clone(), self.inner[e.target()].name.clone()))
            .collect();
        edges.sort();
        edges
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<&str> {
        let Some(&idx) = self.index.get(name) else {
            return Vec::new();
        };
        let mut names: Vec<&str> = self
            .inner
            .neighbors_directed(idx, direction)
            .map(|n| self.inner[n].name.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Vertices the given vertex depends on (outgoing edges), sorted.
    #[must_use]
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Vertices that depend on the given vertex (incoming edges), sorted.
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Incoming)
    }

    fn reachable(&self, name: &str, direction: Direction) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let Some(&start) = self.index.get(name) else {
            return seen;
        };
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            for n in self.inner.neighbors_directed(idx, direction) {
                if seen.insert(self.inner[n].name.clone()) {
                    stack.push(n);
                }
            }
        }
        seen
    }

    /// Every vertex that transitively depends on the given vertex.
    #[must_use]
    pub fn ancestors(&self, name: &str) -> BTreeSet<String> {
        self.reachable(name, Direction::Incoming)
    }

    /// Every vertex the given vertex transitively depends on.
    #[must_use]
    pub fn descendants(&self, name: &str) -> BTreeSet<String> {
        self.reachable(name, Direction::Outgoing)
    }

    /// Vertices nothing depends on (no incoming edges). After the transform
    /// pipeline this is exactly the `root` vertex, which completes last.
    #[must_use]
    pub fn roots(&self) -> Vec<&str> {
        self.with_no_edges(Direction::Incoming)
    }

    /// Vertices with no dependencies (no outgoing edges); they start first.
    #[must_use]
    pub fn leaves(&self) -> Vec<&str> {
        self.with_no_edges(Direction::Outgoing)
    }

    fn with_no_edges(&self, direction: Direction) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .inner
            .node_indices()
            .filter(|&idx| self.inner.neighbors_directed(idx, direction).next().is_none())
            .map(|idx| self.inner[idx].name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Dependency-first execution order, ties broken by name.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
        for idx in self.inner.node_indices() {
            let deps = self.inner.neighbors_directed(idx, Direction::Outgoing).count();
            pending.insert(self.inner[idx].name.as_str(), deps);
        }
        let mut ready: BTreeSet<&str> =
            pending.iter().filter(|(_, n)| **n == 0).map(|(name, _)| *name).collect();
        let mut order = Vec::with_capacity(pending.len());

        while let Some(name) = ready.pop_first() {
            order.push(name.to_string());
            for dependent in self.dependents(name) {
                if let Some(n) = pending.get_mut(dependent) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() != self.vertex_count() {
            return Err(self.cycle_error());
        }
        Ok(order)
    }

    /// Fail with the first cycle found, listed in edge order.
    pub fn validate_acyclic(&self) -> Result<()> {
        let sccs = petgraph::algo::tarjan_scc(&self.inner);
        if sccs.iter().any(|scc| scc.len() > 1) {
            return Err(self.cycle_error());
        }
        Ok(())
    }

    fn cycle_error(&self) -> EngineError {
        let cycle = self.find_cycle().unwrap_or_default();
        crate::err!(Cycle { cycle: cycle.join(" -> ") })
    }

    /// One cycle through the lexicographically first vertex of the first
    /// non-trivial strongly connected component, closed on its start.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut components: Vec<Vec<NodeIndex>> = petgraph::algo::tarjan_scc(&self.inner)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .collect();
        for scc in &mut components {
            scc.sort_by(|a, b| self.inner[*a].name.cmp(&self.inner[*b].name));
        }
        components.sort_by(|a, b| self.inner[a[0]].name.cmp(&self.inner[b[0]].name));
        let scc = components.into_iter().next()?;
        let members: BTreeSet<NodeIndex> = scc.iter().copied().collect();
        let start = scc[0];

        // Breadth-first search back to the start, staying inside the component.
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            let mut next: Vec<NodeIndex> = self
                .inner
                .neighbors_directed(idx, Direction::Outgoing)
                .filter(|n| members.contains(n))
                .collect();
            next.sort_by(|a, b| self.inner[*a].name.cmp(&self.inner[*b].name));
            for n in next {
                if n == start {
                    let mut path = vec![self.inner[start].name.clone()];
                    let mut cur = idx;
                    let mut rev = Vec::new();
                    while cur != start {
                        rev.push(self.inner[cur].name.clone());
                        cur = parent[&cur];
                    }
                    path.extend(rev.into_iter().rev());
                    path.push(self.inner[start].name.clone());
                    return Some(path);
                }
                if let std::collections::hash_map::Entry::Vacant(e) = parent.entry(n) {
                    e.insert(idx);
                    queue.push_back(n);
                }
            }
        }
        None
    }

    /// Resource instances `name` depends on, looking through values,
    /// outputs, aggregates and module barriers but stopping at each instance
    /// reached.
    #[must_use]
    pub fn instance_dependencies(&self, name: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = self.dependencies(name);
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(vertex) = self.vertex(current) else { continue };
            if vertex.as_diffable().is_some() {
                found.insert(current.to_string());
            } else if vertex.as_value_source().is_some()
                || vertex.as_module().is_some()
                || matches!(vertex.kind, VertexKind::Meta(MetaVertex::Ordering))
            {
                stack.extend(self.dependencies(current));
            }
        }
        found
    }

    /// Serializable snapshot of the graph.
    #[must_use]
    pub fn snapshot(&self) -> GraphSnapshot {
        let mut vertices: Vec<Vertex> = self.inner.node_weights().cloned().collect();
        vertices.sort_by(|a, b| a.name.cmp(&b.name));
        GraphSnapshot { vertices, edges: self.edges() }
    }
}

impl PartialEq for Graph {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot()
    }
}

/// The serialized form of a [`Graph`]: sorted vertices and edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub vertices: Vec<Vertex>,
    pub edges: Vec<(String, String)>,
}

impl From<Graph> for GraphSnapshot {
    fn from(graph: Graph) -> Self {
        graph.snapshot()
    }
}

impl TryFrom<GraphSnapshot> for Graph {
    type Error = EngineError;

    fn try_from(snapshot: GraphSnapshot) -> Result<Self> {
        let mut graph = Self::new();
        for vertex in snapshot.vertices {
            graph.add_vertex(vertex)?;
        }
        for (from, to) in &snapshot.edges {
            graph.connect(from, to)?;
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::vertex::{MetaVertex, VertexKind};
    use pretty_assertions::assert_eq;

    fn meta(name: &str) -> Vertex {
        Vertex::new(name, VertexKind::Meta(MetaVertex::Ordering))
    }

    fn graph(names: &[&str], edges: &[(&str, &str)]) -> Graph {
        let mut g = Graph::new();
        for name in names {
            g.add_vertex(meta(name)).unwrap();
        }
        for (from, to) in edges {
            g.connect(from, to).unwrap();
        }
        g
    }

    #[test]
    fn test_duplicate_and_self_edge_rejected() {
        let mut g = graph(&["a"], &[]);
        assert!(matches!(g.add_vertex(meta("a")), Err(EngineError::DuplicateVertex { .. })));
        assert!(matches!(g.connect("a", "a"), Err(EngineError::SelfEdge { .. })));
        assert!(g.connect("a", "missing").is_err());
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let mut g = graph(&["a", "b"], &[("a", "b")]);
        assert!(!g.connect("a", "b").unwrap());
        assert_eq!(g.edge_count(), 1);
        assert!(g.disconnect("a", "b"));
        assert!(!g.disconnect("a", "b"));
    }

    #[test]
    fn test_connectivity_queries() {
        // c -> b -> a, d -> a
        let g = graph(&["a", "b", "c", "d"], &[("b", "a"), ("c", "b"), ("d", "a")]);
        assert_eq!(g.dependencies("b"), vec!["a"]);
        assert_eq!(g.dependents("a"), vec!["b", "d"]);
        assert_eq!(g.ancestors("a").into_iter().collect::<Vec<_>>(), vec!["b", "c", "d"]);
        assert_eq!(g.descendants("c").into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(g.roots(), vec!["c", "d"]);
        assert_eq!(g.leaves(), vec!["a"]);
        assert_eq!(g.topological_order().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_remove_vertex_drops_edges() {
        let mut g = graph(&["a", "b", "c"], &[("b", "a"), ("c", "b")]);
        assert!(g.remove_vertex("b").is_some());
        assert_eq!(g.edge_count(), 0);
        assert!(!g.contains("b"));
        // Indices of remaining vertices stay valid.
        assert_eq!(g.vertex("c").unwrap().name, "c");
    }

    #[test]
    fn test_cycle_reported_in_order() {
        let g = graph(&["a", "b", "c", "d"], &[("a", "b"), ("b", "c"), ("c", "a"), ("d", "a")]);
        match g.validate_acyclic() {
            Err(EngineError::Cycle { cycle, .. }) => assert_eq!(cycle, "a -> b -> c -> a"),
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(g.topological_order().is_err());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let g = graph(&["b", "a", "c"], &[("c", "a"), ("b", "a")]);
        let json = serde_json::to_string(&g).unwrap();
        let back: Graph = serde_json::from_str(&json).unwrap();
        assert_eq!(g, back);
        assert_eq!(back.edges(), vec![("b".into(), "a".into()), ("c".into(), "a".into())]);
    }
}
