use crate::extractor::Entity;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

/// Resolved `name -> dependencies` graph over the extracted entities.
///
/// Nodes are entity names; an edge `a -> b` means `a` references `b`.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    node_map: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.node_map.contains_key(name)
    }

    /// Resolved dependencies of `name`; empty for unknown names.
    pub fn dependencies_of(&self, name: &str) -> BTreeSet<String> {
        self.node_map
            .get(name)
            .map(|&node| {
                self.graph
                    .neighbors_directed(node, Direction::Outgoing)
                    .map(|dep| self.graph[dep].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The whole graph as an ordered adjacency map.
    pub fn to_adjacency(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.node_map
            .keys()
            .map(|name| (name.clone(), self.dependencies_of(name)))
            .collect()
    }

    pub fn analyze(&self) -> DependencyAnalysis {
        let total_nodes = self.graph.node_count();
        let total_edges = self.graph.edge_count();

        let mut cycles: Vec<Vec<String>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .map(|&n| self.graph.contains_edge(n, n))
                        .unwrap_or(false)
            })
            .map(|component| {
                let mut names: Vec<String> =
                    component.into_iter().map(|n| self.graph[n].clone()).collect();
                names.sort();
                names
            })
            .collect();
        cycles.sort();

        let isolated_entities = self
            .graph
            .node_indices()
            .filter(|&n| {
                self.graph.neighbors_directed(n, Direction::Outgoing).next().is_none()
                    && self.graph.neighbors_directed(n, Direction::Incoming).next().is_none()
            })
            .count();

        DependencyAnalysis {
            total_nodes,
            total_edges,
            avg_degree: if total_nodes > 0 { total_edges as f64 / total_nodes as f64 } else { 0.0 },
            isolated_entities,
            cycles,
        }
    }
}

pub struct GraphBuilder;

impl GraphBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Keeps only tokens naming another known entity. Unknown tokens are dropped silently.
    pub fn build_graph(&self, entities: &[Entity]) -> DependencyGraph {
        let mut graph = DependencyGraph::default();

        for entity in entities {
            if graph.node_map.contains_key(&entity.name) {
                debug!("Entity {} already has a node, ignoring duplicate", entity.name);
                continue;
            }
            let node = graph.graph.add_node(entity.name.clone());
            graph.node_map.insert(entity.name.clone(), node);
        }

        let mut dropped = 0usize;
        let mut resolved = HashSet::new();
        for entity in entities {
            if !resolved.insert(entity.name.as_str()) {
                continue;
            }
            let from = graph.node_map[&entity.name];
            for token in &entity.raw_dependency_tokens {
                if token == &entity.name {
                    continue;
                }
                match graph.node_map.get(token) {
                    Some(&to) => {
                        graph.graph.update_edge(from, to, ());
                    }
                    None => dropped += 1,
                }
            }
        }

        info!(
            "Dependency graph: {} entities, {} edges ({} unresolved tokens dropped)",
            graph.node_count(),
            graph.edge_count(),
            dropped
        );
        graph
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyAnalysis {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub avg_degree: f64,
    pub isolated_entities: usize,
    /// Strongly connected components that form a cycle, as sorted name lists.
    pub cycles: Vec<Vec<String>>,
}

impl DependencyAnalysis {
    pub fn log_summary(&self) {
        info!(
            "Dependency analysis: {} nodes, {} edges, average degree {:.2}, {} isolated",
            self.total_nodes, self.total_edges, self.avg_degree, self.isolated_entities
        );
        for cycle in &self.cycles {
            warn!("Dependency cycle between: {}", cycle.join(", "));
        }
    }
}
