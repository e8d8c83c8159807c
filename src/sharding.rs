//! Dependency-aware packing of entities into size-bounded shards.
//!
//! Entities are split into the data-definition and program-logic groups, ordered so
//! that dependencies come first wherever the graph allows, and then packed greedily
//! against the size budget. Cycles never stall the ordering: when nothing is
//! eligible the first remaining entity is placed and the choice is logged.

use crate::context::{ContextAugmenter, ContextEntry};
use crate::dependency_graph::DependencyGraph;
use crate::extractor::{Entity, ShardGroup};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

/// A size-bounded group of entities analyzed as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub id: String,
    pub group: ShardGroup,
    pub entities: Vec<Arc<Entity>>,
    pub external_dependencies: BTreeSet<String>,
    pub context: BTreeMap<String, ContextEntry>,
    pub total_size: usize,
    pub line_start: usize,
    pub line_end: usize,
    pub total_lines: usize,
}

impl Shard {
    pub fn entity_names(&self) -> Vec<&str> {
        self.entities.iter().map(|e| e.name.as_str()).collect()
    }
}

/// Result of ordering one group: the placement order plus entities forced out of a cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupOrder {
    pub order: Vec<Arc<Entity>>,
    pub forced: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackingReport {
    pub shard_count: usize,
    pub shards_per_group: BTreeMap<ShardGroup, usize>,
    pub oversized_shards: Vec<String>,
    pub forced_placements: Vec<String>,
}

pub struct ShardPacker {
    max_shard_size: usize,
}

impl ShardPacker {
    pub fn new(max_shard_size: usize) -> Self {
        Self { max_shard_size }
    }

    /// Packs every entity into exactly one shard; data definitions come first.
    pub fn pack(
        &self,
        entities: &[Arc<Entity>],
        graph: &DependencyGraph,
        augmenter: &ContextAugmenter,
    ) -> (Vec<Shard>, PackingReport) {
        let mut shards = Vec::new();
        let mut report = PackingReport::default();

        for group in ShardGroup::ALL {
            let members: Vec<Arc<Entity>> = entities
                .iter()
                .filter(|e| e.category.group() == group)
                .cloned()
                .collect();
            if members.is_empty() {
                continue;
            }

            let ordered = self.order_group(&members, graph);
            report.forced_placements.extend(ordered.forced.iter().cloned());

            let group_shards = self.pack_ordered(group, &ordered.order, graph, augmenter);
            report.shards_per_group.insert(group, group_shards.len());
            report.oversized_shards.extend(
                group_shards
                    .iter()
                    .filter(|s| s.total_size > self.max_shard_size)
                    .map(|s| s.id.clone()),
            );
            shards.extend(group_shards);
        }

        report.shard_count = shards.len();
        info!(
            "Packed {} entities into {} shards ({} forced placements)",
            entities.len(),
            shards.len(),
            report.forced_placements.len()
        );
        (shards, report)
    }

    /// Orders one group in waves of entities whose in-group dependencies are all placed.
    pub fn order_group(&self, members: &[Arc<Entity>], graph: &DependencyGraph) -> GroupOrder {
        let in_group: HashSet<&str> = members.iter().map(|e| e.name.as_str()).collect();
        let mut placed: HashSet<String> = HashSet::with_capacity(members.len());
        let mut remaining: Vec<Arc<Entity>> = members.to_vec();
        let mut result = GroupOrder::default();

        while !remaining.is_empty() {
            let (ready, waiting): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|entity| {
                graph
                    .dependencies_of(&entity.name)
                    .iter()
                    .filter(|dep| *dep != &entity.name && in_group.contains(dep.as_str()))
                    .all(|dep| placed.contains(dep))
            });
            remaining = waiting;

            if ready.is_empty() {
                let forced = remaining.remove(0);
                warn!(
                    "Dependency cycle in {} group, forcing placement of {}",
                    forced.category.group().label(),
                    forced.name
                );
                result.forced.push(forced.name.clone());
                placed.insert(forced.name.clone());
                result.order.push(forced);
                continue;
            }

            for entity in ready {
                placed.insert(entity.name.clone());
                result.order.push(entity);
            }
        }

        result
    }

    fn pack_ordered(
        &self,
        group: ShardGroup,
        ordered: &[Arc<Entity>],
        graph: &DependencyGraph,
        augmenter: &ContextAugmenter,
    ) -> Vec<Shard> {
        let mut shards = Vec::new();
        let mut current: Vec<Arc<Entity>> = Vec::new();
        let mut current_size = 0usize;

        for entity in ordered {
            if !current.is_empty() && current_size + entity.size_metric > self.max_shard_size {
                let members = std::mem::take(&mut current);
                shards.push(self.build_shard(group, shards.len() + 1, members, graph, augmenter));
                current_size = 0;
            }
            current_size += entity.size_metric;
            current.push(Arc::clone(entity));
        }

        if !current.is_empty() {
            shards.push(self.build_shard(group, shards.len() + 1, current, graph, augmenter));
        }

        shards
    }

    fn build_shard(
        &self,
        group: ShardGroup,
        sequence: usize,
        entities: Vec<Arc<Entity>>,
        graph: &DependencyGraph,
        augmenter: &ContextAugmenter,
    ) -> Shard {
        let member_names: HashSet<&str> = entities.iter().map(|e| e.name.as_str()).collect();
        let external_dependencies: BTreeSet<String> = entities
            .iter()
            .flat_map(|e| graph.dependencies_of(&e.name))
            .filter(|dep| !member_names.contains(dep.as_str()))
            .collect();

        let context = augmenter.context_for(&external_dependencies);
        let line_start = entities.iter().map(|e| e.line_start).min().unwrap_or(0);
        let line_end = entities.iter().map(|e| e.line_end).max().unwrap_or(0);
        let total_lines = entities
            .iter()
            .map(|e| e.line_end.saturating_sub(e.line_start) + 1)
            .sum();

        Shard {
            id: format!("{}_{:03}", group.id_prefix(), sequence),
            group,
            total_size: entities.iter().map(|e| e.size_metric).sum(),
            entities,
            external_dependencies,
            context,
            line_start,
            line_end,
            total_lines,
        }
    }
}
