// src/dag.rs
//
// =============================================================================
// GRAPHLOOM: DAG & JUMP TOPOLOGY
// =============================================================================
//
// The Graph Brain.
//
// Responsibilities:
// 1. Build the item DAG from successor lists and validate it (acyclic, one
//    weakly connected component).
// 2. Compute loop bodies: every item on a simple path from a jump's
//    destination to its source.
// 3. Validate jumps against the DAG and against each other.

use crate::core::EngineInitFailed;
use crate::jump::Jump;
use petgraph::algo::{all_simple_paths, connected_components, has_path_connecting, is_cyclic_directed};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Reversed;
use std::collections::{BTreeSet, HashMap};

// ============================================================================
// 1. THE DAG
// ============================================================================

/// Directed graph over item names. Nodes without edges are kept.
pub struct Dag {
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
}

impl Dag {
    /// Builds a DAG from node names and successor lists.
    pub fn from_successors(
        nodes: impl IntoIterator<Item = String>,
        successors: &HashMap<String, Vec<String>>,
    ) -> Self {
        fn index_of(
            graph: &mut DiGraph<String, ()>,
            indices: &mut HashMap<String, NodeIndex>,
            name: &str,
        ) -> NodeIndex {
            *indices
                .entry(name.to_string())
                .or_insert_with(|| graph.add_node(name.to_string()))
        }
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();
        for node in nodes {
            index_of(&mut graph, &mut indices, &node);
        }
        for (node, succs) in successors {
            let from = index_of(&mut graph, &mut indices, node);
            for successor in succs {
                let to = index_of(&mut graph, &mut indices, successor);
                graph.add_edge(from, to, ());
            }
        }
        Self { graph, indices }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.graph.node_weights().cloned().collect()
    }

    /// Rejects cyclic graphs and graphs with more than one weakly connected
    /// component. An empty graph passes.
    pub fn validate(&self) -> Result<(), EngineInitFailed> {
        if is_cyclic_directed(&self.graph) {
            return Err(EngineInitFailed::InvalidDag);
        }
        if connected_components(&self.graph) > 1 {
            return Err(EngineInitFailed::UnconnectedDag);
        }
        Ok(())
    }

    pub fn has_path(&self, from: &str, to: &str) -> bool {
        match (self.indices.get(from), self.indices.get(to)) {
            (Some(&from), Some(&to)) => has_path_connecting(&self.graph, from, to, None),
            _ => false,
        }
    }

    /// Path existence in the reversed graph.
    pub fn has_reverse_path(&self, from: &str, to: &str) -> bool {
        match (self.indices.get(from), self.indices.get(to)) {
            (Some(&from), Some(&to)) => has_path_connecting(Reversed(&self.graph), from, to, None),
            _ => false,
        }
    }

    /// Union of all simple paths from `from` to `to`, endpoints included.
    /// Empty when either endpoint is missing or no path exists.
    pub fn items_on_simple_paths(&self, from: &str, to: &str) -> BTreeSet<String> {
        let mut items = BTreeSet::new();
        let (Some(&source), Some(&target)) = (self.indices.get(from), self.indices.get(to)) else {
            return items;
        };
        for path in all_simple_paths::<Vec<NodeIndex>, _, std::collections::hash_map::RandomState>(
            &self.graph,
            source,
            target,
            0,
            None,
        ) {
            for index in path {
                items.insert(self.graph[index].clone());
            }
        }
        items
    }
}

// ============================================================================
// 2. JUMP TOPOLOGY
// ============================================================================

/// Loop bodies, one per jump, aligned by index.
pub fn items_by_jump(jumps: &[Jump], dag: &Dag) -> Vec<BTreeSet<String>> {
    jumps
        .iter()
        .map(|jump| dag.items_on_simple_paths(&jump.destination, &jump.source))
        .collect()
}

/// Drops jumps whose body contains an item that is not permitted to execute.
/// Returns the surviving jumps with their bodies, still aligned.
pub fn filter_unneeded_jumps(
    jumps: Vec<Jump>,
    bodies: Vec<BTreeSet<String>>,
    execution_permits: &HashMap<String, bool>,
) -> (Vec<Jump>, Vec<BTreeSet<String>>) {
    jumps
        .into_iter()
        .zip(bodies)
        .filter(|(_, body)| {
            body.iter()
                .all(|item| execution_permits.get(item).copied().unwrap_or(false))
        })
        .unzip()
}

/// Validates each jump against the DAG and the other jumps:
/// - the jump must be ready (its condition well-formed);
/// - no two jumps may share a source;
/// - bodies may be disjoint or nested, never partially overlapping;
/// - both endpoints must be in the DAG;
/// - the loop must go backward: no forward path from source to destination,
///   but a reversed-graph path must exist.
pub fn validate_jumps(
    jumps: &[Jump],
    bodies: &[BTreeSet<String>],
    dag: &Dag,
) -> Result<(), EngineInitFailed> {
    for (i, jump) in jumps.iter().enumerate() {
        if !jump.ready_to_execute() {
            return Err(EngineInitFailed::JumpNotReady(jump.name()));
        }
        for (j, other) in jumps.iter().enumerate() {
            if i == j {
                continue;
            }
            if other.source == jump.source {
                return Err(EngineInitFailed::SharedJumpSource(
                    jump.name(),
                    other.name(),
                ));
            }
            let intersection: BTreeSet<_> = bodies[i].intersection(&bodies[j]).collect();
            let nested_or_disjoint = intersection.is_empty()
                || intersection.len() == bodies[i].len()
                || intersection.len() == bodies[j].len();
            if !nested_or_disjoint {
                return Err(EngineInitFailed::OverlappingJumps(
                    jump.name(),
                    other.name(),
                ));
            }
        }
        if !dag.contains(&jump.destination) {
            return Err(EngineInitFailed::JumpDestinationMissing(
                jump.destination.clone(),
            ));
        }
        if !dag.contains(&jump.source) {
            return Err(EngineInitFailed::JumpSourceMissing(jump.source.clone()));
        }
        if jump.source == jump.destination {
            continue;
        }
        if dag.has_path(&jump.source, &jump.destination) {
            return Err(EngineInitFailed::ForwardJump);
        }
        if !dag.has_reverse_path(&jump.source, &jump.destination) {
            return Err(EngineInitFailed::JumpAcrossBranches);
        }
    }
    Ok(())
}
