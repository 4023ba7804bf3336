//! The build graph (§4.5): a `BuildNode` DAG with dynamic extension.
//!
//! Generalizes a static, generic `DAG<N, E>` (cycle-checked edge insertion via BFS
//! reachability, Kahn's-algorithm topological sort) into a graph whose nodes carry
//! lifecycle status and whose edge set can grow *during* a build — the "dynamic
//! discovery" feature that distinguishes this graph from a plain dependency DAG.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use builder_core::model::{BuildNode, NodeId, NodeResult, NodeStatus, Target, TargetId};
use builder_core::traits::DiscoveryMetadata;

/// Errors the build graph can produce.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Adding an edge, or applying a dynamic extension, would introduce a cycle.
    #[error("cycle detected: {0:?}")]
    CycleDetected(Vec<NodeId>),

    /// A referenced node id is not present in the graph.
    #[error("node {0} not found in graph")]
    NodeNotFound(NodeId),

    /// An attempted status transition is not legal from the node's current status.
    #[error("illegal transition for node {0}: {1:?} -> {2:?}")]
    IllegalTransition(NodeId, NodeStatus, NodeStatus),

    /// A dynamic extension violated one of the discovery rules (§4.5).
    #[error("dynamic discovery error: {0}")]
    DynamicDiscoveryError(String),
}

/// Result type for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

/// The build graph: a DAG of `BuildNode`s plus the bookkeeping dynamic extension needs.
#[derive(Debug)]
pub struct BuildGraph {
    nodes: HashMap<NodeId, BuildNode>,
    by_target: HashMap<TargetId, NodeId>,
    next_id: usize,
    generation: u64,
    /// `(discovering_node, child_target)` pairs already applied, for extension idempotence.
    applied_discoveries: HashSet<(NodeId, TargetId)>,
}

impl Default for BuildGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildGraph {
    /// Creates an empty graph at generation 0.
    #[must_use]
    pub fn new() -> Self {
        BuildGraph {
            nodes: HashMap::new(),
            by_target: HashMap::new(),
            next_id: 0,
            generation: 0,
            applied_discoveries: HashSet::new(),
        }
    }

    /// Current graph generation; bumped on every successful dynamic extension.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of nodes currently in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Adds a node for `target`, returning its fresh id.
    pub fn add_node(&mut self, target: Target) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        let target_id = target.id.clone();
        let node = BuildNode::new(id, target, self.generation);
        let _ = self.nodes.insert(id, node);
        let _ = self.by_target.insert(target_id, id);
        id
    }

    /// Looks up the node id for a target id, if one has been added.
    #[must_use]
    pub fn node_for_target(&self, target_id: &TargetId) -> Option<NodeId> {
        self.by_target.get(target_id).copied()
    }

    /// Iterates over every node currently in the graph, in arbitrary order.
    pub fn nodes(&self) -> impl Iterator<Item = &BuildNode> {
        self.nodes.values()
    }

    /// Borrows a node by id.
    pub fn node(&self, id: NodeId) -> GraphResult<&BuildNode> {
        self.nodes.get(&id).ok_or(GraphError::NodeNotFound(id))
    }

    /// Mutably borrows a node by id.
    pub fn node_mut(&mut self, id: NodeId) -> GraphResult<&mut BuildNode> {
        self.nodes.get_mut(&id).ok_or(GraphError::NodeNotFound(id))
    }

    /// Adds a dependency edge: `to` depends on `from` (`from` must complete first).
    ///
    /// Validated BEFORE commit via BFS reachability from `to` back to `from`: if `to` can
    /// already reach `from`, the new edge would close a cycle.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) -> GraphResult<()> {
        if !self.nodes.contains_key(&from) {
            return Err(GraphError::NodeNotFound(from));
        }
        if !self.nodes.contains_key(&to) {
            return Err(GraphError::NodeNotFound(to));
        }
        if self.can_reach(to, from) {
            return Err(GraphError::CycleDetected(vec![from, to]));
        }

        if let Some(node) = self.nodes.get_mut(&from) {
            let _ = node.dependents.insert(to);
        }
        if let Some(node) = self.nodes.get_mut(&to) {
            let _ = node.dependencies.insert(from);
        }
        Ok(())
    }

    fn can_reach(&self, start: NodeId, end: NodeId) -> bool {
        if start == end {
            return true;
        }
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start);
        while let Some(current) = queue.pop_front() {
            if current == end {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                for &next in &node.dependents {
                    if !visited.contains(&next) {
                        queue.push_back(next);
                    }
                }
            }
        }
        false
    }

    /// Nodes whose status is `Pending` and whose every dependency satisfies readiness
    /// (`Success`, `Cached`, or `Skipped`).
    #[must_use]
    pub fn ready_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|node| node.status == NodeStatus::Pending)
            .filter(|node| {
                node.dependencies.iter().all(|dep| {
                    self.nodes
                        .get(dep)
                        .map(|d| d.status.satisfies_dependents())
                        .unwrap_or(false)
                })
            })
            .map(|node| node.id)
            .collect()
    }

    /// Applies an atomic status transition, validating it is legal.
    pub fn mark(&mut self, id: NodeId, status: NodeStatus) -> GraphResult<()> {
        let current = self.node(id)?.status;
        if !Self::is_legal_transition(current, status) {
            return Err(GraphError::IllegalTransition(id, current, status));
        }
        let node = self.node_mut(id)?;
        node.status = status;
        if status == NodeStatus::Running {
            node.attempt += 1;
        }
        Ok(())
    }

    /// Records a terminal result on a node (success, cache hit, or failure detail).
    pub fn set_result(&mut self, id: NodeId, result: NodeResult) -> GraphResult<()> {
        let node = self.node_mut(id)?;
        node.result = Some(result);
        Ok(())
    }

    fn is_legal_transition(from: NodeStatus, to: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (from, to),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Ready, Running)
                | (Ready, Skipped)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Cached)
                | (Running, Ready) // retry: back to ready for a fresh attempt
        )
    }

    /// After a node reaches a terminal status, promotes newly satisfied dependents to
    /// `Ready`, or cascades `Skipped` to every transitive dependent if the node failed and
    /// `keep_going` is false. Returns the ids touched.
    pub fn propagate(&mut self, id: NodeId, keep_going: bool) -> GraphResult<Vec<NodeId>> {
        let status = self.node(id)?.status;
        let mut touched = Vec::new();

        if status == NodeStatus::Failed && !keep_going {
            let mut stack: Vec<NodeId> = self.node(id)?.dependents.iter().copied().collect();
            let mut seen = HashSet::new();
            while let Some(next) = stack.pop() {
                if !seen.insert(next) {
                    continue;
                }
                let current = self.node(next)?.status;
                if current == NodeStatus::Pending || current == NodeStatus::Ready {
                    self.mark(next, NodeStatus::Skipped)?;
                    touched.push(next);
                    stack.extend(self.node(next)?.dependents.iter().copied());
                }
            }
            return Ok(touched);
        }

        if status.satisfies_dependents() {
            let dependents: Vec<NodeId> = self.node(id)?.dependents.iter().copied().collect();
            for dep in dependents {
                let node = self.node(dep)?;
                if node.status != NodeStatus::Pending {
                    continue;
                }
                let all_satisfied = node.dependencies.iter().all(|d| {
                    self.nodes
                        .get(d)
                        .map(|n| n.status.satisfies_dependents())
                        .unwrap_or(false)
                });
                if all_satisfied {
                    self.mark(dep, NodeStatus::Ready)?;
                    touched.push(dep);
                }
            }
        }

        Ok(touched)
    }

    /// Applies a dynamic-discovery batch emitted by `discovering_node` (§4.5).
    ///
    /// Validates: new nodes must depend only on non-terminal nodes or the discovering node
    /// itself (edges from an already-terminal node are rejected — the extending action
    /// observed frozen state); the whole batch must not introduce a cycle; re-submitting an
    /// already-applied `(discovering_node, child)` pair is a no-op. On success, bumps
    /// `generation` and returns the freshly added node ids.
    pub fn extend(
        &mut self,
        discovering_node: NodeId,
        discovery: DiscoveryMetadata,
    ) -> GraphResult<Vec<NodeId>> {
        let _ = self.node(discovering_node)?;

        let mut added = Vec::new();
        for target in discovery.new_targets {
            let child_id = target.id.clone();
            if self.applied_discoveries.contains(&(discovering_node, child_id.clone())) {
                continue;
            }
            if self.by_target.contains_key(&child_id) {
                // Already known under a prior discovery or the static graph; treat as a
                // no-op for idempotence rather than erroring.
                let _ = self
                    .applied_discoveries
                    .insert((discovering_node, child_id));
                continue;
            }
            let id = self.add_node(target);
            added.push(id);
            let _ = self
                .applied_discoveries
                .insert((discovering_node, child_id));
        }

        for (child, parent) in discovery.edges {
            let parent_id = match self.by_target.get(&parent) {
                Some(id) => *id,
                None => {
                    return Err(GraphError::DynamicDiscoveryError(format!(
                        "extension references unknown parent target {parent}"
                    )))
                }
            };
            let child_id = match self.by_target.get(&child) {
                Some(id) => *id,
                None => {
                    return Err(GraphError::DynamicDiscoveryError(format!(
                        "extension references unknown child target {child}"
                    )))
                }
            };

            if parent_id != discovering_node {
                let parent_status = self.node(parent_id)?.status;
                if parent_status.is_terminal() {
                    return Err(GraphError::DynamicDiscoveryError(format!(
                        "edge from already-terminal node {parent_id} is prohibited"
                    )));
                }
            }

            if self.can_reach(child_id, parent_id) {
                // Roll back the nodes we just added before reporting the cycle so a
                // rejected extension never leaves partial state visible to the scheduler.
                for id in &added {
                    if let Some(node) = self.nodes.remove(id) {
                        let _ = self.by_target.remove(&node.target.id);
                    }
                }
                return Err(GraphError::CycleDetected(vec![parent_id, child_id]));
            }

            if let Some(node) = self.nodes.get_mut(&parent_id) {
                let _ = node.dependents.insert(child_id);
            }
            if let Some(node) = self.nodes.get_mut(&child_id) {
                let _ = node.dependencies.insert(parent_id);
            }
        }

        self.generation += 1;
        for id in &added {
            if let Some(node) = self.nodes.get_mut(id) {
                node.generation = self.generation;
            }
        }

        Ok(added)
    }

    /// Direct dependency ids of a node (edges pointing into it).
    pub fn dependencies(&self, id: NodeId) -> GraphResult<Vec<NodeId>> {
        Ok(self.node(id)?.dependencies.iter().copied().collect())
    }

    /// Direct dependent ids of a node (edges pointing out of it), i.e. reverse dependencies.
    pub fn reverse_dependencies(&self, id: NodeId) -> GraphResult<Vec<NodeId>> {
        Ok(self.node(id)?.dependents.iter().copied().collect())
    }

    /// Shortest dependency path from `a` to `b` (both inclusive), or `None` if unreachable.
    pub fn shortest_path(&self, a: NodeId, b: NodeId) -> GraphResult<Option<Vec<NodeId>>> {
        let _ = self.node(a)?;
        let _ = self.node(b)?;
        if a == b {
            return Ok(Some(vec![a]));
        }
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let mut parent: HashMap<NodeId, NodeId> = HashMap::new();
        queue.push_back(a);
        let _ = visited.insert(a);
        while let Some(current) = queue.pop_front() {
            let node = self.node(current)?;
            for &next in &node.dependents {
                if visited.insert(next) {
                    let _ = parent.insert(next, current);
                    if next == b {
                        let mut path = vec![b];
                        let mut cursor = b;
                        while let Some(&p) = parent.get(&cursor) {
                            path.push(p);
                            cursor = p;
                        }
                        path.reverse();
                        return Ok(Some(path));
                    }
                    queue.push_back(next);
                }
            }
        }
        Ok(None)
    }

    /// Full Kahn's-algorithm topological order over the current (static) node set.
    /// Mostly useful for diagnostics/tests; the scheduler drives off `ready_nodes` instead.
    pub fn topological_sort(&self) -> GraphResult<Vec<NodeId>> {
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        for id in self.nodes.keys() {
            let _ = in_degree.insert(*id, 0);
        }
        for node in self.nodes.values() {
            *in_degree.entry(node.id).or_insert(0) = node.dependencies.len();
        }

        let mut queue: VecDeque<NodeId> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut result = Vec::new();

        while let Some(id) = queue.pop_front() {
            result.push(id);
            if let Some(node) = self.nodes.get(&id) {
                for &dependent in &node.dependents {
                    if let Some(degree) = in_degree.get_mut(&dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }

        if result.len() == self.nodes.len() {
            Ok(result)
        } else {
            Err(GraphError::CycleDetected(
                self.nodes.keys().copied().collect(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use builder_core::model::{ConfigValue, TargetKind};
    use std::collections::{BTreeMap, BTreeSet};

    fn target(id: &str) -> Target {
        Target {
            id: TargetId::from(id),
            kind: TargetKind::Library,
            language: "rust".to_string(),
            sources: vec![],
            deps: BTreeSet::new(),
            config: BTreeMap::<String, ConfigValue>::new(),
        }
    }

    #[test]
    fn ready_nodes_require_all_deps_satisfied() {
        let mut graph = BuildGraph::new();
        let a = graph.add_node(target("//:a"));
        let b = graph.add_node(target("//:b"));
        graph.add_edge(a, b).unwrap();

        assert_eq!(graph.ready_nodes(), vec![a]);

        graph.mark(a, NodeStatus::Ready).unwrap();
        graph.mark(a, NodeStatus::Running).unwrap();
        graph.mark(a, NodeStatus::Success).unwrap();
        let touched = graph.propagate(a, false).unwrap();
        assert_eq!(touched, vec![b]);
        assert_eq!(graph.node(b).unwrap().status, NodeStatus::Ready);
    }

    #[test]
    fn cycle_rejected_before_commit() {
        let mut graph = BuildGraph::new();
        let a = graph.add_node(target("//:a"));
        let b = graph.add_node(target("//:b"));
        let c = graph.add_node(target("//:c"));
        graph.add_edge(a, b).unwrap();
        graph.add_edge(b, c).unwrap();

        let err = graph.add_edge(c, a);
        assert!(matches!(err, Err(GraphError::CycleDetected(_))));
        // Graph is untouched by the rejected edge.
        assert_eq!(graph.dependencies(a).unwrap().len(), 0);
    }

    #[test]
    fn direct_self_cycle_rejected() {
        let mut graph = BuildGraph::new();
        let a = graph.add_node(target("//:a"));
        let err = graph.add_edge(a, a);
        assert!(matches!(err, Err(GraphError::CycleDetected(_))));
    }

    #[test]
    fn cascading_skip_on_failure() {
        let mut graph = BuildGraph::new();
        let a = graph.add_node(target("//:a"));
        let b = graph.add_node(target("//:b"));
        let c = graph.add_node(target("//:c"));
        graph.add_edge(a, b).unwrap();
        graph.add_edge(b, c).unwrap();

        graph.mark(a, NodeStatus::Ready).unwrap();
        graph.mark(a, NodeStatus::Running).unwrap();
        graph.mark(a, NodeStatus::Failed).unwrap();
        let touched = graph.propagate(a, false).unwrap();

        assert!(touched.contains(&b));
        assert!(touched.contains(&c));
        assert_eq!(graph.node(b).unwrap().status, NodeStatus::Skipped);
        assert_eq!(graph.node(c).unwrap().status, NodeStatus::Skipped);
    }

    #[test]
    fn keep_going_does_not_cascade() {
        let mut graph = BuildGraph::new();
        let a = graph.add_node(target("//:a"));
        let b = graph.add_node(target("//:b"));
        graph.add_edge(a, b).unwrap();

        graph.mark(a, NodeStatus::Ready).unwrap();
        graph.mark(a, NodeStatus::Running).unwrap();
        graph.mark(a, NodeStatus::Failed).unwrap();
        let touched = graph.propagate(a, true).unwrap();

        assert!(touched.is_empty());
        assert_eq!(graph.node(b).unwrap().status, NodeStatus::Pending);
    }

    #[test]
    fn dynamic_extension_adds_nodes_and_bumps_generation() {
        let mut graph = BuildGraph::new();
        let p = graph.add_node(target("//:p"));
        graph.mark(p, NodeStatus::Ready).unwrap();
        graph.mark(p, NodeStatus::Running).unwrap();
        let gen_before = graph.generation();

        let discovery = DiscoveryMetadata {
            new_targets: vec![target("//:q")],
            edges: vec![(TargetId::from("//:q"), TargetId::from("//:p"))],
        };
        let added = graph.extend(p, discovery).unwrap();

        assert_eq!(added.len(), 1);
        assert_eq!(graph.generation(), gen_before + 1);
        let q = graph.node_for_target(&TargetId::from("//:q")).unwrap();
        assert_eq!(graph.dependencies(q).unwrap(), vec![p]);
    }

    #[test]
    fn dynamic_extension_is_idempotent() {
        let mut graph = BuildGraph::new();
        let p = graph.add_node(target("//:p"));
        let discovery = || DiscoveryMetadata {
            new_targets: vec![target("//:q")],
            edges: vec![(TargetId::from("//:q"), TargetId::from("//:p"))],
        };
        let first = graph.extend(p, discovery()).unwrap();
        assert_eq!(first.len(), 1);
        let second = graph.extend(p, discovery()).unwrap();
        assert_eq!(second.len(), 0);
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn dynamic_extension_rejects_edge_from_terminal_node() {
        let mut graph = BuildGraph::new();
        let p = graph.add_node(target("//:p"));
        let other = graph.add_node(target("//:other"));
        graph.mark(other, NodeStatus::Ready).unwrap();
        graph.mark(other, NodeStatus::Running).unwrap();
        graph.mark(other, NodeStatus::Success).unwrap();

        let discovery = DiscoveryMetadata {
            new_targets: vec![target("//:q")],
            edges: vec![(TargetId::from("//:q"), TargetId::from("//:other"))],
        };
        let err = graph.extend(p, discovery);
        assert!(matches!(err, Err(GraphError::DynamicDiscoveryError(_))));
    }

    #[test]
    fn topological_sort_orders_dependencies_first() {
        let mut graph = BuildGraph::new();
        let a = graph.add_node(target("//:a"));
        let b = graph.add_node(target("//:b"));
        let c = graph.add_node(target("//:c"));
        graph.add_edge(a, b).unwrap();
        graph.add_edge(b, c).unwrap();

        let order = graph.topological_sort().unwrap();
        assert_eq!(order, vec![a, b, c]);
    }

    #[test]
    fn shortest_path_follows_dependents() {
        let mut graph = BuildGraph::new();
        let a = graph.add_node(target("//:a"));
        let b = graph.add_node(target("//:b"));
        let c = graph.add_node(target("//:c"));
        graph.add_edge(a, b).unwrap();
        graph.add_edge(b, c).unwrap();

        let path = graph.shortest_path(a, c).unwrap().unwrap();
        assert_eq!(path, vec![a, b, c]);
    }
}
