//! Profile graphs.
//!
//! A profile is authored as [`ProfileDefinition`] (the JSON the editor
//! produces) and compiled once per configuration version into a [`Profile`]:
//! a flat arena of nodes addressed by index, with outgoing edges resolved
//! per handle. Compilation validates the whole graph and reports every
//! problem it finds.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::config::DEFAULT_MAX_NODE_VISITS;
use crate::error::{ConfigError, GraphError, ValidationErrors};
use crate::nodes::{DefenseSettings, NodeConfigError, NodeKind, NodeType};
use crate::result::FinalAction;
use crate::value::ConfigMap;

/// Index of a node inside its profile's arena.
pub type NodeIndex = usize;

/// Authored profile, as stored and exchanged with the editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub builtin: bool,
    /// Overrides the engine default action for halts inside this profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_action: Option<FinalAction>,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub config: ConfigMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub from: String,
    pub handle: String,
    pub to: String,
}

impl ProfileDefinition {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_ron(ron_str: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(ron_str)?)
    }

    pub fn to_ron(&self) -> Result<String, ron::Error> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
    }
}

/// A compiled node.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
}

/// A validated profile graph, immutable once built.
#[derive(Debug, Clone)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub priority: i64,
    pub builtin: bool,
    pub default_action: Option<FinalAction>,
    nodes: Vec<Node>,
    /// Outgoing edges per node as `(handle, target)`.
    outgoing: Vec<Vec<(String, NodeIndex)>>,
    index: HashMap<String, NodeIndex>,
    start: NodeIndex,
    longest_walk: usize,
}

impl Profile {
    /// Compile with the default walk ceiling.
    pub fn compile(definition: &ProfileDefinition) -> Result<Self, ValidationErrors> {
        Self::compile_with_limit(definition, DEFAULT_MAX_NODE_VISITS)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let definition = ProfileDefinition::from_json(json)?;
        Self::compile(&definition).map_err(|errors| ConfigError::InvalidProfile {
            profile: definition.id.clone(),
            errors,
        })
    }

    /// Compile and validate. `max_node_visits` bounds the longest possible walk.
    pub fn compile_with_limit(
        definition: &ProfileDefinition,
        max_node_visits: usize,
    ) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::default();

        // Nodes
        let mut nodes = Vec::with_capacity(definition.nodes.len());
        let mut index = HashMap::with_capacity(definition.nodes.len());
        for def in &definition.nodes {
            if index.contains_key(&def.id) {
                errors.push(GraphError::DuplicateNode(def.id.clone()));
                continue;
            }
            let kind = match NodeKind::parse(def.node_type, &def.subtype, &def.config) {
                Ok(kind) => kind,
                Err(NodeConfigError::Config(reason)) => {
                    errors.push(GraphError::InvalidNodeConfig { node: def.id.clone(), reason });
                    continue;
                }
                Err(NodeConfigError::Ranges(reasons)) => {
                    for reason in reasons {
                        errors.push(GraphError::InvalidThresholdRanges { node: def.id.clone(), reason });
                    }
                    continue;
                }
            };
            index.insert(def.id.clone(), nodes.len());
            nodes.push(Node { id: def.id.clone(), kind });
        }

        let starts: Vec<NodeIndex> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| matches!(n.kind, NodeKind::Start))
            .map(|(i, _)| i)
            .collect();
        let start = match starts.len() {
            0 => {
                errors.push(GraphError::MissingStart);
                None
            }
            1 => Some(starts[0]),
            count => {
                errors.push(GraphError::MultipleStarts { count });
                None
            }
        };

        // Edges
        let mut outgoing: Vec<Vec<(String, NodeIndex)>> = vec![Vec::new(); nodes.len()];
        let mut incoming = vec![0usize; nodes.len()];
        let rejected: HashSet<&str> = definition
            .nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| !index.contains_key(*id))
            .collect();
        for edge in &definition.edges {
            let from = index.get(&edge.from).copied();
            let to = index.get(&edge.to).copied();
            let (from, to) = match (from, to) {
                (Some(f), Some(t)) => (f, t),
                _ => {
                    // Edges touching a node that failed to parse are already covered by that node's error.
                    if rejected.contains(edge.from.as_str()) || rejected.contains(edge.to.as_str()) {
                        continue;
                    }
                    let missing = if from.is_none() { &edge.from } else { &edge.to };
                    errors.push(GraphError::DanglingEdge {
                        from: edge.from.clone(),
                        handle: edge.handle.clone(),
                        to: edge.to.clone(),
                        missing: missing.clone(),
                    });
                    continue;
                }
            };

            let node = &nodes[from];
            if node.kind.is_terminal() {
                // Reported once per node below.
            } else if !node.kind.handles().contains(&edge.handle.as_str()) {
                errors.push(GraphError::IllegalHandle {
                    node: node.id.clone(),
                    handle: edge.handle.clone(),
                });
                continue;
            }
            if outgoing[from].iter().any(|(h, _)| *h == edge.handle) {
                errors.push(GraphError::DuplicateHandle {
                    node: node.id.clone(),
                    handle: edge.handle.clone(),
                });
                continue;
            }
            outgoing[from].push((edge.handle.clone(), to));
            incoming[to] += 1;
        }

        for (i, node) in nodes.iter().enumerate() {
            match node.kind {
                NodeKind::Start => {
                    if incoming[i] > 0 {
                        errors.push(GraphError::StartHasIncoming(node.id.clone()));
                    }
                    if outgoing[i].is_empty() {
                        errors.push(GraphError::NoOutgoingEdges(node.id.clone()));
                    }
                }
                NodeKind::Action(_) => {
                    if !outgoing[i].is_empty() {
                        errors.push(GraphError::ActionHasOutgoing(node.id.clone()));
                    }
                    if incoming[i] == 0 {
                        errors.push(GraphError::NoIncomingEdges(node.id.clone()));
                    }
                }
                _ => {
                    if outgoing[i].is_empty() {
                        errors.push(GraphError::NoOutgoingEdges(node.id.clone()));
                    }
                    if incoming[i] == 0 {
                        errors.push(GraphError::NoIncomingEdges(node.id.clone()));
                    }
                }
            }
        }

        // Structure: cycles, reachability and walk length
        let order = match topological_order(&outgoing, &incoming) {
            Ok(order) => Some(order),
            Err(in_cycle) => {
                errors.push(GraphError::CycleDetected(nodes[in_cycle].id.clone()));
                None
            }
        };

        let mut longest_walk = 0;
        if let Some(start) = start {
            let reachable = reachable_from(start, &outgoing);
            for (i, node) in nodes.iter().enumerate() {
                // Nodes with no incoming edges are already reported.
                if !reachable[i] && incoming[i] > 0 {
                    errors.push(GraphError::Unreachable(node.id.clone()));
                }
            }
            if let Some(order) = &order {
                longest_walk = longest_walk_from(start, order, &outgoing);
                if longest_walk > max_node_visits {
                    errors.push(GraphError::WalkTooLong {
                        length: longest_walk,
                        limit: max_node_visits,
                    });
                }
            }
        }

        match (errors.is_empty(), start) {
            (true, Some(start)) => Ok(Profile {
                id: definition.id.clone(),
                name: definition.name.clone(),
                priority: definition.priority,
                builtin: definition.builtin,
                default_action: definition.default_action,
                nodes,
                outgoing,
                index,
                start,
                longest_walk,
            }),
            _ => Err(errors),
        }
    }

    pub fn start(&self) -> NodeIndex {
        self.start
    }

    pub fn node(&self, index: NodeIndex) -> &Node {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn index_of(&self, id: &str) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    /// Target of the edge leaving `from` on `handle`, if connected.
    pub fn next(&self, from: NodeIndex, handle: &str) -> Option<NodeIndex> {
        self.outgoing[from]
            .iter()
            .find(|(h, _)| h == handle)
            .map(|(_, to)| *to)
    }

    pub fn edge_count(&self) -> usize {
        self.outgoing.iter().map(Vec::len).sum()
    }

    /// Number of non-start nodes on the longest path from the start node.
    pub fn longest_walk(&self) -> usize {
        self.longest_walk
    }

    pub fn defense_nodes(&self) -> impl Iterator<Item = (NodeIndex, &Node, &DefenseSettings)> {
        self.nodes.iter().enumerate().filter_map(|(i, n)| match &n.kind {
            NodeKind::Defense(d) => Some((i, n, d)),
            _ => None,
        })
    }
}

/// Kahn's algorithm. On a cycle, returns the index of a node that is part of one.
fn topological_order(outgoing: &[Vec<(String, NodeIndex)>], incoming: &[usize]) -> Result<Vec<NodeIndex>, NodeIndex> {
    let mut remaining = incoming.to_vec();
    let mut queue: VecDeque<NodeIndex> = (0..remaining.len()).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(remaining.len());

    while let Some(i) = queue.pop_front() {
        order.push(i);
        for (_, to) in &outgoing[i] {
            remaining[*to] -= 1;
            if remaining[*to] == 0 {
                queue.push_back(*to);
            }
        }
    }

    if order.len() == remaining.len() {
        Ok(order)
    } else {
        let stuck = (0..remaining.len()).find(|&i| remaining[i] > 0).unwrap_or(0);
        Err(stuck)
    }
}

fn reachable_from(start: NodeIndex, outgoing: &[Vec<(String, NodeIndex)>]) -> Vec<bool> {
    let mut seen = vec![false; outgoing.len()];
    let mut stack = vec![start];
    seen[start] = true;
    while let Some(i) = stack.pop() {
        for (_, to) in &outgoing[i] {
            if !seen[*to] {
                seen[*to] = true;
                stack.push(*to);
            }
        }
    }
    seen
}

/// Longest path from `start`, counted in nodes after the start node.
fn longest_walk_from(start: NodeIndex, order: &[NodeIndex], outgoing: &[Vec<(String, NodeIndex)>]) -> usize {
    let mut depth: Vec<Option<usize>> = vec![None; outgoing.len()];
    depth[start] = Some(0);
    let mut longest = 0;
    for &i in order {
        let Some(d) = depth[i] else { continue };
        longest = longest.max(d);
        for (_, to) in &outgoing[i] {
            let candidate = d + 1;
            if depth[*to].map_or(true, |existing| candidate > existing) {
                depth[*to] = Some(candidate);
            }
        }
    }
    longest
}
