//! Graph validation and execution planning.
//!
//! Validation runs once, before an execution starts. It builds the adjacency
//! structure, computes a topological order with Kahn's algorithm over every
//! edge except those labeled `loopBack`, rejects structural problems, and
//! resolves each loop node's body so the runtime never has to guess.

use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

use super::model::{EdgeLabel, NodeConfig, Workflow};

#[derive(Debug, Error)]
pub enum StructuralError {
    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("edge {source} -> {target} references unknown node '{unknown}'")]
    DanglingEdge {
        source: String,
        target: String,
        unknown: String,
    },

    #[error("cycle without a loopBack edge involving nodes: {}", nodes.join(", "))]
    CycleDetected { nodes: Vec<String> },

    #[error(
        "condition node '{node}' must have exactly one 'true' and one 'false' edge \
         (found {true_count} true, {false_count} false)"
    )]
    BranchCardinality {
        node: String,
        true_count: usize,
        false_count: usize,
    },

    #[error("node '{0}' has more than one 'error' edge")]
    MultipleErrorEdges(String),

    #[error("loopBack edge from '{source}' targets non-loop node '{target}'")]
    LoopBackIntoNonLoop { source: String, target: String },

    #[error("loop node '{0}' has no incoming loopBack edge")]
    MissingLoopBack(String),

    #[error("loop node '{0}' has multiple incoming loopBack edges")]
    MultipleLoopBack(String),

    #[error("loop node '{node}' body start '{body_start}' is invalid: {reason}")]
    InvalidLoopBody {
        node: String,
        body_start: String,
        reason: String,
    },

    #[error(
        "loop node '{node}' has multiple candidate body starts ({}); \
         declare bodyStart explicitly", candidates.join(", ")
    )]
    AmbiguousLoopBody {
        node: String,
        candidates: Vec<String>,
    },

    #[error("loop node '{0}' has no body: no successor reaches its loopBack edge")]
    EmptyLoopBody(String),
}

/// Resolved body of one loop node.
#[derive(Debug, Clone)]
pub struct LoopBody {
    /// First node executed each pass.
    pub start: String,
    /// Source of the loopBack edge; the last node of each pass.
    pub end: String,
    /// Every node belonging to the body.
    pub members: HashSet<String>,
    /// Body nodes the loop dispatches directly, in topological order. Nodes
    /// inside a nested loop's body are driven by that inner loop instead.
    pub dispatch_order: Vec<String>,
}

/// How a visited node ended up, for downstream edge-liveness decisions.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeDisposition {
    Succeeded { branch: Option<EdgeLabel> },
    /// Failed, but routed through its error edge; downstream `error` edges
    /// from this node are live.
    Routed,
    Skipped,
}

/// The validated execution plan for one workflow.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// All nodes in topological order (loop-body nodes included).
    pub order: Vec<String>,
    index: HashMap<String, usize>,
    outgoing: HashMap<String, Vec<(Option<EdgeLabel>, String)>>,
    /// Incoming non-loopBack edges: target -> [(source, label)].
    incoming: HashMap<String, Vec<(String, Option<EdgeLabel>)>>,
    loop_bodies: HashMap<String, LoopBody>,
    in_body: HashSet<String>,
}

impl ExecutionPlan {
    pub fn position(&self, node_id: &str) -> Option<usize> {
        self.index.get(node_id).copied()
    }

    pub fn loop_body(&self, loop_id: &str) -> Option<&LoopBody> {
        self.loop_bodies.get(loop_id)
    }

    /// Whether the node belongs to some loop body and is therefore driven by
    /// its loop controller, not the primary traversal.
    pub fn in_loop_body(&self, node_id: &str) -> bool {
        self.in_body.contains(node_id)
    }

    /// Target of this node's outgoing edge with the given label.
    pub fn labeled_target(&self, node_id: &str, label: EdgeLabel) -> Option<&str> {
        self.outgoing.get(node_id).and_then(|edges| {
            edges
                .iter()
                .find(|(l, _)| *l == Some(label))
                .map(|(_, target)| target.as_str())
        })
    }

    pub fn error_target(&self, node_id: &str) -> Option<&str> {
        self.labeled_target(node_id, EdgeLabel::Error)
    }

    /// Whether a node should execute, given the dispositions of the nodes
    /// visited so far. A node with no (considered) incoming edges is a root
    /// and always live; otherwise at least one incoming edge must be live.
    ///
    /// `restrict` limits the considered predecessors to a subgraph (used for
    /// loop bodies, where the body start acts as the root).
    pub fn node_is_live(
        &self,
        node_id: &str,
        dispositions: &HashMap<String, NodeDisposition>,
        restrict: Option<&HashSet<String>>,
    ) -> bool {
        let incoming = match self.incoming.get(node_id) {
            Some(edges) => edges,
            None => return true,
        };

        let considered: Vec<_> = incoming
            .iter()
            .filter(|(source, _)| restrict.map(|set| set.contains(source)).unwrap_or(true))
            .collect();

        if considered.is_empty() {
            return true;
        }

        considered.iter().any(|(source, label)| {
            match dispositions.get(source) {
                Some(NodeDisposition::Succeeded { branch }) => match label {
                    None => true,
                    Some(EdgeLabel::True) | Some(EdgeLabel::False) => *branch == *label,
                    Some(EdgeLabel::Error) => false,
                    Some(EdgeLabel::LoopBack) => false,
                },
                Some(NodeDisposition::Routed) => *label == Some(EdgeLabel::Error),
                Some(NodeDisposition::Skipped) | None => false,
            }
        })
    }
}

/// Validates a workflow and computes its execution plan.
pub fn validate(workflow: &Workflow) -> Result<ExecutionPlan, StructuralError> {
    let mut ids = HashSet::new();
    for node in &workflow.nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(StructuralError::DuplicateNode(node.id.clone()));
        }
    }

    for edge in &workflow.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !ids.contains(endpoint.as_str()) {
                return Err(StructuralError::DanglingEdge {
                    source: edge.source.clone(),
                    target: edge.target.clone(),
                    unknown: endpoint.clone(),
                });
            }
        }
    }

    // loopBack edges must close into a loop node.
    let mut loopback_sources: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &workflow.edges {
        if edge.label == Some(EdgeLabel::LoopBack) {
            let target_is_loop = workflow
                .node(&edge.target)
                .map(|n| matches!(n.config, NodeConfig::Loop { .. }))
                .unwrap_or(false);
            if !target_is_loop {
                return Err(StructuralError::LoopBackIntoNonLoop {
                    source: edge.source.clone(),
                    target: edge.target.clone(),
                });
            }
            loopback_sources
                .entry(edge.target.as_str())
                .or_default()
                .push(edge.source.as_str());
        }
    }

    // Branch cardinality and error-edge uniqueness.
    for node in &workflow.nodes {
        let outgoing: Vec<_> = workflow
            .edges
            .iter()
            .filter(|e| e.source == node.id)
            .collect();

        if matches!(node.config, NodeConfig::Condition { .. }) {
            let true_count = outgoing
                .iter()
                .filter(|e| e.label == Some(EdgeLabel::True))
                .count();
            let false_count = outgoing
                .iter()
                .filter(|e| e.label == Some(EdgeLabel::False))
                .count();
            if true_count != 1 || false_count != 1 {
                return Err(StructuralError::BranchCardinality {
                    node: node.id.clone(),
                    true_count,
                    false_count,
                });
            }
        }

        let error_count = outgoing
            .iter()
            .filter(|e| e.label == Some(EdgeLabel::Error))
            .count();
        if error_count > 1 {
            return Err(StructuralError::MultipleErrorEdges(node.id.clone()));
        }
    }

    // Kahn's algorithm over every edge except loopBack.
    let mut indegree: HashMap<&str, usize> = workflow
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), 0))
        .collect();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &workflow.edges {
        if edge.label == Some(EdgeLabel::LoopBack) {
            continue;
        }
        *indegree.get_mut(edge.target.as_str()).unwrap() += 1;
        successors
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    let mut queue: VecDeque<&str> = workflow
        .nodes
        .iter()
        .filter(|n| indegree[n.id.as_str()] == 0)
        .map(|n| n.id.as_str())
        .collect();
    let mut order: Vec<String> = Vec::with_capacity(workflow.nodes.len());

    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        if let Some(next) = successors.get(id) {
            for &target in next {
                let degree = indegree.get_mut(target).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(target);
                }
            }
        }
    }

    if order.len() < workflow.nodes.len() {
        let mut nodes: Vec<String> = workflow
            .nodes
            .iter()
            .filter(|n| indegree[n.id.as_str()] > 0)
            .map(|n| n.id.clone())
            .collect();
        nodes.sort();
        return Err(StructuralError::CycleDetected { nodes });
    }

    // petgraph view of the non-loopBack subgraph, for reachability.
    let mut graph = DiGraph::<&str, ()>::new();
    let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
    for node in &workflow.nodes {
        let idx = graph.add_node(node.id.as_str());
        indices.insert(node.id.as_str(), idx);
    }
    for edge in &workflow.edges {
        if edge.label != Some(EdgeLabel::LoopBack) {
            graph.add_edge(
                indices[edge.source.as_str()],
                indices[edge.target.as_str()],
                (),
            );
        }
    }
    let reaches = |from: &str, to: &str| {
        has_path_connecting(&graph, indices[from], indices[to], None)
    };

    // Resolve each loop node's body.
    let mut loop_bodies: HashMap<String, LoopBody> = HashMap::new();
    for node in &workflow.nodes {
        let explicit_start = match &node.config {
            NodeConfig::Loop { body_start, .. } => body_start.clone(),
            _ => continue,
        };

        let sources = loopback_sources.get(node.id.as_str()).ok_or_else(|| {
            StructuralError::MissingLoopBack(node.id.clone())
        })?;
        if sources.len() > 1 {
            return Err(StructuralError::MultipleLoopBack(node.id.clone()));
        }
        let end = sources[0];

        let start = match explicit_start {
            Some(start) => {
                if !ids.contains(start.as_str()) {
                    return Err(StructuralError::InvalidLoopBody {
                        node: node.id.clone(),
                        body_start: start,
                        reason: "unknown node".to_string(),
                    });
                }
                if start == node.id {
                    return Err(StructuralError::InvalidLoopBody {
                        node: node.id.clone(),
                        body_start: start,
                        reason: "a loop cannot be its own body start".to_string(),
                    });
                }
                if !reaches(&start, end) {
                    return Err(StructuralError::InvalidLoopBody {
                        node: node.id.clone(),
                        body_start: start,
                        reason: format!("does not reach loopBack source '{}'", end),
                    });
                }
                start
            }
            None => {
                let mut candidates: Vec<String> = workflow
                    .edges
                    .iter()
                    .filter(|e| {
                        e.source == node.id
                            && e.label != Some(EdgeLabel::LoopBack)
                            && e.label != Some(EdgeLabel::Error)
                            && reaches(&e.target, end)
                    })
                    .map(|e| e.target.clone())
                    .collect();
                candidates.sort();
                candidates.dedup();
                match candidates.len() {
                    0 => return Err(StructuralError::EmptyLoopBody(node.id.clone())),
                    1 => candidates.remove(0),
                    _ => {
                        return Err(StructuralError::AmbiguousLoopBody {
                            node: node.id.clone(),
                            candidates,
                        });
                    }
                }
            }
        };

        let members: HashSet<String> = workflow
            .nodes
            .iter()
            .filter(|n| reaches(&start, &n.id) && reaches(&n.id, end))
            .map(|n| n.id.clone())
            .collect();

        loop_bodies.insert(
            node.id.clone(),
            LoopBody {
                start,
                end: end.to_string(),
                members,
                dispatch_order: Vec::new(),
            },
        );
    }

    // With all bodies known, derive each loop's direct dispatch list: body
    // members in topological order, minus anything a nested loop drives.
    let body_snapshots: Vec<(String, HashSet<String>)> = loop_bodies
        .iter()
        .map(|(id, body)| (id.clone(), body.members.clone()))
        .collect();
    for (loop_id, body) in loop_bodies.iter_mut() {
        body.dispatch_order = order
            .iter()
            .filter(|id| body.members.contains(*id))
            .filter(|id| {
                !body_snapshots.iter().any(|(inner_id, inner_members)| {
                    inner_id != loop_id
                        && body.members.contains(inner_id)
                        && inner_id != *id
                        && inner_members.contains(*id)
                })
            })
            .cloned()
            .collect();
    }

    let in_body: HashSet<String> = loop_bodies
        .values()
        .flat_map(|body| body.members.iter().cloned())
        .collect();

    let mut outgoing: HashMap<String, Vec<(Option<EdgeLabel>, String)>> = HashMap::new();
    let mut incoming: HashMap<String, Vec<(String, Option<EdgeLabel>)>> = HashMap::new();
    for edge in &workflow.edges {
        outgoing
            .entry(edge.source.clone())
            .or_default()
            .push((edge.label, edge.target.clone()));
        if edge.label != Some(EdgeLabel::LoopBack) {
            incoming
                .entry(edge.target.clone())
                .or_default()
                .push((edge.source.clone(), edge.label));
        }
    }

    let index = order
        .iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), i))
        .collect();

    Ok(ExecutionPlan {
        order,
        index,
        outgoing,
        incoming,
        loop_bodies,
        in_body,
    })
}
