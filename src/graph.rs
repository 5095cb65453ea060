use std::collections::HashMap;

use petgraph::Direction;
use petgraph::algo::is_cyclic_directed;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;

use crate::definition::{EdgeLabel, FlowDefinition, Node, NodeKind};
use crate::error::FlowError;

/// A validated, immutable flow graph: the definition plus a petgraph index
/// for O(1) node lookup and edge traversal. Built once when a flow
/// activates; never mutated afterwards.
#[derive(Debug)]
pub struct FlowGraph {
    definition: FlowDefinition,
    graph: StableDiGraph<usize, Option<EdgeLabel>>,
    index_of: HashMap<String, NodeIndex>,
    trigger: String,
    entry_target: String,
}

impl FlowGraph {
    /// Validates and compiles a definition. Failing any structural invariant
    /// here is exactly what blocks the `draft -> active` transition.
    pub fn compile(definition: FlowDefinition) -> Result<Self, FlowError> {
        let flow_id = definition.id.clone();
        let mut graph = StableDiGraph::new();
        let mut index_of: HashMap<String, NodeIndex> = HashMap::new();

        for (pos, node) in definition.nodes.iter().enumerate() {
            if index_of.contains_key(&node.id) {
                return Err(FlowError::DuplicateNode(node.id.clone()));
            }
            let idx = graph.add_node(pos);
            index_of.insert(node.id.clone(), idx);
        }

        for edge in &definition.edges {
            let source = *index_of
                .get(&edge.source)
                .ok_or_else(|| FlowError::UnknownNode(edge.source.clone()))?;
            let target = *index_of
                .get(&edge.target)
                .ok_or_else(|| FlowError::UnknownNode(edge.target.clone()))?;
            graph.add_edge(source, target, edge.label);
        }

        if is_cyclic_directed(&graph) {
            return Err(FlowError::Cyclic(flow_id));
        }

        // Exactly one entry point, and it must be the trigger.
        let entries: Vec<&Node> = definition
            .nodes
            .iter()
            .filter(|n| {
                graph
                    .neighbors_directed(index_of[&n.id], Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect();
        if entries.len() > 1 {
            // Report the orphan rather than the count when a trigger exists.
            if let Some(orphan) = entries
                .iter()
                .find(|n| !matches!(n.kind, NodeKind::Trigger { .. }))
            {
                return Err(FlowError::OrphanNode(orphan.id.clone()));
            }
            return Err(FlowError::MultipleEntryPoints {
                flow: flow_id,
                count: entries.len(),
            });
        }
        let trigger = match entries.first() {
            Some(node) if matches!(node.kind, NodeKind::Trigger { .. }) => node.id.clone(),
            _ => return Err(FlowError::MissingTrigger(flow_id)),
        };

        // Per-node edge shape.
        for node in &definition.nodes {
            let outgoing: Vec<Option<EdgeLabel>> = graph
                .edges(index_of[&node.id])
                .map(|e| *e.weight())
                .collect();
            match &node.kind {
                NodeKind::Trigger { .. } => {
                    if outgoing.len() != 1 {
                        return Err(FlowError::TriggerFanout(node.id.clone()));
                    }
                }
                NodeKind::Conditional { .. } => {
                    require_branches(&node.id, &outgoing, EdgeLabel::Yes, EdgeLabel::No)?;
                }
                NodeKind::Split { ratio } => {
                    if *ratio > 100 {
                        return Err(FlowError::SplitRatio {
                            node: node.id.clone(),
                            ratio: *ratio,
                        });
                    }
                    require_branches(&node.id, &outgoing, EdgeLabel::A, EdgeLabel::B)?;
                }
                _ => {
                    if outgoing.len() > 1 {
                        return Err(FlowError::ExtraEdges(node.id.clone()));
                    }
                }
            }
        }

        let trigger_idx = index_of[&trigger];
        let entry_target_idx = graph
            .neighbors_directed(trigger_idx, Direction::Outgoing)
            .next()
            .ok_or_else(|| FlowError::TriggerFanout(trigger.clone()))?;
        let entry_target = definition.nodes[graph[entry_target_idx]].id.clone();

        Ok(Self {
            definition,
            graph,
            index_of,
            trigger,
            entry_target,
        })
    }

    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    pub fn flow_id(&self) -> &str {
        &self.definition.id
    }

    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    /// The trigger's single downstream node, where every execution starts.
    pub fn entry_target(&self) -> &str {
        &self.entry_target
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        let idx = self.index_of.get(id)?;
        Some(&self.definition.nodes[self.graph[*idx]])
    }

    /// Single unlabeled successor of `id`, or `None` for a terminal node.
    pub fn single_target(&self, id: &str) -> Option<&str> {
        let idx = self.index_of.get(id)?;
        self.graph
            .neighbors_directed(*idx, Direction::Outgoing)
            .next()
            .map(|n| self.definition.nodes[self.graph[n]].id.as_str())
    }

    /// Successor reached by following the edge with the given label.
    pub fn branch_target(&self, id: &str, label: EdgeLabel) -> Option<&str> {
        let idx = self.index_of.get(id)?;
        self.graph
            .edges(*idx)
            .find(|e| e.weight() == &Some(label))
            .map(|e| self.definition.nodes[self.graph[e.target()]].id.as_str())
    }

    /// All successors of `id` regardless of label.
    pub fn successors(&self, id: &str) -> Vec<&str> {
        let Some(idx) = self.index_of.get(id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(*idx, Direction::Outgoing)
            .map(|n| self.definition.nodes[self.graph[n]].id.as_str())
            .collect()
    }
}

fn require_branches(
    node: &str,
    outgoing: &[Option<EdgeLabel>],
    first: EdgeLabel,
    second: EdgeLabel,
) -> Result<(), FlowError> {
    for wanted in [first, second] {
        if !outgoing.contains(&Some(wanted)) {
            return Err(FlowError::MissingBranch {
                node: node.to_string(),
                missing: format!("{:?}", wanted).to_lowercase(),
            });
        }
    }
    if outgoing.len() > 2 {
        return Err(FlowError::ExtraEdges(node.to_string()));
    }
    Ok(())
}
