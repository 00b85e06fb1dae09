//! Execution graph built once per run from a workflow definition.
//!
//! Building the graph resolves every node type through the registry,
//! normalizes connection ports and rejects structural problems before any
//! node runs. Cycles are only accepted when they pass through a node whose
//! type is a loop controller.

use crate::registry::{InputPolicy, NodeMetadata, NodeRegistry};
use flowcore::{Connection, GraphError, InputSlot, ItemSet, Node, NodeSpec, Workflow, MAIN_PORT};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub struct GraphNode {
    pub index: usize,
    pub spec: NodeSpec,
    pub adapter: Arc<dyn Node>,
    pub metadata: NodeMetadata,
    incoming: Vec<usize>,
    outgoing: Vec<usize>,
}

impl GraphNode {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Number of incoming connections, i.e. input slots
    pub fn slot_count(&self) -> usize {
        self.incoming.len()
    }
}

/// A connection with both ends resolved to node indices and port names
#[derive(Debug, Clone)]
pub struct Edge {
    /// Position in the workflow's connection list
    pub index: usize,
    pub source: usize,
    pub source_output: String,
    pub target: usize,
    pub target_input: String,
    /// Position of `target_input` among the target's declared inputs
    pub input_index: usize,
    /// Position among the target's incoming connections
    pub slot: usize,
}

pub struct ExecutionGraph {
    workflow: Workflow,
    nodes: Vec<GraphNode>,
    by_name: HashMap<String, usize>,
    edges: Vec<Edge>,
}

impl ExecutionGraph {
    pub fn build(workflow: &Workflow, registry: &NodeRegistry) -> Result<Self, GraphError> {
        let mut by_name = HashMap::with_capacity(workflow.nodes.len());
        let mut nodes = Vec::with_capacity(workflow.nodes.len());

        for (index, spec) in workflow.nodes.iter().enumerate() {
            if by_name.insert(spec.name.clone(), index).is_some() {
                return Err(GraphError::DuplicateNode(spec.name.clone()));
            }
            let (adapter, metadata) = registry.create_node(spec)?;
            nodes.push(GraphNode {
                index,
                spec: spec.clone(),
                adapter,
                metadata,
                incoming: Vec::new(),
                outgoing: Vec::new(),
            });
        }

        let mut edges = Vec::with_capacity(workflow.connections.len());
        for (index, conn) in workflow.connections.iter().enumerate() {
            let lookup = |name: &String| {
                by_name
                    .get(name)
                    .copied()
                    .ok_or_else(|| GraphError::DanglingConnection {
                        source_node: conn.source.clone(),
                        target_node: conn.target.clone(),
                        missing: name.clone(),
                    })
            };
            let source = lookup(&conn.source)?;
            let target = lookup(&conn.target)?;

            if !nodes[source].metadata.has_output(&conn.source_output) {
                return Err(GraphError::PortMismatch {
                    node: conn.source.clone(),
                    port: conn.source_output.clone(),
                    reason: "no such output port".to_string(),
                });
            }
            let input_index = resolve_input(conn, &nodes[target].metadata)?;
            let target_input = nodes[target].metadata.inputs[input_index].name.clone();
            let slot = nodes[target].incoming.len();

            nodes[source].outgoing.push(index);
            nodes[target].incoming.push(index);
            edges.push(Edge {
                index,
                source,
                source_output: conn.source_output.clone(),
                target,
                target_input,
                input_index,
                slot,
            });
        }

        let graph = Self {
            workflow: workflow.clone(),
            nodes,
            by_name,
            edges,
        };
        graph.check_cycles()?;

        tracing::debug!(
            "Built execution graph for workflow {}: {} nodes, {} edges",
            workflow.id,
            graph.nodes.len(),
            graph.edges.len()
        );
        Ok(graph)
    }

    /// Reject cycles that contain no loop controller
    fn check_cycles(&self) -> Result<(), GraphError> {
        let mut graph = DiGraph::<usize, ()>::new();
        let indices: Vec<NodeIndex> = (0..self.nodes.len()).map(|i| graph.add_node(i)).collect();
        for edge in &self.edges {
            graph.add_edge(indices[edge.source], indices[edge.target], ());
        }

        for component in tarjan_scc(&graph) {
            let cyclic = component.len() > 1
                || component
                    .first()
                    .map(|&ix| graph.contains_edge(ix, ix))
                    .unwrap_or(false);
            if !cyclic {
                continue;
            }

            let mut members: Vec<usize> = component.iter().map(|&ix| graph[ix]).collect();
            if members
                .iter()
                .any(|&i| self.nodes[i].metadata.loop_controller)
            {
                continue;
            }
            members.sort_unstable();
            return Err(GraphError::CycleDetected {
                nodes: members
                    .into_iter()
                    .map(|i| self.nodes[i].spec.name.clone())
                    .collect(),
            });
        }
        Ok(())
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &GraphNode {
        &self.nodes[index]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn edge(&self, index: usize) -> &Edge {
        &self.edges[index]
    }

    /// Incoming connections of `node`, in declaration order
    pub fn incoming(&self, node: usize) -> impl Iterator<Item = &Edge> {
        self.nodes[node].incoming.iter().map(move |&e| &self.edges[e])
    }

    /// Outgoing connections of `node`, in declaration order
    pub fn outgoing(&self, node: usize) -> impl Iterator<Item = &Edge> {
        self.nodes[node].outgoing.iter().map(move |&e| &self.edges[e])
    }

    /// Ordered downstream targets fed by one output port
    pub fn downstream<'a>(&'a self, node: usize, port: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.outgoing(node).filter(move |e| e.source_output == port)
    }

    /// Node that receives the trigger items: the named node if given,
    /// otherwise the first trigger without inputs, otherwise the first node
    /// without incoming connections.
    pub fn start_node(&self, explicit: Option<&str>) -> Result<usize, GraphError> {
        if let Some(name) = explicit {
            return self
                .index_of(name)
                .ok_or_else(|| GraphError::UnknownStartNode(name.to_string()));
        }

        let mut roots = self.nodes.iter().filter(|n| n.incoming.is_empty());
        let first_root = roots.clone().next();
        roots
            .find(|n| n.metadata.trigger)
            .or(first_root)
            .map(|n| n.index)
            .ok_or(GraphError::NoStartNode)
    }

    /// Every required input port has a contribution and at least one
    /// connection carries data
    pub fn inputs_satisfied(&self, node: usize, slots: &[InputSlot]) -> bool {
        if !slots.iter().any(InputSlot::has_data) {
            return false;
        }
        let gn = &self.nodes[node];
        gn.metadata
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, port)| port.required)
            .all(|(port_index, _)| {
                gn.incoming
                    .iter()
                    .zip(slots)
                    .any(|(&e, slot)| self.edges[e].input_index == port_index && slot.has_data())
            })
    }

    /// Ready-predicate under the node type's input policy
    pub fn is_ready(&self, node: usize, slots: &[InputSlot]) -> bool {
        match self.nodes[node].metadata.input_policy {
            InputPolicy::EachArrival => self.inputs_satisfied(node, slots),
            InputPolicy::AllSettled => {
                slots.iter().all(|s| !s.is_pending()) && self.inputs_satisfied(node, slots)
            }
        }
    }

    /// Drain `slots` into per-port item sets. Connections feeding the same
    /// port are concatenated in declaration order; declared ports without
    /// a contribution get an empty set.
    pub fn collect_inputs(&self, node: usize, slots: &mut [InputSlot]) -> BTreeMap<String, ItemSet> {
        let gn = &self.nodes[node];
        let mut inputs: BTreeMap<String, ItemSet> = gn
            .metadata
            .inputs
            .iter()
            .map(|p| (p.name.clone(), ItemSet::new()))
            .collect();

        for (&e, slot) in gn.incoming.iter().zip(slots.iter_mut()) {
            if let Some(items) = slot.take() {
                inputs
                    .entry(self.edges[e].target_input.clone())
                    .or_default()
                    .extend(items);
            }
        }
        inputs
    }
}

fn resolve_input(conn: &Connection, metadata: &NodeMetadata) -> Result<usize, GraphError> {
    let mismatch = |port: &str, reason: &str| GraphError::PortMismatch {
        node: conn.target.clone(),
        port: port.to_string(),
        reason: reason.to_string(),
    };

    if metadata.inputs.is_empty() {
        let port = conn.target_input.as_deref().unwrap_or(MAIN_PORT);
        return Err(mismatch(port, "node accepts no inputs"));
    }

    match (conn.target_input.as_deref(), conn.input_index) {
        (None, None) => Ok(0),
        (Some(name), None) => metadata
            .input_index(name)
            .ok_or_else(|| mismatch(name, "no such input port")),
        (None, Some(index)) if index < metadata.inputs.len() => Ok(index),
        (None, Some(index)) => Err(mismatch(&index.to_string(), "input index out of range")),
        (Some(name), Some(index)) => match metadata.input_index(name) {
            Some(found) if found == index => Ok(index),
            Some(_) => Err(mismatch(name, "input index does not match port")),
            None => Err(mismatch(name, "no such input port")),
        },
    }
}
