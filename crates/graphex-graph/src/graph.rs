use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use graphex_core::error::StructuralError;
use graphex_core::node::{InputPort, NodeConfig, OutputPort, PortDeclaration};
use graphex_core::{DataType, NodeId, PortDirection, PortRef};

/// Where an unconnected input port gets its value from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputBinding {
    /// Literal value typed into the node's field.
    Value(Value),
    /// Value supplied at submission time under this graph input name.
    GraphInput(String),
}

/// A node in a workflow graph. Immutable once the graph is validated.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub type_tag: String,
    pub name: String,
    pub config: NodeConfig,
    pub ports: PortDeclaration,
    pub bindings: BTreeMap<String, InputBinding>,
    /// Overrides the node type's and the engine's default timeout.
    pub timeout_secs: Option<u64>,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, type_tag: impl Into<String>, ports: PortDeclaration) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            type_tag: type_tag.into(),
            config: NodeConfig::new(),
            ports,
            bindings: BTreeMap::new(),
            timeout_secs: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn input_port(&self, name: &str) -> Option<&InputPort> {
        self.ports.find_input(name)
    }

    pub fn output_port(&self, name: &str) -> Option<&OutputPort> {
        self.ports.find_output(name)
    }

    pub fn binding(&self, port: &str) -> Option<&InputBinding> {
        self.bindings.get(port)
    }
}

/// Directed connection from an output port to an input port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: PortRef,
    pub to: PortRef,
}

impl Edge {
    pub fn new(from: PortRef, to: PortRef) -> Self {
        Self { from, to }
    }

    pub fn between(
        from_node: impl Into<NodeId>,
        from_port: impl Into<String>,
        to_node: impl Into<NodeId>,
        to_port: impl Into<String>,
    ) -> Self {
        Self::new(
            PortRef::new(from_node, from_port),
            PortRef::new(to_node, to_port),
        )
    }
}

/// Named value supplied when a run is submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphInput {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl GraphInput {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            default: None,
            description: String::new(),
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Workflow graph under construction.
///
/// Enforces the structural invariants: unique node ids, edges only between
/// existing ports, at most one incoming edge per input port, no self loops,
/// and no list output feeding a scalar input. Acyclicity is the validator's
/// job.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    name: String,
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
    edges: Vec<Edge>,
    incoming: HashMap<PortRef, usize>,
    /// Edge indices per node position, into and out of that node.
    edges_in: Vec<Vec<usize>>,
    edges_out: Vec<Vec<usize>>,
    inputs: Vec<GraphInput>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_node(&mut self, node: Node) -> Result<(), StructuralError> {
        if self.index.contains_key(&node.id) {
            return Err(StructuralError::DuplicateNode(node.id));
        }
        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        self.edges_in.push(Vec::new());
        self.edges_out.push(Vec::new());
        Ok(())
    }

    /// Connect two ports. Any literal or graph-input binding on the
    /// destination port is dropped: the edge wins.
    pub fn add_edge(&mut self, edge: Edge) -> Result<(), StructuralError> {
        let from = self
            .position(&edge.from.node)
            .ok_or_else(|| StructuralError::UnknownNode(edge.from.node.clone()))?;
        let to = self
            .position(&edge.to.node)
            .ok_or_else(|| StructuralError::UnknownNode(edge.to.node.clone()))?;
        let (from_node, to_node) = (&self.nodes[from], &self.nodes[to]);
        if edge.from.node == edge.to.node {
            return Err(StructuralError::SelfLoop(edge.from.node.clone()));
        }
        let from_port = from_node
            .output_port(&edge.from.port)
            .ok_or_else(|| StructuralError::UnknownPort {
                node: edge.from.node.clone(),
                port: edge.from.port.clone(),
                direction: PortDirection::Output,
            })?;
        let to_port = to_node
            .input_port(&edge.to.port)
            .ok_or_else(|| StructuralError::UnknownPort {
                node: edge.to.node.clone(),
                port: edge.to.port.clone(),
                direction: PortDirection::Input,
            })?;
        if self.incoming.contains_key(&edge.to) {
            return Err(StructuralError::InputAlreadyConnected(edge.to.clone()));
        }
        if !from_port.data_type.structurally_compatible(&to_port.data_type) {
            return Err(StructuralError::IncompatiblePorts {
                from: edge.from.clone(),
                to: edge.to.clone(),
                from_type: from_port.data_type.clone(),
                to_type: to_port.data_type.clone(),
            });
        }

        let slot = self.edges.len();
        self.nodes[to].bindings.remove(&edge.to.port);
        self.incoming.insert(edge.to.clone(), slot);
        self.edges_in[to].push(slot);
        self.edges_out[from].push(slot);
        self.edges.push(edge);
        Ok(())
    }

    /// Give an unconnected input port a literal value or a graph input.
    pub fn bind_input(
        &mut self,
        node: &NodeId,
        port: &str,
        binding: InputBinding,
    ) -> Result<(), StructuralError> {
        let idx = *self
            .index
            .get(node)
            .ok_or_else(|| StructuralError::UnknownNode(node.clone()))?;
        if self.nodes[idx].input_port(port).is_none() {
            return Err(StructuralError::UnknownPort {
                node: node.clone(),
                port: port.to_string(),
                direction: PortDirection::Input,
            });
        }
        let target = PortRef::new(node.clone(), port);
        if self.incoming.contains_key(&target) {
            return Err(StructuralError::InputAlreadyConnected(target));
        }
        self.nodes[idx].bindings.insert(port.to_string(), binding);
        Ok(())
    }

    pub fn add_graph_input(&mut self, input: GraphInput) -> Result<(), StructuralError> {
        if self.graph_input(&input.name).is_some() {
            return Err(StructuralError::DuplicateGraphInput(input.name));
        }
        self.inputs.push(input);
        Ok(())
    }

    pub fn graph_input(&self, name: &str) -> Option<&GraphInput> {
        self.inputs.iter().find(|i| i.name == name)
    }

    pub fn graph_inputs(&self) -> &[GraphInput] {
        &self.inputs
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.index.get(id).map(|&idx| &self.nodes[idx])
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Edges in insertion order.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Position of a node in insertion order.
    pub fn position(&self, id: &NodeId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// The edge feeding `node::port`, if any.
    pub fn incoming_edge(&self, node: &NodeId, port: &str) -> Option<&Edge> {
        self.incoming
            .get(&PortRef::new(node.clone(), port))
            .map(|&idx| &self.edges[idx])
    }

    /// Edges into `node`, in insertion order.
    pub fn incoming_edges<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges_at(&self.edges_in, node)
    }

    /// Edges out of `node`, in insertion order.
    pub fn outgoing_edges<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges_at(&self.edges_out, node)
    }

    fn edges_at<'a>(
        &'a self,
        by_node: &'a [Vec<usize>],
        node: &NodeId,
    ) -> impl Iterator<Item = &'a Edge> + 'a {
        let slots: &[usize] = match self.index.get(node) {
            Some(&i) => &by_node[i],
            None => &[],
        };
        slots.iter().map(move |&slot| &self.edges[slot])
    }

    /// Distinct upstream nodes, in edge insertion order.
    pub fn predecessors(&self, id: &NodeId) -> Vec<NodeId> {
        dedup(self.incoming_edges(id).map(|e| &e.from.node))
    }

    /// Distinct downstream nodes, in edge insertion order.
    pub fn successors(&self, id: &NodeId) -> Vec<NodeId> {
        dedup(self.outgoing_edges(id).map(|e| &e.to.node))
    }

    /// Lazily yields layers of mutually independent nodes. Every
    /// predecessor of a node lies in an earlier layer. Nodes on or behind a
    /// cycle are never yielded.
    pub fn topological_layers(&self) -> TopologicalLayers<'_> {
        TopologicalLayers::new(self)
    }

    /// Successor positions per node position, distinct, in edge order.
    pub fn adjacency(&self) -> Vec<Vec<usize>> {
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for edge in &self.edges {
            let (Some(&from), Some(&to)) = (self.index.get(&edge.from.node), self.index.get(&edge.to.node)) else {
                continue;
            };
            if !adj[from].contains(&to) {
                adj[from].push(to);
            }
        }
        adj
    }
}

fn dedup<'a>(ids: impl Iterator<Item = &'a NodeId>) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(*id)).cloned().collect()
}

/// Iterator returned by [`Graph::topological_layers`].
pub struct TopologicalLayers<'a> {
    graph: &'a Graph,
    adjacency: Vec<Vec<usize>>,
    in_degree: Vec<usize>,
    frontier: Vec<usize>,
}

impl<'a> TopologicalLayers<'a> {
    fn new(graph: &'a Graph) -> Self {
        let adjacency = graph.adjacency();
        let mut in_degree = vec![0; graph.nodes.len()];
        for succs in &adjacency {
            for &s in succs {
                in_degree[s] += 1;
            }
        }
        let frontier = (0..graph.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        Self {
            graph,
            adjacency,
            in_degree,
            frontier,
        }
    }
}

impl Iterator for TopologicalLayers<'_> {
    type Item = Vec<NodeId>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.frontier.is_empty() {
            return None;
        }
        let layer = std::mem::take(&mut self.frontier);
        let mut next = Vec::new();
        for &idx in &layer {
            for &succ in &self.adjacency[idx] {
                self.in_degree[succ] -= 1;
                if self.in_degree[succ] == 0 {
                    next.push(succ);
                }
            }
        }
        next.sort_unstable();
        self.frontier = next;
        Some(
            layer
                .into_iter()
                .map(|idx| self.graph.nodes[idx].id.clone())
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn passthrough(id: &str) -> Node {
        Node::new(
            id,
            "test.pass",
            PortDeclaration::new()
                .input(InputPort::new("in", DataType::Any).optional())
                .output(OutputPort::new("out", DataType::Any)),
        )
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut g = Graph::new("g");
        g.add_node(passthrough("a")).unwrap();
        assert_eq!(
            g.add_node(passthrough("a")),
            Err(StructuralError::DuplicateNode("a".into()))
        );
    }

    #[test]
    fn test_edge_errors() {
        let mut g = Graph::new("g");
        g.add_node(passthrough("a")).unwrap();
        g.add_node(passthrough("b")).unwrap();

        assert!(matches!(
            g.add_edge(Edge::between("a", "out", "zzz", "in")),
            Err(StructuralError::UnknownNode(_))
        ));
        assert!(matches!(
            g.add_edge(Edge::between("a", "out", "a", "in")),
            Err(StructuralError::SelfLoop(_))
        ));
        assert!(matches!(
            g.add_edge(Edge::between("a", "nope", "b", "in")),
            Err(StructuralError::UnknownPort {
                direction: PortDirection::Output,
                ..
            })
        ));
        g.add_edge(Edge::between("a", "out", "b", "in")).unwrap();
        assert!(matches!(
            g.add_edge(Edge::between("a", "out", "b", "in")),
            Err(StructuralError::InputAlreadyConnected(_))
        ));
    }

    #[test]
    fn test_edges_indexed_per_node() {
        let mut g = Graph::new("g");
        for id in ["a", "b", "c"] {
            g.add_node(passthrough(id)).unwrap();
        }
        g.add_node(Node::new(
            "join",
            "test.join",
            PortDeclaration::new()
                .input(InputPort::new("left", DataType::Any).optional())
                .input(InputPort::new("right", DataType::Any).optional()),
        ))
        .unwrap();
        g.add_edge(Edge::between("b", "out", "join", "right")).unwrap();
        g.add_edge(Edge::between("a", "out", "c", "in")).unwrap();
        g.add_edge(Edge::between("a", "out", "join", "left")).unwrap();

        let join: NodeId = "join".into();
        let sources: Vec<&str> = g
            .incoming_edges(&join)
            .map(|e| e.from.node.as_str())
            .collect();
        assert_eq!(sources, vec!["b", "a"]);

        let a: NodeId = "a".into();
        let targets: Vec<&str> = g
            .outgoing_edges(&a)
            .map(|e| e.to.port.as_str())
            .collect();
        assert_eq!(targets, vec!["in", "left"]);

        let b: NodeId = "b".into();
        assert_eq!(g.incoming_edges(&b).count(), 0);
        let missing: NodeId = "missing".into();
        assert_eq!(g.incoming_edges(&missing).count(), 0);
        assert_eq!(g.predecessors(&join), vec![b, a]);
    }

    #[test]
    fn test_list_output_cannot_feed_scalar_input() {
        let mut g = Graph::new("g");
        g.add_node(Node::new(
            "src",
            "t",
            PortDeclaration::new().output(OutputPort::new("items", DataType::list(DataType::String))),
        ))
        .unwrap();
        g.add_node(Node::new(
            "dst",
            "t",
            PortDeclaration::new().input(InputPort::new("item", DataType::String)),
        ))
        .unwrap();
        assert!(matches!(
            g.add_edge(Edge::between("src", "items", "dst", "item")),
            Err(StructuralError::IncompatiblePorts { .. })
        ));
    }

    #[test]
    fn test_edge_clears_binding_and_binding_rejects_connected_port() {
        let mut g = Graph::new("g");
        g.add_node(passthrough("a")).unwrap();
        g.add_node(passthrough("b")).unwrap();
        g.bind_input(&"b".into(), "in", InputBinding::Value(json!(1)))
            .unwrap();
        g.add_edge(Edge::between("a", "out", "b", "in")).unwrap();
        assert!(g.node(&"b".into()).unwrap().binding("in").is_none());

        assert!(matches!(
            g.bind_input(&"b".into(), "in", InputBinding::Value(json!(2))),
            Err(StructuralError::InputAlreadyConnected(_))
        ));
    }

    #[test]
    fn test_predecessors_are_ordered_and_deduplicated() {
        let mut g = Graph::new("g");
        g.add_node(Node::new(
            "src",
            "t",
            PortDeclaration::new()
                .output(OutputPort::new("x", DataType::Any))
                .output(OutputPort::new("y", DataType::Any)),
        ))
        .unwrap();
        g.add_node(passthrough("other")).unwrap();
        g.add_node(Node::new(
            "dst",
            "t",
            PortDeclaration::new()
                .input(InputPort::new("p", DataType::Any))
                .input(InputPort::new("q", DataType::Any))
                .input(InputPort::new("r", DataType::Any)),
        ))
        .unwrap();
        g.add_edge(Edge::between("other", "out", "dst", "p")).unwrap();
        g.add_edge(Edge::between("src", "x", "dst", "q")).unwrap();
        g.add_edge(Edge::between("src", "y", "dst", "r")).unwrap();

        assert_eq!(
            g.predecessors(&"dst".into()),
            vec![NodeId::from("other"), NodeId::from("src")]
        );
        assert_eq!(g.successors(&"src".into()), vec![NodeId::from("dst")]);
        assert!(g.predecessors(&"src".into()).is_empty());
    }

    #[test]
    fn test_graph_input_names_unique() {
        let mut g = Graph::new("g");
        g.add_graph_input(GraphInput::new("host", DataType::String))
            .unwrap();
        assert!(matches!(
            g.add_graph_input(GraphInput::new("host", DataType::Integer)),
            Err(StructuralError::DuplicateGraphInput(_))
        ));
    }

    #[test]
    fn test_binding_serde_shape() {
        let v = serde_json::to_value(InputBinding::GraphInput("host".into())).unwrap();
        assert_eq!(v, json!({"graph_input": "host"}));
        let b: InputBinding = serde_json::from_value(json!({"value": 5})).unwrap();
        assert_eq!(b, InputBinding::Value(json!(5)));
    }
}
