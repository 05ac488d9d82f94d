use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use graphex_core::error::StructuralError;
use graphex_core::node::NodeConfig;
use graphex_core::traits::NodeCatalog;
use graphex_core::{NodeId, PortRef};

use crate::graph::{Edge, Graph, GraphInput, InputBinding, Node};

/// JSON form of a workflow graph, as submitted by the UI.
///
/// ```json
/// {
///   "name": "probe",
///   "inputs": [{"name": "host", "type": "string"}],
///   "nodes": [
///     {"id": "tcp", "type": "net.tcp_probe", "inputs": {"host": {"graph_input": "host"}, "port": {"value": 22}}},
///     {"id": "say", "type": "value.cast", "config": {"to": "string"}}
///   ],
///   "edges": [{"from": "tcp::reachable", "to": "say::value"}]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<GraphInput>,
    #[serde(default)]
    pub nodes: Vec<NodeDocument>,
    #[serde(default)]
    pub edges: Vec<EdgeDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDocument {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub config: NodeConfig,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Connection in `node::port` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDocument {
    pub from: String,
    pub to: String,
}

impl GraphDocument {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Resolve every node's ports through `catalog` and assemble the graph.
    /// Bindings are applied before edges, so an edge into a bound port wins.
    pub fn build(&self, catalog: &dyn NodeCatalog) -> Result<Graph, StructuralError> {
        let mut graph = Graph::new(self.name.clone());

        for input in &self.inputs {
            graph.add_graph_input(input.clone())?;
        }

        for doc in &self.nodes {
            let node_type =
                catalog
                    .lookup(&doc.type_tag)
                    .ok_or_else(|| StructuralError::UnknownNodeType {
                        node: doc.id.clone(),
                        type_tag: doc.type_tag.clone(),
                    })?;
            let ports = node_type
                .ports(&doc.config)
                .map_err(|e| StructuralError::InvalidConfig {
                    node: doc.id.clone(),
                    message: e.to_string(),
                })?;

            let mut node = Node::new(doc.id.clone(), doc.type_tag.clone(), ports)
                .with_config(doc.config.clone());
            if let Some(name) = &doc.name {
                node = node.with_name(name.clone());
            }
            node.timeout_secs = doc.timeout_secs;
            graph.add_node(node)?;

            for (port, binding) in &doc.inputs {
                graph.bind_input(&doc.id, port, binding.clone())?;
            }
        }

        for edge in &self.edges {
            let from = parse_ref(&edge.from)?;
            let to = parse_ref(&edge.to)?;
            graph.add_edge(Edge::new(from, to))?;
        }

        Ok(graph)
    }

    /// Document form of an assembled graph.
    pub fn from_graph(graph: &Graph) -> Self {
        Self {
            name: graph.name().to_string(),
            inputs: graph.graph_inputs().to_vec(),
            nodes: graph
                .nodes()
                .iter()
                .map(|n| NodeDocument {
                    id: n.id.clone(),
                    type_tag: n.type_tag.clone(),
                    name: (n.name != n.id.as_str()).then(|| n.name.clone()),
                    config: n.config.clone(),
                    inputs: n.bindings.clone(),
                    timeout_secs: n.timeout_secs,
                })
                .collect(),
            edges: graph
                .edges()
                .iter()
                .map(|e| EdgeDocument {
                    from: e.from.to_string(),
                    to: e.to.to_string(),
                })
                .collect(),
        }
    }
}

fn parse_ref(s: &str) -> Result<PortRef, StructuralError> {
    PortRef::parse(s).ok_or_else(|| StructuralError::MalformedPortRef(s.to_string()))
}
