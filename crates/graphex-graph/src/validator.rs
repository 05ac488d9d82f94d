use std::ops::Deref;
use std::sync::Arc;

use tracing::debug;

use graphex_core::error::ValidationError;
use graphex_core::CoercionTable;

use crate::graph::{Graph, InputBinding};

/// A graph that passed validation. The only graph form the engine accepts.
#[derive(Debug, Clone)]
pub struct ValidatedGraph {
    graph: Arc<Graph>,
}

impl ValidatedGraph {
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn shared(&self) -> Arc<Graph> {
        self.graph.clone()
    }
}

impl Deref for ValidatedGraph {
    type Target = Graph;

    fn deref(&self) -> &Graph {
        &self.graph
    }
}

/// Validate with the lenient coercion table.
pub fn validate(graph: Graph) -> Result<ValidatedGraph, ValidationError> {
    validate_with(graph, &CoercionTable::lenient())
}

/// Check, in order: acyclicity, input satisfaction, edge type compatibility.
pub fn validate_with(
    graph: Graph,
    table: &CoercionTable,
) -> Result<ValidatedGraph, ValidationError> {
    check_acyclic(&graph)?;
    check_inputs(&graph)?;
    check_types(&graph, table)?;
    debug!(
        graph = %graph.name(),
        nodes = graph.len(),
        edges = graph.edges().len(),
        "Graph validated"
    );
    Ok(ValidatedGraph {
        graph: Arc::new(graph),
    })
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Iterative three-color depth-first search. Reports the first cycle found,
/// with its first node repeated at the end.
fn check_acyclic(graph: &Graph) -> Result<(), ValidationError> {
    let adjacency = graph.adjacency();
    let mut color = vec![Color::White; graph.len()];

    for root in 0..graph.len() {
        if color[root] != Color::White {
            continue;
        }
        // (node, index of next successor to visit)
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        color[root] = Color::Gray;

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            let succ = adjacency[node].get(top.1).copied();
            top.1 += 1;
            if let Some(succ) = succ {
                match color[succ] {
                    Color::White => {
                        color[succ] = Color::Gray;
                        stack.push((succ, 0));
                    }
                    Color::Gray => {
                        let start = stack
                            .iter()
                            .position(|&(n, _)| n == succ)
                            .unwrap_or(0);
                        let mut path: Vec<_> = stack[start..]
                            .iter()
                            .map(|&(n, _)| graph.nodes()[n].id.clone())
                            .collect();
                        path.push(graph.nodes()[succ].id.clone());
                        return Err(ValidationError::CycleDetected { path });
                    }
                    Color::Black => {}
                }
            } else {
                color[node] = Color::Black;
                stack.pop();
            }
        }
    }
    Ok(())
}

fn check_inputs(graph: &Graph) -> Result<(), ValidationError> {
    for node in graph.nodes() {
        for port in &node.ports.inputs {
            let connected = graph.incoming_edge(&node.id, &port.name).is_some();
            let bound = match node.binding(&port.name) {
                Some(InputBinding::Value(_)) => true,
                Some(InputBinding::GraphInput(name)) => {
                    if graph.graph_input(name).is_none() {
                        return Err(ValidationError::UnsatisfiedInput {
                            node: node.id.clone(),
                            port: port.name.clone(),
                        });
                    }
                    true
                }
                None => false,
            };
            if port.required && !connected && !bound && port.default.is_none() {
                return Err(ValidationError::UnsatisfiedInput {
                    node: node.id.clone(),
                    port: port.name.clone(),
                });
            }
        }
    }
    Ok(())
}

fn check_types(graph: &Graph, table: &CoercionTable) -> Result<(), ValidationError> {
    for edge in graph.edges() {
        let from_type = graph
            .node(&edge.from.node)
            .and_then(|n| n.output_port(&edge.from.port))
            .map(|p| &p.data_type);
        let to_type = graph
            .node(&edge.to.node)
            .and_then(|n| n.input_port(&edge.to.port))
            .map(|p| &p.data_type);
        // Both ends were checked when the edge was added.
        let (Some(from_type), Some(to_type)) = (from_type, to_type) else {
            continue;
        };
        if !table.can_coerce(from_type, to_type) {
            return Err(ValidationError::TypeMismatch {
                from: edge.from.clone(),
                to: edge.to.clone(),
                from_type: from_type.clone(),
                to_type: to_type.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, GraphInput, Node};
    use graphex_core::node::{InputPort, OutputPort, PortDeclaration};
    use graphex_core::{DataType, NodeId};
    use serde_json::json;

    fn node(id: &str, input: DataType, output: DataType) -> Node {
        Node::new(
            id,
            "t",
            PortDeclaration::new()
                .input(InputPort::new("in", input))
                .output(OutputPort::new("out", output)),
        )
    }

    fn chain(ids: &[&str]) -> Graph {
        let mut g = Graph::new("chain");
        for id in ids {
            g.add_node(node(id, DataType::Any, DataType::Any)).unwrap();
        }
        g
    }

    #[test]
    fn test_cycle_path_repeats_first_node() {
        let mut g = chain(&["a", "b", "c"]);
        g.add_edge(Edge::between("a", "out", "b", "in")).unwrap();
        g.add_edge(Edge::between("b", "out", "c", "in")).unwrap();
        g.add_edge(Edge::between("c", "out", "a", "in")).unwrap();

        match validate(g) {
            Err(ValidationError::CycleDetected { path }) => {
                let ids: Vec<&str> = path.iter().map(NodeId::as_str).collect();
                assert_eq!(ids, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_checked_before_inputs() {
        // "x" has an unsatisfied input and sorts first, but cycles win.
        let mut g = chain(&["x", "a", "b"]);
        g.add_edge(Edge::between("a", "out", "b", "in")).unwrap();
        g.add_edge(Edge::between("b", "out", "a", "in")).unwrap();
        assert!(matches!(
            validate(g),
            Err(ValidationError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_unsatisfied_required_input() {
        let g = chain(&["a"]);
        assert_eq!(
            validate(g).unwrap_err(),
            ValidationError::UnsatisfiedInput {
                node: "a".into(),
                port: "in".into(),
            }
        );
    }

    #[test]
    fn test_inputs_satisfied_by_binding_default_or_graph_input() {
        let mut g = Graph::new("g");
        g.add_graph_input(GraphInput::new("target", DataType::String))
            .unwrap();
        g.add_node(node("literal", DataType::Any, DataType::Any))
            .unwrap();
        g.add_node(node("from_input", DataType::String, DataType::Any))
            .unwrap();
        g.add_node(Node::new(
            "defaulted",
            "t",
            PortDeclaration::new().input(InputPort::new("in", DataType::Integer).with_default(json!(1))),
        ))
        .unwrap();
        g.add_node(Node::new(
            "optional",
            "t",
            PortDeclaration::new().input(InputPort::new("in", DataType::Integer).optional()),
        ))
        .unwrap();
        g.bind_input(&"literal".into(), "in", InputBinding::Value(json!("x")))
            .unwrap();
        g.bind_input(
            &"from_input".into(),
            "in",
            InputBinding::GraphInput("target".into()),
        )
        .unwrap();

        assert!(validate(g).is_ok());
    }

    #[test]
    fn test_binding_to_undeclared_graph_input() {
        let mut g = Graph::new("g");
        g.add_node(Node::new(
            "n",
            "t",
            PortDeclaration::new().input(InputPort::new("in", DataType::String).optional()),
        ))
        .unwrap();
        g.bind_input(&"n".into(), "in", InputBinding::GraphInput("nope".into()))
            .unwrap();
        assert!(matches!(
            validate(g),
            Err(ValidationError::UnsatisfiedInput { .. })
        ));
    }

    #[test]
    fn test_type_mismatch_depends_on_table() {
        let build = || {
            let mut g = Graph::new("g");
            g.add_node(node("count", DataType::Any, DataType::Integer))
                .unwrap();
            g.add_node(node("label", DataType::String, DataType::Any))
                .unwrap();
            g.bind_input(&"count".into(), "in", InputBinding::Value(json!(0)))
                .unwrap();
            g.add_edge(Edge::between("count", "out", "label", "in"))
                .unwrap();
            g
        };

        assert!(validate_with(build(), &CoercionTable::lenient()).is_ok());
        match validate_with(build(), &CoercionTable::strict()) {
            Err(ValidationError::TypeMismatch {
                from_type, to_type, ..
            }) => {
                assert_eq!(from_type, DataType::Integer);
                assert_eq!(to_type, DataType::String);
            }
            other => panic!("expected type mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_string_cannot_feed_number() {
        let mut g = Graph::new("g");
        g.add_node(node("s", DataType::Any, DataType::String)).unwrap();
        g.add_node(node("n", DataType::Number, DataType::Any)).unwrap();
        g.bind_input(&"s".into(), "in", InputBinding::Value(json!(0)))
            .unwrap();
        g.add_edge(Edge::between("s", "out", "n", "in")).unwrap();
        assert!(matches!(
            validate(g),
            Err(ValidationError::TypeMismatch { .. })
        ));
    }
}
