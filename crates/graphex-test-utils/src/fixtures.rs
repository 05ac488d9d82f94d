//! Graph fixtures built from JSON documents against the mock registry.

use serde_json::{json, Value};

use graphex_core::traits::NodeCatalog;
use graphex_graph::{validate, Graph, GraphDocument, ValidatedGraph};

/// Parse a graph document from a `json!` value. Panics on malformed input.
pub fn parse_document(doc: Value) -> GraphDocument {
    serde_json::from_value(doc).expect("fixture document should deserialize")
}

/// Assemble a graph from a document value. Panics on structural errors.
pub fn build(doc: Value, catalog: &dyn NodeCatalog) -> Graph {
    parse_document(doc)
        .build(catalog)
        .expect("fixture graph should assemble")
}

/// Assemble and validate. Panics when either step fails.
pub fn build_validated(doc: Value, catalog: &dyn NodeCatalog) -> ValidatedGraph {
    validate(build(doc, catalog)).expect("fixture graph should validate")
}

/// `a -> b -> d`, `a -> c -> d`, where `b` uses `b_type` (e.g. `test.fail`)
/// and `d` joins both branches.
pub fn diamond(b_type: &str) -> Value {
    json!({
        "name": "diamond",
        "nodes": [
            {"id": "a", "type": "test.echo"},
            {"id": "b", "type": b_type},
            {"id": "c", "type": "test.echo"},
            {"id": "d", "type": "test.join"},
        ],
        "edges": [
            {"from": "a::value", "to": "b::value"},
            {"from": "a::value", "to": "c::value"},
            {"from": "b::value", "to": "d::left"},
            {"from": "c::value", "to": "d::right"},
        ]
    })
}

/// `n` unconnected echo nodes named `n0..`, each pausing `millis`.
pub fn independent(n: usize, millis: u64) -> Value {
    let nodes: Vec<Value> = (0..n)
        .map(|i| json!({"id": format!("n{}", i), "type": "test.echo", "config": {"millis": millis}}))
        .collect();
    json!({"name": "independent", "nodes": nodes, "edges": []})
}

/// Linear chain of echo nodes `s0 -> s1 -> ..`, each requiring its input
/// except the first.
pub fn chain(n: usize) -> Value {
    let nodes: Vec<Value> = (0..n)
        .map(|i| {
            json!({
                "id": format!("s{}", i),
                "type": "test.echo",
                "config": {"required": i > 0},
            })
        })
        .collect();
    let edges: Vec<Value> = (1..n)
        .map(|i| json!({"from": format!("s{}::value", i - 1), "to": format!("s{}::value", i)}))
        .collect();
    json!({"name": "chain", "nodes": nodes, "edges": edges})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{mock_registry, Probe};

    #[test]
    fn test_fixtures_validate() {
        let registry = mock_registry(&Probe::new());
        assert_eq!(build_validated(diamond("test.fail"), &registry).len(), 4);
        assert_eq!(build_validated(independent(3, 0), &registry).len(), 3);
        let chain = build_validated(chain(4), &registry);
        assert_eq!(chain.edges().len(), 3);
    }
}
