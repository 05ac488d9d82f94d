//! Workflow graphs: the mutable model a graph is assembled in, the JSON
//! document form the UI submits, and the validator that turns a graph into
//! something the engine will run.

pub mod document;
pub mod graph;
pub mod validator;

pub use document::{EdgeDocument, GraphDocument, NodeDocument};
pub use graph::{Edge, Graph, GraphInput, InputBinding, Node, TopologicalLayers};
pub use validator::{validate, validate_with, ValidatedGraph};
