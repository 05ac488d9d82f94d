use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use graphex_core::node::{NodeConfig, PortDeclaration};
use graphex_core::traits::{NodeCatalog, NodeType};

/// What the UI palette needs to know about a node type.
#[derive(Debug, Clone, Serialize)]
pub struct NodeTypeInfo {
    #[serde(rename = "type")]
    pub type_tag: String,
    pub description: String,
    pub category: String,
    /// Ports for the default (empty) configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<PortDeclaration>,
}

/// Registry of available node types, keyed by type tag.
pub struct NodeTypeRegistry {
    types: HashMap<String, Arc<dyn NodeType>>,
}

impl NodeTypeRegistry {
    pub fn new() -> Self {
        Self {
            types: HashMap::new(),
        }
    }

    /// Register a node type. A later registration replaces an earlier one.
    pub fn register(&mut self, node_type: impl NodeType) {
        let tag = node_type.type_tag().to_string();
        self.types.insert(tag, Arc::new(node_type));
    }

    pub fn register_arc(&mut self, node_type: Arc<dyn NodeType>) {
        self.types.insert(node_type.type_tag().to_string(), node_type);
    }

    /// Unregister a node type by tag.
    pub fn unregister(&mut self, type_tag: &str) -> bool {
        self.types.remove(type_tag).is_some()
    }

    pub fn get(&self, type_tag: &str) -> Option<Arc<dyn NodeType>> {
        self.types.get(type_tag).cloned()
    }

    /// Registered type tags, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.types.keys().map(|s| s.as_str()).collect();
        tags.sort_unstable();
        tags
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Descriptions for every registered type, sorted by tag.
    pub fn definitions(&self) -> Vec<NodeTypeInfo> {
        let empty = NodeConfig::new();
        self.list()
            .into_iter()
            .filter_map(|tag| self.types.get(tag))
            .map(|t| NodeTypeInfo {
                type_tag: t.type_tag().to_string(),
                description: t.description().to_string(),
                category: t.category().to_string(),
                ports: t.ports(&empty).ok(),
            })
            .collect()
    }

    /// Create a registry with all built-in node types registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        // ── Values & control ────────────────────────────────────
        registry.register(crate::builtin::value::ConstantNode);
        registry.register(crate::builtin::value::CastNode);
        registry.register(crate::builtin::control::DelayNode);

        // ── Network ─────────────────────────────────────────────
        registry.register(crate::builtin::network::TcpProbeNode);
        registry.register(crate::builtin::network::DnsLookupNode);
        registry.register(crate::builtin::network::HttpRequestNode);

        // ── File system ─────────────────────────────────────────
        registry.register(crate::builtin::filesystem::FileReadNode);
        registry.register(crate::builtin::filesystem::FileWriteNode);
        registry.register(crate::builtin::filesystem::FileExistsNode);

        // ── Git & shell ─────────────────────────────────────────
        registry.register(crate::builtin::git::GitStatusNode);
        registry.register(crate::builtin::shell::ShellCommandNode);

        registry
    }
}

impl Default for NodeTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeCatalog for NodeTypeRegistry {
    fn lookup(&self, type_tag: &str) -> Option<Arc<dyn NodeType>> {
        self.get(type_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = NodeTypeRegistry::with_builtins();
        assert_eq!(registry.len(), 11);
        for tag in [
            "value.constant",
            "value.cast",
            "control.delay",
            "net.tcp_probe",
            "net.dns_lookup",
            "net.http_request",
            "file.read",
            "file.write",
            "file.exists",
            "git.status",
            "shell.command",
        ] {
            assert!(registry.lookup(tag).is_some(), "missing {}", tag);
        }
    }

    #[test]
    fn test_definitions_sorted_with_default_ports() {
        let registry = NodeTypeRegistry::with_builtins();
        let defs = registry.definitions();
        let tags: Vec<&str> = defs.iter().map(|d| d.type_tag.as_str()).collect();
        let mut sorted = tags.clone();
        sorted.sort_unstable();
        assert_eq!(tags, sorted);
        assert!(defs.iter().all(|d| d.ports.is_some()));
    }

    #[test]
    fn test_unregister() {
        let mut registry = NodeTypeRegistry::with_builtins();
        assert!(registry.unregister("shell.command"));
        assert!(!registry.unregister("shell.command"));
        assert!(registry.get("shell.command").is_none());
    }
}
