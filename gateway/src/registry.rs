//! Tool Registry — stores and retrieves tool definitions

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Description of a callable tool as offered to the AI layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub namespace: String,
    pub version: String,
    pub description: String,
    pub risk_level: String,
    pub requires_confirmation: bool,
    pub idempotent: bool,
    pub timeout_ms: u64,
}

/// In-memory tool registry
#[derive(Default)]
pub struct Registry {
    tools: BTreeMap<String, ToolDefinition>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool definition
    pub fn register_tool(&mut self, tool: ToolDefinition) {
        debug!("Registered tool: {} (ns: {})", tool.name, tool.namespace);
        self.tools.insert(tool.name.clone(), tool);
    }

    /// Get a tool by name
    pub fn get_tool(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    /// List tools sorted by name, optionally filtered by namespace
    pub fn list_tools(&self, namespace: &str) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .filter(|t| namespace.is_empty() || t.namespace == namespace)
            .cloned()
            .collect()
    }

    /// Get total tool count
    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }
}

/// Helper to create a ToolDefinition
pub fn make_tool(
    name: &str,
    namespace: &str,
    description: &str,
    risk_level: &str,
    idempotent: bool,
    timeout_ms: u64,
) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        namespace: namespace.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        description: description.to_string(),
        risk_level: risk_level.to_string(),
        requires_confirmation: risk_level == "high",
        idempotent,
        timeout_ms,
    }
}
