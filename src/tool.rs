use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Result, RuntimeError};

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema for the tool input, when the source advertises one.
    fn parameters(&self) -> Option<Value> {
        None
    }
    async fn call(&self, input: Value) -> Result<Value>;
}

/// The invocation schema surfaced to the model for one tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescription {
    pub name: String,
    pub description: String,
    pub parameters: Option<Value>,
}

/// An ordered tool collection.
///
/// Insertion order is preserved and duplicate names are kept as distinct
/// entries; call-time lookup resolves a name to the last entry registered
/// under it. Both are deliberate: aggregation order encodes source priority,
/// and colliding names across sources are allowed.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn from_tools(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self { tools }
    }

    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.tools.push(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().rev().find(|t| t.name() == name).cloned()
    }

    pub fn describe(&self) -> Vec<ToolDescription> {
        self.tools
            .iter()
            .map(|t| ToolDescription {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect()
    }

    pub async fn call(&self, name: &str, input: Value) -> Result<Value> {
        let tool = self
            .get(name)
            .ok_or_else(|| RuntimeError::ToolNotFound(name.to_string()))?;
        tool.call(input).await
    }
}
