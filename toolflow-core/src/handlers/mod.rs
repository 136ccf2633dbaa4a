//! Collaborators the flow engine dispatches to.

mod approval;
mod files;
mod shell;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;

pub use approval::{ApprovalGate, ApprovalRequest, AutoApprove, AutoReject};
pub use files::{FileContent, FileReader, ReadError, ReadFileTool, WorkspaceFileReader};
pub use shell::ShellTool;

/// A named tool callable from `tool_call` steps.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;

    /// One-line summary of what a call with `args` would do. Used by dry
    /// runs, so it must not have side effects.
    fn describe(&self, args: &Value) -> String {
        format!("call {} with {args}", self.name())
    }

    async fn call(&self, args: &Value) -> Result<Value>;
}

/// Tools by name, in registration order.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: IndexMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tool`, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn ToolHandler>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with(mut self, tool: Arc<dyn ToolHandler>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolHandler>> {
        self.tools.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.tools.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn call(&self, args: &Value) -> Result<Value> {
            Ok(args.clone())
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_name() {
        let registry = ToolRegistry::new().with(Arc::new(Echo));
        let tool = registry.get("echo").unwrap();
        assert_eq!(tool.call(&json!({"x": 1})).await.unwrap(), json!({"x": 1}));
        assert_eq!(tool.describe(&json!({})), "call echo with {}");
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["echo"]);
    }
}
