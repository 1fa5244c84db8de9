//! Dynamic tool provider: tools discovered at runtime and addressed as
//! `provider/tool`.

use std::sync::Arc;

use async_trait::async_trait;

use super::arguments::ToolArguments;
use super::tool::{ToolContext, ToolHandler, ToolOutput};
use super::types::AgentToolParameters;
use crate::error::WeftError;

/// A tool discovered at runtime.
#[derive(Debug, Clone)]
pub struct DynamicTool {
    pub name: String,
    pub description: String,
    pub parameters: AgentToolParameters,
}

/// Trait for providers that can discover and execute tools at runtime.
#[async_trait]
pub trait DynamicToolProvider: Send + Sync {
    /// List available tools.
    async fn list_tools(&self) -> Result<Vec<DynamicTool>, WeftError>;

    /// Execute a tool by its unqualified name.
    async fn execute_tool(
        &self,
        name: &str,
        args: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, WeftError>;
}

/// Adapter that exposes one provider tool through [`ToolHandler`].
pub struct DynamicToolAdapter {
    provider: Arc<dyn DynamicToolProvider>,
    name: String,
}

impl DynamicToolAdapter {
    pub fn new(provider: Arc<dyn DynamicToolProvider>, name: impl Into<String>) -> Self {
        Self {
            provider,
            name: name.into(),
        }
    }
}

#[async_trait]
impl ToolHandler for DynamicToolAdapter {
    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, WeftError> {
        let content = self.provider.execute_tool(&self.name, args, ctx).await?;
        Ok(ToolOutput::new(content))
    }
}
