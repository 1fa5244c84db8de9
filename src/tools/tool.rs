//! Tool handler trait, execution context and closure-based tool wrapper.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::arguments::ToolArguments;
use super::resource::ResourceSlot;
use super::types::AgentToolParameters;
use crate::agent::state::{AgentIdentity, StateDelta};
use crate::error::WeftError;
use crate::fanout::Spawner;

/// Context available during tool execution.
#[derive(Clone)]
pub struct ToolContext {
    pub call_id: String,
    pub tool_name: String,
    /// The agent issuing the call.
    pub agent: AgentIdentity,
    /// Agent types this agent may spawn.
    pub spawnable_agents: Vec<String>,
    /// Fires when the run is cancelled. Handlers that spawn sub-runs pass
    /// child tokens down.
    pub cancel: CancellationToken,
    pub spawner: Option<Arc<dyn Spawner>>,
    resource: Option<ResourceSlot>,
    /// Slots for resources the tool reads, by the key as the call spelled it.
    reads: HashMap<String, ResourceSlot>,
}

impl ToolContext {
    pub fn new(
        tool_name: impl Into<String>,
        call_id: impl Into<String>,
        agent: AgentIdentity,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            agent,
            spawnable_agents: Vec::new(),
            cancel: CancellationToken::new(),
            spawner: None,
            resource: None,
            reads: HashMap::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>, spawnable: Vec<String>) -> Self {
        self.spawner = Some(spawner);
        self.spawnable_agents = spawnable;
        self
    }

    pub(crate) fn with_resource(mut self, slot: ResourceSlot) -> Self {
        self.resource = Some(slot);
        self
    }

    pub(crate) fn with_read(mut self, key: impl Into<String>, slot: ResourceSlot) -> Self {
        self.reads.insert(key.into(), slot);
        self
    }

    /// Ordered slot for a resource this call reads, if the dispatcher
    /// issued one for `key`.
    pub fn read_slot(&self, key: &str) -> Option<&ResourceSlot> {
        self.reads.get(key)
    }

    /// The ordered resource slot for resource-keyed tools.
    pub fn resource(&self) -> Result<&ResourceSlot, WeftError> {
        self.resource.as_ref().ok_or_else(|| {
            WeftError::tool(&self.tool_name, "tool is not keyed by a resource")
        })
    }

    pub fn spawner(&self) -> Result<&Arc<dyn Spawner>, WeftError> {
        self.spawner
            .as_ref()
            .ok_or_else(|| WeftError::tool(&self.tool_name, "spawning is not available here"))
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("call_id", &self.call_id)
            .field("tool_name", &self.tool_name)
            .field("agent", &self.agent)
            .field("resource", &self.resource.as_ref().map(ResourceSlot::key))
            .field("reads", &self.reads.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Cost reported by a handler.
///
/// A deferred cost resolves after the handler's own result; the dispatcher
/// awaits it without holding up other calls.
#[derive(Default)]
pub enum CostReport {
    #[default]
    None,
    Immediate(f64),
    Deferred(BoxFuture<'static, f64>),
}

impl std::fmt::Debug for CostReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Immediate(cost) => f.debug_tuple("Immediate").field(cost).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Output of one tool execution: the content returned to the model, a state
/// delta for the owning agent loop, and an optional cost.
#[derive(Debug, Default)]
pub struct ToolOutput {
    pub content: serde_json::Value,
    pub delta: StateDelta,
    pub cost: CostReport,
}

impl ToolOutput {
    pub fn new(content: serde_json::Value) -> Self {
        Self {
            content,
            ..Self::default()
        }
    }

    pub fn with_delta(mut self, delta: StateDelta) -> Self {
        self.delta = delta;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = CostReport::Immediate(cost);
        self
    }

    pub fn with_deferred_cost<F>(mut self, cost: F) -> Self
    where
        F: Future<Output = f64> + Send + 'static,
    {
        self.cost = CostReport::Deferred(Box::pin(cost));
        self
    }
}

/// Capability every tool handler provides.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool with validated arguments.
    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, WeftError>;
}

type HandlerFn = dyn Fn(ToolArguments, ToolContext) -> Pin<Box<dyn Future<Output = Result<ToolOutput, WeftError>> + Send>>
    + Send
    + Sync;

/// Closure-based tool for quick tool creation.
///
/// Carries its own name, description and schema so it can be registered as a
/// custom tool; as a builtin override only the handler is used.
#[derive(Clone)]
pub struct AgentTool {
    name: String,
    description: String,
    parameters: AgentToolParameters,
    handler: Arc<HandlerFn>,
}

impl AgentTool {
    /// Create a tool from a closure.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: AgentToolParameters,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolArguments, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput, WeftError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn parameters(&self) -> &AgentToolParameters {
        &self.parameters
    }
}

#[async_trait]
impl ToolHandler for AgentTool {
    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, WeftError> {
        (self.handler)(args.clone(), ctx.clone()).await
    }
}

impl std::fmt::Debug for AgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closure_tool_receives_arguments_and_context() {
        let tool = AgentTool::new(
            "echo",
            "Echo the message",
            AgentToolParameters::object()
                .string("message", "text to echo", true)
                .build(),
            |args, ctx| async move {
                let message = args.get_str("message")?.to_string();
                Ok(ToolOutput::new(serde_json::json!({
                    "echo": message,
                    "call_id": ctx.call_id,
                }))
                .with_cost(0.5))
            },
        );
        let ctx = ToolContext::new("echo", "call-1", AgentIdentity::root("base"));

        let output = tool
            .execute(
                &ToolArguments::new(serde_json::json!({ "message": "hi" })),
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(output.content["echo"], "hi");
        assert_eq!(output.content["call_id"], "call-1");
        assert!(matches!(output.cost, CostReport::Immediate(c) if c == 0.5));
    }

    #[test]
    fn resource_is_unavailable_without_a_slot() {
        let ctx = ToolContext::new("echo", "call-1", AgentIdentity::root("base"));
        assert!(ctx.resource().is_err());
        assert!(ctx.read_slot("a.txt").is_none());
        assert!(ctx.spawner().is_err());
    }
}
