//! Convenience re-exports for common use.

pub use crate::agent::{
    AgentOutput, AgentRuntime, AgentState, AgentTemplate, AgentTemplates, OutputMode, RunOptions,
    RunState,
};
pub use crate::agent_loop::{AgentEvent, ScriptedSteps, StepInstruction, StepProgram};
pub use crate::config::WeftConfig;
pub use crate::error::{ErrorCode, Result, WeftError};
pub use crate::fanout::{best_of_n, Selection, Selector, SpawnRequest, Spawner};
pub use crate::provider::{ModelProvider, ModelRequest};
pub use crate::tools::{
    AgentTool, AgentToolParameters, ResourceStore, ToolArguments, ToolContext, ToolHandler,
    ToolOutput,
};
pub use crate::types::{ContentPart, ModelMessage, Role, StreamChunk, ToolResult, Usage};
