//! Tool system: handlers, the registry, validation and ordered resources.

pub mod arguments;
pub mod builtin;
pub mod dynamic;
pub mod registry;
pub mod resource;
pub mod tool;
pub mod types;
pub mod validation;

pub use arguments::ToolArguments;
pub use builtin::register_builtins;
pub use dynamic::{DynamicTool, DynamicToolAdapter, DynamicToolProvider};
pub use registry::{
    CustomToolDefinition, RawToolCall, ToolCall, ToolCallError, ToolName, ToolRegistry,
    ValidateOptions,
};
pub use resource::{FsResourceStore, MemoryResourceStore, ResourceSlot, ResourceStore};
pub use tool::{AgentTool, CostReport, ToolContext, ToolHandler, ToolOutput};
pub use types::AgentToolParameters;
