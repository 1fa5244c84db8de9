//! Tool table, call validation and handler lookup.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

use super::dynamic::{DynamicTool, DynamicToolAdapter, DynamicToolProvider};
use super::tool::{AgentTool, ToolHandler};
use super::types::AgentToolParameters;
use super::validation::{coerce_textual_arguments, validate_arguments};
use crate::error::WeftError;
use crate::provider::ToolDefinition;
use crate::types::ToolResult;

/// Internal input key marking a call as ending the current step.
pub const END_STEP_MARKER: &str = "__ends_step";

/// Builtin tools.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, AsRefStr, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolName {
    ReadFiles,
    WriteFile,
    StrReplace,
    ListDirectory,
    RunTerminalCommand,
    AddSubgoal,
    UpdateSubgoal,
    SpawnAgents,
    SpawnBestOfN,
    SetOutput,
    EndTurn,
}

const SUBGOAL_STATUSES: &[&str] = &["NOT_STARTED", "IN_PROGRESS", "COMPLETE", "ABORTED"];

/// Static declaration of a builtin tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub description: &'static str,
    pub parameters: AgentToolParameters,
    /// The tool always ends the current step.
    pub ends_step: bool,
    /// Input field naming the resource the tool mutates.
    pub resource_param: Option<&'static str>,
    /// Input field listing resources the tool reads.
    pub read_param: Option<&'static str>,
}

impl ToolName {
    pub fn spec(self) -> ToolSpec {
        let (description, parameters) = match self {
            Self::ReadFiles => (
                "Read the current contents of one or more files.",
                AgentToolParameters::object()
                    .array("paths", "Paths relative to the project root", "string", true)
                    .build(),
            ),
            Self::WriteFile => (
                "Create or overwrite a file.",
                AgentToolParameters::object()
                    .string("path", "Path relative to the project root", true)
                    .string("content", "Full new file content", true)
                    .build(),
            ),
            Self::StrReplace => (
                "Replace an exact string in a file.",
                AgentToolParameters::object()
                    .string("path", "Path relative to the project root", true)
                    .string("old", "Exact text to replace", true)
                    .string("new", "Replacement text", true)
                    .boolean("all", "Replace every occurrence", false)
                    .build(),
            ),
            Self::ListDirectory => (
                "List the entries of a directory.",
                AgentToolParameters::object()
                    .string("path", "Directory relative to the project root", true)
                    .build(),
            ),
            Self::RunTerminalCommand => (
                "Run a shell command in the project.",
                AgentToolParameters::object()
                    .string("command", "Command line to run", true)
                    .string("cwd", "Working directory relative to the project root", false)
                    .integer("timeout_seconds", "Kill the command after this many seconds", false)
                    .build(),
            ),
            Self::AddSubgoal => (
                "Record a new subgoal.",
                AgentToolParameters::object()
                    .string("id", "Subgoal identifier", true)
                    .string("objective", "What the subgoal achieves", true)
                    .string_enum("status", "Initial status", SUBGOAL_STATUSES, false)
                    .string("plan", "How to achieve it", false)
                    .build(),
            ),
            Self::UpdateSubgoal => (
                "Update the status, plan or log of a subgoal.",
                AgentToolParameters::object()
                    .string("id", "Subgoal identifier", true)
                    .string_enum("status", "New status", SUBGOAL_STATUSES, false)
                    .string("plan", "Replacement plan", false)
                    .string("log", "Progress note to append", false)
                    .build(),
            ),
            Self::SpawnAgents => (
                "Run subagents in parallel and collect their outputs.",
                AgentToolParameters::object()
                    .array(
                        "agents",
                        "Agents to spawn: objects with agent_type, prompt and optional params",
                        "object",
                        true,
                    )
                    .build(),
            ),
            Self::SpawnBestOfN => (
                "Run the same task on N agents and keep the best result.",
                AgentToolParameters::object()
                    .string("agent_type", "Agent type to run", true)
                    .string("prompt", "Task for every instance", true)
                    .integer("n", "Number of instances", true)
                    .string("selector_agent", "Agent type that judges the results", false)
                    .object("params", "Extra parameters for every instance", false)
                    .build(),
            ),
            Self::SetOutput => (
                "Set the agent's structured output. The whole input becomes the output.",
                AgentToolParameters::empty(),
            ),
            Self::EndTurn => (
                "End the agent's turn.",
                AgentToolParameters::empty(),
            ),
        };
        ToolSpec {
            description,
            parameters,
            ends_step: matches!(self, Self::EndTurn),
            resource_param: match self {
                Self::WriteFile | Self::StrReplace => Some("path"),
                _ => None,
            },
            read_param: match self {
                Self::ReadFiles => Some("paths"),
                _ => None,
            },
        }
    }
}

/// A tool call as it arrives from the model or a scripted step.
#[derive(Debug, Clone, PartialEq)]
pub struct RawToolCall {
    pub name: String,
    pub call_id: String,
    pub input: Value,
    /// Values came from tag text and may need coercion to schema types.
    pub textual: bool,
}

impl RawToolCall {
    /// A structured call with a fresh call id.
    pub fn new(name: impl Into<String>, input: Value) -> Self {
        Self {
            name: name.into(),
            call_id: new_call_id(),
            input,
            textual: false,
        }
    }

    /// Build a call from an extracted tool tag.
    ///
    /// Attributes become string inputs. A body holding a JSON object is merged
    /// underneath them; other body text is ignored.
    pub fn from_tag(name: &str, attributes: &BTreeMap<String, String>, body: &str) -> Self {
        let mut input = match serde_json::from_str::<Value>(body.trim()) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        for (key, value) in attributes {
            input.insert(key.clone(), Value::String(value.clone()));
        }
        Self {
            name: name.to_string(),
            call_id: new_call_id(),
            input: Value::Object(input),
            textual: true,
        }
    }
}

pub(crate) fn new_call_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Where a validated call is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolTarget {
    Builtin(ToolName),
    Custom,
    Provider { provider: String, tool: String },
}

/// A validated, immutable tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool_name: String,
    pub call_id: String,
    pub input: Value,
    pub target: ToolTarget,
    pub ends_step: bool,
}

/// Validation failure, shaped identically for every tool path.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallError {
    pub tool_name: String,
    pub call_id: String,
    pub input: Value,
    pub message: String,
    pub violations: Vec<String>,
}

impl ToolCallError {
    pub fn new(
        tool_name: impl Into<String>,
        call_id: impl Into<String>,
        input: Value,
        message: impl Into<String>,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            call_id: call_id.into(),
            input,
            message: message.into(),
            violations: Vec::new(),
        }
    }

    fn not_found(raw: &RawToolCall) -> Self {
        Self::new(
            &raw.name,
            &raw.call_id,
            raw.input.clone(),
            format!("Tool '{}' not found", raw.name),
        )
    }

    /// The error as a transcript-ready result.
    pub fn to_result(&self) -> ToolResult {
        ToolResult::error(&self.tool_name, &self.call_id, &self.message)
    }
}

impl std::fmt::Display for ToolCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ToolCallError {}

/// Options for one validation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateOptions {
    /// The calling context requires the call to end the current step.
    pub ends_step: bool,
}

/// A dynamically registered tool.
#[derive(Debug, Clone)]
pub struct CustomToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: AgentToolParameters,
    pub ends_step: bool,
    pub resource_param: Option<String>,
}

impl CustomToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: AgentToolParameters,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            ends_step: false,
            resource_param: None,
        }
    }

    pub fn ending_step(mut self) -> Self {
        self.ends_step = true;
        self
    }

    /// Order calls on the resource named by this input field.
    pub fn keyed_by(mut self, param: impl Into<String>) -> Self {
        self.resource_param = Some(param.into());
        self
    }
}

struct CustomTool {
    definition: CustomToolDefinition,
    handler: Arc<dyn ToolHandler>,
}

struct ProviderTools {
    provider: Arc<dyn DynamicToolProvider>,
    tools: HashMap<String, DynamicTool>,
}

/// Registry of builtin handlers, custom tools and dynamic providers.
#[derive(Default)]
pub struct ToolRegistry {
    handlers: HashMap<ToolName, Arc<dyn ToolHandler>>,
    custom: HashMap<String, CustomTool>,
    providers: HashMap<String, ProviderTools>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&mut self, name: ToolName, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(name, handler);
    }

    /// Register a custom tool. Builtin names cannot be shadowed.
    pub fn register_custom(
        &mut self,
        definition: CustomToolDefinition,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), WeftError> {
        if ToolName::from_str(&definition.name).is_ok() || definition.name.contains('/') {
            return Err(WeftError::Configuration(format!(
                "custom tool name '{}' is reserved",
                definition.name
            )));
        }
        self.custom.insert(
            definition.name.clone(),
            CustomTool {
                definition,
                handler,
            },
        );
        Ok(())
    }

    /// Register a closure-based tool as a custom tool.
    pub fn register_tool(&mut self, tool: AgentTool) -> Result<(), WeftError> {
        let definition = CustomToolDefinition::new(
            tool.name(),
            tool.description(),
            tool.parameters().clone(),
        );
        self.register_custom(definition, Arc::new(tool))
    }

    /// Register a dynamic provider under `prefix`, caching its tool schemas.
    /// Returns how many tools it exposes.
    pub async fn register_provider(
        &mut self,
        prefix: impl Into<String>,
        provider: Arc<dyn DynamicToolProvider>,
    ) -> Result<usize, WeftError> {
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.contains('/') {
            return Err(WeftError::Configuration(format!(
                "invalid tool provider prefix '{prefix}'"
            )));
        }
        let tools: HashMap<_, _> = provider
            .list_tools()
            .await?
            .into_iter()
            .map(|tool| (tool.name.clone(), tool))
            .collect();
        let count = tools.len();
        tracing::debug!(provider = %prefix, tools = count, "registered tool provider");
        self.providers
            .insert(prefix, ProviderTools { provider, tools });
        Ok(count)
    }

    /// Validate a call against the builtin table.
    pub fn validate(
        &self,
        raw: &RawToolCall,
        options: ValidateOptions,
    ) -> Result<ToolCall, ToolCallError> {
        let name = ToolName::from_str(&raw.name).map_err(|_| ToolCallError::not_found(raw))?;
        let spec = name.spec();
        check_input(
            raw,
            options,
            &spec.parameters.schema,
            spec.ends_step,
            ToolTarget::Builtin(name),
        )
    }

    /// Validate a call against custom tools and `provider/tool` names.
    pub fn validate_custom(
        &self,
        raw: &RawToolCall,
        options: ValidateOptions,
    ) -> Result<ToolCall, ToolCallError> {
        if let Some((prefix, tool)) = raw.name.split_once('/') {
            let found = self
                .providers
                .get(prefix)
                .and_then(|p| p.tools.get(tool))
                .ok_or_else(|| ToolCallError::not_found(raw))?;
            return check_input(
                raw,
                options,
                &found.parameters.schema,
                false,
                ToolTarget::Provider {
                    provider: prefix.to_string(),
                    tool: tool.to_string(),
                },
            );
        }
        let custom = self
            .custom
            .get(&raw.name)
            .ok_or_else(|| ToolCallError::not_found(raw))?;
        check_input(
            raw,
            options,
            &custom.definition.parameters.schema,
            custom.definition.ends_step,
            ToolTarget::Custom,
        )
    }

    /// Validate through whichever path owns the name.
    pub fn resolve(
        &self,
        raw: &RawToolCall,
        options: ValidateOptions,
    ) -> Result<ToolCall, ToolCallError> {
        if ToolName::from_str(&raw.name).is_ok() {
            self.validate(raw, options)
        } else {
            self.validate_custom(raw, options)
        }
    }

    /// Handler for a validated call.
    pub fn handler_for(&self, call: &ToolCall) -> Option<Arc<dyn ToolHandler>> {
        match &call.target {
            ToolTarget::Builtin(name) => self.handlers.get(name).cloned(),
            ToolTarget::Custom => self
                .custom
                .get(&call.tool_name)
                .map(|c| Arc::clone(&c.handler)),
            ToolTarget::Provider { provider, tool } => self.providers.get(provider).map(|p| {
                Arc::new(DynamicToolAdapter::new(Arc::clone(&p.provider), tool.clone()))
                    as Arc<dyn ToolHandler>
            }),
        }
    }

    /// Resource key the call must be ordered on, if any.
    pub fn resource_key(&self, call: &ToolCall) -> Option<String> {
        let param = match &call.target {
            ToolTarget::Builtin(name) => name.spec().resource_param.map(str::to_string),
            ToolTarget::Custom => self
                .custom
                .get(&call.tool_name)
                .and_then(|c| c.definition.resource_param.clone()),
            ToolTarget::Provider { .. } => None,
        }?;
        call.input.get(&param).and_then(Value::as_str).map(str::to_string)
    }

    /// Resources a builtin reads without mutating, in input order.
    pub fn read_keys(&self, call: &ToolCall) -> Vec<String> {
        let ToolTarget::Builtin(name) = &call.target else {
            return Vec::new();
        };
        let Some(param) = name.spec().read_param else {
            return Vec::new();
        };
        call.input
            .get(param)
            .and_then(Value::as_array)
            .map(|keys| {
                keys.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Schemas for the allowed tools that have a handler, in allow-list order.
    pub fn tool_definitions(&self, allow_list: &[String]) -> Vec<ToolDefinition> {
        allow_list
            .iter()
            .filter_map(|name| self.definition(name))
            .collect()
    }

    fn definition(&self, name: &str) -> Option<ToolDefinition> {
        if let Ok(builtin) = ToolName::from_str(name) {
            if !self.handlers.contains_key(&builtin) {
                return None;
            }
            let spec = builtin.spec();
            return Some(ToolDefinition {
                name: name.to_string(),
                description: spec.description.to_string(),
                parameters: spec.parameters.schema,
            });
        }
        if let Some((prefix, tool)) = name.split_once('/') {
            let tool = self.providers.get(prefix)?.tools.get(tool)?;
            return Some(ToolDefinition {
                name: name.to_string(),
                description: tool.description.clone(),
                parameters: tool.parameters.schema.clone(),
            });
        }
        self.custom.get(name).map(|c| ToolDefinition {
            name: name.to_string(),
            description: c.definition.description.clone(),
            parameters: c.definition.parameters.schema.clone(),
        })
    }

    /// Every name the registry can route, for tag recognition.
    pub fn tag_names(&self) -> Vec<String> {
        let mut names: Vec<String> = ToolName::iter().map(|n| n.to_string()).collect();
        names.extend(self.custom.keys().cloned());
        for (prefix, provider) in &self.providers {
            names.extend(provider.tools.keys().map(|tool| format!("{prefix}/{tool}")));
        }
        names
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn check_input(
    raw: &RawToolCall,
    options: ValidateOptions,
    schema: &Value,
    declared_ends_step: bool,
    target: ToolTarget,
) -> Result<ToolCall, ToolCallError> {
    let mut input = raw.input.clone();
    if let Value::Object(map) = &mut input {
        // Internal markers are only ever set by the caller.
        map.retain(|key, _| !key.starts_with("__"));
        if options.ends_step {
            map.insert(END_STEP_MARKER.to_string(), Value::Bool(true));
        }
    }
    if raw.textual {
        input = coerce_textual_arguments(input, schema);
    }

    if let Err(violations) = validate_arguments(&input, schema) {
        let mut err = ToolCallError::new(
            &raw.name,
            &raw.call_id,
            raw.input.clone(),
            format!(
                "Invalid parameters for {}: {}",
                raw.name,
                violations.join("; ")
            ),
        );
        err.violations = violations;
        return Err(err);
    }

    let mut ends_step = declared_ends_step;
    if let Value::Object(map) = &mut input {
        ends_step |= map
            .get(END_STEP_MARKER)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        map.retain(|key, _| !key.starts_with("__"));
    }

    Ok(ToolCall {
        tool_name: raw.name.clone(),
        call_id: raw.call_id.clone(),
        input,
        target,
        ends_step,
    })
}
