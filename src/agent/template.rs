//! Agent templates: what an agent type may do and how it reports output.

use std::collections::HashMap;
use std::sync::Arc;

use bon::Builder;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::agent_loop::steps::StepProgram;
use crate::error::WeftError;

/// How a finished agent's output is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutputMode {
    #[default]
    LastMessage,
    AllMessages,
    StructuredOutput,
}

/// Creates a fresh step program for each run.
pub type StepProgramFactory = Arc<dyn Fn() -> Box<dyn StepProgram> + Send + Sync>;

/// Definition of one agent type.
#[derive(Clone, Builder)]
pub struct AgentTemplate {
    #[builder(into)]
    pub id: String,
    #[builder(into)]
    pub system_prompt: Option<String>,
    /// Tools the model may call.
    #[builder(default)]
    pub tool_names: Vec<String>,
    /// Agent types this agent may spawn.
    #[builder(default)]
    pub spawnable_agents: Vec<String>,
    #[builder(default)]
    pub output_mode: OutputMode,
    /// Overrides the configured step budget.
    pub max_steps: Option<u32>,
    pub step_program: Option<StepProgramFactory>,
}

impl AgentTemplate {
    pub fn allows(&self, tool_name: &str) -> bool {
        self.tool_names.iter().any(|name| name == tool_name)
    }
}

impl std::fmt::Debug for AgentTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTemplate")
            .field("id", &self.id)
            .field("tool_names", &self.tool_names)
            .field("spawnable_agents", &self.spawnable_agents)
            .field("output_mode", &self.output_mode)
            .field("max_steps", &self.max_steps)
            .field("step_program", &self.step_program.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Templates by agent type.
#[derive(Debug, Clone, Default)]
pub struct AgentTemplates {
    templates: HashMap<String, Arc<AgentTemplate>>,
}

impl AgentTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, template: AgentTemplate) {
        self.templates
            .insert(template.id.clone(), Arc::new(template));
    }

    pub fn with(mut self, template: AgentTemplate) -> Self {
        self.register(template);
        self
    }

    pub fn get(&self, agent_type: &str) -> Result<Arc<AgentTemplate>, WeftError> {
        self.templates
            .get(agent_type)
            .cloned()
            .ok_or_else(|| WeftError::AgentNotFound(agent_type.to_string()))
    }
}
