//! Agent execution state and persisted run state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::agent_loop::types::RunId;
use crate::error::{ErrorCode, WeftError};
use crate::types::{ModelMessage, Role};

/// Who an agent is and where it sits in the spawn tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<RunId>,
    /// Run ids from the root agent down to the parent.
    #[serde(default)]
    pub ancestor_run_ids: Vec<RunId>,
    pub agent_type: String,
}

impl AgentIdentity {
    /// A fresh top-level agent.
    pub fn root(agent_type: impl Into<String>) -> Self {
        Self {
            run_id: RunId::new_v4(),
            parent_id: None,
            ancestor_run_ids: Vec::new(),
            agent_type: agent_type.into(),
        }
    }

    /// A fresh child of this agent.
    pub fn child(&self, agent_type: impl Into<String>) -> Self {
        let mut ancestors = self.ancestor_run_ids.clone();
        ancestors.push(self.run_id);
        Self {
            run_id: RunId::new_v4(),
            parent_id: Some(self.run_id),
            ancestor_run_ids: ancestors,
            agent_type: agent_type.into(),
        }
    }
}

/// Status of a named subgoal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SubgoalStatus {
    #[default]
    NotStarted,
    InProgress,
    Complete,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subgoal {
    pub objective: String,
    #[serde(default)]
    pub status: SubgoalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
}

/// Change to the subgoal map carried by a [`StateDelta`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubgoalUpdate {
    Add { id: String, subgoal: Subgoal },
    Update {
        id: String,
        status: Option<SubgoalStatus>,
        plan: Option<String>,
        log: Option<String>,
    },
}

/// One agent's mutable execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(flatten)]
    pub identity: AgentIdentity,
    pub steps_remaining: u32,
    #[serde(default)]
    pub credits_used: f64,
    #[serde(default)]
    pub messages: Vec<ModelMessage>,
    #[serde(default)]
    pub subgoals: BTreeMap<String, Subgoal>,
    #[serde(default)]
    pub subagents: Vec<AgentState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl AgentState {
    pub fn new(identity: AgentIdentity, steps: u32) -> Self {
        Self {
            identity,
            steps_remaining: steps,
            credits_used: 0.0,
            messages: Vec::new(),
            subgoals: BTreeMap::new(),
            subagents: Vec::new(),
            output: None,
        }
    }

    pub fn agent_type(&self) -> &str {
        &self.identity.agent_type
    }

    /// Take one step from the budget. Returns `false` when none was left.
    pub fn consume_step(&mut self) -> bool {
        if self.steps_remaining == 0 {
            return false;
        }
        self.steps_remaining -= 1;
        true
    }

    /// Text of the last assistant message.
    pub fn last_assistant_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(ModelMessage::text)
    }

    /// Merge one handler's delta. Called only by the owning agent loop.
    pub fn apply(&mut self, delta: StateDelta) {
        self.credits_used += delta.credits;
        self.messages.extend(delta.messages);
        for update in delta.subgoals {
            match update {
                SubgoalUpdate::Add { id, subgoal } => {
                    self.subgoals.insert(id, subgoal);
                }
                SubgoalUpdate::Update {
                    id,
                    status,
                    plan,
                    log,
                } => {
                    let entry = self.subgoals.entry(id).or_insert_with(|| Subgoal {
                        objective: String::new(),
                        status: SubgoalStatus::default(),
                        plan: None,
                        logs: Vec::new(),
                    });
                    if let Some(status) = status {
                        entry.status = status;
                    }
                    if plan.is_some() {
                        entry.plan = plan;
                    }
                    entry.logs.extend(log);
                }
            }
        }
        self.subagents.extend(delta.subagents);
        if let Some(output) = delta.output {
            self.output = Some(output);
        }
    }
}

/// Immutable state change returned by a tool handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDelta {
    pub credits: f64,
    pub messages: Vec<ModelMessage>,
    pub subgoals: Vec<SubgoalUpdate>,
    pub output: Option<serde_json::Value>,
    /// The agent's turn is over.
    pub end_turn: bool,
    /// Finished child agents to reap into `subagents`.
    pub subagents: Vec<AgentState>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Externally visible result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentOutput {
    StructuredOutput {
        value: serde_json::Value,
    },
    LastMessage {
        text: String,
    },
    AllMessages {
        messages: Vec<ModelMessage>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
    },
}

impl AgentOutput {
    /// Error output carrying the error's sanitized message and code.
    pub fn from_error(err: &WeftError) -> Self {
        Self::Error {
            message: err.public_message(),
            error_code: Some(err.code()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// The output as one JSON value.
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Self::StructuredOutput { value } => value.clone(),
            Self::LastMessage { text } => serde_json::Value::String(text.clone()),
            other => serde_json::to_value(other).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Full persisted snapshot of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Opaque project context, round-tripped as is.
    #[serde(default)]
    pub file_context: serde_json::Value,
    pub main_agent_state: AgentState,
}

/// Result of one run; may seed the next run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub session_state: SessionState,
    pub output: AgentOutput,
}

impl RunState {
    pub fn to_json(&self) -> Result<String, WeftError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, WeftError> {
        Ok(serde_json::from_str(json)?)
    }
}
