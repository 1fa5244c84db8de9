//! Agent events for observers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::types::RunId;
use crate::types::ToolResult;

/// Lifecycle and streaming events emitted by the agent loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    // -- Lifecycle --
    AgentStart {
        run_id: RunId,
        agent_type: String,
    },
    AgentEnd {
        run_id: RunId,
        is_error: bool,
    },

    // -- Step boundaries --
    StepStart {
        run_id: RunId,
        step: u32,
    },
    StepEnd {
        run_id: RunId,
        step: u32,
        tool_calls: usize,
    },

    // -- Streaming --
    TextDelta {
        run_id: RunId,
        text: String,
    },
    Reasoning {
        run_id: RunId,
        text: String,
    },

    // -- Tool execution --
    ToolExecutionStart {
        run_id: RunId,
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },
    ToolExecutionEnd {
        run_id: RunId,
        result: ToolResult,
    },

    // -- Retries --
    Retry {
        run_id: RunId,
        attempt: u32,
        delay_ms: u64,
        message: String,
    },
}

/// Observer callback for [`AgentEvent`]s.
pub type AgentEventSink = Arc<dyn Fn(AgentEvent) + Send + Sync>;

/// Emit to an optional sink.
pub(crate) fn emit(sink: &Option<AgentEventSink>, event: AgentEvent) {
    if let Some(sink) = sink {
        sink(event);
    }
}
