//! Judging step for best-of-N.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{LabeledResult, SpawnRequest, Spawner};
use crate::agent::state::{AgentIdentity, AgentOutput};
use crate::error::WeftError;

/// Verdict of a selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Winner {
        label: String,
        rationale: Option<String>,
    },
    AllFailed,
}

/// Picks one labeled result.
#[async_trait]
pub trait Selector: Send + Sync {
    async fn select(
        &self,
        results: &[LabeledResult],
        cancel: CancellationToken,
    ) -> Result<Selection, WeftError>;
}

#[derive(Debug, Deserialize)]
struct Verdict {
    selected: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    all_failed: bool,
}

/// Selector that runs a judging agent over the labeled results.
///
/// The judge receives the results as JSON in its prompt and must set a
/// structured output of `{"selected": "<label>", "reason": "..."}`, or
/// `{"all_failed": true}`.
pub struct AgentSelector {
    spawner: Arc<dyn Spawner>,
    agent_type: String,
    task: String,
    parent: Option<AgentIdentity>,
    credits_used: Mutex<f64>,
}

impl AgentSelector {
    pub fn new(spawner: Arc<dyn Spawner>, agent_type: impl Into<String>) -> Self {
        Self {
            spawner,
            agent_type: agent_type.into(),
            task: String::new(),
            parent: None,
            credits_used: Mutex::new(0.0),
        }
    }

    /// The original task, shown to the judge.
    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = task.into();
        self
    }

    pub fn with_parent(mut self, parent: AgentIdentity) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Credits spent by every judge run so far.
    pub fn credits_used(&self) -> f64 {
        *self.credits_used.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn prompt(&self, results: &[LabeledResult]) -> Result<String, WeftError> {
        let rendered = serde_json::to_string_pretty(results)?;
        Ok(format!(
            "Task:\n{}\n\nCandidate results:\n{rendered}\n\nSelect the best candidate by label.",
            self.task
        ))
    }
}

#[async_trait]
impl Selector for AgentSelector {
    async fn select(
        &self,
        results: &[LabeledResult],
        cancel: CancellationToken,
    ) -> Result<Selection, WeftError> {
        let mut request = SpawnRequest::new(&self.agent_type, self.prompt(results)?)
            .with_cancel(cancel);
        if let Some(parent) = &self.parent {
            request = request.with_parent(parent.clone());
        }
        let run = self.spawner.spawn(request).await?;
        *self.credits_used.lock().unwrap_or_else(|e| e.into_inner()) +=
            run.agent_state().credits_used;

        let value = match run.run_state.output {
            AgentOutput::StructuredOutput { value } => value,
            AgentOutput::Error { message, .. } => {
                return Err(WeftError::Selection(format!("judge failed: {message}")))
            }
            other => {
                return Err(WeftError::Selection(format!(
                    "judge returned no structured verdict: {}",
                    other.to_value()
                )))
            }
        };
        let verdict: Verdict = serde_json::from_value(value)
            .map_err(|e| WeftError::Selection(format!("malformed verdict: {e}")))?;

        match verdict {
            Verdict {
                all_failed: true, ..
            } => Ok(Selection::AllFailed),
            Verdict {
                selected: Some(label),
                reason,
                ..
            } => Ok(Selection::Winner {
                label,
                rationale: reason,
            }),
            Verdict { selected: None, .. } => Err(WeftError::Selection(
                "verdict names no candidate".into(),
            )),
        }
    }
}
