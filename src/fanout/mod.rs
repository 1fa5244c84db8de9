//! Spawning agent runs and best-of-N fan-out.

pub mod selector;

pub use selector::{AgentSelector, Selection, Selector};

use std::ops::RangeInclusive;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::state::{AgentIdentity, AgentOutput, AgentState, RunState};
use crate::error::{ErrorCode, WeftError};

/// Request to run one agent to completion.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub agent_type: String,
    pub prompt: String,
    pub params: Option<serde_json::Value>,
    /// Spawning agent; `None` for a top-level run.
    pub parent: Option<AgentIdentity>,
    pub cancel: CancellationToken,
}

impl SpawnRequest {
    pub fn new(agent_type: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            prompt: prompt.into(),
            params: None,
            parent: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_parent(mut self, parent: AgentIdentity) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A finished spawned run.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnedRun {
    pub agent_type: String,
    pub run_state: RunState,
}

impl SpawnedRun {
    pub fn output(&self) -> &AgentOutput {
        &self.run_state.output
    }

    /// The child's final agent state, for reaping into its parent.
    pub fn agent_state(&self) -> &AgentState {
        &self.run_state.session_state.main_agent_state
    }

    pub fn into_outcome(self) -> InstanceOutcome {
        match self.run_state.output {
            AgentOutput::Error {
                message,
                error_code,
            } => InstanceOutcome::Failed {
                message,
                code: error_code,
            },
            output => InstanceOutcome::Completed { output },
        }
    }
}

/// Spawn boundary shared by subagent delegation and fan-out.
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Run an agent to completion. A run that ends with an error output is
    /// still `Ok`; `Err` means the run could not be started.
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedRun, WeftError>;
}

/// Result of one fan-out instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InstanceOutcome {
    Completed {
        output: AgentOutput,
    },
    Failed {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

/// One instance's result under its stable label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledResult {
    pub label: String,
    pub outcome: InstanceOutcome,
}

impl LabeledResult {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, InstanceOutcome::Failed { .. })
    }
}

/// Winner of a best-of-N fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct BestOfNOutcome {
    pub label: String,
    pub output: AgentOutput,
    pub rationale: Option<String>,
    /// Every instance, in label order.
    pub results: Vec<LabeledResult>,
    /// Final states of the instances that ran, in label order.
    pub instances: Vec<AgentState>,
}

/// Label for the instance at `index`: `A`..`Z`, then `AA`, `AB`, …
pub fn instance_label(index: usize) -> String {
    let mut n = index;
    let mut label = Vec::new();
    loop {
        label.push(b'A' + (n % 26) as u8);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    label.reverse();
    String::from_utf8_lossy(&label).into_owned()
}

/// Run `n` identical instances of `request` and reduce them to one winner.
pub async fn best_of_n(
    spawner: &dyn Spawner,
    selector: &dyn Selector,
    request: SpawnRequest,
    n: usize,
    range: RangeInclusive<usize>,
    cancel: CancellationToken,
) -> Result<BestOfNOutcome, WeftError> {
    if !range.contains(&n) {
        return Err(WeftError::InvalidArgument(format!(
            "best-of-N count {n} is outside {}..={}",
            range.start(),
            range.end()
        )));
    }
    debug!(agent_type = %request.agent_type, n, "fanning out");

    let spawns = (0..n).map(|_| {
        let instance = request.clone().with_cancel(cancel.child_token());
        spawner.spawn(instance)
    });
    let finished = tokio::select! {
        finished = futures::future::join_all(spawns) => finished,
        _ = cancel.cancelled() => return Err(WeftError::Cancelled),
    };

    let mut results = Vec::with_capacity(n);
    let mut instances = Vec::new();
    for (index, spawned) in finished.into_iter().enumerate() {
        let label = instance_label(index);
        let outcome = match spawned {
            Ok(run) => {
                instances.push(run.agent_state().clone());
                run.into_outcome()
            }
            Err(err) => {
                warn!(label = %label, error = %err, "best-of-N instance failed to start");
                InstanceOutcome::Failed {
                    message: err.public_message(),
                    code: Some(err.code()),
                }
            }
        };
        results.push(LabeledResult { label, outcome });
    }

    if results.iter().all(LabeledResult::is_failed) {
        return Err(WeftError::Selection(format!(
            "all {n} best-of-N instances failed"
        )));
    }

    let selection = selector
        .select(&results, cancel.child_token())
        .await
        .map_err(|err| WeftError::Selection(format!("selector failed: {err}")))?;

    match selection {
        Selection::AllFailed => Err(WeftError::Selection(
            "selector reported that every instance failed".into(),
        )),
        Selection::Winner { label, rationale } => {
            let chosen = results
                .iter()
                .find(|r| r.label == label)
                .ok_or_else(|| {
                    WeftError::Selection(format!(
                        "selector chose '{label}', which is not one of {}",
                        results
                            .iter()
                            .map(|r| r.label.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ))
                })?;
            let output = match &chosen.outcome {
                InstanceOutcome::Completed { output } => output.clone(),
                InstanceOutcome::Failed { message, .. } => {
                    return Err(WeftError::Selection(format!(
                        "selector chose '{label}', which failed: {message}"
                    )))
                }
            };
            debug!(label = %label, "best-of-N winner selected");
            Ok(BestOfNOutcome {
                label,
                output,
                rationale,
                results,
                instances,
            })
        }
    }
}
