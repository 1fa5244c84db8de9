//! Run controller: one agent run with retries, cancellation and spawning.
//!
//! [`AgentRuntime::run`] always resolves to a [`RunState`]. Each attempt
//! starts the agent loop from the same initial state; a retryable failure
//! sleeps for `min(base_delay * 2^attempt, max_delay)` and tries again, a
//! terminal one (or running out of retries) becomes an error output. One
//! cancellation token covers every attempt and every backoff.
//!
//! The runtime is also the [`Spawner`] for its agents: subagents and
//! best-of-N instances run through the same controller.
//!
//! # Example
//!
//! ```ignore
//! let runtime = AgentRuntime::builder()
//!     .provider(provider)
//!     .templates(templates)
//!     .build();
//! let run = runtime
//!     .run(RunOptions::builder().agent_type("base").prompt("Fix the tests").build())
//!     .await;
//! let next = runtime
//!     .run(
//!         RunOptions::builder()
//!             .agent_type("base")
//!             .prompt("Now update the docs")
//!             .previous_run(run)
//!             .build(),
//!     )
//!     .await;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bon::{bon, Builder};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::state::{AgentIdentity, AgentOutput, AgentState, RunState, SessionState};
use super::template::AgentTemplates;
use crate::agent_loop::dispatch::CostCallback;
use crate::agent_loop::events::{emit, AgentEvent, AgentEventSink};
use crate::agent_loop::runner::{AgentLoop, LoopEnv};
use crate::agent_loop::types::{RetryInfo, RunStatus};
use crate::config::WeftConfig;
use crate::error::{ErrorCode, WeftError};
use crate::fanout::{SpawnRequest, SpawnedRun, Spawner};
use crate::provider::ModelProvider;
use crate::tools::builtin::register_builtins;
use crate::tools::registry::ToolRegistry;
use crate::tools::resource::{MemoryResourceStore, ResourceStore};
use crate::types::ModelMessage;
use crate::util::retry::RetryPolicy;

/// A run started with [`AgentRuntime::start`].
#[derive(Debug)]
pub struct RunHandle {
    status: watch::Receiver<RunStatus>,
    task: JoinHandle<RunState>,
}

impl RunHandle {
    /// Status of this run only.
    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<RunStatus> {
        self.status.clone()
    }

    /// Wait for the run to finish.
    pub async fn join(self) -> Result<RunState, WeftError> {
        self.task
            .await
            .map_err(|e| WeftError::InvalidState(format!("run task failed: {e}")))
    }
}

/// Callback invoked with retry details.
pub type RetryCallback = Arc<dyn Fn(&RetryInfo) + Send + Sync>;

/// Options for one run.
#[derive(Clone, Builder)]
pub struct RunOptions {
    #[builder(into)]
    pub agent_type: String,
    #[builder(into)]
    pub prompt: String,
    /// Structured parameters shown to the agent with its prompt.
    pub params: Option<serde_json::Value>,
    /// Continue a persisted conversation instead of starting fresh.
    pub previous_run: Option<RunState>,
    /// Opaque project context carried in the session state. Defaults to the
    /// previous run's context when continuing.
    pub file_context: Option<serde_json::Value>,
    /// Shared across every attempt; a fresh token is used when absent.
    pub cancel: Option<CancellationToken>,
    /// Called before each backoff sleep.
    pub on_retry: Option<RetryCallback>,
    /// Called once when the run ends in a failure that will not be retried.
    pub on_retries_exhausted: Option<RetryCallback>,
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("agent_type", &self.agent_type)
            .field("prompt", &self.prompt)
            .field("params", &self.params)
            .field("continuation", &self.previous_run.is_some())
            .finish()
    }
}

struct RuntimeInner {
    config: WeftConfig,
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    templates: AgentTemplates,
    store: Arc<dyn ResourceStore>,
    events: Option<AgentEventSink>,
    cost_callback: Option<CostCallback>,
    status_tx: watch::Sender<RunStatus>,
}

/// Runs agents. Cheap to clone; clones share collaborators and status.
#[derive(Clone)]
pub struct AgentRuntime {
    inner: Arc<RuntimeInner>,
}

#[bon]
impl AgentRuntime {
    /// Create a runtime.
    ///
    /// Without an explicit `registry`, a registry with every built-in handler
    /// is created over `store`. An explicit registry is used as given.
    #[builder]
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        templates: AgentTemplates,
        #[builder(default)] config: WeftConfig,
        store: Option<Arc<dyn ResourceStore>>,
        registry: Option<ToolRegistry>,
        events: Option<AgentEventSink>,
        cost_callback: Option<CostCallback>,
    ) -> Self {
        let store = store.unwrap_or_else(|| Arc::new(MemoryResourceStore::new()));
        let registry = registry.unwrap_or_else(|| {
            let mut registry = ToolRegistry::new();
            register_builtins(&mut registry, Arc::clone(&store), &config);
            registry
        });
        let (status_tx, _) = watch::channel(RunStatus::Idle);
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                provider,
                registry: Arc::new(registry),
                templates,
                store,
                events,
                cost_callback,
                status_tx,
            }),
        }
    }
}

impl AgentRuntime {
    pub fn config(&self) -> &WeftConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.inner.store
    }

    /// Last status written by any top-level run on this runtime or its
    /// clones. Concurrent runs overwrite each other here; use
    /// [`AgentRuntime::start`] to track one run.
    pub fn status(&self) -> RunStatus {
        *self.inner.status_tx.borrow()
    }

    /// Subscribe to top-level run status changes.
    pub fn watch_status(&self) -> watch::Receiver<RunStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Run an agent to completion. Never fails: failures are reported as an
    /// [`AgentOutput::Error`] in the returned state.
    pub async fn run(&self, options: RunOptions) -> RunState {
        self.run_tracked(options, None).await
    }

    /// Run an agent on a background task with its own status channel.
    pub fn start(&self, options: RunOptions) -> RunHandle {
        let (status_tx, status) = watch::channel(RunStatus::Running);
        let runtime = self.clone();
        let task =
            tokio::spawn(async move { runtime.run_tracked(options, Some(status_tx)).await });
        RunHandle { status, task }
    }

    async fn run_tracked(
        &self,
        options: RunOptions,
        own_status: Option<watch::Sender<RunStatus>>,
    ) -> RunState {
        self.inner.status_tx.send_replace(RunStatus::Running);
        let (run, status) = self.run_attempts(options, None).await;
        self.inner.status_tx.send_replace(status);
        if let Some(own_status) = own_status {
            own_status.send_replace(status);
        }
        run
    }

    async fn run_attempts(
        &self,
        options: RunOptions,
        parent: Option<AgentIdentity>,
    ) -> (RunState, RunStatus) {
        let RunOptions {
            agent_type,
            prompt,
            params,
            previous_run,
            file_context,
            cancel,
            on_retry,
            on_retries_exhausted,
        } = options;

        let (mut initial, previous_context) = match previous_run {
            Some(previous) => {
                let SessionState {
                    file_context,
                    main_agent_state,
                } = previous.session_state;
                (main_agent_state, file_context)
            }
            None => {
                let identity = match &parent {
                    Some(parent) => parent.child(&agent_type),
                    None => AgentIdentity::root(&agent_type),
                };
                (AgentState::new(identity, 0), serde_json::Value::Null)
            }
        };
        let file_context = file_context.unwrap_or(previous_context);

        let template = match self.inner.templates.get(&agent_type) {
            Ok(template) => template,
            Err(err) => {
                return (
                    failed_run(initial, file_context, &err),
                    RunStatus::FailedTerminal,
                )
            }
        };
        initial.steps_remaining = template
            .max_steps
            .unwrap_or(self.inner.config.max_agent_steps);
        initial.output = None;
        initial.messages.push(ModelMessage::user(user_prompt(&prompt, params.as_ref())));

        let cancel = cancel.unwrap_or_default();
        let policy = self.inner.config.retry.policy();
        let run_id = initial.identity.run_id;
        let mut attempt = 0u32;

        loop {
            debug!(run_id = %run_id, agent_type = %agent_type, attempt, "run attempt");
            let agent = AgentLoop::new(
                self.loop_env(),
                Arc::clone(&template),
                initial.clone(),
                cancel.child_token(),
            );
            let err = match agent.run().await {
                Ok((state, output)) => {
                    let run = RunState {
                        session_state: SessionState {
                            file_context,
                            main_agent_state: state,
                        },
                        output,
                    };
                    return (run, RunStatus::Succeeded);
                }
                Err(err) => err,
            };

            if cancel.is_cancelled() || matches!(err, WeftError::Cancelled) {
                debug!(run_id = %run_id, "run cancelled");
                return (
                    failed_run(initial, file_context, &WeftError::Cancelled),
                    RunStatus::Cancelled,
                );
            }

            let delay = policy.delay_for_attempt(attempt);
            let info = RetryInfo {
                attempt,
                max_retries: policy.max_retries,
                delay_ms: delay.as_millis() as u64,
                error_code: err.code(),
                message: err.public_message(),
            };
            let retryable = err.is_retryable();
            if !retryable || attempt >= policy.max_retries {
                warn!(
                    run_id = %run_id,
                    attempt,
                    error_code = %info.error_code,
                    error = %info.message,
                    "run failed"
                );
                if let Some(callback) = &on_retries_exhausted {
                    callback(&info);
                }
                let status = if retryable {
                    RunStatus::FailedRetryable
                } else {
                    RunStatus::FailedTerminal
                };
                return (failed_run(initial, file_context, &err), status);
            }

            warn!(
                run_id = %run_id,
                attempt = attempt + 1,
                max_retries = policy.max_retries,
                delay_ms = info.delay_ms,
                error_code = %info.error_code,
                "retrying run"
            );
            if let Some(callback) = &on_retry {
                callback(&info);
            }
            emit(
                &self.inner.events,
                AgentEvent::Retry {
                    run_id,
                    attempt: attempt + 1,
                    delay_ms: info.delay_ms,
                    message: info.message.clone(),
                },
            );
            if RetryPolicy::sleep_or_cancel(delay, &cancel).await.is_err() {
                debug!(run_id = %run_id, "run cancelled during backoff");
                return (
                    failed_run(initial, file_context, &WeftError::Cancelled),
                    RunStatus::Cancelled,
                );
            }
            attempt += 1;
        }
    }

    fn loop_env(&self) -> LoopEnv {
        LoopEnv {
            provider: Arc::clone(&self.inner.provider),
            registry: Arc::clone(&self.inner.registry),
            store: Arc::clone(&self.inner.store),
            spawner: Some(Arc::new(self.clone())),
            events: self.inner.events.clone(),
            cost_callback: self.inner.cost_callback.clone(),
            max_tag_len: self.inner.config.extractor.max_tag_len,
        }
    }
}

#[async_trait]
impl Spawner for AgentRuntime {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedRun, WeftError> {
        self.inner.templates.get(&request.agent_type)?;
        let options = RunOptions {
            agent_type: request.agent_type.clone(),
            prompt: request.prompt,
            params: request.params,
            previous_run: None,
            file_context: None,
            cancel: Some(request.cancel),
            on_retry: None,
            on_retries_exhausted: None,
        };
        let (run_state, _) = self.run_attempts(options, request.parent).await;
        Ok(SpawnedRun {
            agent_type: request.agent_type,
            run_state,
        })
    }
}

fn user_prompt(prompt: &str, params: Option<&serde_json::Value>) -> String {
    match params {
        Some(params) => format!("{prompt}\n\nParameters:\n{params}"),
        None => prompt.to_string(),
    }
}

/// The starting state with an error output. Failed attempts leave no
/// partial progress behind, so a failed run can be continued as is.
fn failed_run(state: AgentState, file_context: serde_json::Value, err: &WeftError) -> RunState {
    RunState {
        session_state: SessionState {
            file_context,
            main_agent_state: state,
        },
        output: AgentOutput::from_error(err),
    }
}

/// Error code of a finished run, if it failed.
pub fn run_error_code(run: &RunState) -> Option<ErrorCode> {
    match &run.output {
        AgentOutput::Error { error_code, .. } => Some(error_code.unwrap_or(ErrorCode::Unknown)),
        _ => None,
    }
}
