//! Built-in tool handlers.
//!
//! File tools go through the runtime's [`ResourceStore`]; `write_file` and
//! `str_replace` are keyed by path and `read_files` takes a turn on every
//! path it reads, so reads and writes land in the order the calls were
//! issued even though the handlers run concurrently.
//! Subgoal, output and end-of-turn tools only return state deltas.
//!
//! `list_directory` and `run_terminal_command` have definitions but no
//! handler here; embedders that want them register their own.

use std::ops::RangeInclusive;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::arguments::ToolArguments;
use super::registry::{ToolName, ToolRegistry};
use super::resource::ResourceStore;
use super::tool::{ToolContext, ToolHandler, ToolOutput};
use crate::agent::state::{StateDelta, Subgoal, SubgoalStatus, SubgoalUpdate};
use crate::config::WeftConfig;
use crate::error::WeftError;
use crate::fanout::{best_of_n, AgentSelector, SpawnRequest};

/// Agent type used to judge best-of-N results when the call names none.
pub const DEFAULT_SELECTOR_AGENT: &str = "best_of_n_selector";

/// Register every built-in handler.
pub fn register_builtins(
    registry: &mut ToolRegistry,
    store: Arc<dyn ResourceStore>,
    config: &WeftConfig,
) {
    registry.register_handler(
        ToolName::ReadFiles,
        Arc::new(ReadFilesTool {
            store: Arc::clone(&store),
        }),
    );
    registry.register_handler(ToolName::WriteFile, Arc::new(WriteFileTool));
    registry.register_handler(ToolName::StrReplace, Arc::new(StrReplaceTool));
    registry.register_handler(ToolName::AddSubgoal, Arc::new(AddSubgoalTool));
    registry.register_handler(ToolName::UpdateSubgoal, Arc::new(UpdateSubgoalTool));
    registry.register_handler(ToolName::SetOutput, Arc::new(SetOutputTool));
    registry.register_handler(ToolName::EndTurn, Arc::new(EndTurnTool));
    registry.register_handler(ToolName::SpawnAgents, Arc::new(SpawnAgentsTool));
    registry.register_handler(
        ToolName::SpawnBestOfN,
        Arc::new(BestOfNTool {
            range: config.best_of_n.range(),
            default_selector: DEFAULT_SELECTOR_AGENT.to_string(),
        }),
    );
}

/// `read_files`: map of path to content, `null` for missing files.
///
/// Paths the dispatcher ordered are read through their slot; anything else
/// goes straight to the store.
pub struct ReadFilesTool {
    store: Arc<dyn ResourceStore>,
}

impl ReadFilesTool {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ToolHandler for ReadFilesTool {
    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, WeftError> {
        let mut files = serde_json::Map::new();
        for path in args.get_array("paths")? {
            let path = path.as_str().ok_or_else(|| {
                WeftError::InvalidArgument("paths must contain strings".into())
            })?;
            let content = match ctx.read_slot(path) {
                Some(slot) => slot.current().await?,
                None => self.store.read(path).await?,
            };
            files.insert(path.to_string(), content.map_or(Value::Null, Value::String));
        }
        Ok(ToolOutput::new(Value::Object(files)))
    }
}

/// `write_file`: replace a file's content.
pub struct WriteFileTool;

#[async_trait]
impl ToolHandler for WriteFileTool {
    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, WeftError> {
        let content = args.get_str("content")?;
        let slot = ctx.resource()?;
        slot.commit(content).await?;
        Ok(ToolOutput::new(json!({
            "path": slot.key(),
            "bytes": content.len(),
        })))
    }
}

/// `str_replace`: replace the first (or every) occurrence of `old`.
pub struct StrReplaceTool;

#[async_trait]
impl ToolHandler for StrReplaceTool {
    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, WeftError> {
        let old = args.get_str("old")?;
        let new = args.get_str("new")?;
        let all = args.get_bool_or_false("all");
        if old.is_empty() {
            return Err(WeftError::InvalidArgument("'old' must not be empty".into()));
        }

        let slot = ctx.resource()?;
        let current = slot
            .current()
            .await?
            .ok_or_else(|| WeftError::tool(&ctx.tool_name, format!("{} does not exist", slot.key())))?;
        let count = current.matches(old).count();
        if count == 0 {
            return Err(WeftError::tool(
                &ctx.tool_name,
                format!("'{old}' not found in {}", slot.key()),
            ));
        }
        let (updated, replaced) = if all {
            (current.replace(old, new), count)
        } else {
            (current.replacen(old, new, 1), 1)
        };
        slot.commit(&updated).await?;
        Ok(ToolOutput::new(json!({
            "path": slot.key(),
            "replacements": replaced,
        })))
    }
}

#[derive(Debug, Deserialize)]
struct AddSubgoalInput {
    id: String,
    objective: String,
    #[serde(default)]
    status: SubgoalStatus,
    #[serde(default)]
    plan: Option<String>,
}

pub struct AddSubgoalTool;

#[async_trait]
impl ToolHandler for AddSubgoalTool {
    async fn execute(
        &self,
        args: &ToolArguments,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, WeftError> {
        let input: AddSubgoalInput = args.deserialize()?;
        let content = json!({ "message": format!("Subgoal {} added", input.id) });
        Ok(ToolOutput::new(content).with_delta(StateDelta {
            subgoals: vec![SubgoalUpdate::Add {
                id: input.id,
                subgoal: Subgoal {
                    objective: input.objective,
                    status: input.status,
                    plan: input.plan,
                    logs: Vec::new(),
                },
            }],
            ..StateDelta::default()
        }))
    }
}

#[derive(Debug, Deserialize)]
struct UpdateSubgoalInput {
    id: String,
    #[serde(default)]
    status: Option<SubgoalStatus>,
    #[serde(default)]
    plan: Option<String>,
    #[serde(default)]
    log: Option<String>,
}

pub struct UpdateSubgoalTool;

#[async_trait]
impl ToolHandler for UpdateSubgoalTool {
    async fn execute(
        &self,
        args: &ToolArguments,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, WeftError> {
        let input: UpdateSubgoalInput = args.deserialize()?;
        let content = json!({ "message": format!("Subgoal {} updated", input.id) });
        Ok(ToolOutput::new(content).with_delta(StateDelta {
            subgoals: vec![SubgoalUpdate::Update {
                id: input.id,
                status: input.status,
                plan: input.plan,
                log: input.log,
            }],
            ..StateDelta::default()
        }))
    }
}

/// `set_output`: the whole input becomes the agent's structured output.
pub struct SetOutputTool;

#[async_trait]
impl ToolHandler for SetOutputTool {
    async fn execute(
        &self,
        args: &ToolArguments,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, WeftError> {
        Ok(ToolOutput::new(json!({ "message": "Output set" })).with_delta(StateDelta {
            output: Some(args.raw().clone()),
            ..StateDelta::default()
        }))
    }
}

pub struct EndTurnTool;

#[async_trait]
impl ToolHandler for EndTurnTool {
    async fn execute(
        &self,
        _args: &ToolArguments,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, WeftError> {
        Ok(ToolOutput::new(json!({ "message": "Turn ended" })).with_delta(StateDelta {
            end_turn: true,
            ..StateDelta::default()
        }))
    }
}

#[derive(Debug, Deserialize)]
struct SpawnAgentsInput {
    agents: Vec<AgentSpawn>,
}

#[derive(Debug, Deserialize)]
struct AgentSpawn {
    agent_type: String,
    prompt: String,
    #[serde(default)]
    params: Option<Value>,
}

fn ensure_spawnable(ctx: &ToolContext, agent_type: &str) -> Result<(), WeftError> {
    if ctx.spawnable_agents.iter().any(|a| a == agent_type) {
        Ok(())
    } else {
        Err(WeftError::tool(
            &ctx.tool_name,
            format!(
                "agent '{}' may not spawn '{agent_type}'",
                ctx.agent.agent_type
            ),
        ))
    }
}

/// `spawn_agents`: run subagents concurrently and report each output.
///
/// Finished children are reaped into the parent's `subagents` and their
/// credits are added to the parent's total. The cost callback already saw
/// each child cost as it happened, so nothing is reported again.
pub struct SpawnAgentsTool;

#[async_trait]
impl ToolHandler for SpawnAgentsTool {
    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, WeftError> {
        let input: SpawnAgentsInput = args.deserialize()?;
        let spawner = ctx.spawner()?;

        let runs = input.agents.into_iter().map(|agent| async move {
            ensure_spawnable(ctx, &agent.agent_type)?;
            let mut request = SpawnRequest::new(&agent.agent_type, agent.prompt)
                .with_parent(ctx.agent.clone())
                .with_cancel(ctx.cancel.child_token());
            if let Some(params) = agent.params {
                request = request.with_params(params);
            }
            spawner.spawn(request).await.map(|run| (agent.agent_type, run))
        });
        let finished = futures::future::join_all(runs).await;

        let mut reports = Vec::with_capacity(finished.len());
        let mut children = Vec::new();
        let mut credits = 0.0;
        for run in finished {
            match run {
                Ok((agent_type, run)) => {
                    credits += run.agent_state().credits_used;
                    reports.push(json!({
                        "agent_type": agent_type,
                        "output": run.output(),
                    }));
                    children.push(run.run_state.session_state.main_agent_state);
                }
                Err(err) => reports.push(json!({ "error": err.public_message() })),
            }
        }

        // Children reported their own costs as they ran; only the total moves.
        Ok(ToolOutput::new(Value::Array(reports)).with_delta(StateDelta {
            credits,
            subagents: children,
            ..StateDelta::default()
        }))
    }
}

#[derive(Debug, Deserialize)]
struct BestOfNInput {
    agent_type: String,
    prompt: String,
    n: usize,
    #[serde(default)]
    selector_agent: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

/// `spawn_best_of_n`: fan out identical runs, judge them, and set the
/// winner's output as this agent's output.
pub struct BestOfNTool {
    range: RangeInclusive<usize>,
    default_selector: String,
}

impl BestOfNTool {
    pub fn new(range: RangeInclusive<usize>, default_selector: impl Into<String>) -> Self {
        Self {
            range,
            default_selector: default_selector.into(),
        }
    }
}

#[async_trait]
impl ToolHandler for BestOfNTool {
    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, WeftError> {
        let input: BestOfNInput = args.deserialize()?;
        ensure_spawnable(ctx, &input.agent_type)?;
        let spawner = ctx.spawner()?;

        let selector_agent = input
            .selector_agent
            .unwrap_or_else(|| self.default_selector.clone());
        let selector = AgentSelector::new(Arc::clone(spawner), selector_agent)
            .with_task(input.prompt.clone())
            .with_parent(ctx.agent.clone());
        let mut request =
            SpawnRequest::new(input.agent_type, input.prompt).with_parent(ctx.agent.clone());
        if let Some(params) = input.params {
            request = request.with_params(params);
        }

        let outcome = best_of_n(
            spawner.as_ref(),
            &selector,
            request,
            input.n,
            self.range.clone(),
            ctx.cancel.child_token(),
        )
        .await?;

        let winner = outcome.output.to_value();
        let credits = outcome
            .instances
            .iter()
            .map(|s| s.credits_used)
            .sum::<f64>()
            + selector.credits_used();
        Ok(ToolOutput::new(json!({
            "selected": outcome.label,
            "reason": outcome.rationale,
            "output": winner,
        }))
        .with_delta(StateDelta {
            credits,
            output: Some(winner),
            subagents: outcome.instances,
            ..StateDelta::default()
        }))
    }
}
