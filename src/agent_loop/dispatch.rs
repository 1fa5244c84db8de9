//! Ordered, concurrent tool dispatch.
//!
//! Calls are spawned as soon as they are issued. Calls touching the same
//! resource, whether they mutate or only read it, take turns through the
//! [`ResourceLedger`] under the store's canonical key; everything else runs
//! freely. Results are handed back in issuance order regardless of when each
//! call finished.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{emit, AgentEvent, AgentEventSink};
use super::ledger::{ResourceLedger, Ticket};
use crate::agent::state::{AgentIdentity, StateDelta};
use crate::error::WeftError;
use crate::fanout::Spawner;
use crate::tools::registry::{ToolCall, ToolCallError, ToolRegistry};
use crate::tools::resource::{ResourceSlot, ResourceStore};
use crate::tools::tool::{CostReport, ToolContext, ToolOutput};
use crate::tools::ToolArguments;
use crate::types::ToolResult;

/// Receives every cost a handler reports, as soon as it is known.
pub type CostCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Who issued a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOrigin {
    /// Parsed from model output; subject to the agent's allow-list.
    Model,
    /// Issued by a step program; bypasses the allow-list.
    Scripted,
}

/// Result of one issued call, ready for the transcript.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub result: ToolResult,
    pub delta: StateDelta,
    pub ends_step: bool,
    /// Cost reported synchronously with the result.
    pub cost: f64,
}

impl DispatchOutcome {
    fn error(tool_name: &str, call_id: &str, message: impl Into<String>) -> Self {
        Self {
            result: ToolResult::error(tool_name, call_id, message),
            delta: StateDelta::default(),
            ends_step: false,
            cost: 0.0,
        }
    }
}

/// Per-agent facts every tool context carries.
#[derive(Clone)]
pub struct DispatchContext {
    pub agent: AgentIdentity,
    pub spawnable_agents: Vec<String>,
    pub spawner: Option<Arc<dyn Spawner>>,
}

enum Pending {
    Resolved(DispatchOutcome),
    Running {
        tool_name: String,
        call_id: String,
        ends_step: bool,
        task: JoinHandle<CallCompletion>,
    },
}

enum CallCompletion {
    Skipped,
    Finished(Result<ToolOutput, String>),
}

/// Issues tool calls for one agent run.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    store: Arc<dyn ResourceStore>,
    ledger: ResourceLedger,
    context: DispatchContext,
    cancel: CancellationToken,
    cost_callback: Option<CostCallback>,
    events: Option<AgentEventSink>,
    pending: VecDeque<Pending>,
    deferred_costs: Vec<JoinHandle<f64>>,
    issued: u64,
}

impl ToolDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        store: Arc<dyn ResourceStore>,
        context: DispatchContext,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            store,
            ledger: ResourceLedger::new(),
            context,
            cancel,
            cost_callback: None,
            events: None,
            pending: VecDeque::new(),
            deferred_costs: Vec::new(),
            issued: 0,
        }
    }

    pub fn with_cost_callback(mut self, callback: Option<CostCallback>) -> Self {
        self.cost_callback = callback;
        self
    }

    pub fn with_events(mut self, events: Option<AgentEventSink>) -> Self {
        self.events = events;
        self
    }

    /// The per-key queues, for inspection.
    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Calls issued so far, including rejected ones.
    pub fn issued(&self) -> u64 {
        self.issued
    }

    /// Issue a validated call.
    pub fn submit(&mut self, call: ToolCall, origin: CallOrigin, allow_list: &[String]) {
        self.issued += 1;

        if origin == CallOrigin::Model && !allow_list.iter().any(|name| *name == call.tool_name) {
            debug!(tool = %call.tool_name, agent = %self.context.agent.agent_type, "tool not on allow-list");
            self.pending.push_back(Pending::Resolved(DispatchOutcome::error(
                &call.tool_name,
                &call.call_id,
                format!(
                    "Tool '{}' is not available to agent '{}'",
                    call.tool_name, self.context.agent.agent_type
                ),
            )));
            return;
        }

        if self.cancel.is_cancelled() {
            debug!(tool = %call.tool_name, call_id = %call.call_id, "run cancelled, call skipped");
            return;
        }

        let Some(handler) = self.registry.handler_for(&call) else {
            self.pending.push_back(Pending::Resolved(DispatchOutcome::error(
                &call.tool_name,
                &call.call_id,
                format!("No handler registered for tool '{}'", call.tool_name),
            )));
            return;
        };

        let mut ctx = ToolContext::new(&call.tool_name, &call.call_id, self.context.agent.clone())
            .with_cancel(self.cancel.child_token());
        if let Some(spawner) = &self.context.spawner {
            ctx = ctx.with_spawner(Arc::clone(spawner), self.context.spawnable_agents.clone());
        }
        // One ticket per distinct resource, shared by every spelling of it.
        let mut slots: HashMap<String, ResourceSlot> = HashMap::new();
        let mut tickets = Vec::new();
        if let Some(key) = self.registry.resource_key(&call) {
            let slot = self.slot_for(&key, &mut slots, &mut tickets);
            ctx = ctx.with_resource(slot);
        }
        for key in self.registry.read_keys(&call) {
            let slot = self.slot_for(&key, &mut slots, &mut tickets);
            ctx = ctx.with_read(key, slot);
        }

        emit(
            &self.events,
            AgentEvent::ToolExecutionStart {
                run_id: self.context.agent.run_id,
                tool_call_id: call.call_id.clone(),
                tool_name: call.tool_name.clone(),
                args: call.input.clone(),
            },
        );

        let cancel = self.cancel.clone();
        let args = ToolArguments::new(call.input);
        let tool_name = call.tool_name.clone();
        let task = tokio::spawn(async move {
            if cancel.is_cancelled() {
                release_all(tickets, &tool_name).await;
                return CallCompletion::Skipped;
            }
            let inner = tokio::spawn(async move { handler.execute(&args, &ctx).await });
            let joined = inner.await;
            release_all(tickets, &tool_name).await;
            match joined {
                Ok(Ok(output)) => CallCompletion::Finished(Ok(output)),
                Ok(Err(err)) => {
                    warn!(tool = %tool_name, error = %err, "tool handler failed");
                    CallCompletion::Finished(Err(err.to_string()))
                }
                Err(join) => {
                    warn!(tool = %tool_name, error = %join, "tool handler panicked");
                    CallCompletion::Finished(Err(format!("Tool '{tool_name}' failed unexpectedly")))
                }
            }
        });

        self.pending.push_back(Pending::Running {
            tool_name: call.tool_name,
            call_id: call.call_id,
            ends_step: call.ends_step,
            task,
        });
    }

    /// Record a call that failed validation, in issuance order.
    pub fn submit_error(&mut self, error: ToolCallError) {
        self.issued += 1;
        self.pending.push_back(Pending::Resolved(DispatchOutcome {
            result: error.to_result(),
            delta: StateDelta::default(),
            ends_step: false,
            cost: 0.0,
        }));
    }

    /// Await every issued call in issuance order.
    ///
    /// When the run was cancelled, in-flight calls still finish but their
    /// results are discarded and `Cancelled` is returned.
    pub async fn drain(&mut self) -> Result<Vec<DispatchOutcome>, WeftError> {
        let mut outcomes = Vec::with_capacity(self.pending.len());
        while let Some(pending) = self.pending.pop_front() {
            match pending {
                Pending::Resolved(outcome) => outcomes.push(outcome),
                Pending::Running {
                    tool_name,
                    call_id,
                    ends_step,
                    task,
                } => match task.await {
                    Ok(CallCompletion::Skipped) => {}
                    Ok(CallCompletion::Finished(Ok(output))) => {
                        let cost = self.report_cost(output.cost);
                        outcomes.push(DispatchOutcome {
                            result: ToolResult::ok(&tool_name, &call_id, output.content),
                            delta: output.delta,
                            ends_step,
                            cost,
                        });
                    }
                    Ok(CallCompletion::Finished(Err(message))) => {
                        outcomes.push(DispatchOutcome::error(&tool_name, &call_id, message));
                    }
                    Err(join) => {
                        warn!(tool = %tool_name, error = %join, "tool task failed");
                        outcomes.push(DispatchOutcome::error(
                            &tool_name,
                            &call_id,
                            format!("Tool '{tool_name}' failed unexpectedly"),
                        ));
                    }
                },
            }
        }

        if self.cancel.is_cancelled() {
            return Err(WeftError::Cancelled);
        }
        for outcome in &outcomes {
            emit(
                &self.events,
                AgentEvent::ToolExecutionEnd {
                    run_id: self.context.agent.run_id,
                    result: outcome.result.clone(),
                },
            );
        }
        Ok(outcomes)
    }

    /// Await every deferred cost reported so far and return their sum.
    pub async fn settle_costs(&mut self) -> f64 {
        let handles = std::mem::take(&mut self.deferred_costs);
        futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| match joined {
                Ok(cost) => cost,
                Err(err) => {
                    warn!(error = %err, "deferred cost failed");
                    0.0
                }
            })
            .sum()
    }

    /// Slot for `key` in this call, taking a ticket on first use of the
    /// resource. Keys are ordered under the store's canonical spelling.
    fn slot_for(
        &self,
        key: &str,
        slots: &mut HashMap<String, ResourceSlot>,
        tickets: &mut Vec<Ticket>,
    ) -> ResourceSlot {
        // Keys the store rejects keep their spelling; the handler's access fails anyway.
        let canonical = self
            .store
            .normalize_key(key)
            .unwrap_or_else(|_| key.to_string());
        slots
            .entry(canonical.clone())
            .or_insert_with(|| {
                let ticket = self.ledger.issue(&canonical);
                let slot = ResourceSlot::new(canonical, ticket.waiter(), Arc::clone(&self.store));
                tickets.push(ticket);
                slot
            })
            .clone()
    }

    fn report_cost(&mut self, cost: CostReport) -> f64 {
        match cost {
            CostReport::None => 0.0,
            CostReport::Immediate(cost) => {
                if let Some(callback) = &self.cost_callback {
                    callback(cost);
                }
                cost
            }
            CostReport::Deferred(pending) => {
                let callback = self.cost_callback.clone();
                self.deferred_costs.push(tokio::spawn(async move {
                    let cost = pending.await;
                    if let Some(callback) = callback {
                        callback(cost);
                    }
                    cost
                }));
                0.0
            }
        }
    }
}

async fn release_all(tickets: Vec<Ticket>, tool_name: &str) {
    let released = futures::future::join_all(tickets.into_iter().map(Ticket::release)).await;
    for err in released.into_iter().filter_map(Result::err) {
        warn!(tool = %tool_name, error = %err, "failed to release resource turn");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::state::AgentIdentity;
    use crate::tools::registry::{CustomToolDefinition, RawToolCall, ToolName, ValidateOptions};
    use crate::tools::resource::MemoryResourceStore;
    use crate::tools::{AgentTool, AgentToolParameters};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn dispatcher(registry: ToolRegistry) -> ToolDispatcher {
        ToolDispatcher::new(
            Arc::new(registry),
            Arc::new(MemoryResourceStore::new()),
            DispatchContext {
                agent: AgentIdentity::root("base"),
                spawnable_agents: Vec::new(),
                spawner: None,
            },
            CancellationToken::new(),
        )
    }

    fn call(registry: &ToolRegistry, name: &str, input: serde_json::Value) -> ToolCall {
        registry
            .resolve(&RawToolCall::new(name, input), ValidateOptions::default())
            .unwrap()
    }

    fn sleeper(name: &str) -> AgentTool {
        AgentTool::new(
            name,
            "sleep then echo",
            AgentToolParameters::object().integer("ms", "delay", true).build(),
            |args, _ctx| async move {
                let ms = args.get_i64("ms")? as u64;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ToolOutput::new(json!(ms)))
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn results_follow_issuance_not_completion_order() {
        let mut registry = ToolRegistry::new();
        registry.register_tool(sleeper("nap")).unwrap();
        let calls: Vec<_> = [30, 10, 20]
            .into_iter()
            .map(|ms| call(&registry, "nap", json!({ "ms": ms })))
            .collect();
        let ids: Vec<_> = calls.iter().map(|c| c.call_id.clone()).collect();
        let mut dispatcher = dispatcher(registry);
        let allow = vec!["nap".to_string()];

        for c in calls {
            dispatcher.submit(c, CallOrigin::Model, &allow);
        }
        let outcomes = dispatcher.drain().await.unwrap();

        let got: Vec<_> = outcomes.iter().map(|o| o.result.call_id.clone()).collect();
        assert_eq!(got, ids);
        assert_eq!(outcomes[0].result.content, json!(30));
    }

    #[tokio::test]
    async fn disallowed_tools_become_error_results_unless_scripted() {
        let mut registry = ToolRegistry::new();
        registry.register_tool(sleeper("nap")).unwrap();
        let model_call = call(&registry, "nap", json!({ "ms": 0 }));
        let scripted_call = call(&registry, "nap", json!({ "ms": 0 }));
        let mut dispatcher = dispatcher(registry);

        dispatcher.submit(model_call, CallOrigin::Model, &[]);
        dispatcher.submit(scripted_call, CallOrigin::Scripted, &[]);
        let outcomes = dispatcher.drain().await.unwrap();

        assert!(outcomes[0].result.is_error);
        assert!(outcomes[0].result.content["error"]
            .as_str()
            .unwrap()
            .contains("not available"));
        assert!(!outcomes[1].result.is_error);
    }

    #[tokio::test]
    async fn handler_errors_and_panics_do_not_abort_siblings() {
        let mut registry = ToolRegistry::new();
        registry
            .register_tool(AgentTool::new(
                "boom",
                "panics",
                AgentToolParameters::empty(),
                |_args, _ctx| async move {
                    if true {
                        panic!("handler bug");
                    }
                    Ok(ToolOutput::default())
                },
            ))
            .unwrap();
        registry
            .register_tool(AgentTool::new(
                "fail",
                "fails",
                AgentToolParameters::empty(),
                |_args, _ctx| async move { Err(WeftError::tool("fail", "disk full")) },
            ))
            .unwrap();
        registry.register_tool(sleeper("nap")).unwrap();
        let calls = vec![
            call(&registry, "boom", json!({})),
            call(&registry, "fail", json!({})),
            call(&registry, "nap", json!({ "ms": 1 })),
        ];
        let mut dispatcher = dispatcher(registry);
        let allow: Vec<String> = ["boom", "fail", "nap"].map(String::from).to_vec();

        for c in calls {
            dispatcher.submit(c, CallOrigin::Model, &allow);
        }
        let outcomes = dispatcher.drain().await.unwrap();

        assert!(outcomes[0].result.is_error);
        assert!(outcomes[1].result.is_error);
        assert!(outcomes[1].result.content["error"]
            .as_str()
            .unwrap()
            .contains("disk full"));
        assert!(!outcomes[2].result.is_error);
    }

    #[tokio::test]
    async fn immediate_and_deferred_costs_reach_callback() {
        let mut registry = ToolRegistry::new();
        registry
            .register_tool(AgentTool::new(
                "priced",
                "reports cost",
                AgentToolParameters::empty(),
                |_args, _ctx| async move {
                    Ok(ToolOutput::new(json!("ok"))
                        .with_deferred_cost(async {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            2.0
                        }))
                },
            ))
            .unwrap();
        registry
            .register_tool(AgentTool::new(
                "cheap",
                "reports cost",
                AgentToolParameters::empty(),
                |_args, _ctx| async move { Ok(ToolOutput::new(json!("ok")).with_cost(0.5)) },
            ))
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let calls = vec![
            call(&registry, "priced", json!({})),
            call(&registry, "cheap", json!({})),
        ];
        let mut dispatcher = dispatcher(registry)
            .with_cost_callback(Some(Arc::new(move |cost| sink.lock().unwrap().push(cost))));
        let allow: Vec<String> = ["priced", "cheap"].map(String::from).to_vec();

        for c in calls {
            dispatcher.submit(c, CallOrigin::Model, &allow);
        }
        let outcomes = dispatcher.drain().await.unwrap();
        assert_eq!(outcomes[0].cost, 0.0);
        assert_eq!(outcomes[1].cost, 0.5);

        assert_eq!(dispatcher.settle_costs().await, 2.0);
        let mut seen = seen.lock().unwrap().clone();
        seen.sort_by(f64::total_cmp);
        assert_eq!(seen, vec![0.5, 2.0]);
    }

    #[tokio::test]
    async fn cancelled_dispatch_skips_new_calls_and_discards_results() {
        let mut registry = ToolRegistry::new();
        registry.register_handler(
            ToolName::EndTurn,
            Arc::new(AgentTool::new(
                "end_turn",
                "",
                AgentToolParameters::empty(),
                |_args, _ctx| async move { Ok(ToolOutput::default()) },
            )),
        );
        let first = call(&registry, "end_turn", json!({}));
        let second = call(&registry, "end_turn", json!({}));
        let cancel = CancellationToken::new();
        let mut dispatcher = ToolDispatcher::new(
            Arc::new(registry),
            Arc::new(MemoryResourceStore::new()),
            DispatchContext {
                agent: AgentIdentity::root("base"),
                spawnable_agents: Vec::new(),
                spawner: None,
            },
            cancel.clone(),
        );
        let allow = vec!["end_turn".to_string()];

        dispatcher.submit(first, CallOrigin::Model, &allow);
        cancel.cancel();
        dispatcher.submit(second, CallOrigin::Model, &allow);

        assert_eq!(dispatcher.issued(), 2);
        assert!(matches!(dispatcher.drain().await, Err(WeftError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_write_lands_when_cancelled_but_its_result_is_dropped() {
        let parameters = AgentToolParameters::object()
            .string("path", "file", true)
            .string("content", "text", true)
            .build();
        let mut registry = ToolRegistry::new();
        registry
            .register_custom(
                CustomToolDefinition::new("slow_write", "write later", parameters.clone())
                    .keyed_by("path"),
                Arc::new(AgentTool::new(
                    "slow_write",
                    "write later",
                    parameters,
                    |args, ctx| async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        ctx.resource()?.commit(args.get_str("content")?).await?;
                        Ok(ToolOutput::new(json!("written")))
                    },
                )),
            )
            .unwrap();
        let write = call(&registry, "slow_write", json!({ "path": "/a.txt", "content": "A1" }));
        let store = Arc::new(MemoryResourceStore::new());
        let cancel = CancellationToken::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut dispatcher = ToolDispatcher::new(
            Arc::new(registry),
            store.clone(),
            DispatchContext {
                agent: AgentIdentity::root("base"),
                spawnable_agents: Vec::new(),
                spawner: None,
            },
            cancel.clone(),
        )
        .with_events(Some(Arc::new(move |event: AgentEvent| sink.lock().unwrap().push(event))));

        dispatcher.submit(write, CallOrigin::Scripted, &[]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        assert!(matches!(dispatcher.drain().await, Err(WeftError::Cancelled)));
        assert_eq!(store.get("/a.txt").await.as_deref(), Some("A1"));
        assert!(!events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolExecutionEnd { .. })));
        assert_eq!(dispatcher.ledger().in_flight("/a.txt"), 0);
    }

    #[tokio::test]
    async fn read_calls_take_a_turn_on_each_distinct_path() {
        let mut registry = ToolRegistry::new();
        let store = Arc::new(MemoryResourceStore::new());
        crate::tools::register_builtins(
            &mut registry,
            store.clone(),
            &crate::config::WeftConfig::default(),
        );
        let read = call(
            &registry,
            "read_files",
            json!({ "paths": ["/a.txt", "/a.txt", "/b.txt"] }),
        );
        let mut dispatcher = ToolDispatcher::new(
            Arc::new(registry),
            store,
            DispatchContext {
                agent: AgentIdentity::root("base"),
                spawnable_agents: Vec::new(),
                spawner: None,
            },
            CancellationToken::new(),
        );

        dispatcher.submit(read, CallOrigin::Scripted, &[]);
        assert_eq!(dispatcher.ledger().keys(), vec!["/a.txt", "/b.txt"]);
        let outcomes = dispatcher.drain().await.unwrap();

        assert_eq!(outcomes[0].result.content, json!({ "/a.txt": null, "/b.txt": null }));
        assert_eq!(dispatcher.ledger().in_flight("/a.txt"), 0);
    }
}
