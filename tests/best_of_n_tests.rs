//! Best-of-N fan-out: direct protocol tests and a full run through the
//! `spawn_best_of_n` tool.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::ScriptedProvider;
use weft::agent::{
    AgentIdentity, AgentOutput, AgentRuntime, AgentState, AgentTemplate, AgentTemplates,
    OutputMode, RunOptions, RunState, SessionState,
};
use weft::agent_loop::{ScriptedSteps, StepInstruction, StepProgram};
use weft::config::WeftConfig;
use weft::error::WeftError;
use weft::fanout::{
    best_of_n, InstanceOutcome, LabeledResult, Selection, Selector, SpawnRequest, SpawnedRun,
    Spawner,
};
use weft::tools::{
    register_builtins, AgentTool, AgentToolParameters, MemoryResourceStore, ToolOutput,
    ToolRegistry,
};

/// Spawner whose i-th run outputs `{"instance": i}`, or fails for the
/// indices in `failing`.
#[derive(Default)]
struct CountingSpawner {
    next: AtomicUsize,
    failing: HashSet<usize>,
}

#[async_trait]
impl Spawner for CountingSpawner {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedRun, WeftError> {
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        let output = if self.failing.contains(&index) {
            AgentOutput::Error {
                message: format!("instance {index} crashed"),
                error_code: None,
            }
        } else {
            AgentOutput::StructuredOutput {
                value: json!({ "instance": index }),
            }
        };
        Ok(SpawnedRun {
            agent_type: request.agent_type.clone(),
            run_state: RunState {
                session_state: SessionState {
                    file_context: serde_json::Value::Null,
                    main_agent_state: AgentState::new(AgentIdentity::root(request.agent_type), 0),
                },
                output,
            },
        })
    }
}

/// Selector returning a fixed verdict and recording what it saw.
struct FixedSelector {
    verdict: Selection,
    seen: Mutex<Vec<Vec<LabeledResult>>>,
}

impl FixedSelector {
    fn picking(label: &str) -> Self {
        Self {
            verdict: Selection::Winner {
                label: label.into(),
                rationale: Some("cleanest".into()),
            },
            seen: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl Selector for FixedSelector {
    async fn select(
        &self,
        results: &[LabeledResult],
        _cancel: CancellationToken,
    ) -> Result<Selection, WeftError> {
        self.seen.lock().unwrap().push(results.to_vec());
        Ok(self.verdict.clone())
    }
}

fn request() -> SpawnRequest {
    SpawnRequest::new("worker", "implement the feature")
}

#[tokio::test]
async fn winner_output_is_returned_with_labels_in_spawn_order() {
    let spawner = CountingSpawner::default();
    let selector = FixedSelector::picking("C");

    let outcome = best_of_n(&spawner, &selector, request(), 5, 1..=10, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.label, "C");
    assert_eq!(
        outcome.output,
        AgentOutput::StructuredOutput {
            value: json!({ "instance": 2 })
        }
    );
    assert_eq!(outcome.rationale.as_deref(), Some("cleanest"));
    let labels: Vec<_> = outcome.results.iter().map(|r| r.label.as_str()).collect();
    assert_eq!(labels, vec!["A", "B", "C", "D", "E"]);
    assert_eq!(outcome.instances.len(), 5);
}

#[tokio::test]
async fn unknown_label_is_an_error() {
    let spawner = CountingSpawner::default();
    let selector = FixedSelector::picking("Q");

    let err = best_of_n(&spawner, &selector, request(), 3, 1..=10, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, WeftError::Selection(_)));
    assert!(err.to_string().contains("'Q'"), "{err}");
}

#[tokio::test]
async fn failed_instances_are_kept_but_cannot_win() {
    let spawner = CountingSpawner {
        failing: HashSet::from([1]),
        ..CountingSpawner::default()
    };
    let selector = FixedSelector::picking("B");

    let err = best_of_n(&spawner, &selector, request(), 3, 1..=10, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("which failed"), "{err}");
    let seen = selector.seen.lock().unwrap();
    assert!(matches!(
        &seen[0][1].outcome,
        InstanceOutcome::Failed { message, .. } if message == "instance 1 crashed"
    ));
}

#[tokio::test]
async fn all_failed_skips_the_selector() {
    let spawner = CountingSpawner {
        failing: HashSet::from([0, 1]),
        ..CountingSpawner::default()
    };
    let selector = FixedSelector::picking("A");

    let err = best_of_n(&spawner, &selector, request(), 2, 1..=10, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("all 2"), "{err}");
    assert_eq!(selector.calls(), 0);
}

#[tokio::test]
async fn selector_verdict_of_all_failed_is_an_error() {
    let spawner = CountingSpawner::default();
    let selector = FixedSelector {
        verdict: Selection::AllFailed,
        seen: Mutex::new(Vec::new()),
    };

    let err = best_of_n(&spawner, &selector, request(), 2, 1..=10, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, WeftError::Selection(_)));
}

#[tokio::test]
async fn count_outside_the_range_is_rejected_before_spawning() {
    let spawner = CountingSpawner::default();
    let selector = FixedSelector::picking("A");

    for n in [0, 11] {
        let err = best_of_n(&spawner, &selector, request(), n, 1..=10, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::InvalidArgument(_)));
    }
    assert_eq!(spawner.next.load(Ordering::SeqCst), 0);
}

fn structured(id: &str, factory: impl Fn() -> Vec<StepInstruction> + Send + Sync + 'static) -> AgentTemplate {
    AgentTemplate::builder()
        .id(id)
        .output_mode(OutputMode::StructuredOutput)
        .step_program(Arc::new(move || {
            Box::new(ScriptedSteps::new(factory())) as Box<dyn StepProgram>
        }))
        .build()
}

#[tokio::test]
async fn best_of_n_tool_sets_the_parent_output_to_the_winner() {
    let counter = Arc::new(AtomicUsize::new(0));
    let worker_counter = Arc::clone(&counter);
    let templates = AgentTemplates::new()
        .with(
            AgentTemplate::builder()
                .id("lead")
                .output_mode(OutputMode::StructuredOutput)
                .spawnable_agents(vec!["worker".into()])
                .step_program(Arc::new(|| {
                    Box::new(ScriptedSteps::new(vec![StepInstruction::call(
                        "spawn_best_of_n",
                        json!({
                            "agent_type": "worker",
                            "prompt": "write the parser",
                            "n": 5,
                            "selector_agent": "judge",
                        }),
                    )])) as Box<dyn StepProgram>
                }))
                .build(),
        )
        .with(structured("worker", move || {
            let index = worker_counter.fetch_add(1, Ordering::SeqCst);
            vec![StepInstruction::SetOutput(json!({ "draft": index }))]
        }))
        .with(structured("judge", || {
            vec![
                StepInstruction::call("review", json!({})),
                StepInstruction::SetOutput(
                    json!({ "selected": "C", "reason": "fewest allocations" }),
                ),
            ]
        }));
    let store = Arc::new(MemoryResourceStore::new());
    let mut registry = ToolRegistry::new();
    register_builtins(&mut registry, store.clone(), &WeftConfig::default());
    registry
        .register_tool(AgentTool::new(
            "review",
            "Costs two credits",
            AgentToolParameters::empty(),
            |_args, _ctx| async move { Ok(ToolOutput::new(json!("read")).with_cost(2.0)) },
        ))
        .unwrap();
    let runtime = AgentRuntime::builder()
        .provider(Arc::new(ScriptedProvider::default()))
        .templates(templates)
        .store(store)
        .registry(registry)
        .build();

    let run = runtime
        .run(RunOptions::builder().agent_type("lead").prompt("parse").build())
        .await;

    assert_eq!(
        run.output,
        AgentOutput::StructuredOutput {
            value: json!({ "draft": 2 })
        }
    );
    let lead = &run.session_state.main_agent_state;
    assert_eq!(lead.subagents.len(), 5);
    assert!(lead
        .subagents
        .iter()
        .all(|child| child.identity.parent_id == Some(lead.identity.run_id)));
    assert_eq!(counter.load(Ordering::SeqCst), 5);
    // The judge is not reaped, but its spend is charged to the lead.
    assert_eq!(lead.credits_used, 2.0);
}

#[tokio::test]
async fn spawn_agents_rejects_types_outside_the_spawnable_list() {
    let templates = AgentTemplates::new()
        .with(
            AgentTemplate::builder()
                .id("lead")
                .output_mode(OutputMode::StructuredOutput)
                .spawnable_agents(vec!["worker".into()])
                .step_program(Arc::new(|| {
                    Box::new(ScriptedSteps::new(vec![
                        StepInstruction::call(
                            "spawn_agents",
                            json!({ "agents": [
                                { "agent_type": "worker", "prompt": "a" },
                                { "agent_type": "admin", "prompt": "b" },
                            ] }),
                        ),
                        StepInstruction::End,
                    ])) as Box<dyn StepProgram>
                }))
                .build(),
        )
        .with(structured("worker", || {
            vec![StepInstruction::SetOutput(json!({ "done": true }))]
        }))
        .with(structured("admin", || {
            vec![StepInstruction::SetOutput(json!({ "root": true }))]
        }));
    let runtime = AgentRuntime::builder()
        .provider(Arc::new(ScriptedProvider::default()))
        .templates(templates)
        .build();

    let run = runtime
        .run(RunOptions::builder().agent_type("lead").prompt("go").build())
        .await;

    let lead = &run.session_state.main_agent_state;
    assert_eq!(lead.subagents.len(), 1);
    assert_eq!(lead.subagents[0].agent_type(), "worker");
    let results: Vec<_> = lead.messages.iter().flat_map(|m| m.tool_results()).collect();
    let reports = results[0].content.as_array().unwrap();
    assert_eq!(
        reports[0],
        json!({
            "agent_type": "worker",
            "output": { "type": "structured_output", "value": { "done": true } },
        })
    );
    assert!(reports[1]["error"].as_str().unwrap().contains("may not spawn 'admin'"));
}
