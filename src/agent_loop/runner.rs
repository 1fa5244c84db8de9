//! The agent step loop.
//!
//! One [`AgentLoop`] owns one agent's [`AgentState`] for the length of an
//! attempt. Tool handlers never touch the state; their deltas come back
//! through the dispatcher in issuance order and are applied here, serially.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::dispatch::{CallOrigin, CostCallback, DispatchContext, DispatchOutcome, ToolDispatcher};
use super::events::{emit, AgentEvent, AgentEventSink};
use super::steps::{StepInstruction, StepResume};
use crate::agent::state::{AgentOutput, AgentState};
use crate::agent::template::{AgentTemplate, OutputMode};
use crate::error::WeftError;
use crate::fanout::Spawner;
use crate::provider::{ModelProvider, ModelRequest};
use crate::stream_transform::{extract_tool_tags, TagEvent, TagExtractor, TurnEvent};
use crate::tools::registry::{new_call_id, RawToolCall, ToolCallError, ToolRegistry, ValidateOptions};
use crate::tools::resource::ResourceStore;
use crate::types::{ContentPart, ModelMessage, Role, ToolResult};

/// Collaborators shared by every agent loop of a runtime.
#[derive(Clone)]
pub struct LoopEnv {
    pub provider: Arc<dyn ModelProvider>,
    pub registry: Arc<ToolRegistry>,
    pub store: Arc<dyn ResourceStore>,
    pub spawner: Option<Arc<dyn Spawner>>,
    pub events: Option<AgentEventSink>,
    pub cost_callback: Option<CostCallback>,
    pub max_tag_len: usize,
}

/// Drives one agent through its step program or model steps.
pub struct AgentLoop {
    env: LoopEnv,
    template: Arc<AgentTemplate>,
    state: AgentState,
    dispatcher: ToolDispatcher,
    cancel: CancellationToken,
    step: u32,
    turn_ended: bool,
}

impl AgentLoop {
    pub fn new(
        env: LoopEnv,
        template: Arc<AgentTemplate>,
        state: AgentState,
        cancel: CancellationToken,
    ) -> Self {
        let dispatcher = ToolDispatcher::new(
            Arc::clone(&env.registry),
            Arc::clone(&env.store),
            DispatchContext {
                agent: state.identity.clone(),
                spawnable_agents: template.spawnable_agents.clone(),
                spawner: env.spawner.clone(),
            },
            cancel.clone(),
        )
        .with_cost_callback(env.cost_callback.clone())
        .with_events(env.events.clone());
        Self {
            env,
            template,
            state,
            dispatcher,
            cancel,
            step: 0,
            turn_ended: false,
        }
    }

    /// Run to completion.
    ///
    /// Returns the final state and output, or the error that ended the
    /// attempt (provider failure or cancellation).
    pub async fn run(mut self) -> Result<(AgentState, AgentOutput), WeftError> {
        let run_id = self.state.identity.run_id;
        debug!(run_id = %run_id, agent_type = %self.template.id, "agent run started");
        emit(
            &self.env.events,
            AgentEvent::AgentStart {
                run_id,
                agent_type: self.template.id.clone(),
            },
        );

        let result = self.interpret().await;
        let result = match result {
            Ok(()) => {
                let deferred = self.dispatcher.settle_costs().await;
                self.state.credits_used += deferred;
                let output = self.final_output();
                Ok((self.state, output))
            }
            Err(err) => Err(err),
        };

        debug!(run_id = %run_id, ok = result.is_ok(), "agent run finished");
        emit(
            &self.env.events,
            AgentEvent::AgentEnd {
                run_id,
                is_error: result.as_ref().map_or(true, |(_, out)| out.is_error()),
            },
        );
        result
    }

    async fn interpret(&mut self) -> Result<(), WeftError> {
        let mut program = self.template.step_program.as_ref().map(|factory| factory());
        let mut last_result: Option<ToolResult> = None;

        loop {
            self.check_cancelled()?;
            if self.state.output.is_some() {
                return Ok(());
            }
            let instruction = match program.as_mut() {
                Some(program) => program.next(&StepResume {
                    state: &self.state,
                    tool_result: last_result.as_ref(),
                    turn_ended: self.turn_ended,
                }),
                None => StepInstruction::RunToEnd,
            };
            last_result = None;

            match instruction {
                StepInstruction::CallTool {
                    name,
                    input,
                    ends_step,
                    include_result,
                } => {
                    last_result = self
                        .scripted_call(name, input, ends_step, include_result)
                        .await?;
                }
                StepInstruction::SetMessages(messages) => self.state.messages = messages,
                StepInstruction::SetOutput(value) => self.state.output = Some(value),
                StepInstruction::StepModel => {
                    if self.state.steps_remaining == 0 {
                        debug!(run_id = %self.state.identity.run_id, "step budget exhausted");
                        return Ok(());
                    }
                    self.model_step().await?;
                }
                StepInstruction::RunToEnd => {
                    while !self.turn_ended
                        && self.state.output.is_none()
                        && self.state.steps_remaining > 0
                    {
                        self.model_step().await?;
                    }
                    return Ok(());
                }
                StepInstruction::End => return Ok(()),
            }
        }
    }

    async fn scripted_call(
        &mut self,
        name: String,
        input: serde_json::Value,
        ends_step: bool,
        include_result: bool,
    ) -> Result<Option<ToolResult>, WeftError> {
        let raw = RawToolCall::new(name, input);
        match self.env.registry.resolve(&raw, ValidateOptions { ends_step }) {
            Ok(call) => self.dispatcher.submit(call, CallOrigin::Scripted, &[]),
            Err(err) => self.dispatcher.submit_error(err),
        }
        let outcomes = self.dispatcher.drain().await?;
        if include_result {
            self.state.messages.push(ModelMessage {
                role: Role::Assistant,
                content: vec![ContentPart::ToolCall {
                    call_id: raw.call_id.clone(),
                    tool_name: raw.name.clone(),
                    input: raw.input.clone(),
                }],
                timestamp: Some(Utc::now()),
            });
        }
        let (mut results, ended) = self.absorb(outcomes, include_result);
        if ended {
            self.turn_ended = true;
        }
        Ok(results.pop())
    }

    async fn model_step(&mut self) -> Result<(), WeftError> {
        self.step += 1;
        let step = self.step;
        let run_id = self.state.identity.run_id;
        self.state.consume_step();
        self.turn_ended = false;
        debug!(run_id = %run_id, agent_type = %self.template.id, step, "model step");
        emit(&self.env.events, AgentEvent::StepStart { run_id, step });

        let request = ModelRequest {
            agent_type: self.template.id.clone(),
            system_prompt: self.template.system_prompt.clone(),
            messages: self.state.messages.clone(),
            tools: self.env.registry.tool_definitions(&self.template.tool_names),
        };
        let stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(WeftError::Cancelled),
            stream = self.env.provider.stream_turn(&request) => stream?,
        };
        let extractor = TagExtractor::new(self.env.registry.tag_names())
            .with_max_tag_len(self.env.max_tag_len);
        let mut events = extract_tool_tags(
            stream,
            self.env.provider.provider_name().to_string(),
            extractor,
        );

        let mut parts: Vec<ContentPart> = Vec::new();
        let mut tool_calls = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(WeftError::Cancelled),
                next = events.next() => next,
            };
            let Some(event) = next else { break };
            match event? {
                TurnEvent::Tag(TagEvent::Text { text }) => {
                    emit(
                        &self.env.events,
                        AgentEvent::TextDelta {
                            run_id,
                            text: text.clone(),
                        },
                    );
                    push_delta(&mut parts, text, false);
                }
                TurnEvent::Tag(TagEvent::Reasoning { text }) => {
                    emit(
                        &self.env.events,
                        AgentEvent::Reasoning {
                            run_id,
                            text: text.clone(),
                        },
                    );
                    push_delta(&mut parts, text, true);
                }
                TurnEvent::Tag(TagEvent::ToolOpen { .. }) => {}
                TurnEvent::Tag(TagEvent::ToolClose {
                    name,
                    attributes,
                    body,
                }) => {
                    tool_calls += 1;
                    let raw = RawToolCall::from_tag(&name, &attributes, &body);
                    parts.push(ContentPart::ToolCall {
                        call_id: raw.call_id.clone(),
                        tool_name: raw.name.clone(),
                        input: raw.input.clone(),
                    });
                    match self.env.registry.resolve(&raw, ValidateOptions::default()) {
                        Ok(call) => {
                            self.dispatcher
                                .submit(call, CallOrigin::Model, &self.template.tool_names)
                        }
                        Err(err) => self.dispatcher.submit_error(err),
                    }
                }
                TurnEvent::Tag(TagEvent::Error { name, message }) => {
                    tool_calls += 1;
                    let call_id = new_call_id();
                    parts.push(ContentPart::ToolCall {
                        call_id: call_id.clone(),
                        tool_name: name.clone(),
                        input: serde_json::Value::Null,
                    });
                    self.dispatcher.submit_error(ToolCallError::new(
                        name,
                        call_id,
                        serde_json::Value::Null,
                        message,
                    ));
                }
                TurnEvent::Usage(usage) => {
                    self.state.credits_used += usage.credits;
                    if let Some(callback) = &self.env.cost_callback {
                        callback(usage.credits);
                    }
                }
                TurnEvent::Finished { text_hash } => {
                    debug!(run_id = %run_id, step, text_hash = %text_hash, "model turn finished");
                }
            }
        }

        if !parts.is_empty() {
            self.state.messages.push(ModelMessage {
                role: Role::Assistant,
                content: parts,
                timestamp: Some(Utc::now()),
            });
        }
        let outcomes = self.dispatcher.drain().await?;
        let (_, ended) = self.absorb(outcomes, true);
        if ended || tool_calls == 0 {
            self.turn_ended = true;
        }

        emit(
            &self.env.events,
            AgentEvent::StepEnd {
                run_id,
                step,
                tool_calls,
            },
        );
        Ok(())
    }

    /// Apply outcomes in issuance order. Returns the results and whether any
    /// call ended the turn.
    fn absorb(
        &mut self,
        outcomes: Vec<DispatchOutcome>,
        record: bool,
    ) -> (Vec<ToolResult>, bool) {
        let mut ended = false;
        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            ended |= outcome.ends_step || outcome.delta.end_turn;
            self.state.credits_used += outcome.cost;
            self.state.apply(outcome.delta);
            if record {
                self.state
                    .messages
                    .push(ModelMessage::tool_result(outcome.result.clone()));
            }
            results.push(outcome.result);
        }
        (results, ended)
    }

    fn final_output(&self) -> AgentOutput {
        match self.template.output_mode {
            OutputMode::StructuredOutput => AgentOutput::StructuredOutput {
                value: self.state.output.clone().unwrap_or(serde_json::Value::Null),
            },
            OutputMode::LastMessage => AgentOutput::LastMessage {
                text: self.state.last_assistant_text().unwrap_or_default(),
            },
            OutputMode::AllMessages => AgentOutput::AllMessages {
                messages: self.state.messages.clone(),
            },
        }
    }

    fn check_cancelled(&self) -> Result<(), WeftError> {
        if self.cancel.is_cancelled() {
            Err(WeftError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Append a streamed delta, extending the previous part of the same kind.
fn push_delta(parts: &mut Vec<ContentPart>, delta: String, reasoning: bool) {
    match (parts.last_mut(), reasoning) {
        (Some(ContentPart::Text { text }), false) | (Some(ContentPart::Reasoning { text }), true) => {
            text.push_str(&delta)
        }
        (_, false) => parts.push(ContentPart::Text { text: delta }),
        (_, true) => parts.push(ContentPart::Reasoning { text: delta }),
    }
}
