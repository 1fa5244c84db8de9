//! Step programs: scripted agent logic as an explicit instruction machine.
//!
//! A program is asked for its next instruction each time the interpreter
//! loop is ready; it sees the current agent state and the result of its
//! previous instruction.

use serde_json::Value;

use crate::agent::state::AgentState;
use crate::types::{ModelMessage, ToolResult};

/// One instruction yielded by a step program.
#[derive(Debug, Clone, PartialEq)]
pub enum StepInstruction {
    /// Issue a tool call with scripted privileges.
    CallTool {
        name: String,
        input: Value,
        /// Force the call to end the current step.
        ends_step: bool,
        /// Append the tool result to the transcript.
        include_result: bool,
    },
    /// Replace the transcript.
    SetMessages(Vec<ModelMessage>),
    /// Set the structured output.
    SetOutput(Value),
    /// Run exactly one model step.
    StepModel,
    /// Run model steps until the agent stops, then end the program.
    RunToEnd,
    /// End the program.
    End,
}

impl StepInstruction {
    pub fn call(name: impl Into<String>, input: Value) -> Self {
        Self::CallTool {
            name: name.into(),
            input,
            ends_step: false,
            include_result: true,
        }
    }
}

/// What a program sees when asked for its next instruction.
#[derive(Debug)]
pub struct StepResume<'a> {
    pub state: &'a AgentState,
    /// Result of the previous `CallTool`, if that was the last instruction.
    pub tool_result: Option<&'a ToolResult>,
    /// The last model step ended the agent's turn.
    pub turn_ended: bool,
}

/// Scripted agent logic.
pub trait StepProgram: Send {
    fn next(&mut self, resume: &StepResume<'_>) -> StepInstruction;
}

/// A fixed instruction list walked by an explicit program counter.
#[derive(Debug, Clone)]
pub struct ScriptedSteps {
    instructions: Vec<StepInstruction>,
    pc: usize,
}

impl ScriptedSteps {
    pub fn new(instructions: Vec<StepInstruction>) -> Self {
        Self {
            instructions,
            pc: 0,
        }
    }

    pub fn pc(&self) -> usize {
        self.pc
    }
}

impl StepProgram for ScriptedSteps {
    fn next(&mut self, _resume: &StepResume<'_>) -> StepInstruction {
        match self.instructions.get(self.pc) {
            Some(instruction) => {
                self.pc += 1;
                instruction.clone()
            }
            None => StepInstruction::End,
        }
    }
}
