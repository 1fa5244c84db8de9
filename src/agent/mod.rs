//! Agents: templates, execution state and the run controller.

pub mod runtime;
pub mod state;
pub mod template;

pub use runtime::{AgentRuntime, RetryCallback, RunHandle, RunOptions};
pub use state::{
    AgentIdentity, AgentOutput, AgentState, RunState, SessionState, StateDelta, Subgoal,
    SubgoalStatus, SubgoalUpdate,
};
pub use template::{AgentTemplate, AgentTemplates, OutputMode, StepProgramFactory};
