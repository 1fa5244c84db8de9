//! Agent loop primitives (steps, dispatch, ordering, events).

pub mod dispatch;
pub mod events;
pub mod ledger;
pub mod runner;
pub mod steps;
pub mod types;

pub use dispatch::{CallOrigin, CostCallback, DispatchOutcome, ToolDispatcher};
pub use events::{AgentEvent, AgentEventSink};
pub use ledger::{ResourceLedger, Ticket, TurnWaiter};
pub use runner::{AgentLoop, LoopEnv};
pub use steps::{ScriptedSteps, StepInstruction, StepProgram, StepResume};
pub use types::{RetryInfo, RunId, RunStatus};
