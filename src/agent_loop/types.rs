//! Core run types for the agent loop.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique run identifier.
pub type RunId = Uuid;

/// Run controller lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::FailedTerminal | Self::Cancelled
        )
    }
}

/// Information handed to retry callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryInfo {
    /// Zero-based index of the attempt that failed.
    pub attempt: u32,
    pub max_retries: u32,
    pub delay_ms: u64,
    pub error_code: crate::error::ErrorCode,
    pub message: String,
}
