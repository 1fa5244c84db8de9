//! Error types for weft.

pub mod unified;

pub use unified::{sanitize_message, ErrorCategory, ErrorCode};

use thiserror::Error;

/// Primary error type for all weft operations.
#[derive(Error, Debug)]
pub enum WeftError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Provider error: {provider}: {message}")]
    Provider {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Payment required: {0}")]
    PaymentRequired(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Agent template not found: {0}")]
    AgentNotFound(String),

    #[error("Selection failed: {0}")]
    Selection(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl WeftError {
    /// Create an API error from a status and message.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create a provider error without a status code.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Classify this error into the run-level taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Api { status, message } => ErrorCode::classify(Some(*status), message),
            Self::Provider {
                status, message, ..
            } => ErrorCode::classify(*status, message),
            Self::Network(message) => match ErrorCode::from_message(message) {
                code @ (ErrorCode::ConnectionRefused
                | ErrorCode::DnsFailure
                | ErrorCode::Timeout) => code,
                _ => ErrorCode::Network,
            },
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Stream(message) => match ErrorCode::from_message(message) {
                ErrorCode::Unknown => ErrorCode::Network,
                code => code,
            },
            Self::PaymentRequired(_) => ErrorCode::PaymentRequired,
            Self::Authentication(_) => ErrorCode::AuthenticationFailed,
            Self::Io(err) => match err.kind() {
                std::io::ErrorKind::TimedOut => ErrorCode::Timeout,
                std::io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
                    ErrorCode::Network
                }
                std::io::ErrorKind::NotFound => ErrorCode::NotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::Forbidden,
                _ => ErrorCode::Unknown,
            },
            Self::InvalidArgument(_) | Self::Serialization(_) => ErrorCode::BadRequest,
            Self::AgentNotFound(_) => ErrorCode::NotFound,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Configuration(_)
            | Self::ToolExecution { .. }
            | Self::Selection(_)
            | Self::InvalidState(_) => ErrorCode::Unknown,
        }
    }

    /// Broad category derived from [`WeftError::code`].
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::ToolExecution { .. } => ErrorCategory::ToolExecution,
            _ => self.code().into(),
        }
    }

    /// Whether the run controller may retry after this error.
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Message safe to hand back to callers.
    ///
    /// Payment-required errors carry a user-actionable message and are
    /// passed through verbatim.
    pub fn public_message(&self) -> String {
        match self {
            Self::PaymentRequired(message) => message.clone(),
            other => sanitize_message(&other.to_string()),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, WeftError>;
