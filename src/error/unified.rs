//! Unified error classification and sanitization.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Machine-readable error code surfaced on failed runs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthenticationFailed,
    Forbidden,
    InvalidCredential,
    PaymentRequired,
    Network,
    Timeout,
    ConnectionRefused,
    DnsFailure,
    ServerError,
    ServiceUnavailable,
    BadRequest,
    NotFound,
    Cancelled,
    Unknown,
}

impl ErrorCode {
    /// Codes the run controller retries with backoff.
    pub const RETRYABLE: [ErrorCode; 6] = [
        ErrorCode::Network,
        ErrorCode::Timeout,
        ErrorCode::ConnectionRefused,
        ErrorCode::DnsFailure,
        ErrorCode::ServerError,
        ErrorCode::ServiceUnavailable,
    ];

    pub fn is_retryable(self) -> bool {
        Self::RETRYABLE.contains(&self)
    }

    /// Map an HTTP-like status code. Returns `None` for statuses that carry
    /// no classification on their own (2xx, 3xx, unusual 4xx).
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            400 | 422 => Some(Self::BadRequest),
            401 => Some(Self::AuthenticationFailed),
            402 => Some(Self::PaymentRequired),
            403 => Some(Self::Forbidden),
            404 => Some(Self::NotFound),
            408 => Some(Self::Timeout),
            502 | 503 => Some(Self::ServiceUnavailable),
            504 => Some(Self::Timeout),
            500..=599 => Some(Self::ServerError),
            _ => None,
        }
    }

    /// Classify from message text alone.
    ///
    /// Upstream failures sometimes arrive pre-serialized as plain text after
    /// an inner retry layer gave up, so the status code is lost and only the
    /// message remains.
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        let has = |needle: &str| lower.contains(needle);

        if has("payment required") || has("insufficient credits") || has("out of credits") {
            Self::PaymentRequired
        } else if has("invalid api key") || has("invalid credential") || has("invalid token") {
            Self::InvalidCredential
        } else if has("unauthorized") || has("authentication failed") || has("not authenticated")
        {
            Self::AuthenticationFailed
        } else if has("forbidden") || has("permission denied") {
            Self::Forbidden
        } else if has("econnrefused") || has("connection refused") {
            Self::ConnectionRefused
        } else if has("enotfound") || has("getaddrinfo") || has("dns") {
            Self::DnsFailure
        } else if has("timeout") || has("timed out") || has("etimedout") {
            Self::Timeout
        } else if has("service unavailable") || has("overloaded") || has("bad gateway") {
            Self::ServiceUnavailable
        } else if has("internal server error") || has("server error") {
            Self::ServerError
        } else if has("econnreset")
            || has("socket hang up")
            || has("network")
            || has("fetch failed")
            || has("connection reset")
        {
            Self::Network
        } else if has("cancelled") || has("canceled") || has("aborted") {
            Self::Cancelled
        } else if has("bad request") || has("invalid request") {
            Self::BadRequest
        } else if has("not found") {
            Self::NotFound
        } else {
            Self::Unknown
        }
    }

    /// Classify using a status code when one is known, falling back to the
    /// message heuristics.
    pub fn classify(status: Option<u16>, message: &str) -> Self {
        status
            .and_then(Self::from_status)
            .unwrap_or_else(|| Self::from_message(message))
    }
}

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Authentication,
    Payment,
    Network,
    Server,
    Request,
    Cancellation,
    Configuration,
    ToolExecution,
    Unknown,
}

impl From<ErrorCode> for ErrorCategory {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::AuthenticationFailed
            | ErrorCode::Forbidden
            | ErrorCode::InvalidCredential => Self::Authentication,
            ErrorCode::PaymentRequired => Self::Payment,
            ErrorCode::Network
            | ErrorCode::Timeout
            | ErrorCode::ConnectionRefused
            | ErrorCode::DnsFailure => Self::Network,
            ErrorCode::ServerError | ErrorCode::ServiceUnavailable => Self::Server,
            ErrorCode::BadRequest | ErrorCode::NotFound => Self::Request,
            ErrorCode::Cancelled => Self::Cancellation,
            ErrorCode::Unknown => Self::Unknown,
        }
    }
}

fn stack_frame_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^\s*(at\s+\S.*|\d+:\s+0x[0-9a-f]+.*|stack backtrace:.*)$\n?")
            .expect("stack frame pattern is valid")
    })
}

fn secret_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(bearer\s+[A-Za-z0-9._\-]+|\b(sk|pk|rk)-[A-Za-z0-9_\-]{8,}|(api[_-]?key|token|secret)\s*[=:]\s*\S+)",
        )
        .expect("secret pattern is valid")
    })
}

/// Strip stack frames and redact credential-looking substrings.
pub fn sanitize_message(message: &str) -> String {
    let without_frames = stack_frame_pattern().replace_all(message, "");
    let redacted = secret_pattern().replace_all(&without_frames, "[redacted]");
    redacted.trim().to_string()
}
