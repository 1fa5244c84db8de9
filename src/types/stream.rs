//! Streaming types exchanged with a model provider.

use serde::{Deserialize, Serialize};

/// One chunk of a model turn stream.
///
/// Control events (usage, errors, completion) arrive interleaved with text
/// deltas and are kept distinct from them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Incremental text content.
    Text { text: String },
    /// Provider-native reasoning content.
    Reasoning { text: String },
    /// Usage and cost metadata.
    Usage(Usage),
    /// Error reported mid-stream by the provider.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
    },
    /// Stream finished.
    Done,
}

impl StreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Token usage and credit cost for one model turn.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub credits: f64,
}
