//! Model provider boundary.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::WeftError;
use crate::types::{ModelMessage, StreamChunk};

/// A request for the next model turn.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    /// Agent type issuing the request.
    pub agent_type: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// Tool definition sent to the provider API.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Core trait implemented by model providers.
///
/// Tool calls arrive inline in the text stream as tags; the provider only
/// needs to stream text and control chunks.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name (e.g., "openai", "stub").
    fn provider_name(&self) -> &str;

    /// Start streaming one model turn.
    async fn stream_turn(
        &self,
        request: &ModelRequest,
    ) -> Result<BoxStream<'static, Result<StreamChunk, WeftError>>, WeftError>;
}
