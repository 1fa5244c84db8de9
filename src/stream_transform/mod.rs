//! Stream transformations over model turn streams.

pub mod tags;

pub use tags::{
    coalesce_events, ExtractionSummary, TagEvent, TagExtractor, UnknownTagPolicy,
    DEFAULT_MAX_TAG_LEN,
};

use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::WeftError;
use crate::types::{StreamChunk, Usage};

/// Event produced while consuming one model turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Tag(TagEvent),
    Usage(Usage),
    /// End of the turn; carries the digest of the turn's plain text.
    Finished { text_hash: String },
}

/// Run a provider chunk stream through a [`TagExtractor`].
///
/// Text chunks are parsed for tool tags; provider-native reasoning passes
/// straight through; a mid-stream provider error ends the stream with `Err`.
/// The stream always ends with [`TurnEvent::Finished`] unless it errored.
pub fn extract_tool_tags(
    stream: BoxStream<'static, Result<StreamChunk, WeftError>>,
    provider_name: String,
    mut extractor: TagExtractor,
) -> BoxStream<'static, Result<TurnEvent, WeftError>> {
    let transformed = async_stream::stream! {
        let mut inner = std::pin::pin!(stream);
        while let Some(item) = inner.next().await {
            match item {
                Ok(StreamChunk::Text { text }) => {
                    for event in extractor.push(&text) {
                        yield Ok(TurnEvent::Tag(event));
                    }
                }
                Ok(StreamChunk::Reasoning { text }) => {
                    yield Ok(TurnEvent::Tag(TagEvent::Reasoning { text }));
                }
                Ok(StreamChunk::Usage(usage)) => yield Ok(TurnEvent::Usage(usage)),
                Ok(StreamChunk::Error { message, status }) => {
                    yield Err(WeftError::Provider {
                        provider: provider_name.clone(),
                        message,
                        status,
                    });
                    return;
                }
                Ok(StreamChunk::Done) => break,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        let summary = extractor.finish();
        for event in summary.events {
            yield Ok(TurnEvent::Tag(event));
        }
        yield Ok(TurnEvent::Finished { text_hash: summary.text_hash });
    };
    Box::pin(transformed)
}
