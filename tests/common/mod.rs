//! Shared test helpers: a scripted model provider and template shortcuts.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use weft::error::WeftError;
use weft::provider::{ModelProvider, ModelRequest};
use weft::types::{StreamChunk, Usage};

/// One scripted model turn.
pub enum Turn {
    /// Stream these chunks, then `Done`.
    Chunks(Vec<StreamChunk>),
    /// Fail before streaming.
    Fail(WeftError),
}

impl Turn {
    /// A turn streaming `text` in pieces of at most `size` characters.
    pub fn text_in_pieces(text: &str, size: usize) -> Self {
        let chars: Vec<char> = text.chars().collect();
        Self::Chunks(
            chars
                .chunks(size.max(1))
                .map(|piece| StreamChunk::text(piece.iter().collect::<String>()))
                .collect(),
        )
    }

    pub fn text(text: &str) -> Self {
        Self::Chunks(vec![StreamChunk::text(text)])
    }

    pub fn with_credits(self, credits: f64) -> Self {
        match self {
            Self::Chunks(mut chunks) => {
                chunks.push(StreamChunk::Usage(Usage {
                    credits,
                    ..Usage::default()
                }));
                Self::Chunks(chunks)
            }
            fail => fail,
        }
    }
}

/// Provider that replays queued turns and records every request.
///
/// Once the queue is empty, each turn is an empty reply.
#[derive(Default)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<Turn>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    async fn stream_turn(
        &self,
        request: &ModelRequest,
    ) -> Result<BoxStream<'static, Result<StreamChunk, WeftError>>, WeftError> {
        self.requests.lock().unwrap().push(request.clone());
        let turn = self.turns.lock().unwrap().pop_front();
        match turn {
            Some(Turn::Fail(err)) => Err(err),
            Some(Turn::Chunks(mut chunks)) => {
                chunks.push(StreamChunk::Done);
                Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
            }
            None => Ok(stream::iter(vec![Ok(StreamChunk::Done)]).boxed()),
        }
    }
}
