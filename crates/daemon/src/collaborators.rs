//! Contracts of services the session subsystem consumes but does not own.

use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

/// Text chunks of one chat response, in arrival order.
pub type ChunkStream = Pin<Box<dyn Stream<Item = String> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// A language model that answers with a lazy stream of text chunks.
pub trait ChatService: Send + Sync {
    fn chat(&self, prompt: &str, system_prompt: Option<&str>, history: &[ChatMessage]) -> ChunkStream;
}

/// Concatenate a response. A stream without any text is "no response".
pub async fn collect_response(mut chunks: ChunkStream) -> Option<String> {
    let mut response = String::new();
    while let Some(chunk) = chunks.next().await {
        response.push_str(&chunk);
    }
    if response.is_empty() {
        None
    } else {
        Some(response)
    }
}

/// Snapshot of a background indexing service. Read-only for this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingStatus {
    pub is_indexing: bool,
    /// Fraction done, always within `0.0..=1.0`.
    pub progress: f32,
    pub status: String,
}

impl IndexingStatus {
    pub fn new(is_indexing: bool, progress: f32, status: impl Into<String>) -> Self {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
        Self {
            is_indexing,
            progress,
            status: status.into(),
        }
    }

    pub fn idle() -> Self {
        Self::new(false, 0.0, "")
    }

    /// Progress as a whole percentage.
    pub fn percent(&self) -> u8 {
        (self.progress * 100.0).round() as u8
    }
}
