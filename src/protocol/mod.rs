pub mod anthropic;
pub mod canonical;
pub mod mapping;
pub mod openai_chat;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::stream::SseEvent;

pub use anthropic::stream::AnthropicConverter;
pub use openai_chat::stream::OpenAiChatConverter;

/// The family of upstream a stream comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Text-event-stream of chat-completion-chunk JSON objects.
    #[default]
    #[serde(rename = "openai_chat")]
    OpenAiChat,
    /// Typed event stream (block start / block delta / metadata).
    Anthropic,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::OpenAiChat => write!(f, "openai_chat"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
        }
    }
}

/// Translates one provider's native stream frames into [`canonical::Chunk`]s.
///
/// Implementations never block and never fail the session: a frame that
/// cannot be understood is dropped with a diagnostic.
pub trait ProviderConverter {
    /// Convert one native frame into zero or one chunk.
    fn convert(&mut self, frame: &SseEvent) -> Option<canonical::Chunk>;

    /// Whether `frame` is the provider's native end-of-stream marker.
    fn is_end_of_stream(&self, frame: &SseEvent) -> bool;
}

/// Closed set of converters, selected once at session setup.
#[derive(Debug)]
pub enum StreamConverter {
    OpenAiChat(OpenAiChatConverter),
    Anthropic(AnthropicConverter),
}

impl StreamConverter {
    #[must_use]
    pub fn for_provider(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::OpenAiChat => StreamConverter::OpenAiChat(OpenAiChatConverter::new()),
            ProviderKind::Anthropic => StreamConverter::Anthropic(AnthropicConverter::new()),
        }
    }
}

impl ProviderConverter for StreamConverter {
    fn convert(&mut self, frame: &SseEvent) -> Option<canonical::Chunk> {
        match self {
            StreamConverter::OpenAiChat(inner) => inner.convert(frame),
            StreamConverter::Anthropic(inner) => inner.convert(frame),
        }
    }

    fn is_end_of_stream(&self, frame: &SseEvent) -> bool {
        match self {
            StreamConverter::OpenAiChat(inner) => inner.is_end_of_stream(frame),
            StreamConverter::Anthropic(inner) => inner.is_end_of_stream(frame),
        }
    }
}
