use memchr::memmem;
use smallvec::SmallVec;

use crate::error::GatewayError;
use crate::protocol::canonical::{
    ChoiceDelta, Chunk, FunctionFragment, MessageFragment, ToolCallFragment, ToolCallType, Usage,
};
use crate::protocol::mapping::openai_role;
use crate::protocol::ProviderConverter;
use crate::stream::{is_done_event, SseEvent};
use crate::util::unix_now_secs;

use super::{
    OpenAiErrorFrame, OpenAiStreamChoice, OpenAiStreamChunk, OpenAiStreamError,
    OpenAiStreamToolCall,
};

/// Converter for text-event-stream providers speaking the chat-completion
/// chunk shape.
#[derive(Debug, Default)]
pub struct OpenAiChatConverter {
    frames_dropped: u64,
}

impl OpenAiChatConverter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames dropped as malformed so far.
    #[must_use]
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }
}

impl ProviderConverter for OpenAiChatConverter {
    fn convert(&mut self, frame: &SseEvent) -> Option<Chunk> {
        let data = frame.data.trim();
        if data.is_empty() || is_done_event(frame) {
            return None;
        }

        if memmem::find(data.as_bytes(), b"\"error\"").is_some() {
            if let Ok(error_frame) = serde_json::from_str::<OpenAiErrorFrame>(data) {
                return Some(error_chunk(error_frame.error));
            }
        }

        match serde_json::from_str::<OpenAiStreamChunk>(data) {
            Ok(wire) => Some(map_stream_chunk(wire)),
            Err(err) => {
                self.frames_dropped += 1;
                tracing::warn!(error = %err, "dropping malformed openai stream frame");
                None
            }
        }
    }

    fn is_end_of_stream(&self, frame: &SseEvent) -> bool {
        is_done_event(frame)
    }
}

/// Field-by-field mapping of one wire chunk into the unified model.
#[must_use]
pub fn map_stream_chunk(wire: OpenAiStreamChunk) -> Chunk {
    Chunk {
        id: wire.id,
        model: wire.model,
        created: wire.created.unwrap_or_else(unix_now_secs),
        choices: wire.choices.into_iter().map(map_choice).collect(),
        usage: wire.usage.map(|usage| Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }),
        error: None,
    }
}

fn map_choice(choice: OpenAiStreamChoice) -> ChoiceDelta {
    let delta = choice.delta;
    let tool_calls: SmallVec<[ToolCallFragment; 1]> = delta
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(map_tool_call)
        .collect();
    ChoiceDelta {
        index: choice.index,
        delta: MessageFragment {
            role: delta.role.as_deref().map(openai_role),
            content: delta.content,
            reasoning_content: delta.reasoning_content.or(delta.reasoning),
            tool_calls,
        },
        finish_reason: choice.finish_reason.filter(|reason| !reason.is_empty()),
    }
}

fn map_tool_call(call: OpenAiStreamToolCall) -> ToolCallFragment {
    let function = call.function.map_or_else(FunctionFragment::default, |f| {
        FunctionFragment {
            name: f.name,
            arguments: f.arguments,
        }
    });
    ToolCallFragment {
        index: call.index,
        id: call.id.filter(|id| !id.is_empty()),
        call_type: ToolCallType::Function,
        function,
    }
}

fn error_chunk(error: OpenAiStreamError) -> Chunk {
    let status = error
        .code
        .as_ref()
        .and_then(|code| {
            code.as_u64()
                .or_else(|| code.as_str().and_then(|s| s.parse::<u64>().ok()))
        })
        .and_then(|code| u16::try_from(code).ok())
        .filter(|code| (400..=599).contains(code))
        .unwrap_or(500);
    let message = if error.message.is_empty() {
        error.error_type.unwrap_or_default()
    } else {
        error.message
    };
    let mut chunk = Chunk::new("", "", unix_now_secs());
    chunk.error = Some(GatewayError::Upstream { status, message }.to_chunk_error());
    chunk
}
