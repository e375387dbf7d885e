use rustc_hash::FxHashMap;

use crate::error::GatewayError;
use crate::protocol::anthropic::{
    AnthropicContentBlock, AnthropicDelta, AnthropicErrorBody, AnthropicStreamEvent,
};
use crate::protocol::canonical::{ChoiceDelta, Chunk, Role, ToolCallFragment, Usage};
use crate::protocol::mapping::anthropic_stop_to_finish_reason;
use crate::protocol::ProviderConverter;
use crate::stream::SseEvent;
use crate::util::unix_now_secs;

/// Stateful converter for the typed Anthropic event stream.
///
/// Content-block indexes count every block (text, thinking, tool use);
/// tool calls are renumbered densely from zero so downstream tool-call
/// indexes stay contiguous.
#[derive(Debug, Default)]
pub struct AnthropicConverter {
    id: String,
    model: String,
    created: u64,
    input_tokens: u64,
    tool_indexes: FxHashMap<usize, u32>,
    next_tool_index: u32,
    frames_dropped: u64,
}

impl AnthropicConverter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    fn chunk(&self) -> Chunk {
        let created = if self.created == 0 {
            unix_now_secs()
        } else {
            self.created
        };
        Chunk::new(self.id.clone(), self.model.clone(), created)
    }

    fn choice_chunk(&self, choice: ChoiceDelta) -> Chunk {
        self.chunk().with_choice(choice)
    }

    fn decode(&mut self, event: AnthropicStreamEvent) -> Option<Chunk> {
        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                self.id = message.id;
                self.model = message.model;
                self.created = unix_now_secs();
                self.input_tokens = message.usage.input_tokens.unwrap_or(0);
                let mut choice = ChoiceDelta::new(0);
                choice.delta.role = Some(Role::Assistant);
                Some(self.choice_chunk(choice))
            }
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                AnthropicContentBlock::Text { text } => {
                    (!text.is_empty()).then(|| self.choice_chunk(ChoiceDelta::content(0, text)))
                }
                AnthropicContentBlock::Thinking { thinking } => (!thinking.is_empty())
                    .then(|| self.choice_chunk(ChoiceDelta::reasoning(0, thinking))),
                AnthropicContentBlock::ToolUse { id, name } => {
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.tool_indexes.insert(index, tool_index);
                    let mut choice = ChoiceDelta::new(0);
                    choice
                        .delta
                        .tool_calls
                        .push(ToolCallFragment::start(tool_index, id, name));
                    Some(self.choice_chunk(choice))
                }
                AnthropicContentBlock::Unsupported => {
                    tracing::debug!(index, "ignoring unsupported anthropic content block");
                    None
                }
            },
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                AnthropicDelta::TextDelta { text } => {
                    Some(self.choice_chunk(ChoiceDelta::content(0, text)))
                }
                AnthropicDelta::ThinkingDelta { thinking } => {
                    Some(self.choice_chunk(ChoiceDelta::reasoning(0, thinking)))
                }
                AnthropicDelta::InputJsonDelta { partial_json } => {
                    let Some(tool_index) = self.tool_indexes.get(&index).copied() else {
                        self.frames_dropped += 1;
                        tracing::warn!(index, "input_json_delta for unknown tool_use block");
                        return None;
                    };
                    let mut choice = ChoiceDelta::new(0);
                    choice
                        .delta
                        .tool_calls
                        .push(ToolCallFragment::arguments(tool_index, partial_json));
                    Some(self.choice_chunk(choice))
                }
                AnthropicDelta::SignatureDelta | AnthropicDelta::Unsupported => None,
            },
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                let input_tokens = usage.input_tokens.unwrap_or(self.input_tokens);
                let output_tokens = usage.output_tokens.unwrap_or(0);
                let mut chunk = self.chunk().with_usage(Usage {
                    prompt_tokens: input_tokens,
                    completion_tokens: output_tokens,
                    total_tokens: input_tokens + output_tokens,
                });
                if let Some(reason) = delta.stop_reason {
                    let mut choice = ChoiceDelta::new(0);
                    choice.finish_reason =
                        Some(anthropic_stop_to_finish_reason(&reason).to_string());
                    chunk.choices.push(choice);
                }
                Some(chunk)
            }
            AnthropicStreamEvent::ContentBlockStop { .. }
            | AnthropicStreamEvent::MessageStop
            | AnthropicStreamEvent::Ping => None,
            AnthropicStreamEvent::Error { error } => {
                let mut chunk = self.chunk();
                chunk.error = Some(upstream_error(error).to_chunk_error());
                Some(chunk)
            }
            AnthropicStreamEvent::Unknown => {
                self.frames_dropped += 1;
                tracing::warn!("dropping unknown anthropic stream event");
                None
            }
        }
    }
}

fn upstream_error(error: AnthropicErrorBody) -> GatewayError {
    let status = match error.error_type.as_str() {
        "invalid_request_error" => 400,
        "authentication_error" => 401,
        "permission_error" => 403,
        "not_found_error" => 404,
        "request_too_large" => 413,
        "rate_limit_error" => 429,
        "overloaded_error" => 529,
        _ => 500,
    };
    GatewayError::Upstream {
        status,
        message: error.message,
    }
}

impl ProviderConverter for AnthropicConverter {
    fn convert(&mut self, frame: &SseEvent) -> Option<Chunk> {
        let data = frame.data.trim();
        if data.is_empty() {
            return None;
        }
        match serde_json::from_str::<AnthropicStreamEvent>(data) {
            Ok(event) => self.decode(event),
            Err(err) => {
                self.frames_dropped += 1;
                tracing::warn!(
                    event = frame.event_name(),
                    error = %err,
                    "dropping malformed anthropic stream frame"
                );
                None
            }
        }
    }

    fn is_end_of_stream(&self, frame: &SseEvent) -> bool {
        frame.event.as_deref() == Some("message_stop")
            || (frame.event.is_none() && frame.data.contains("\"message_stop\""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(converter: &mut AnthropicConverter, event: &str, data: &str) -> Option<Chunk> {
        converter.convert(&SseEvent::named(event, data))
    }

    #[test]
    fn test_message_start_sets_identity_and_role() {
        let mut converter = AnthropicConverter::new();
        let chunk = feed(
            &mut converter,
            "message_start",
            r#"{"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant","model":"claude","usage":{"input_tokens":12,"output_tokens":1}}}"#,
        )
        .expect("chunk");
        assert_eq!(chunk.id, "msg_1");
        assert_eq!(chunk.model, "claude");
        assert_eq!(chunk.choices[0].delta.role, Some(Role::Assistant));
    }

    #[test]
    fn test_text_thinking_and_tool_blocks() {
        let mut converter = AnthropicConverter::new();
        let thinking = feed(
            &mut converter,
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"plan"}}"#,
        )
        .expect("thinking");
        assert_eq!(
            thinking.choices[0].delta.reasoning_content.as_deref(),
            Some("plan")
        );

        let text = feed(
            &mut converter,
            "content_block_delta",
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"Hello"}}"#,
        )
        .expect("text");
        assert_eq!(text.choices[0].delta.content.as_deref(), Some("Hello"));

        let start = feed(
            &mut converter,
            "content_block_start",
            r#"{"type":"content_block_start","index":2,"content_block":{"type":"tool_use","id":"toolu_1","name":"search","input":{}}}"#,
        )
        .expect("tool start");
        let call = &start.choices[0].delta.tool_calls[0];
        assert_eq!(call.index, 0);
        assert_eq!(call.id.as_deref(), Some("toolu_1"));
        assert_eq!(call.function.name.as_deref(), Some("search"));

        let args = feed(
            &mut converter,
            "content_block_delta",
            r#"{"type":"content_block_delta","index":2,"delta":{"type":"input_json_delta","partial_json":"{\"q\":1}"}}"#,
        )
        .expect("tool args");
        let call = &args.choices[0].delta.tool_calls[0];
        assert_eq!(call.index, 0);
        assert!(call.id.is_none());
        assert_eq!(call.function.arguments.as_deref(), Some("{\"q\":1}"));
    }

    #[test]
    fn test_message_delta_carries_usage_and_finish_reason() {
        let mut converter = AnthropicConverter::new();
        feed(
            &mut converter,
            "message_start",
            r#"{"type":"message_start","message":{"id":"msg_1","model":"claude","usage":{"input_tokens":10,"output_tokens":0}}}"#,
        );
        let chunk = feed(
            &mut converter,
            "message_delta",
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":5}}"#,
        )
        .expect("chunk");
        let usage = chunk.usage.expect("usage");
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
        assert_eq!(usage.total_tokens, 15);
        assert_eq!(chunk.choices[0].finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn test_error_event_maps_to_terminal_chunk() {
        let mut converter = AnthropicConverter::new();
        let chunk = feed(
            &mut converter,
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        )
        .expect("chunk");
        let error = chunk.error.expect("error");
        assert_eq!(error.http_code, 503);
        assert_eq!(error.message, "Overloaded");
    }

    #[test]
    fn test_unknown_and_malformed_frames_are_dropped() {
        let mut converter = AnthropicConverter::new();
        assert!(feed(&mut converter, "mystery", r#"{"type":"mystery"}"#).is_none());
        assert!(feed(&mut converter, "content_block_delta", "{oops").is_none());
        assert!(feed(
            &mut converter,
            "content_block_delta",
            r#"{"type":"content_block_delta","index":7,"delta":{"type":"input_json_delta","partial_json":"{}"}}"#,
        )
        .is_none());
        assert_eq!(converter.frames_dropped(), 3);
        assert!(feed(&mut converter, "ping", r#"{"type":"ping"}"#).is_none());
    }

    #[test]
    fn test_message_stop_is_end_of_stream() {
        let converter = AnthropicConverter::new();
        assert!(converter.is_end_of_stream(&SseEvent::named(
            "message_stop",
            r#"{"type":"message_stop"}"#
        )));
        assert!(converter.is_end_of_stream(&SseEvent::data(r#"{"type":"message_stop"}"#)));
        assert!(!converter.is_end_of_stream(&SseEvent::named("ping", r#"{"type":"ping"}"#)));
    }
}
