use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::stream::sse::{data_frame, done_frame};

/// Message role carried on the first fragment of a choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Token usage reported by the provider, normally on the last chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Normalized error body carried by a terminal chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    pub http_code: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallType {
    #[default]
    Function,
}

/// Name and argument fragments of one tool call increment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionFragment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// One increment of a tool call, identified by `index` within its choice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallFragment {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub call_type: ToolCallType,
    #[serde(default)]
    pub function: FunctionFragment,
}

impl ToolCallFragment {
    /// Fragment introducing a call: carries the id and the whole name.
    #[must_use]
    pub fn start(index: u32, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            index,
            id: Some(id.into()),
            call_type: ToolCallType::Function,
            function: FunctionFragment {
                name: Some(name.into()),
                arguments: None,
            },
        }
    }

    /// Fragment continuing a call's JSON arguments.
    #[must_use]
    pub fn arguments(index: u32, arguments: impl Into<String>) -> Self {
        Self {
            index,
            id: None,
            call_type: ToolCallType::Function,
            function: FunctionFragment {
                name: None,
                arguments: Some(arguments.into()),
            },
        }
    }
}

/// The incremental, not-yet-combined content of one choice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFragment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "SmallVec::is_empty")]
    pub tool_calls: SmallVec<[ToolCallFragment; 1]>,
}

impl MessageFragment {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.role.is_none()
            && self.content.as_deref().map_or(true, str::is_empty)
            && self.reasoning_content.as_deref().map_or(true, str::is_empty)
            && self.tool_calls.is_empty()
    }
}

/// One parallel output stream inside a chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceDelta {
    pub index: u32,
    #[serde(default)]
    pub delta: MessageFragment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl ChoiceDelta {
    #[must_use]
    pub fn new(index: u32) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn content(index: u32, text: impl Into<String>) -> Self {
        let mut choice = Self::new(index);
        choice.delta.content = Some(text.into());
        choice
    }

    #[must_use]
    pub fn reasoning(index: u32, text: impl Into<String>) -> Self {
        let mut choice = Self::new(index);
        choice.delta.reasoning_content = Some(text.into());
        choice
    }
}

/// One normalized increment of a streaming response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub model: String,
    pub created: u64,
    #[serde(default)]
    pub choices: Vec<ChoiceDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ChunkError>,
}

impl Chunk {
    #[must_use]
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: u64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_choice(mut self, choice: ChoiceDelta) -> Self {
        self.choices.push(choice);
        self
    }

    #[must_use]
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    #[must_use]
    pub fn is_terminal_error(&self) -> bool {
        self.error.is_some()
    }

    #[must_use]
    pub fn has_finish_reason(&self) -> bool {
        self.choices.iter().any(|choice| choice.finish_reason.is_some())
    }
}

#[derive(Serialize)]
struct OutboundChunk<'a> {
    id: &'a str,
    object: &'static str,
    created: u64,
    model: &'a str,
    choices: &'a [ChoiceDelta],
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<&'a Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ChunkError>,
}

/// One event on the caller-facing stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    Chunk(Chunk),
    Done,
}

impl OutboundEvent {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            OutboundEvent::Done => true,
            OutboundEvent::Chunk(chunk) => chunk.is_terminal_error(),
        }
    }

    /// Encode as one outward SSE `data:` frame.
    #[must_use]
    pub fn to_sse(&self) -> String {
        match self {
            OutboundEvent::Done => done_frame(),
            OutboundEvent::Chunk(chunk) => data_frame(&encode_chunk_json(chunk)),
        }
    }
}

/// Serialize a chunk in the outward `chat.completion.chunk` shape.
#[must_use]
pub fn encode_chunk_json(chunk: &Chunk) -> String {
    let wire = OutboundChunk {
        id: &chunk.id,
        object: "chat.completion.chunk",
        created: chunk.created,
        model: &chunk.model,
        choices: &chunk.choices,
        usage: chunk.usage.as_ref(),
        error: chunk.error.as_ref(),
    };
    // Every field is a plain string/number/struct, serialization cannot fail.
    serde_json::to_string(&wire).unwrap_or_else(|_| String::from("{}"))
}
