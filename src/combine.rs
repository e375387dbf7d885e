//! Delta combiner: folds a session's chunk sequence into one buffered message.
//!
//! Every fragment is applied exactly once. The combiner is not replay-safe:
//! applying the same chunk twice duplicates its text.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::protocol::canonical::{ChoiceDelta, Chunk, Role, ToolCallFragment, Usage};

/// Accumulated state of one tool call inside a choice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferedToolCall {
    pub id: Option<String>,
    pub name: String,
    pub arguments: String,
}

/// Accumulated state of one choice index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferedMessage {
    pub role: Option<Role>,
    pub content: String,
    pub reasoning_content: String,
    pub tool_calls: BTreeMap<u32, BufferedToolCall>,
    pub finish_reason: Option<String>,
}

impl BufferedMessage {
    fn apply_choice(&mut self, choice: &ChoiceDelta) {
        let delta = &choice.delta;
        if self.role.is_none() {
            self.role = delta.role;
        }
        if let Some(content) = delta.content.as_deref() {
            self.content.push_str(content);
        }
        if let Some(reasoning) = delta.reasoning_content.as_deref() {
            self.reasoning_content.push_str(reasoning);
        }
        for fragment in &delta.tool_calls {
            self.apply_tool_call(fragment);
        }
        if let Some(reason) = choice.finish_reason.as_deref() {
            self.finish_reason = Some(reason.to_string());
        }
    }

    fn apply_tool_call(&mut self, fragment: &ToolCallFragment) {
        let call = self.tool_calls.entry(fragment.index).or_default();
        if call.id.is_none() {
            call.id = fragment.id.clone().filter(|id| !id.is_empty());
        }
        if let Some(name) = fragment.function.name.as_deref() {
            if call.name.trim().is_empty() && !name.trim().is_empty() {
                call.name = name.to_string();
            }
        }
        if let Some(arguments) = fragment.function.arguments.as_deref() {
            call.arguments.push_str(arguments);
        }
    }
}

/// The fully combined message for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CombinedMessage {
    pub id: String,
    pub model: String,
    pub created: u64,
    pub usage: Option<Usage>,
    pub choices: BTreeMap<u32, BufferedMessage>,
}

impl CombinedMessage {
    /// The message for choice 0, the one single-candidate requests produce.
    #[must_use]
    pub fn primary(&self) -> Option<&BufferedMessage> {
        self.choices.get(&0)
    }
}

/// Folds chunks into a [`CombinedMessage`].
#[derive(Debug, Default)]
pub struct DeltaCombiner {
    message: CombinedMessage,
    chunks_applied: u64,
}

impl DeltaCombiner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one chunk.
    ///
    /// The session id is first-seen; model, created and usage take the
    /// latest value the upstream supplied.
    pub fn apply(&mut self, chunk: &Chunk) {
        self.chunks_applied += 1;
        let message = &mut self.message;
        if message.id.is_empty() && !chunk.id.is_empty() {
            message.id.clone_from(&chunk.id);
        }
        if !chunk.model.is_empty() {
            message.model.clone_from(&chunk.model);
        }
        if chunk.created != 0 {
            message.created = chunk.created;
        }
        if let Some(usage) = chunk.usage {
            message.usage = Some(usage);
        }
        for choice in &chunk.choices {
            message
                .choices
                .entry(choice.index)
                .or_default()
                .apply_choice(choice);
        }
    }

    #[must_use]
    pub fn message(&self) -> &CombinedMessage {
        &self.message
    }

    #[must_use]
    pub fn chunks_applied(&self) -> u64 {
        self.chunks_applied
    }

    #[must_use]
    pub fn into_message(self) -> CombinedMessage {
        self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content_chunk(text: &str) -> Chunk {
        Chunk::new("chatcmpl-1", "m", 1).with_choice(ChoiceDelta::content(0, text))
    }

    fn tool_chunk(fragment: ToolCallFragment) -> Chunk {
        let mut choice = ChoiceDelta::new(0);
        choice.delta.tool_calls.push(fragment);
        Chunk::new("chatcmpl-1", "m", 1).with_choice(choice)
    }

    #[test]
    fn test_content_and_finish_reason() {
        let mut combiner = DeltaCombiner::new();
        combiner.apply(&content_chunk("Hello, "));
        let mut last = content_chunk("world!");
        last.choices[0].finish_reason = Some("stop".to_string());
        combiner.apply(&last);

        let message = combiner.into_message();
        let primary = message.primary().expect("choice 0");
        assert_eq!(primary.content, "Hello, world!");
        assert_eq!(primary.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_interleaved_tool_call_arguments() {
        let mut combiner = DeltaCombiner::new();
        let mut first = ToolCallFragment::start(0, "call_a", "f");
        first.function.arguments = Some("{\"a\":".to_string());
        combiner.apply(&tool_chunk(first));
        combiner.apply(&tool_chunk(ToolCallFragment::start(1, "call_b", "g")));
        combiner.apply(&tool_chunk(ToolCallFragment::arguments(1, "1}")));
        combiner.apply(&tool_chunk(ToolCallFragment::arguments(0, "1}")));

        let message = combiner.into_message();
        let calls = &message.primary().expect("choice 0").tool_calls;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[&0].arguments, "{\"a\":1}");
        assert_eq!(calls[&1].arguments, "1}");
        assert_eq!(calls[&0].id.as_deref(), Some("call_a"));
        assert_eq!(calls[&1].name, "g");
    }

    #[test]
    fn test_tool_name_is_set_once_and_never_blanked() {
        let mut combiner = DeltaCombiner::new();
        let mut blank = ToolCallFragment::arguments(0, "");
        blank.function.name = Some("  ".to_string());
        combiner.apply(&tool_chunk(blank));
        combiner.apply(&tool_chunk(ToolCallFragment::start(0, "call_x", "first")));
        combiner.apply(&tool_chunk(ToolCallFragment::start(0, "call_y", "second")));
        let mut empty_name = ToolCallFragment::arguments(0, "{}");
        empty_name.function.name = Some(String::new());
        combiner.apply(&tool_chunk(empty_name));

        let message = combiner.into_message();
        let call = &message.primary().expect("choice 0").tool_calls[&0];
        assert_eq!(call.name, "first");
        assert_eq!(call.id.as_deref(), Some("call_x"));
        assert_eq!(call.arguments, "{}");
    }

    #[test]
    fn test_top_level_fields() {
        let mut combiner = DeltaCombiner::new();
        combiner.apply(&Chunk::new("first-id", "m1", 10));
        combiner.apply(&Chunk::new("second-id", "m2", 11).with_usage(Usage {
            prompt_tokens: 1,
            completion_tokens: 2,
            total_tokens: 3,
        }));
        combiner.apply(&Chunk::new("", "", 0));

        assert_eq!(combiner.chunks_applied(), 3);
        let message = combiner.message();
        assert_eq!(message.id, "first-id");
        assert_eq!(message.model, "m2");
        assert_eq!(message.created, 11);
        assert_eq!(message.usage.map(|u| u.total_tokens), Some(3));
        assert!(message.choices.is_empty());
    }

    #[test]
    fn test_parallel_choices_stay_separate() {
        let mut combiner = DeltaCombiner::new();
        combiner.apply(
            &Chunk::new("a", "m", 1)
                .with_choice(ChoiceDelta::content(0, "zero"))
                .with_choice(ChoiceDelta::content(1, "one")),
        );
        combiner.apply(&Chunk::new("a", "m", 1).with_choice(ChoiceDelta::reasoning(1, "why")));
        let message = combiner.into_message();
        assert_eq!(message.choices[&0].content, "zero");
        assert_eq!(message.choices[&1].content, "one");
        assert_eq!(message.choices[&1].reasoning_content, "why");
    }

    #[test]
    fn test_combine_equivalence_over_arbitrary_fragments() {
        let fragments = ["a", "", "bc", "d\u{e9}f", " ", "ghij"];
        let mut combiner = DeltaCombiner::new();
        let mut expected_content = String::new();
        let mut expected_reasoning = String::new();
        let mut expected_args = String::new();
        for (i, text) in fragments.iter().enumerate() {
            let mut choice = ChoiceDelta::content(0, *text);
            choice.delta.reasoning_content = Some(text.repeat(2));
            choice
                .delta
                .tool_calls
                .push(ToolCallFragment::arguments(0, format!("{i}{text}")));
            combiner.apply(&Chunk::new("a", "m", 1).with_choice(choice));
            expected_content.push_str(text);
            expected_reasoning.push_str(&text.repeat(2));
            expected_args.push_str(&format!("{i}{text}"));
        }
        let message = combiner.into_message();
        let primary = message.primary().expect("choice 0");
        assert_eq!(primary.content, expected_content);
        assert_eq!(primary.reasoning_content, expected_reasoning);
        assert_eq!(primary.tool_calls[&0].arguments, expected_args);
    }
}
