use super::canonical::Role;

// ---------------------------------------------------------------------------
// Role mappings
// ---------------------------------------------------------------------------

#[must_use]
pub fn openai_role(s: &str) -> Role {
    match s {
        "system" | "developer" => Role::System,
        "user" => Role::User,
        "tool" => Role::Tool,
        _ => Role::Assistant,
    }
}

// ---------------------------------------------------------------------------
// Stop reason mappings
// ---------------------------------------------------------------------------

/// Map an Anthropic `stop_reason` to the outward `finish_reason` vocabulary.
#[must_use]
pub fn anthropic_stop_to_finish_reason(s: &str) -> &'static str {
    match s {
        "tool_use" => "tool_calls",
        "max_tokens" => "length",
        "refusal" => "content_filter",
        _ => "stop",
    }
}
