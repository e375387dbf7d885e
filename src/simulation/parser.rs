use std::borrow::Cow;

use memchr::{memchr, memchr2, memmem};

use crate::error::GatewayError;

// Incremental parser for narrated tool calls.
//
// Grammar, as produced by a model prompted with the trigger convention:
//
//   narration <TRIGGER> <function_calls>
//     <invoke name="tool"><parameter name="k">v</parameter></invoke>
//     <function_call><tool>t</tool><args_json>{...}</args_json></function_call>
//   </function_calls> narration
//
// Key invariants:
// - Narration is released as soon as it cannot be the start of the trigger
//   or of a reasoning tag; nothing is emitted twice.
// - Trigger occurrences inside `<think>`, `<thinking>`, `<reasoning>` and
//   `<analysis>` blocks are ignored.
// - A call is emitted only once its closing tag has arrived.

const REASONING_TAGS: [(&str, &str); 4] = [
    ("<think>", "</think>"),
    ("<thinking>", "</thinking>"),
    ("<reasoning>", "</reasoning>"),
    ("<analysis>", "</analysis>"),
];
const FC_OPEN: &str = "<function_calls>";
const FC_CLOSE: &str = "</function_calls>";
const INVOKE_OPEN: &str = "<invoke";
const INVOKE_CLOSE: &str = "</invoke>";
const FUNCTION_CALL_OPEN: &str = "<function_call";
const FUNCTION_CALL_CLOSE: &str = "</function_call>";
const PARAMETER_OPEN: &str = "<parameter";
const PARAMETER_CLOSE: &str = "</parameter>";
/// Text allowed between the trigger and `<function_calls>` before the
/// trigger is treated as ordinary narration.
const MAX_TRIGGER_PREAMBLE: usize = 4096;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One call extracted from a closed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCall {
    /// Id the model supplied, kept only when well-formed.
    pub id: Option<String>,
    pub name: String,
    /// Arguments as a serialized JSON object.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    Text(String),
    Call(ParsedCall),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Scanning narration for the trigger signal.
    Narration,
    /// Trigger seen, waiting for `<function_calls>`.
    AfterTrigger,
    /// Inside `<function_calls>`, extracting call blocks.
    InBlock,
    /// The trigger turned out to be prose; everything is narration now.
    Passthrough,
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SimulationParser {
    trigger: String,
    buffer: String,
    state: ParserState,
    think_depth: usize,
    max_buffer_bytes: usize,
}

impl SimulationParser {
    #[must_use]
    pub fn new(trigger: impl Into<String>, max_buffer_bytes: usize) -> Self {
        Self {
            trigger: trigger.into(),
            buffer: String::new(),
            state: ParserState::Narration,
            think_depth: 0,
            max_buffer_bytes,
        }
    }

    #[must_use]
    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Feed one text fragment.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::SimulationParse`] on a malformed call block or
    /// when a call block outgrows the buffer cap.
    pub fn push(&mut self, text: &str) -> Result<Vec<ParseEvent>, GatewayError> {
        let mut events = Vec::new();
        if text.is_empty() {
            return Ok(events);
        }
        self.buffer.push_str(text);
        self.drive(&mut events)?;
        if self.buffer.len() > self.max_buffer_bytes {
            return Err(GatewayError::SimulationParse(format!(
                "tool-call buffer exceeded {} bytes",
                self.max_buffer_bytes
            )));
        }
        Ok(events)
    }

    /// End of input: flush narration and validate what is left.
    ///
    /// A block whose only missing piece is `</function_calls>` is accepted.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::SimulationParse`] when a call block was left
    /// unclosed.
    pub fn finish(&mut self) -> Result<Vec<ParseEvent>, GatewayError> {
        let mut events = Vec::new();
        self.drive(&mut events)?;
        let rest = std::mem::take(&mut self.buffer);
        match self.state {
            ParserState::Narration | ParserState::Passthrough => push_text(&mut events, rest),
            ParserState::AfterTrigger => {
                // The trigger was never followed by a block.
                let mut text = self.trigger.clone();
                text.push_str(&rest);
                push_text(&mut events, text);
            }
            ParserState::InBlock => {
                let trimmed = rest.trim_start();
                if trimmed.starts_with(INVOKE_OPEN) {
                    return Err(GatewayError::SimulationParse(
                        "unclosed <invoke> at end of stream".to_string(),
                    ));
                }
                if opens_function_call(trimmed) {
                    return Err(GatewayError::SimulationParse(
                        "unclosed <function_call> at end of stream".to_string(),
                    ));
                }
                if !trimmed.is_empty() {
                    tracing::debug!(
                        trailing_len = trimmed.len(),
                        "ignoring trailing text inside unterminated function_calls block"
                    );
                }
            }
        }
        self.state = ParserState::Passthrough;
        Ok(events)
    }

    fn drive(&mut self, events: &mut Vec<ParseEvent>) -> Result<(), GatewayError> {
        loop {
            let progressed = match self.state {
                ParserState::Narration => self.scan_narration(events),
                ParserState::AfterTrigger => self.scan_after_trigger(events),
                ParserState::InBlock => self.scan_block(events)?,
                ParserState::Passthrough => {
                    let text = std::mem::take(&mut self.buffer);
                    push_text(events, text);
                    false
                }
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    // -- Narration ------------------------------------------------------------

    /// Returns `true` when the trigger was found and the state changed.
    fn scan_narration(&mut self, events: &mut Vec<ParseEvent>) -> bool {
        let trigger = self.trigger.as_bytes();
        let Some(&trigger_first) = trigger.first() else {
            let text = std::mem::take(&mut self.buffer);
            push_text(events, text);
            return false;
        };

        let bytes = self.buffer.as_bytes();
        let mut i = 0usize;
        let mut trigger_at = None;
        let mut hold_from = None;
        while let Some(rel) = memchr2(b'<', trigger_first, &bytes[i..]) {
            let at = i + rel;
            let rest = &bytes[at..];
            if let Some(len) = reasoning_open_len(rest) {
                self.think_depth += 1;
                i = at + len;
                continue;
            }
            if let Some(len) = reasoning_close_len(rest) {
                self.think_depth = self.think_depth.saturating_sub(1);
                i = at + len;
                continue;
            }
            if self.think_depth == 0 && rest.starts_with(trigger) {
                trigger_at = Some(at);
                break;
            }
            if (self.think_depth == 0 && is_proper_prefix(rest, trigger))
                || is_partial_reasoning_tag(rest)
            {
                hold_from = Some(at);
                break;
            }
            i = at + 1;
        }

        if let Some(at) = trigger_at {
            let after = self.buffer.split_off(at + self.trigger.len());
            self.buffer.truncate(at);
            let before = std::mem::replace(&mut self.buffer, after);
            push_text(events, before);
            self.state = ParserState::AfterTrigger;
            return true;
        }

        let emit_len = hold_from.unwrap_or(self.buffer.len());
        let held = self.buffer.split_off(emit_len);
        let text = std::mem::replace(&mut self.buffer, held);
        push_text(events, text);
        false
    }

    // -- After trigger --------------------------------------------------------

    fn scan_after_trigger(&mut self, events: &mut Vec<ParseEvent>) -> bool {
        if let Some(at) = memmem::find(self.buffer.as_bytes(), FC_OPEN.as_bytes()) {
            self.buffer.drain(..at + FC_OPEN.len());
            self.state = ParserState::InBlock;
            return true;
        }
        if self.buffer.len() > MAX_TRIGGER_PREAMBLE {
            tracing::debug!("trigger not followed by a function_calls block, passing through");
            let mut text = self.trigger.clone();
            text.push_str(&std::mem::take(&mut self.buffer));
            push_text(events, text);
            self.state = ParserState::Passthrough;
            return true;
        }
        false
    }

    // -- Inside <function_calls> ----------------------------------------------

    fn scan_block(&mut self, events: &mut Vec<ParseEvent>) -> Result<bool, GatewayError> {
        loop {
            let skip = self.buffer.len() - self.buffer.trim_start().len();
            if skip > 0 {
                self.buffer.drain(..skip);
            }
            let rest = self.buffer.as_str();
            if rest.is_empty() {
                return Ok(false);
            }

            if rest.starts_with(FC_CLOSE) {
                self.buffer.drain(..FC_CLOSE.len());
                self.state = ParserState::Narration;
                return Ok(true);
            }

            if rest.starts_with(INVOKE_OPEN) {
                let Some(end) = memmem::find(rest.as_bytes(), INVOKE_CLOSE.as_bytes()) else {
                    return Ok(false);
                };
                let block_end = end + INVOKE_CLOSE.len();
                let call = parse_invoke_block(&rest[..block_end])?;
                events.push(ParseEvent::Call(call));
                self.buffer.drain(..block_end);
                continue;
            }

            if opens_function_call(rest) {
                let Some(end) = memmem::find(rest.as_bytes(), FUNCTION_CALL_CLOSE.as_bytes())
                else {
                    return Ok(false);
                };
                let block_end = end + FUNCTION_CALL_CLOSE.len();
                let call = parse_function_call_block(&rest[..block_end])?;
                events.push(ParseEvent::Call(call));
                self.buffer.drain(..block_end);
                continue;
            }

            let bytes = rest.as_bytes();
            if [FC_CLOSE, INVOKE_OPEN, FUNCTION_CALL_OPEN]
                .iter()
                .any(|tag| is_proper_prefix(bytes, tag.as_bytes()))
                || (rest.starts_with(FUNCTION_CALL_OPEN) && rest.len() == FUNCTION_CALL_OPEN.len())
            {
                return Ok(false);
            }

            // Stray text or an unknown tag between calls: skip to the next '<'.
            match memchr(b'<', &bytes[1..]) {
                Some(rel) => {
                    self.buffer.drain(..=rel);
                }
                None => {
                    if rest.starts_with('<') {
                        return Ok(false);
                    }
                    self.buffer.clear();
                    return Ok(false);
                }
            }
        }
    }
}

fn push_text(events: &mut Vec<ParseEvent>, text: String) {
    if text.is_empty() {
        return;
    }
    if let Some(ParseEvent::Text(last)) = events.last_mut() {
        last.push_str(&text);
        return;
    }
    events.push(ParseEvent::Text(text));
}

#[inline]
fn is_proper_prefix(rest: &[u8], needle: &[u8]) -> bool {
    rest.len() < needle.len() && needle.starts_with(rest)
}

/// `<function_call` followed by `>` or whitespace; never `<function_calls>`.
#[inline]
fn opens_function_call(rest: &str) -> bool {
    rest.strip_prefix(FUNCTION_CALL_OPEN)
        .and_then(|after| after.as_bytes().first())
        .is_some_and(|&b| b == b'>' || b.is_ascii_whitespace())
}

#[inline]
fn reasoning_open_len(rest: &[u8]) -> Option<usize> {
    REASONING_TAGS
        .iter()
        .find(|(open, _)| rest.starts_with(open.as_bytes()))
        .map(|(open, _)| open.len())
}

#[inline]
fn reasoning_close_len(rest: &[u8]) -> Option<usize> {
    REASONING_TAGS
        .iter()
        .find(|(_, close)| rest.starts_with(close.as_bytes()))
        .map(|(_, close)| close.len())
}

#[inline]
fn is_partial_reasoning_tag(rest: &[u8]) -> bool {
    REASONING_TAGS.iter().any(|(open, close)| {
        is_proper_prefix(rest, open.as_bytes()) || is_proper_prefix(rest, close.as_bytes())
    })
}

// ---------------------------------------------------------------------------
// Block parsing
// ---------------------------------------------------------------------------

/// Parse one `<invoke name="..">..</invoke>` block.
fn parse_invoke_block(block: &str) -> Result<ParsedCall, GatewayError> {
    match parse_invoke_fast(block) {
        Ok(call) => Ok(call),
        Err(fast_err) => parse_invoke_strict(block).map_err(|strict_err| {
            tracing::debug!(error = %strict_err, "strict invoke parse failed");
            fast_err
        }),
    }
}

fn parse_invoke_fast(block: &str) -> Result<ParsedCall, GatewayError> {
    let open_end = memchr(b'>', block.as_bytes())
        .ok_or_else(|| parse_error("unterminated <invoke> tag"))?;
    let open_tag = &block[..open_end];
    let name = extract_attr_ascii(open_tag, b"name")
        .filter(|name| !name.is_empty())
        .ok_or_else(|| parse_error("<invoke> without a name attribute"))?;
    let id = extract_attr_ascii(open_tag, b"id").and_then(normalize_call_id);

    let body_end = block.len() - INVOKE_CLOSE.len();
    let body = block.get(open_end + 1..body_end).unwrap_or_default();
    let mut params = serde_json::Map::new();
    let mut cursor = 0usize;
    while let Some(rel) = memmem::find(&body.as_bytes()[cursor..], PARAMETER_OPEN.as_bytes()) {
        let tag_start = cursor + rel;
        let tag_end = tag_start
            + memchr(b'>', &body.as_bytes()[tag_start..])
                .ok_or_else(|| parse_error("unterminated <parameter> tag"))?;
        let param_name = extract_attr_ascii(&body[tag_start..tag_end], b"name")
            .filter(|name| !name.is_empty())
            .ok_or_else(|| parse_error("<parameter> without a name attribute"))?;
        let value_start = tag_end + 1;
        let value_len = memmem::find(&body.as_bytes()[value_start..], PARAMETER_CLOSE.as_bytes())
            .ok_or_else(|| parse_error("unclosed <parameter>"))?;
        let raw = &body[value_start..value_start + value_len];
        params.insert(param_name.to_string(), parameter_value(raw));
        cursor = value_start + value_len + PARAMETER_CLOSE.len();
    }

    Ok(ParsedCall {
        id,
        name: name.to_string(),
        arguments: serde_json::Value::Object(params).to_string(),
    })
}

/// Strict reader for blocks the byte scanner rejects (attributes quoted
/// unusually, entities in names, nested markup in values).
fn parse_invoke_strict(block: &str) -> Result<ParsedCall, GatewayError> {
    use quick_xml::events::{BytesStart, Event};
    use quick_xml::Reader;

    fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
        e.attributes()
            .flatten()
            .find(|attr| attr.key.as_ref() == key)
            .and_then(|attr| attr.unescape_value().ok().map(|v| v.trim().to_string()))
    }

    let mut reader = Reader::from_str(block);
    let mut name: Option<String> = None;
    let mut id: Option<String> = None;
    let mut params = serde_json::Map::new();
    let mut current: Option<(String, String)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"invoke" => {
                    name = attr(e, b"name");
                    id = attr(e, b"id").as_deref().and_then(normalize_call_id);
                }
                b"parameter" => {
                    let param = attr(e, b"name")
                        .filter(|n| !n.is_empty())
                        .ok_or_else(|| parse_error("<parameter> without a name attribute"))?;
                    current = Some((param, String::new()));
                }
                _ => {}
            },
            Ok(Event::Text(ref e)) => {
                if let Some((_, text)) = current.as_mut() {
                    match e.unescape() {
                        Ok(cow) => text.push_str(&cow),
                        Err(_) => text.push_str(&String::from_utf8_lossy(e.as_ref())),
                    }
                }
            }
            Ok(Event::CData(ref e)) => {
                if let Some((_, text)) = current.as_mut() {
                    text.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"parameter" => {
                if let Some((param, text)) = current.take() {
                    params.insert(param, coerce_json_value(&text));
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(parse_error(&format!("XML parse error: {err}"))),
            _ => {}
        }
    }

    let name = name
        .filter(|name| !name.is_empty())
        .ok_or_else(|| parse_error("<invoke> without a name attribute"))?;
    Ok(ParsedCall {
        id,
        name,
        arguments: serde_json::Value::Object(params).to_string(),
    })
}

/// Parse one `<function_call>..</function_call>` block.
fn parse_function_call_block(block: &str) -> Result<ParsedCall, GatewayError> {
    let open_end = memchr(b'>', block.as_bytes())
        .ok_or_else(|| parse_error("unterminated <function_call> tag"))?;
    let open_tag = &block[..open_end];
    let body_end = block.len() - FUNCTION_CALL_CLOSE.len();
    let body = block.get(open_end + 1..body_end).unwrap_or_default();

    let name = extract_tag_text(body, "<tool>", "</tool>")
        .map(|name| decode_xml_entities(name.trim()).into_owned())
        .or_else(|| extract_attr_ascii(open_tag, b"name").map(str::to_string))
        .filter(|name| !name.is_empty())
        .ok_or_else(|| parse_error("<function_call> without a tool name"))?;

    let id = extract_attr_ascii(open_tag, b"id")
        .and_then(normalize_call_id)
        .or_else(|| extract_tag_text(body, "<id>", "</id>").and_then(normalize_call_id));

    let raw_args = extract_tag_text(body, "<args_json>", "</args_json>")
        .or_else(|| extract_tag_text(body, "<arguments>", "</arguments>"))
        .unwrap_or_default();
    let arguments = parse_args_object(raw_args)?;

    Ok(ParsedCall {
        id,
        name,
        arguments,
    })
}

/// Arguments must be a JSON object; an empty body means `{}`.
fn parse_args_object(raw: &str) -> Result<String, GatewayError> {
    let unwrapped = unwrap_cdata(raw.trim());
    let trimmed = unwrapped.trim();
    if trimmed.is_empty() {
        return Ok("{}".to_string());
    }
    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => serde_json::from_str(&decode_xml_entities(trimmed))
            .map_err(|err| parse_error(&format!("arguments are not valid JSON: {err}")))?,
    };
    if !value.is_object() {
        return Err(parse_error(&format!(
            "arguments must be a JSON object, got {}",
            kind_label(&value)
        )));
    }
    Ok(value.to_string())
}

fn parameter_value(raw: &str) -> serde_json::Value {
    let unwrapped = unwrap_cdata(raw);
    if matches!(unwrapped, Cow::Owned(_)) {
        return coerce_json_value(&unwrapped);
    }
    coerce_json_value(&decode_xml_entities(raw))
}

fn parse_error(message: &str) -> GatewayError {
    GatewayError::SimulationParse(message.to_string())
}

// ---------------------------------------------------------------------------
// Scalar helpers
// ---------------------------------------------------------------------------

fn extract_attr_ascii<'a>(tag: &'a str, attr: &[u8]) -> Option<&'a str> {
    let bytes = tag.as_bytes();
    let mut search_from = 0usize;
    while let Some(rel) = memmem::find(&bytes[search_from..], attr) {
        let name_start = search_from + rel;
        let name_end = name_start + attr.len();
        search_from = name_start + 1;
        if name_start > 0 && is_ascii_attr_char(bytes[name_start - 1]) {
            continue;
        }
        let mut idx = name_end;
        while bytes.get(idx).is_some_and(u8::is_ascii_whitespace) {
            idx += 1;
        }
        if bytes.get(idx) != Some(&b'=') {
            continue;
        }
        idx += 1;
        while bytes.get(idx).is_some_and(u8::is_ascii_whitespace) {
            idx += 1;
        }
        let quote = *bytes.get(idx)?;
        if quote != b'"' && quote != b'\'' {
            continue;
        }
        let value_start = idx + 1;
        let value_len = memchr(quote, &bytes[value_start..])?;
        return tag.get(value_start..value_start + value_len).map(str::trim);
    }
    None
}

#[inline]
const fn is_ascii_attr_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-' | b':')
}

fn extract_tag_text<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let bytes = text.as_bytes();
    let start = memmem::find(bytes, open.as_bytes())? + open.len();
    let len = memmem::find(&bytes[start..], close.as_bytes())?;
    text.get(start..start + len)
}

/// Model-supplied ids survive only when short and made of `[A-Za-z0-9_-]`.
fn normalize_call_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > 128 {
        return None;
    }
    trimmed
        .bytes()
        .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-'))
        .then(|| trimmed.to_string())
}

/// Concatenate the inner content of every CDATA section, or borrow the
/// input unchanged when there is none.
fn unwrap_cdata(text: &str) -> Cow<'_, str> {
    const CDATA_OPEN: &[u8] = b"<![CDATA[";
    const CDATA_CLOSE: &[u8] = b"]]>";

    let bytes = text.as_bytes();
    let mut out: Option<String> = None;
    let mut cursor = 0usize;
    while let Some(open_rel) = memmem::find(&bytes[cursor..], CDATA_OPEN) {
        let content_start = cursor + open_rel + CDATA_OPEN.len();
        let Some(close_rel) = memmem::find(&bytes[content_start..], CDATA_CLOSE) else {
            return Cow::Borrowed(text);
        };
        let content_end = content_start + close_rel;
        if let Some(part) = text.get(content_start..content_end) {
            out.get_or_insert_with(|| String::with_capacity(text.len()))
                .push_str(part);
        }
        cursor = content_end + CDATA_CLOSE.len();
    }
    out.map_or(Cow::Borrowed(text), Cow::Owned)
}

fn decode_xml_entities(text: &str) -> Cow<'_, str> {
    if memchr(b'&', text.as_bytes()).is_none() {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let (decoded, consumed) = [
            ("&amp;", '&'),
            ("&lt;", '<'),
            ("&gt;", '>'),
            ("&quot;", '"'),
            ("&apos;", '\''),
        ]
        .iter()
        .find(|(entity, _)| rest.starts_with(entity))
        .map_or(('&', 1), |(entity, ch)| (*ch, entity.len()));
        out.push(decoded);
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    Cow::Owned(out)
}

/// Parameter values that look like JSON are parsed; everything else is a
/// JSON string.
fn coerce_json_value(s: &str) -> serde_json::Value {
    let trimmed = s.trim();
    let looks_like_json = trimmed
        .as_bytes()
        .first()
        .is_some_and(|b| matches!(b, b'{' | b'[' | b'-' | b'0'..=b'9' | b't' | b'f' | b'n'));
    if looks_like_json {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return value;
        }
    }
    serde_json::Value::String(s.to_string())
}

fn kind_label(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const TRIGGER: &str = "<Function_AB12_Start/>";

    fn parser() -> SimulationParser {
        SimulationParser::new(TRIGGER, 64 * 1024)
    }

    fn run(parts: &[&str]) -> Result<Vec<ParseEvent>, GatewayError> {
        let mut p = parser();
        let mut events = Vec::new();
        for part in parts {
            for event in p.push(part)? {
                match (events.last_mut(), event) {
                    (Some(ParseEvent::Text(last)), ParseEvent::Text(text)) => last.push_str(&text),
                    (_, event) => events.push(event),
                }
            }
        }
        for event in p.finish()? {
            match (events.last_mut(), event) {
                (Some(ParseEvent::Text(last)), ParseEvent::Text(text)) => last.push_str(&text),
                (_, event) => events.push(event),
            }
        }
        Ok(events)
    }

    fn calls(events: &[ParseEvent]) -> Vec<&ParsedCall> {
        events
            .iter()
            .filter_map(|event| match event {
                ParseEvent::Call(call) => Some(call),
                ParseEvent::Text(_) => None,
            })
            .collect()
    }

    fn text(events: &[ParseEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                ParseEvent::Text(text) => Some(text.as_str()),
                ParseEvent::Call(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_plain_narration_passes_through() {
        let events = run(&["Hello, ", "world < 3"]).expect("events");
        assert_eq!(text(&events), "Hello, world < 3");
        assert!(calls(&events).is_empty());
    }

    #[test]
    fn test_invoke_and_function_call_blocks() {
        let input = format!(
            "Let me check.{TRIGGER}\n<function_calls>\n\
             <invoke name=\"get_weather\"><parameter name=\"city\">Paris</parameter>\
             <parameter name=\"days\">3</parameter></invoke>\n\
             <function_call id=\"call_model_1\"><tool>search</tool>\
             <args_json><![CDATA[{{\"q\":\"rust\"}}]]></args_json></function_call>\n\
             </function_calls>"
        );
        let events = run(&[&input]).expect("events");
        assert_eq!(text(&events), "Let me check.");
        let found = calls(&events);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "get_weather");
        assert_eq!(found[0].arguments, r#"{"city":"Paris","days":3}"#);
        assert!(found[0].id.is_none());
        assert_eq!(found[1].name, "search");
        assert_eq!(found[1].arguments, r#"{"q":"rust"}"#);
        assert_eq!(found[1].id.as_deref(), Some("call_model_1"));
    }

    #[test]
    fn test_result_is_independent_of_fragmentation() {
        let input = format!(
            "Sure{TRIGGER}<function_calls><invoke name=\"a\"><parameter name=\"x\">1</parameter></invoke>\
             <invoke name=\"b\"></invoke></function_calls> done"
        );
        let whole = run(&[&input]).expect("whole");
        for split in 1..input.len() {
            if !input.is_char_boundary(split) {
                continue;
            }
            let (left, right) = input.split_at(split);
            assert_eq!(run(&[left, right]).expect("split"), whole, "split at {split}");
        }
        assert_eq!(text(&whole), "Sure done");
        assert_eq!(calls(&whole).len(), 2);
    }

    #[test]
    fn test_trigger_inside_reasoning_is_ignored() {
        let input = format!("<think>maybe {TRIGGER}</think>answer");
        let events = run(&[&input]).expect("events");
        assert_eq!(text(&events), input);
        assert!(calls(&events).is_empty());
    }

    #[test]
    fn test_missing_function_calls_close_is_accepted() {
        let input = format!("{TRIGGER}<function_calls><invoke name=\"a\"></invoke>\n");
        let events = run(&[&input]).expect("events");
        assert_eq!(calls(&events).len(), 1);
        assert_eq!(calls(&events)[0].arguments, "{}");
    }

    #[test]
    fn test_unclosed_invoke_is_a_parse_error() {
        let input = format!("{TRIGGER}<function_calls><invoke name=\"a\"><parameter name=\"x\">1");
        let err = run(&[&input]).unwrap_err();
        assert!(matches!(err, GatewayError::SimulationParse(_)));
    }

    #[test]
    fn test_invoke_without_name_is_a_parse_error() {
        let input = format!("{TRIGGER}<function_calls><invoke><parameter name=\"x\">1</parameter></invoke>");
        let err = run(&[&input]).unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn test_non_object_arguments_are_a_parse_error() {
        let input = format!(
            "{TRIGGER}<function_calls><function_call><tool>t</tool><args_json>[1,2]</args_json></function_call>"
        );
        let err = run(&[&input]).unwrap_err();
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn test_buffer_cap_is_enforced_inside_block() {
        let mut p = SimulationParser::new(TRIGGER, 128);
        let first = format!("{TRIGGER}<function_calls><invoke name=\"a\"><parameter name=\"x\">");
        p.push(&first).expect("first");
        let err = p.push(&"x".repeat(200)).unwrap_err();
        assert!(err.to_string().contains("exceeded"));
    }

    #[test]
    fn test_trigger_without_block_becomes_text() {
        let input = format!("odd {TRIGGER} mention");
        let events = run(&[&input]).expect("events");
        assert_eq!(text(&events), input);
    }

    #[test]
    fn test_entities_and_json_values_in_parameters() {
        let input = format!(
            "{TRIGGER}<function_calls><invoke name=\"f\">\
             <parameter name=\"expr\">a &lt; b</parameter>\
             <parameter name=\"obj\">{{\"k\":[1,2]}}</parameter>\
             <parameter name=\"flag\">true</parameter></invoke></function_calls>"
        );
        let events = run(&[&input]).expect("events");
        let call = calls(&events)[0].clone();
        let args: serde_json::Value = serde_json::from_str(&call.arguments).expect("json");
        assert_eq!(args["expr"], "a < b");
        assert_eq!(args["obj"]["k"][1], 2);
        assert_eq!(args["flag"], true);
    }

    #[test]
    fn test_malformed_model_ids_are_dropped() {
        assert_eq!(normalize_call_id(" call_1 ").as_deref(), Some("call_1"));
        assert!(normalize_call_id("bad id").is_none());
        assert!(normalize_call_id("").is_none());
    }

    #[test]
    fn test_strict_tier_accepts_single_quoted_entities_in_names() {
        let block = "<invoke name='a&amp;b'><parameter name='k'><![CDATA[v]]></parameter></invoke>";
        let call = parse_invoke_strict(block).expect("call");
        assert_eq!(call.name, "a&b");
        assert_eq!(call.arguments, r#"{"k":"v"}"#);
    }
}
