//! Event-stream framing for upstream bodies and the caller-facing output.
//!
//! Lines are split on raw bytes before any UTF-8 decoding, so a multi-byte
//! character cut by a read boundary is simply part of an unfinished line.
use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use memchr::memchr;

use super::SseEvent;
use crate::error::GatewayError;

const DONE_SENTINEL: &str = "[DONE]";

// ---------------------------------------------------------------------------
// Line parser
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct OpenFrame {
    event: Option<String>,
    data: Option<String>,
}

/// Incremental event-stream parser.
///
/// Accepts input cut at arbitrary byte offsets; `\n` and `\r\n` line endings
/// are both recognized. Repeated `data:` lines join with `\n`, comments and
/// unknown fields are skipped, and a frame without data is never dispatched.
#[derive(Debug, Default)]
pub struct SseParser {
    partial_line: Vec<u8>,
    frame: OpenFrame,
    last_id: Option<String>,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, text: &str) -> Vec<SseEvent> {
        let mut out = Vec::new();
        self.feed_bytes(text.as_bytes(), &mut out);
        out
    }

    pub fn feed_into(&mut self, text: &str, out: &mut Vec<SseEvent>) {
        self.feed_bytes(text.as_bytes(), out);
    }

    /// Consume raw body bytes, appending every completed frame to `out`.
    pub fn feed_bytes(&mut self, mut bytes: &[u8], out: &mut Vec<SseEvent>) {
        while let Some(pos) = memchr(b'\n', bytes) {
            let (head, rest) = bytes.split_at(pos);
            bytes = &rest[1..];
            if self.partial_line.is_empty() {
                self.take_line(head, out);
            } else {
                let mut line = std::mem::take(&mut self.partial_line);
                line.extend_from_slice(head);
                self.take_line(&line, out);
                line.clear();
                self.partial_line = line;
            }
        }
        self.partial_line.extend_from_slice(bytes);
    }

    /// End of input: treat any unfinished line and frame as complete.
    pub fn flush_into(&mut self, out: &mut Vec<SseEvent>) {
        if !self.partial_line.is_empty() {
            let line = std::mem::take(&mut self.partial_line);
            self.take_line(&line, out);
        }
        self.take_line(b"", out);
    }

    fn take_line(&mut self, line: &[u8], out: &mut Vec<SseEvent>) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            let frame = std::mem::take(&mut self.frame);
            if let Some(data) = frame.data {
                out.push(SseEvent {
                    event: frame.event,
                    data,
                    id: self.last_id.clone(),
                });
            }
            return;
        }
        if line[0] == b':' {
            return;
        }

        let (field, value) = match memchr(b':', line) {
            Some(colon) => {
                let value = &line[colon + 1..];
                (&line[..colon], value.strip_prefix(b" ").unwrap_or(value))
            }
            None => (line, &b""[..]),
        };
        let value = String::from_utf8_lossy(value);
        match field {
            b"data" => match self.frame.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(&value);
                }
                None => self.frame.data = Some(value.into_owned()),
            },
            b"event" => self.frame.event = Some(value.into_owned()),
            b"id" => self.last_id = Some(value.into_owned()),
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Outward frames
// ---------------------------------------------------------------------------

/// `true` for the `data: [DONE]` end marker of text-event-stream providers.
#[must_use]
pub fn is_done_event(event: &SseEvent) -> bool {
    event.event.is_none() && event.data.trim() == DONE_SENTINEL
}

#[must_use]
pub fn done_frame() -> String {
    data_frame(DONE_SENTINEL)
}

/// One `data:` frame carrying `payload`.
#[must_use]
pub fn data_frame(payload: &str) -> String {
    format!("data: {payload}\n\n")
}

// ---------------------------------------------------------------------------
// Byte stream adapter
// ---------------------------------------------------------------------------

struct FrameReader<S> {
    body: Pin<Box<S>>,
    parser: SseParser,
    ready: VecDeque<Result<SseEvent, GatewayError>>,
    scratch: Vec<SseEvent>,
    ended: bool,
}

impl<S, E> FrameReader<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    async fn next_frame(&mut self) -> Option<Result<SseEvent, GatewayError>> {
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Some(item);
            }
            if self.ended {
                return None;
            }
            match self.body.next().await {
                Some(Ok(bytes)) => self.parser.feed_bytes(&bytes, &mut self.scratch),
                Some(Err(err)) => {
                    self.ended = true;
                    self.ready.push_back(Err(GatewayError::Transport(err.to_string())));
                }
                None => {
                    self.ended = true;
                    self.parser.flush_into(&mut self.scratch);
                }
            }
            self.ready.extend(self.scratch.drain(..).map(Ok));
        }
    }
}

/// Turn an upstream body into event frames.
///
/// A body error becomes one [`GatewayError::Transport`] item and ends the
/// stream; the session decides what that means.
pub fn sse_frame_stream<S, E>(body: S) -> impl Stream<Item = Result<SseEvent, GatewayError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let reader = FrameReader {
        body: Box::pin(body),
        parser: SseParser::new(),
        ready: VecDeque::new(),
        scratch: Vec::new(),
        ended: false,
    };
    futures_util::stream::unfold(reader, |mut reader| async move {
        let item = reader.next_frame().await?;
        Some((item, reader))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::StreamExt;

    fn collect_frames(parts: &[&str]) -> Vec<SseEvent> {
        let mut parser = SseParser::new();
        let mut out = Vec::new();
        for part in parts {
            parser.feed_into(part, &mut out);
        }
        out
    }

    #[test]
    fn test_typed_events_keep_their_names() {
        let frames = collect_frames(&[
            "event: message_start\ndata: {\"a\":1}\n\n",
            "event: ping\ndata: {}\n\n",
        ]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        assert_eq!(frames[1], SseEvent::named("ping", "{}"));
    }

    #[test]
    fn test_frames_survive_any_cut_point() {
        let wire = "data: {\"x\":\"one\"}\r\n\r\n: keep-alive\n\ndata: two\n\n";
        for cut in 0..=wire.len() {
            let frames = collect_frames(&[&wire[..cut], &wire[cut..]]);
            let data: Vec<&str> = frames.iter().map(|f| f.data.as_str()).collect();
            assert_eq!(data, ["{\"x\":\"one\"}", "two"], "cut at {cut}");
        }
    }

    #[test]
    fn test_repeated_data_lines_join_and_empty_frames_are_skipped() {
        let frames = collect_frames(&["event: x\n\ndata:a\ndata: b\nretry: 5\n\n"]);
        assert_eq!(frames, vec![SseEvent::data("a\nb")]);
    }

    #[test]
    fn test_last_event_id_carries_forward() {
        let frames = collect_frames(&["id: 7\ndata: a\n\ndata: b\n\n"]);
        assert_eq!(frames[1].id.as_deref(), Some("7"));
    }

    #[test]
    fn test_done_marker_only_on_untyped_frames() {
        assert!(is_done_event(&SseEvent::data(" [DONE] ")));
        assert!(!is_done_event(&SseEvent::named("message", "[DONE]")));
        assert_eq!(done_frame(), "data: [DONE]\n\n");
    }

    #[test]
    fn test_flush_closes_unterminated_frame() {
        let mut parser = SseParser::new();
        let mut out = Vec::new();
        parser.feed_into("data: tail", &mut out);
        assert!(out.is_empty());
        parser.flush_into(&mut out);
        assert_eq!(out, vec![SseEvent::data("tail")]);
    }

    #[tokio::test]
    async fn test_byte_stream_rejoins_split_characters() {
        let wire = "data: \u{4f60}\u{597d}\n\n".as_bytes();
        let parts: Vec<Result<Bytes, String>> = wire
            .chunks(1)
            .map(|b| Ok(Bytes::copy_from_slice(b)))
            .collect();
        let frames: Vec<_> = sse_frame_stream(futures_util::stream::iter(parts)).collect().await;
        assert_eq!(frames, vec![Ok(SseEvent::data("\u{4f60}\u{597d}"))]);
    }

    #[tokio::test]
    async fn test_body_error_ends_the_stream() {
        let parts: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"data: one\n\n")),
            Err("connection reset".to_string()),
            Ok(Bytes::from_static(b"data: never\n\n")),
        ];
        let frames: Vec<_> = sse_frame_stream(futures_util::stream::iter(parts)).collect().await;
        assert_eq!(frames.len(), 2);
        assert!(matches!(
            &frames[1],
            Err(GatewayError::Transport(msg)) if msg.contains("reset")
        ));
    }
}
