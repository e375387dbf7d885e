pub mod sse;

pub use sse::{data_frame, done_frame, is_done_event, sse_frame_stream, SseParser};

/// One upstream event-stream frame.
///
/// `event` is set by typed event streams (`message_start`, ...); data-only
/// providers leave it empty. `id` is the last `id:` seen on the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    #[must_use]
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
            id: None,
        }
    }

    /// Frame name, or `""` for data-only frames.
    #[must_use]
    pub fn event_name(&self) -> &str {
        self.event.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_match_parsed_frames() {
        let mut parser = SseParser::new();
        let frames = parser.feed("event: message_stop\ndata: {}\n\ndata: [DONE]\n\n");
        assert_eq!(frames[0], SseEvent::named("message_stop", "{}"));
        assert_eq!(frames[0].event_name(), "message_stop");
        assert_eq!(frames[1], SseEvent::data("[DONE]"));
        assert_eq!(frames[1].event_name(), "");
    }
}
