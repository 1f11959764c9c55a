//! Normalized adapter output.

use serde::{Deserialize, Serialize};

/// One decoded snapshot of a vendor response.
///
/// Adapters re-decode the whole captured body on every update, so `content`
/// and `reasoning_content` hold everything decoded so far for the session.
/// The last event of a session always has `done` set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedEvent {
    /// Assistant answer text.
    pub content: String,
    /// Reasoning ("thinking") text, kept apart from the answer.
    pub reasoning_content: String,
    /// JSON array of OpenAI-style tool calls, empty when there are none.
    pub tool_calls: String,
    /// Whether the stream is finished.
    pub done: bool,
}

impl DecodedEvent {
    /// Creates an event with answer text only.
    pub fn content(content: impl Into<String>, done: bool) -> Self {
        Self {
            content: content.into(),
            done,
            ..Default::default()
        }
    }

    /// Creates an empty terminal event.
    pub fn finished() -> Self {
        Self {
            done: true,
            ..Default::default()
        }
    }

    /// Returns true if the event carries tool calls.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Returns true if no text or tool calls were decoded.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.reasoning_content.is_empty() && self.tool_calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_event_is_done_and_empty() {
        let event = DecodedEvent::finished();
        assert!(event.done);
        assert!(event.is_empty());
        assert!(!event.has_tool_calls());
    }

    #[test]
    fn serializes_with_snake_case_fields() {
        let event = DecodedEvent::content("hi", false);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["content"], "hi");
        assert_eq!(json["reasoning_content"], "");
        assert_eq!(json["done"], false);
    }
}
