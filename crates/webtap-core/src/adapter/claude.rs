//! claude.ai completion stream.

use serde_json::Value;

use super::{contains, sse_data_frames, ProtocolAdapter};
use crate::event::DecodedEvent;

/// Adapter for claude.ai.
///
/// The completion stream mirrors the Messages API: `content_block_start`
/// opens a thinking or text block, `content_block_delta` extends the open
/// block and `message_stop` ends the message.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaudeAdapter;

impl ClaudeAdapter {
    /// Extracts text from one frame, updating the open block kind.
    /// Returns `None` at the end of the message.
    fn frame_text<'a>(frame: &'a Value, thinking: &mut bool) -> Option<&'a str> {
        let text = match frame.get("type").and_then(Value::as_str) {
            Some("content_block_start") => {
                match frame.pointer("/content_block/type").and_then(Value::as_str) {
                    Some("thinking") => {
                        *thinking = true;
                        frame.pointer("/content_block/thinking")
                    }
                    Some("text") => {
                        *thinking = false;
                        frame.pointer("/content_block/text")
                    }
                    _ => None,
                }
            }
            Some("content_block_delta") => {
                match frame.pointer("/delta/type").and_then(Value::as_str) {
                    Some("thinking_delta") => frame.pointer("/delta/thinking"),
                    Some("text_delta") => frame.pointer("/delta/text"),
                    _ => None,
                }
            }
            Some("message_stop") => return None,
            _ => None,
        };
        Some(text.and_then(Value::as_str).unwrap_or_default())
    }
}

impl ProtocolAdapter for ClaudeAdapter {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn should_record(&self, request: &[u8]) -> bool {
        contains(request, b"/chat_conversations/") && contains(request, b"/completion")
    }

    fn decode(&self, body: &[u8], done: bool) -> Option<DecodedEvent> {
        let text = String::from_utf8_lossy(body);
        let mut frames = sse_data_frames(&text).peekable();
        frames.peek()?;

        let mut content = String::new();
        let mut reasoning = String::new();
        let mut thinking = false;
        let mut done = done;

        for data in frames {
            let Ok(frame) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            match Self::frame_text(&frame, &mut thinking) {
                Some(text) if thinking => reasoning.push_str(text),
                Some(text) => content.push_str(text),
                None => {
                    done = true;
                    break;
                }
            }
        }

        Some(DecodedEvent {
            content,
            reasoning_content: reasoning,
            tool_calls: String::new(),
            done,
        })
    }
}
