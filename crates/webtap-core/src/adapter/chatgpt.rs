//! chatgpt.com conversation stream.
//!
//! The conversation endpoint streams SSE frames carrying JSON-patch style
//! deltas. A frame either names the path it writes to (`p`) or reuses the
//! path of the previous frame, so the answer/reasoning selection carries
//! across frames.

use serde_json::Value;

use super::{contains, sse_data_frames, ProtocolAdapter};
use crate::event::DecodedEvent;

const CONVERSATION_REQUESTS: [&[u8]; 2] = [
    b"/backend-api/conversation ",
    b"/backend-api/f/conversation ",
];

const THOUGHTS_PATH: &str = "/message/content/thoughts";
const PARTS_PATH: &str = "/message/content/parts";

/// Where text from a frame goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Answer,
    Reasoning,
    /// Thought summaries duplicate the reasoning and are dropped.
    Skip,
    /// Path outside the message content, keep the current selection.
    Keep,
}

fn route(path: &str) -> Route {
    if path.starts_with(THOUGHTS_PATH) && path.ends_with("/summary") {
        Route::Skip
    } else if path.starts_with(THOUGHTS_PATH) {
        Route::Reasoning
    } else if path.starts_with(PARTS_PATH) {
        Route::Answer
    } else {
        Route::Keep
    }
}

#[derive(Default)]
struct Accumulator {
    content: String,
    reasoning: String,
    thinking: bool,
}

impl Accumulator {
    /// Applies a frame or patch path. Returns false if its text must be dropped.
    fn select(&mut self, op: &Value) -> bool {
        let Some(path) = op.get("p").and_then(Value::as_str) else {
            return true;
        };
        match route(path) {
            Route::Skip => return false,
            Route::Reasoning => self.thinking = true,
            Route::Answer => self.thinking = false,
            Route::Keep => {}
        }
        true
    }

    fn push(&mut self, text: &str) {
        if self.thinking {
            self.reasoning.push_str(text);
        } else {
            self.content.push_str(text);
        }
    }

    fn apply(&mut self, frame: &Value) {
        if !self.select(frame) {
            return;
        }

        let op = frame.get("o").and_then(Value::as_str);
        match op {
            None | Some("append") => {
                if let Some(text) = frame.get("v").and_then(Value::as_str) {
                    self.push(text);
                }
            }
            Some("add") => {
                if let Some(text) = frame
                    .pointer("/v/message/content/parts/0")
                    .and_then(Value::as_str)
                {
                    self.push(text);
                }
            }
            Some("patch") => {
                let Some(patches) = frame.get("v").and_then(Value::as_array) else {
                    return;
                };
                for patch in patches {
                    if !self.select(patch) {
                        continue;
                    }
                    if patch.get("o").and_then(Value::as_str) != Some("append") {
                        continue;
                    }
                    if let Some(text) = patch.get("v").and_then(Value::as_str) {
                        self.push(text);
                    }
                }
            }
            Some(_) => {}
        }
    }
}

/// Adapter for chatgpt.com.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatGptAdapter;

impl ProtocolAdapter for ChatGptAdapter {
    fn name(&self) -> &'static str {
        "chatgpt"
    }

    fn should_record(&self, request: &[u8]) -> bool {
        CONVERSATION_REQUESTS
            .iter()
            .any(|needle| contains(request, needle))
    }

    fn decode(&self, body: &[u8], done: bool) -> Option<DecodedEvent> {
        let text = String::from_utf8_lossy(body);
        let mut frames = sse_data_frames(&text).peekable();
        frames.peek()?;

        let mut acc = Accumulator::default();
        let mut done = done;

        for data in frames {
            let data = data.trim();
            if data == "[DONE]" {
                done = true;
                break;
            }
            match serde_json::from_str::<Value>(data) {
                Ok(frame) => acc.apply(&frame),
                Err(_) => continue,
            }
        }

        Some(DecodedEvent {
            content: acc.content,
            reasoning_content: acc.reasoning,
            tool_calls: String::new(),
            done,
        })
    }
}
