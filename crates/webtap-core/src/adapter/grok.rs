//! grok.com conversation stream.
//!
//! Responses are newline-delimited JSON. Token lines carry incremental text
//! flagged with `isThinking`; a `modelResponse` line carries the complete
//! answer and reasoning and replaces whatever was accumulated.

use serde_json::Value;

use super::{contains, ProtocolAdapter};
use crate::event::DecodedEvent;

/// Adapter for grok.com.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrokAdapter;

impl ProtocolAdapter for GrokAdapter {
    fn name(&self) -> &'static str {
        "grok"
    }

    fn should_record(&self, request: &[u8]) -> bool {
        contains(request, b"rest/app-chat/conversations/new")
            || (contains(request, b"rest/app-chat/conversations/")
                && contains(request, b"/responses"))
    }

    fn decode(&self, body: &[u8], done: bool) -> Option<DecodedEvent> {
        let text = String::from_utf8_lossy(body);
        let mut content = String::new();
        let mut reasoning = String::new();
        let mut recognized = false;

        for line in text.split('\n') {
            let Ok(value) = serde_json::from_str::<Value>(line.trim()) else {
                continue;
            };
            let Some(response) = value.pointer("/result/response") else {
                continue;
            };
            recognized = true;

            match response.get("modelResponse").filter(|v| !v.is_null()) {
                None => {
                    let Some(token) = response.get("token").and_then(Value::as_str) else {
                        continue;
                    };
                    match response.get("isThinking").and_then(Value::as_bool) {
                        Some(true) => reasoning.push_str(token),
                        Some(false) => content.push_str(token),
                        None => {}
                    }
                }
                Some(model_response) => {
                    if let Some(message) = model_response.get("message").and_then(Value::as_str) {
                        content = message.to_string();
                    }
                    if let Some(trace) = model_response
                        .get("thinkingTrace")
                        .and_then(Value::as_str)
                    {
                        reasoning = trace.to_string();
                    }
                }
            }
        }

        recognized.then(|| DecodedEvent {
            content,
            reasoning_content: reasoning,
            tool_calls: String::new(),
            done,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKENS: &str = concat!(
        "{\"result\":{\"conversation\":{\"conversationId\":\"c1\"}}}\n",
        "{\"result\":{\"response\":{\"token\":\"Hmm\",\"isThinking\":true}}}\n",
        "{\"result\":{\"response\":{\"token\":\"Hello\",\"isThinking\":false}}}\n",
        "{\"result\":{\"response\":{\"token\":\" world\",\"isThinking\":false}}}\n",
        "{\"result\":{\"response\":{\"token\":\"untagged\"}}}\n",
    );

    #[test]
    fn records_new_and_follow_up_conversations() {
        let adapter = GrokAdapter;
        assert!(adapter.should_record(b"POST /rest/app-chat/conversations/new HTTP/1.1\r\n"));
        assert!(adapter.should_record(
            b"POST /rest/app-chat/conversations/c1/responses HTTP/1.1\r\n"
        ));
        assert!(!adapter.should_record(b"GET /rest/app-chat/conversations/c1 HTTP/1.1\r\n"));
    }

    #[test]
    fn tokens_are_routed_by_thinking_flag() {
        let event = GrokAdapter.decode(TOKENS.as_bytes(), false).unwrap();
        assert_eq!(event.content, "Hello world");
        assert_eq!(event.reasoning_content, "Hmm");
        assert!(!event.done);
    }

    #[test]
    fn model_response_replaces_accumulated_text() {
        let mut body = TOKENS.to_string();
        body.push_str(
            "{\"result\":{\"response\":{\"modelResponse\":{\"message\":\"Final answer\",\"thinkingTrace\":\"Full trace\"}}}}\n",
        );

        let event = GrokAdapter.decode(body.as_bytes(), true).unwrap();
        assert_eq!(event.content, "Final answer");
        assert_eq!(event.reasoning_content, "Full trace");
        assert!(event.done);
    }

    #[test]
    fn partial_trailing_line_is_ignored() {
        let mut body = TOKENS.to_string();
        body.push_str("{\"result\":{\"response\":{\"tok");
        let event = GrokAdapter.decode(body.as_bytes(), false).unwrap();
        assert_eq!(event.content, "Hello world");
    }

    #[test]
    fn unrelated_body_decodes_to_nothing() {
        assert!(GrokAdapter.decode(b"<html></html>", true).is_none());
    }
}
