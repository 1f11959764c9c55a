//! Google AI Studio `GenerateContent` stream.
//!
//! The body is a stream of positional JSON arrays. Every candidate part is
//! wrapped as `[[[null,...]],"model"]`; the inner array is matched out of the
//! raw text and interpreted by its shape.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

use super::{contains, json_text, ProtocolAdapter};
use crate::event::DecodedEvent;

static MODEL_PART: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\[\[\[null,(.*?)\]\],"model"\]"#).expect("Invalid regex pattern")
});

/// Length of a part array that carries a function call at index 10.
const FUNCTION_CALL_PART_LEN: usize = 11;

/// Adapter for aistudio.google.com.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiAdapter;

impl GeminiAdapter {
    /// Builds one OpenAI-style tool call from `[name, [[args...]]]`.
    fn tool_call(call: &[Value]) -> Value {
        let name = call.first().map(json_text).unwrap_or_default();
        let arguments = call
            .get(1)
            .and_then(Self::parse_arguments)
            .map(|args| Value::Object(args).to_string())
            .unwrap_or_default();

        json!({
            "id": "",
            "index": 0,
            "type": "function",
            "function": {
                "name": name,
                "arguments": arguments,
            }
        })
    }

    /// Decodes positional arguments. Each argument is `[name, value]` where
    /// the length of `value` encodes its type:
    ///
    /// | len | type    | payload                       |
    /// |-----|---------|-------------------------------|
    /// | 1   | null    |                               |
    /// | 2   | number  | `value[1]`                    |
    /// | 3   | string  | `value[2]`                    |
    /// | 4   | boolean | `value[3] == 1`               |
    /// | 5   | object  | `value[4]`, decoded the same way |
    fn parse_arguments(encoded: &Value) -> Option<Map<String, Value>> {
        let args = encoded.get(0)?.as_array()?;
        let mut params = Map::new();

        for arg in args.iter().filter_map(Value::as_array) {
            let Some(name) = arg.first().map(json_text) else {
                continue;
            };
            let Some(value) = arg.get(1).and_then(Value::as_array) else {
                continue;
            };

            let decoded = match value.len() {
                1 => Value::Null,
                2 => value[1].clone(),
                3 => Value::String(json_text(&value[2])),
                4 => Value::Bool(value[3].as_i64() == Some(1) || value[3].as_bool() == Some(true)),
                5 => Self::parse_arguments(&value[4])
                    .map(Value::Object)
                    .unwrap_or(Value::Null),
                _ => continue,
            };
            params.insert(name, decoded);
        }

        Some(params)
    }
}

impl ProtocolAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini-aistudio"
    }

    fn should_record(&self, request: &[u8]) -> bool {
        contains(request, b"GenerateContent")
    }

    fn decode(&self, body: &[u8], done: bool) -> Option<DecodedEvent> {
        let text = String::from_utf8_lossy(body);
        let mut matched = false;
        let mut content = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::new();

        for part in MODEL_PART.find_iter(&text) {
            matched = true;
            let Ok(value) = serde_json::from_str::<Value>(part.as_str()) else {
                continue;
            };
            let Some(arr) = value.pointer("/0/0").and_then(Value::as_array) else {
                continue;
            };

            match arr.len() {
                2 => content.push_str(&json_text(&arr[1])),
                FUNCTION_CALL_PART_LEN if arr[1].is_null() && (arr[10].is_array() || arr[10].is_object()) => {
                    if let Some(call) = arr[10].as_array() {
                        tool_calls.push(Self::tool_call(call));
                    }
                }
                n if n > 2 => reasoning.push_str(&json_text(&arr[1])),
                _ => {}
            }
        }

        if !matched {
            return None;
        }

        let tool_calls = if tool_calls.is_empty() {
            String::new()
        } else {
            Value::Array(tool_calls).to_string()
        };

        Some(DecodedEvent {
            content,
            reasoning_content: reasoning,
            tool_calls,
            done,
        })
    }
}
