//! Fallback extraction shared by adapters without a dedicated shape.

use serde_json::Value;

use super::ChunkState;

const TEXT_KEYS: &[&str] = &["text", "content", "generated_text", "output_text", "completion"];

pub(super) fn model(body: &Value) -> Option<String> {
    body.get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

fn collect_text(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                out.push(' ');
            }
            out.push_str(s);
        }
        Value::Array(items) => {
            for item in items {
                collect_text(item, out);
            }
        }
        Value::Object(map) => {
            for key in TEXT_KEYS {
                if let Some(inner) = map.get(*key) {
                    collect_text(inner, out);
                }
            }
            if let Some(parts) = map.get("parts") {
                collect_text(parts, out);
            }
        }
        _ => {}
    }
}

pub(super) fn response_text(body: &Value) -> String {
    let mut out = String::new();
    collect_text(body, &mut out);
    out
}

pub(super) fn chunk(chunk: &Value, state: &mut ChunkState) {
    state.record_model(model(chunk).as_deref());
    let mut text = String::new();
    for key in ["text", "delta", "token", "generated_text"] {
        match chunk.get(key) {
            Some(Value::String(s)) => text.push_str(s),
            Some(Value::Object(obj)) => {
                if let Some(s) = obj.get("text").and_then(Value::as_str) {
                    text.push_str(s);
                }
            }
            _ => {}
        }
    }
    state.text.push_str(&text);
}

/// Prompt text of a request body, used to estimate input tokens.
pub(super) fn request_text(body: &Value) -> String {
    let mut out = String::new();
    for key in ["system", "instructions", "prompt", "input", "message", "query"] {
        if let Some(value) = body.get(key) {
            collect_text(value, &mut out);
        }
    }
    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for message in messages {
            if let Some(content) = message.get("content") {
                collect_text(content, &mut out);
            }
        }
    }
    for key in ["contents", "systemInstruction", "system_instruction"] {
        if let Some(value) = body.get(key) {
            collect_text(value, &mut out);
        }
    }
    out
}
