//! Cohere chat payloads (v1 `meta` and v2 `usage` layouts).

use serde_json::Value;

use super::{ChunkState, count};
use crate::providers::usage::RawUsage;

fn from_billed(container: &Value) -> RawUsage {
    let units = container
        .get("billed_units")
        .or_else(|| container.get("tokens"));
    match units {
        Some(units) => RawUsage {
            input_tokens: count(units, "input_tokens"),
            output_tokens: count(units, "output_tokens"),
            cached_tokens: None,
        },
        None => RawUsage::default(),
    }
}

pub(super) fn usage(body: &Value) -> RawUsage {
    body.get("usage")
        .or_else(|| body.get("meta"))
        .map(from_billed)
        .unwrap_or_default()
}

pub(super) fn text(body: &Value) -> String {
    if let Some(text) = body.get("text").and_then(Value::as_str) {
        return text.to_string();
    }
    body.pointer("/message/content")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

pub(super) fn chunk(chunk: &Value, state: &mut ChunkState) {
    match chunk.get("type").and_then(Value::as_str) {
        Some("content-delta") => {
            if let Some(text) = chunk
                .pointer("/delta/message/content/text")
                .and_then(Value::as_str)
            {
                state.text.push_str(text);
            }
        }
        Some("message-end") => {
            if let Some(delta) = chunk.get("delta") {
                state.record_usage(usage(delta));
            }
        }
        _ => {}
    }
    // v1 stream events
    match chunk.get("event_type").and_then(Value::as_str) {
        Some("text-generation") => {
            if let Some(text) = chunk.get("text").and_then(Value::as_str) {
                state.text.push_str(text);
            }
        }
        Some("stream-end") => {
            if let Some(response) = chunk.get("response") {
                state.record_usage(usage(response));
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_v2_usage() {
        let body = json!({
            "message": {"role": "assistant", "content": [{"type": "text", "text": "Yes"}]},
            "usage": {"billed_units": {"input_tokens": 9, "output_tokens": 1}}
        });
        let raw = usage(&body);
        assert_eq!(raw.input_tokens, Some(9));
        assert_eq!(raw.output_tokens, Some(1));
        assert_eq!(text(&body), "Yes");
    }

    #[test]
    fn test_v1_meta_usage() {
        let body = json!({"text": "ok", "meta": {"billed_units": {"input_tokens": 3, "output_tokens": 1}}});
        assert_eq!(usage(&body).input_tokens, Some(3));
        assert_eq!(text(&body), "ok");
    }

    #[test]
    fn test_v2_stream() {
        let mut state = ChunkState::default();
        chunk(
            &json!({"type": "content-delta", "delta": {"message": {"content": {"text": "Hey"}}}}),
            &mut state,
        );
        chunk(
            &json!({"type": "message-end", "delta": {"usage": {"billed_units": {"input_tokens": 2, "output_tokens": 1}}}}),
            &mut state,
        );
        assert_eq!(state.text, "Hey");
        assert_eq!(state.usage.output_tokens, Some(1));
    }
}
