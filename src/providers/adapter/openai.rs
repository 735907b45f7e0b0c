//! OpenAI-compatible payloads: chat completions, legacy completions, the
//! Responses API and embeddings.
//!
//! OpenAI reports cached prompt tokens as a subset of `prompt_tokens`; they
//! are split out so input and cached tiers are never billed twice.

use serde_json::Value;

use super::{ChunkState, count, count_at};
use crate::providers::usage::RawUsage;

fn split_cached(prompt: Option<u64>, cached: Option<u64>) -> RawUsage {
    let cached_tokens = cached.filter(|c| *c > 0);
    let input_tokens = match (prompt, cached_tokens) {
        (Some(p), Some(c)) => Some(p.saturating_sub(c)),
        (p, _) => p,
    };
    RawUsage {
        input_tokens,
        output_tokens: None,
        cached_tokens,
    }
}

fn from_usage_object(usage: &Value) -> RawUsage {
    if !usage.is_object() {
        return RawUsage::default();
    }
    // Responses API names.
    if usage.get("input_tokens").is_some() {
        let mut raw = split_cached(
            count(usage, "input_tokens"),
            count_at(usage, "/input_tokens_details/cached_tokens"),
        );
        raw.output_tokens = count(usage, "output_tokens");
        return raw;
    }
    let mut raw = split_cached(
        count(usage, "prompt_tokens"),
        count_at(usage, "/prompt_tokens_details/cached_tokens"),
    );
    raw.output_tokens = count(usage, "completion_tokens");
    // Embeddings report only prompt and total tokens.
    if raw.output_tokens.is_none() && raw.input_tokens.is_some() {
        raw.output_tokens = Some(0);
    }
    raw
}

pub(super) fn usage(body: &Value) -> RawUsage {
    if let Some(usage) = body.get("usage") {
        return from_usage_object(usage);
    }
    // Responses API wraps the object in `response` for terminal events.
    body.pointer("/response/usage")
        .map(from_usage_object)
        .unwrap_or_default()
}

pub(super) fn text(body: &Value) -> String {
    let mut out = String::new();

    if let Some(choices) = body.get("choices").and_then(Value::as_array) {
        for choice in choices {
            if let Some(content) = choice.pointer("/message/content").and_then(Value::as_str) {
                out.push_str(content);
            } else if let Some(text) = choice.get("text").and_then(Value::as_str) {
                out.push_str(text);
            }
        }
        return out;
    }

    if let Some(text) = body.get("output_text").and_then(Value::as_str) {
        return text.to_string();
    }

    if let Some(items) = body.get("output").and_then(Value::as_array) {
        for item in items {
            let Some(parts) = item.get("content").and_then(Value::as_array) else {
                continue;
            };
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    out.push_str(text);
                }
            }
        }
    }
    out
}

pub(super) fn chunk(chunk: &Value, state: &mut ChunkState) {
    state.record_model(chunk.get("model").and_then(Value::as_str));

    if let Some(choices) = chunk.get("choices").and_then(Value::as_array) {
        for choice in choices {
            if let Some(content) = choice.pointer("/delta/content").and_then(Value::as_str) {
                state.text.push_str(content);
            } else if let Some(text) = choice.get("text").and_then(Value::as_str) {
                state.text.push_str(text);
            }
        }
    }

    match chunk.get("type").and_then(Value::as_str) {
        Some("response.output_text.delta") => {
            if let Some(delta) = chunk.get("delta").and_then(Value::as_str) {
                state.text.push_str(delta);
            }
        }
        Some("response.completed") | Some("response.incomplete") => {
            state.record_model(chunk.pointer("/response/model").and_then(Value::as_str));
        }
        _ => {}
    }

    // `usage` is null on every chunk but the last when include_usage is set.
    state.record_usage(usage(chunk));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_completion_usage() {
        let body = json!({
            "model": "gpt-4o-2024-08-06",
            "choices": [{"message": {"role": "assistant", "content": "Hi there"}}],
            "usage": {"prompt_tokens": 1000, "completion_tokens": 500, "total_tokens": 1500}
        });
        let raw = usage(&body);
        assert_eq!(raw.input_tokens, Some(1000));
        assert_eq!(raw.output_tokens, Some(500));
        assert_eq!(raw.cached_tokens, None);
        assert_eq!(text(&body), "Hi there");
    }

    #[test]
    fn test_cached_tokens_split_from_prompt() {
        let body = json!({
            "usage": {
                "prompt_tokens": 2000,
                "completion_tokens": 10,
                "prompt_tokens_details": {"cached_tokens": 1500}
            }
        });
        let raw = usage(&body);
        assert_eq!(raw.input_tokens, Some(500));
        assert_eq!(raw.cached_tokens, Some(1500));
    }

    #[test]
    fn test_responses_api_usage_and_text() {
        let body = json!({
            "model": "gpt-4.1",
            "output": [{"type": "message", "content": [{"type": "output_text", "text": "Done."}]}],
            "usage": {"input_tokens": 20, "output_tokens": 3, "input_tokens_details": {"cached_tokens": 0}}
        });
        let raw = usage(&body);
        assert_eq!(raw.input_tokens, Some(20));
        assert_eq!(raw.output_tokens, Some(3));
        assert_eq!(raw.cached_tokens, None);
        assert_eq!(text(&body), "Done.");
    }

    #[test]
    fn test_embeddings_usage() {
        let body = json!({"usage": {"prompt_tokens": 8, "total_tokens": 8}});
        let raw = usage(&body);
        assert_eq!(raw.input_tokens, Some(8));
        assert_eq!(raw.output_tokens, Some(0));
    }

    #[test]
    fn test_null_usage_is_empty() {
        assert!(usage(&json!({"usage": null})).is_empty());
        assert!(usage(&json!({})).is_empty());
    }

    #[test]
    fn test_stream_chunks() {
        let mut state = ChunkState::default();
        chunk(
            &json!({"model": "gpt-4o", "choices": [{"delta": {"content": "Hel"}}], "usage": null}),
            &mut state,
        );
        chunk(
            &json!({"choices": [{"delta": {"content": "lo"}}], "usage": null}),
            &mut state,
        );
        assert_eq!(state.text, "Hello");
        assert!(!state.usage_seen);

        chunk(
            &json!({"choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 2}}),
            &mut state,
        );
        assert!(state.usage_seen);
        assert_eq!(state.usage.output_tokens, Some(2));
        assert_eq!(state.model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn test_responses_stream_events() {
        let mut state = ChunkState::default();
        chunk(&json!({"type": "response.output_text.delta", "delta": "Hi"}), &mut state);
        chunk(
            &json!({"type": "response.completed", "response": {"model": "gpt-4.1", "usage": {"input_tokens": 4, "output_tokens": 1}}}),
            &mut state,
        );
        assert_eq!(state.text, "Hi");
        assert_eq!(state.usage.input_tokens, Some(4));
        assert_eq!(state.model.as_deref(), Some("gpt-4.1"));
    }
}
