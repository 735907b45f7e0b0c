//! Anthropic Messages API payloads.
//!
//! Cache writes are billed as input; cache reads go to the cached tier.

use serde_json::Value;

use super::{ChunkState, count};
use crate::providers::usage::RawUsage;

fn from_usage_object(usage: &Value) -> RawUsage {
    if !usage.is_object() {
        return RawUsage::default();
    }
    let creation = count(usage, "cache_creation_input_tokens").unwrap_or(0);
    RawUsage {
        input_tokens: count(usage, "input_tokens").map(|n| n + creation),
        output_tokens: count(usage, "output_tokens"),
        cached_tokens: count(usage, "cache_read_input_tokens").filter(|n| *n > 0),
    }
}

pub(super) fn usage(body: &Value) -> RawUsage {
    body.get("usage")
        .map(from_usage_object)
        .unwrap_or_default()
}

pub(super) fn text(body: &Value) -> String {
    body.get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

pub(super) fn chunk(chunk: &Value, state: &mut ChunkState) {
    match chunk.get("type").and_then(Value::as_str) {
        Some("message_start") => {
            if let Some(message) = chunk.get("message") {
                state.record_model(message.get("model").and_then(Value::as_str));
                // The starting output count is a placeholder; the real
                // count only arrives with message_delta.
                let mut raw = usage(message);
                raw.output_tokens = None;
                state.record_usage(raw);
            }
        }
        Some("content_block_delta") => {
            if let Some(text) = chunk.pointer("/delta/text").and_then(Value::as_str) {
                state.text.push_str(text);
            }
        }
        Some("message_delta") => {
            // Cumulative output count; input was reported at message_start.
            if let Some(usage) = chunk.get("usage") {
                state.record_usage(RawUsage {
                    input_tokens: None,
                    output_tokens: count(usage, "output_tokens"),
                    cached_tokens: None,
                });
            }
        }
        _ => {}
    }
}
