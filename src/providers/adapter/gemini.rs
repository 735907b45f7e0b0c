//! Google Gemini `generateContent` / `streamGenerateContent` payloads.

use serde_json::Value;

use super::{ChunkState, count};
use crate::providers::usage::RawUsage;

pub(super) fn usage(body: &Value) -> RawUsage {
    let Some(meta) = body.get("usageMetadata").filter(|m| m.is_object()) else {
        return RawUsage::default();
    };
    let cached = count(meta, "cachedContentTokenCount").filter(|n| *n > 0);
    let prompt = count(meta, "promptTokenCount");
    let thoughts = count(meta, "thoughtsTokenCount").unwrap_or(0);
    RawUsage {
        input_tokens: match (prompt, cached) {
            (Some(p), Some(c)) => Some(p.saturating_sub(c)),
            (p, _) => p,
        },
        output_tokens: count(meta, "candidatesTokenCount").map(|n| n + thoughts),
        cached_tokens: cached,
    }
}

pub(super) fn text(body: &Value) -> String {
    let mut out = String::new();
    let Some(candidates) = body.get("candidates").and_then(Value::as_array) else {
        return out;
    };
    for candidate in candidates {
        let Some(parts) = candidate
            .pointer("/content/parts")
            .and_then(Value::as_array)
        else {
            continue;
        };
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                out.push_str(text);
            }
        }
    }
    out
}

pub(super) fn model(body: &Value) -> Option<String> {
    body.get("modelVersion")
        .or_else(|| body.get("model"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub(super) fn chunk(chunk: &Value, state: &mut ChunkState) {
    state.text.push_str(&text(chunk));
    state.record_model(model(chunk).as_deref());
    // usageMetadata is cumulative; the last chunk wins.
    state.record_usage(usage(chunk));
}
