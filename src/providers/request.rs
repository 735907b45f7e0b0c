//! What the interceptor learns from an outbound request before sending it.

use reqwest::header::{ACCEPT, HeaderMap};
use serde_json::Value;
use url::Url;

use super::adapter::Adapter;

/// Request-side facts used for streaming detection, model attribution and
/// input estimation.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method: String,
    /// URL path, recorded as the event endpoint.
    pub endpoint: String,
    pub streaming: bool,
    pub model: Option<String>,
    /// Prompt text extracted from the body, for input estimation.
    pub input_text: String,
    pub max_output_tokens: Option<u64>,
    pub body_size: usize,
}

impl RequestInfo {
    pub fn analyze(
        method: &str,
        url: &Url,
        headers: &HeaderMap,
        body: Option<&[u8]>,
        adapter: &Adapter,
    ) -> Self {
        let json = body
            .filter(|b| !b.is_empty())
            .and_then(|b| serde_json::from_slice::<Value>(b).ok());

        let mut info = Self {
            method: method.to_ascii_uppercase(),
            endpoint: url.path().to_string(),
            body_size: body.map(<[u8]>::len).unwrap_or(0),
            ..Default::default()
        };

        info.streaming = Self::detect_streaming(url, headers, json.as_ref());
        info.model = json
            .as_ref()
            .and_then(|v| v.get("model"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| model_from_path(url.path()));

        if let Some(json) = json.as_ref() {
            info.input_text = adapter.request_text(json);
            info.max_output_tokens = ["max_tokens", "max_completion_tokens", "max_output_tokens"]
                .iter()
                .find_map(|k| json.get(*k).and_then(Value::as_u64))
                .or_else(|| {
                    json.pointer("/generationConfig/maxOutputTokens")
                        .and_then(Value::as_u64)
                });
        }
        info
    }

    fn detect_streaming(url: &Url, headers: &HeaderMap, body: Option<&Value>) -> bool {
        if body
            .and_then(|b| b.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return true;
        }
        if url.path().contains(":streamGenerateContent") {
            return true;
        }
        if url.query_pairs().any(|(k, v)| k == "alt" && v == "sse") {
            return true;
        }
        headers
            .get_all(ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.contains("text/event-stream"))
    }
}

/// Model named in the URL path: Gemini's `models/<model>:method` and Azure's
/// `deployments/<deployment>/`.
fn model_from_path(path: &str) -> Option<String> {
    let mut segments = path.split('/');
    while let Some(segment) = segments.next() {
        if segment == "models" || segment == "deployments" {
            let next = segments.next()?;
            let model = next.split(':').next().unwrap_or(next);
            if !model.is_empty() {
                return Some(model.to_string());
            }
        }
    }
    None
}
