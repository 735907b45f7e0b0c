//! Provider identification and usage extraction.
//!
//! A destination host selects a [`ProviderInfo`] through the
//! [`ProviderRegistry`]; its [`Adapter`] knows the provider's response shape.
//! Usage is resolved through an ordered fallback chain:
//!
//! 1. explicit usage in the final response body,
//! 2. usage carried by the last streamed chunk,
//! 3. tokenizer count of the observed text (`tokenizer` feature),
//! 4. word-count heuristic.
//!
//! Malformed, binary or empty bodies degrade to an estimate or to zero; no
//! extraction path returns an error.

pub mod adapter;
mod estimate;
mod json_stream;
mod registry;
mod request;
mod sse;
mod usage;

pub use adapter::{Adapter, ChunkState, UsageParser};
pub use estimate::{TOKENS_PER_WORD, estimate_tokens, heuristic_tokens};
pub use registry::{ProviderCategory, ProviderInfo, ProviderRegistry, UNKNOWN_PROVIDER};
pub use json_stream::JsonArrayDecoder;
pub use request::RequestInfo;
pub use sse::SseDecoder;
pub use usage::{RawUsage, Usage, UsageSource};

use serde_json::Value;

fn combine(current: Option<UsageSource>, next: UsageSource) -> Option<UsageSource> {
    Some(current.map_or(next, |c| c.weakest(next)))
}

/// Completes `raw` with estimates for the fields it lacks.
fn resolve(
    raw: RawUsage,
    base: UsageSource,
    provider: &ProviderInfo,
    model: Option<String>,
    request: &RequestInfo,
    output_text: &str,
    allow_estimate: bool,
) -> Usage {
    let mut source = (!raw.is_empty()).then_some(base);

    let mut estimate = |text: &str, source: &mut Option<UsageSource>| -> u64 {
        if !allow_estimate {
            return 0;
        }
        let (count, how) = estimate_tokens(text, &provider.name, model.as_deref());
        if count > 0 {
            *source = combine(*source, how);
        }
        count
    };

    let input_tokens = match raw.input_tokens {
        Some(n) => n,
        None => estimate(&request.input_text, &mut source),
    };
    let output_tokens = match raw.output_tokens {
        Some(n) => n,
        None => estimate(output_text, &mut source),
    };

    Usage {
        input_tokens,
        output_tokens,
        cached_tokens: raw.cached_tokens.unwrap_or(0),
        model,
        source: source.unwrap_or_default(),
    }
}

fn trim_leading(body: &[u8]) -> &[u8] {
    let start = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(body.len());
    &body[start..]
}

fn looks_like_event_stream(body: &[u8]) -> bool {
    let head = trim_leading(body);
    head.starts_with(b"data:") || head.starts_with(b"event:") || head.starts_with(b":")
}

/// Bodies that are a JSON array of chunks (Gemini streaming without SSE).
fn looks_like_chunk_array(body: &[u8]) -> bool {
    trim_leading(body).starts_with(b"[")
}

/// Usage for a fully buffered response body.
///
/// `allow_estimate` is false for failed calls: only usage the provider
/// reported explicitly is attributed to them.
pub fn extract_usage(
    provider: &ProviderInfo,
    request: &RequestInfo,
    body: &[u8],
    allow_estimate: bool,
) -> Usage {
    let adapter = &provider.adapter;
    if !adapter.is_token_based() {
        return Usage {
            model: request.model.clone(),
            ..Default::default()
        };
    }

    if looks_like_event_stream(body) || looks_like_chunk_array(body) {
        let mut acc = StreamAccumulator::new(adapter.clone());
        acc.push(body);
        return acc.finish(provider, request, allow_estimate);
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(json) => {
            let raw = adapter.response_usage(&json);
            let model = adapter
                .response_model(&json)
                .or_else(|| request.model.clone());
            let text = if raw.output_tokens.is_none() {
                adapter.response_text(&json)
            } else {
                String::new()
            };
            resolve(
                raw,
                UsageSource::Response,
                provider,
                model,
                request,
                &text,
                allow_estimate,
            )
        }
        Err(_) => {
            // Non-JSON text bodies are estimated as output; binary bodies
            // estimate to zero.
            let text = std::str::from_utf8(body).unwrap_or_default();
            resolve(
                RawUsage::default(),
                UsageSource::Response,
                provider,
                request.model.clone(),
                request,
                text,
                allow_estimate,
            )
        }
    }
}

/// How a streamed body is framed; decided by its first non-blank byte.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Framing {
    #[default]
    Undetected,
    EventStream,
    ChunkArray,
}

/// Observes a streamed body chunk by chunk.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    adapter: Adapter,
    framing: Framing,
    decoder: SseDecoder,
    array: JsonArrayDecoder,
    state: ChunkState,
    bytes_seen: u64,
}

impl StreamAccumulator {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            ..Default::default()
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.bytes_seen += bytes.len() as u64;
        if !self.adapter.is_token_based() {
            return;
        }
        if self.framing == Framing::Undetected {
            self.framing = match trim_leading(bytes).first() {
                None => return,
                Some(b'[') => Framing::ChunkArray,
                Some(_) => Framing::EventStream,
            };
        }
        let events = match self.framing {
            Framing::ChunkArray => self.array.push(bytes),
            _ => self.decoder.push(bytes),
        };
        for event in events {
            self.adapter.chunk(&event, &mut self.state);
        }
    }

    /// Text reconstructed from the chunks seen so far.
    pub fn text(&self) -> &str {
        &self.state.text
    }

    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }

    pub fn chunks_seen(&self) -> usize {
        self.decoder.events_seen() + self.array.elements_seen()
    }

    pub fn finish(
        mut self,
        provider: &ProviderInfo,
        request: &RequestInfo,
        allow_estimate: bool,
    ) -> Usage {
        if self.adapter.is_token_based() && self.framing == Framing::EventStream {
            for event in self.decoder.finish() {
                self.adapter.chunk(&event, &mut self.state);
            }
        }
        let model = self.state.model.take().or_else(|| request.model.clone());
        if !self.adapter.is_token_based() {
            return Usage {
                model,
                ..Default::default()
            };
        }
        let raw = if self.state.usage_seen {
            self.state.usage
        } else {
            RawUsage::default()
        };
        resolve(
            raw,
            UsageSource::StreamChunk,
            provider,
            model,
            request,
            &self.state.text,
            allow_estimate,
        )
    }
}
