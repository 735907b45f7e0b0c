//! Response-shape adapters, one per provider wire convention.

mod anthropic;
mod cohere;
mod gemini;
mod generic;
mod openai;

use std::fmt::Debug;
use std::sync::Arc;

use serde_json::Value;

use super::usage::RawUsage;

/// State accumulated across the chunks of one streamed response.
#[derive(Debug, Clone, Default)]
pub struct ChunkState {
    pub text: String,
    pub usage: RawUsage,
    pub model: Option<String>,
    /// True once any chunk carried a usage field.
    pub usage_seen: bool,
}

impl ChunkState {
    pub fn record_usage(&mut self, usage: RawUsage) {
        if !usage.is_empty() {
            self.usage.merge(usage);
            self.usage_seen = true;
        }
    }

    pub fn record_model(&mut self, model: Option<&str>) {
        if let Some(model) = model.filter(|m| !m.is_empty()) {
            self.model = Some(model.to_string());
        }
    }
}

/// Extraction hooks for a provider registered at runtime.
///
/// Only [`UsageParser::response_usage`] is required; the remaining hooks
/// default to the generic behaviour.
pub trait UsageParser: Send + Sync + Debug {
    fn response_usage(&self, body: &Value) -> RawUsage;

    fn response_text(&self, body: &Value) -> String {
        generic::response_text(body)
    }

    fn response_model(&self, body: &Value) -> Option<String> {
        generic::model(body)
    }

    fn chunk(&self, chunk: &Value, state: &mut ChunkState) {
        generic::chunk(chunk, state);
    }

    fn request_text(&self, body: &Value) -> String {
        generic::request_text(body)
    }
}

/// Wire convention used to read usage out of a provider's responses.
#[derive(Debug, Clone, Default)]
pub enum Adapter {
    /// OpenAI chat/completions/responses/embeddings and compatible APIs.
    OpenAiStyle,
    /// Anthropic Messages API.
    AnthropicStyle,
    /// Google Gemini `generateContent`.
    GeminiStyle,
    /// Cohere chat (v1 and v2).
    CohereStyle,
    /// Text-producing API without structured usage; estimation only.
    GenericStream,
    /// Non-token API (payments, telephony, vector stores). Zero usage.
    #[default]
    Flat,
    Custom(Arc<dyn UsageParser>),
}

impl Adapter {
    pub fn custom(parser: impl UsageParser + 'static) -> Self {
        Self::Custom(Arc::new(parser))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenAiStyle => "openai_style",
            Self::AnthropicStyle => "anthropic_style",
            Self::GeminiStyle => "gemini_style",
            Self::CohereStyle => "cohere_style",
            Self::GenericStream => "generic_stream",
            Self::Flat => "flat",
            Self::Custom(_) => "custom",
        }
    }

    /// Whether responses of this adapter are billed per token.
    pub fn is_token_based(&self) -> bool {
        !matches!(self, Self::Flat)
    }

    pub fn response_usage(&self, body: &Value) -> RawUsage {
        match self {
            Self::OpenAiStyle => openai::usage(body),
            Self::AnthropicStyle => anthropic::usage(body),
            Self::GeminiStyle => gemini::usage(body),
            Self::CohereStyle => cohere::usage(body),
            Self::GenericStream | Self::Flat => RawUsage::default(),
            Self::Custom(parser) => parser.response_usage(body),
        }
    }

    pub fn response_text(&self, body: &Value) -> String {
        match self {
            Self::OpenAiStyle => openai::text(body),
            Self::AnthropicStyle => anthropic::text(body),
            Self::GeminiStyle => gemini::text(body),
            Self::CohereStyle => cohere::text(body),
            Self::GenericStream => generic::response_text(body),
            Self::Flat => String::new(),
            Self::Custom(parser) => parser.response_text(body),
        }
    }

    pub fn response_model(&self, body: &Value) -> Option<String> {
        match self {
            Self::GeminiStyle => gemini::model(body),
            Self::Flat => None,
            Self::Custom(parser) => parser.response_model(body),
            _ => generic::model(body),
        }
    }

    pub fn chunk(&self, chunk: &Value, state: &mut ChunkState) {
        match self {
            Self::OpenAiStyle => openai::chunk(chunk, state),
            Self::AnthropicStyle => anthropic::chunk(chunk, state),
            Self::GeminiStyle => gemini::chunk(chunk, state),
            Self::CohereStyle => cohere::chunk(chunk, state),
            Self::GenericStream => generic::chunk(chunk, state),
            Self::Flat => {}
            Self::Custom(parser) => parser.chunk(chunk, state),
        }
    }

    pub fn request_text(&self, body: &Value) -> String {
        match self {
            Self::Flat => String::new(),
            Self::Custom(parser) => parser.request_text(body),
            _ => generic::request_text(body),
        }
    }
}

/// Reads a non-negative integer field.
pub(crate) fn count(value: &Value, key: &str) -> Option<u64> {
    value.get(key).and_then(Value::as_u64)
}

pub(crate) fn count_at(value: &Value, pointer: &str) -> Option<u64> {
    value.pointer(pointer).and_then(Value::as_u64)
}
