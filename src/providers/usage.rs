//! Token usage extracted from (or estimated for) one call.

use serde::{Deserialize, Serialize};

/// Where the token counts of a [`Usage`] came from, strongest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    /// Explicit usage field in the final response body.
    Response,
    /// Usage field carried by the last streamed chunk.
    StreamChunk,
    /// BPE tokenizer count of the observed text.
    Tokenizer,
    /// Word-count heuristic.
    Heuristic,
    /// Nothing to count.
    #[default]
    None,
}

impl UsageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Response => "response",
            Self::StreamChunk => "stream_chunk",
            Self::Tokenizer => "tokenizer",
            Self::Heuristic => "heuristic",
            Self::None => "none",
        }
    }

    pub fn is_estimate(&self) -> bool {
        matches!(self, Self::Tokenizer | Self::Heuristic)
    }

    /// The weaker of two sources.
    pub fn weakest(self, other: Self) -> Self {
        self.max(other)
    }
}

/// Counts as reported by a provider; any field may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cached_tokens: Option<u64>,
}

impl RawUsage {
    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none() && self.output_tokens.is_none() && self.cached_tokens.is_none()
    }

    /// Overlays the fields present in `newer`.
    pub fn merge(&mut self, newer: RawUsage) {
        if newer.input_tokens.is_some() {
            self.input_tokens = newer.input_tokens;
        }
        if newer.output_tokens.is_some() {
            self.output_tokens = newer.output_tokens;
        }
        if newer.cached_tokens.is_some() {
            self.cached_tokens = newer.cached_tokens;
        }
    }
}

/// Final usage attributed to an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Non-cached input tokens.
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Input tokens served from the provider's prompt cache.
    pub cached_tokens: u64,
    pub model: Option<String>,
    pub source: UsageSource,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cached_tokens
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}
