//! Destination-host lookup selecting a provider and its adapter.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use super::adapter::Adapter;

/// Provider name recorded for hosts nothing matches.
pub const UNKNOWN_PROVIDER: &str = "unknown";

/// What kind of API a provider exposes; becomes the event's `span_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderCategory {
    Llm,
    VectorDb,
    Payment,
    Telephony,
    Http,
}

impl ProviderCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::VectorDb => "vector_db",
            Self::Payment => "payment",
            Self::Telephony => "telephony",
            Self::Http => "http",
        }
    }
}

impl fmt::Display for ProviderCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved identity of a destination.
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub name: String,
    pub category: ProviderCategory,
    pub adapter: Adapter,
}

impl ProviderInfo {
    pub fn new(name: impl Into<String>, category: ProviderCategory, adapter: Adapter) -> Self {
        Self {
            name: name.into(),
            category,
            adapter,
        }
    }

    pub fn unknown() -> Self {
        Self::new(UNKNOWN_PROVIDER, ProviderCategory::Http, Adapter::Flat)
    }

    pub fn is_unknown(&self) -> bool {
        self.name == UNKNOWN_PROVIDER
    }
}

type HostPredicate = Arc<dyn Fn(&Url) -> bool + Send + Sync>;

#[derive(Clone)]
enum HostMatcher {
    Exact(&'static str),
    Suffix(&'static str),
    Predicate(HostPredicate),
}

impl HostMatcher {
    fn matches(&self, url: &Url, host: &str) -> bool {
        match self {
            Self::Exact(expected) => host == *expected,
            Self::Suffix(suffix) => host.ends_with(suffix),
            Self::Predicate(predicate) => predicate(url),
        }
    }
}

impl fmt::Debug for HostMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(host) => write!(f, "Exact({host})"),
            Self::Suffix(suffix) => write!(f, "Suffix({suffix})"),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

#[derive(Debug, Clone)]
struct ProviderEntry {
    matcher: HostMatcher,
    info: ProviderInfo,
}

/// Built-in `(host, provider, category, adapter)` table.
const BUILTIN_HOSTS: &[(&str, &str, ProviderCategory, BuiltinAdapter)] = &[
    ("api.openai.com", "openai", ProviderCategory::Llm, BuiltinAdapter::OpenAi),
    ("api.anthropic.com", "anthropic", ProviderCategory::Llm, BuiltinAdapter::Anthropic),
    ("generativelanguage.googleapis.com", "google", ProviderCategory::Llm, BuiltinAdapter::Gemini),
    ("api.mistral.ai", "mistral", ProviderCategory::Llm, BuiltinAdapter::OpenAi),
    ("api.groq.com", "groq", ProviderCategory::Llm, BuiltinAdapter::OpenAi),
    ("api.together.xyz", "together", ProviderCategory::Llm, BuiltinAdapter::OpenAi),
    ("api.deepseek.com", "deepseek", ProviderCategory::Llm, BuiltinAdapter::OpenAi),
    ("openrouter.ai", "openrouter", ProviderCategory::Llm, BuiltinAdapter::OpenAi),
    ("api.fireworks.ai", "fireworks", ProviderCategory::Llm, BuiltinAdapter::OpenAi),
    ("api.perplexity.ai", "perplexity", ProviderCategory::Llm, BuiltinAdapter::OpenAi),
    ("api.x.ai", "xai", ProviderCategory::Llm, BuiltinAdapter::OpenAi),
    ("api.cohere.com", "cohere", ProviderCategory::Llm, BuiltinAdapter::Cohere),
    ("api.cohere.ai", "cohere", ProviderCategory::Llm, BuiltinAdapter::Cohere),
    ("api-inference.huggingface.co", "huggingface", ProviderCategory::Llm, BuiltinAdapter::Generic),
    ("api.stripe.com", "stripe", ProviderCategory::Payment, BuiltinAdapter::Flat),
    ("api.twilio.com", "twilio", ProviderCategory::Telephony, BuiltinAdapter::Flat),
];

/// Built-in `(host suffix, provider, category, adapter)` table.
const BUILTIN_SUFFIXES: &[(&str, &str, ProviderCategory, BuiltinAdapter)] = &[
    (".openai.azure.com", "azure_openai", ProviderCategory::Llm, BuiltinAdapter::OpenAi),
    (".pinecone.io", "pinecone", ProviderCategory::VectorDb, BuiltinAdapter::Flat),
    (".qdrant.io", "qdrant", ProviderCategory::VectorDb, BuiltinAdapter::Flat),
    (".weaviate.network", "weaviate", ProviderCategory::VectorDb, BuiltinAdapter::Flat),
];

#[derive(Debug, Clone, Copy)]
enum BuiltinAdapter {
    OpenAi,
    Anthropic,
    Gemini,
    Cohere,
    Generic,
    Flat,
}

impl From<BuiltinAdapter> for Adapter {
    fn from(value: BuiltinAdapter) -> Self {
        match value {
            BuiltinAdapter::OpenAi => Adapter::OpenAiStyle,
            BuiltinAdapter::Anthropic => Adapter::AnthropicStyle,
            BuiltinAdapter::Gemini => Adapter::GeminiStyle,
            BuiltinAdapter::Cohere => Adapter::CohereStyle,
            BuiltinAdapter::Generic => Adapter::GenericStream,
            BuiltinAdapter::Flat => Adapter::Flat,
        }
    }
}

/// Ordered provider lookup.
///
/// Resolution order: explicit host overrides, then runtime registrations
/// (newest first), then the built-in table. Anything else is
/// [`UNKNOWN_PROVIDER`].
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    overrides: HashMap<String, ProviderInfo>,
    custom: Vec<ProviderEntry>,
    builtin: Vec<ProviderEntry>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ProviderRegistry {
    /// Registry containing no providers at all.
    pub fn empty() -> Self {
        Self {
            overrides: HashMap::new(),
            custom: Vec::new(),
            builtin: Vec::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut builtin = Vec::with_capacity(BUILTIN_HOSTS.len() + BUILTIN_SUFFIXES.len());
        for (host, name, category, adapter) in BUILTIN_HOSTS {
            builtin.push(ProviderEntry {
                matcher: HostMatcher::Exact(*host),
                info: ProviderInfo::new(*name, *category, (*adapter).into()),
            });
        }
        for (suffix, name, category, adapter) in BUILTIN_SUFFIXES {
            builtin.push(ProviderEntry {
                matcher: HostMatcher::Suffix(*suffix),
                info: ProviderInfo::new(*name, *category, (*adapter).into()),
            });
        }
        Self {
            overrides: HashMap::new(),
            custom: Vec::new(),
            builtin,
        }
    }

    /// Registers a provider selected by `predicate` over the destination URL.
    pub fn register<F>(&mut self, info: ProviderInfo, predicate: F) -> &mut Self
    where
        F: Fn(&Url) -> bool + Send + Sync + 'static,
    {
        self.custom.insert(
            0,
            ProviderEntry {
                matcher: HostMatcher::Predicate(Arc::new(predicate)),
                info,
            },
        );
        self
    }

    /// Routes `host` (optionally `host:port`) to `info`, ahead of every other
    /// rule. Used for gateways and proxies that front a known provider.
    pub fn map_host(&mut self, host: impl Into<String>, info: ProviderInfo) -> &mut Self {
        self.overrides.insert(host.into().to_ascii_lowercase(), info);
        self
    }

    pub fn detect(&self, url: &Url) -> ProviderInfo {
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            return ProviderInfo::unknown();
        };

        if !self.overrides.is_empty() {
            if let Some(port) = url.port_or_known_default()
                && let Some(info) = self.overrides.get(&format!("{host}:{port}"))
            {
                return info.clone();
            }
            if let Some(info) = self.overrides.get(&host) {
                return info.clone();
            }
        }

        self.custom
            .iter()
            .chain(self.builtin.iter())
            .find(|entry| entry.matcher.matches(url, &host))
            .map(|entry| entry.info.clone())
            .unwrap_or_else(ProviderInfo::unknown)
    }

    pub fn len(&self) -> usize {
        self.overrides.len() + self.custom.len() + self.builtin.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
