//! Token estimation for calls whose responses carry no usage.

use super::usage::UsageSource;

/// Average tokens per whitespace-separated word for English prose.
pub const TOKENS_PER_WORD: f64 = 1.3;

/// Word-count estimate: `floor(words * 1.3)`, at least 1 for non-empty text.
pub fn heuristic_tokens(text: &str) -> u64 {
    let words = text.split_whitespace().count();
    if words == 0 {
        return 0;
    }
    ((words as f64 * TOKENS_PER_WORD) as u64).max(1)
}

/// Best available estimate for `text` and the method used.
///
/// The tokenizer is tried first when the `tokenizer` feature is enabled and
/// the model belongs to a family with a known encoding.
pub fn estimate_tokens(text: &str, provider: &str, model: Option<&str>) -> (u64, UsageSource) {
    if text.trim().is_empty() {
        return (0, UsageSource::None);
    }

    #[cfg(feature = "tokenizer")]
    if let Some(count) = bpe::count(provider, model, text) {
        return (count, UsageSource::Tokenizer);
    }
    #[cfg(not(feature = "tokenizer"))]
    let _ = (provider, model);

    (heuristic_tokens(text), UsageSource::Heuristic)
}

#[cfg(feature = "tokenizer")]
mod bpe {
    use std::sync::OnceLock;

    use tiktoken_rs::CoreBPE;

    #[derive(Clone, Copy)]
    enum Encoding {
        O200k,
        Cl100k,
    }

    static O200K: OnceLock<Option<CoreBPE>> = OnceLock::new();
    static CL100K: OnceLock<Option<CoreBPE>> = OnceLock::new();

    fn encoding_for(provider: &str, model: Option<&str>) -> Option<Encoding> {
        if !matches!(provider, "openai" | "azure_openai") {
            return None;
        }
        let model = model.unwrap_or_default().to_lowercase();
        if model.starts_with("gpt-4o")
            || model.starts_with("gpt-4.1")
            || model.starts_with("gpt-5")
            || model.starts_with("o1")
            || model.starts_with("o3")
            || model.starts_with("o4")
        {
            Some(Encoding::O200k)
        } else if model.starts_with("gpt-4")
            || model.starts_with("gpt-3.5")
            || model.starts_with("text-embedding")
        {
            Some(Encoding::Cl100k)
        } else {
            None
        }
    }

    fn load(encoding: Encoding) -> Option<&'static CoreBPE> {
        let slot = match encoding {
            Encoding::O200k => O200K.get_or_init(|| {
                tiktoken_rs::o200k_base()
                    .inspect_err(|e| tracing::warn!("failed to load o200k encoding: {}", e))
                    .ok()
            }),
            Encoding::Cl100k => CL100K.get_or_init(|| {
                tiktoken_rs::cl100k_base()
                    .inspect_err(|e| tracing::warn!("failed to load cl100k encoding: {}", e))
                    .ok()
            }),
        };
        slot.as_ref()
    }

    pub(super) fn count(provider: &str, model: Option<&str>, text: &str) -> Option<u64> {
        let bpe = load(encoding_for(provider, model)?)?;
        Some(bpe.encode_ordinary(text).len() as u64)
    }
}
