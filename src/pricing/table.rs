//! Versioned per-model price table.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Cached input tokens cost this fraction of the input rate unless an entry
/// says otherwise.
pub const CACHE_READ_DISCOUNT: Decimal = dec!(0.1);

/// Version tag of the built-in table.
pub const BUILTIN_PRICING_VERSION: &str = "builtin";

fn unversioned() -> String {
    "unversioned".to_string()
}

/// USD price per million tokens for one `(provider, model, version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingEntry {
    pub provider: String,
    pub model: String,
    #[serde(default = "unversioned")]
    pub version: String,
    #[serde(default)]
    pub effective_date: NaiveDate,
    pub input_per_mtok: Decimal,
    pub output_per_mtok: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_per_mtok: Option<Decimal>,
}

impl PricingEntry {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        input_per_mtok: Decimal,
        output_per_mtok: Decimal,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            version: unversioned(),
            effective_date: NaiveDate::default(),
            input_per_mtok,
            output_per_mtok,
            cached_per_mtok: None,
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn effective(mut self, date: NaiveDate) -> Self {
        self.effective_date = date;
        self
    }

    pub fn cached(mut self, cached_per_mtok: Decimal) -> Self {
        self.cached_per_mtok = Some(cached_per_mtok);
        self
    }

    pub fn cached_rate(&self) -> Decimal {
        self.cached_per_mtok
            .unwrap_or(self.input_per_mtok * CACHE_READ_DISCOUNT)
    }

    fn same_key(&self, other: &PricingEntry) -> bool {
        self.provider == other.provider && self.model == other.model && self.version == other.version
    }
}

/// Price entries grouped by provider.
///
/// Lookup tries the exact model name, then the longest registered model name
/// that prefixes it, so dated snapshots (`gpt-4o-2024-08-06`) resolve to
/// their family entry (`gpt-4o`). Among the versions of that model a pinned
/// version wins; otherwise the entry with the latest effective date not after
/// `today` is used.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    providers: HashMap<String, Vec<PricingEntry>>,
    aliases: HashMap<String, String>,
}

impl PricingTable {
    pub fn builder() -> PricingTableBuilder {
        PricingTableBuilder::new()
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn lookup(
        &self,
        provider: &str,
        model: &str,
        pinned_version: Option<&str>,
        today: NaiveDate,
    ) -> Option<&PricingEntry> {
        let provider = provider.to_ascii_lowercase();
        let entries = self.providers.get(&provider).or_else(|| {
            self.aliases
                .get(&provider)
                .and_then(|target| self.providers.get(target))
        })?;

        let model = model.to_ascii_lowercase();
        let family = if entries.iter().any(|e| e.model == model) {
            model.as_str()
        } else {
            entries
                .iter()
                .filter(|e| model.starts_with(e.model.as_str()))
                .map(|e| e.model.as_str())
                .max_by_key(|m| m.len())?
        };

        let candidates = entries.iter().filter(|e| e.model == family);
        if let Some(pinned) = pinned_version
            && let Some(entry) = candidates.clone().find(|e| e.version == pinned)
        {
            return Some(entry);
        }
        candidates
            .filter(|e| e.effective_date <= today)
            .max_by_key(|e| e.effective_date)
    }

    /// Inserts entries, replacing any with the same provider, model and
    /// version.
    pub fn upsert(&mut self, entries: impl IntoIterator<Item = PricingEntry>) {
        for mut entry in entries {
            entry.provider = entry.provider.to_ascii_lowercase();
            entry.model = entry.model.to_ascii_lowercase();
            let slot = self.providers.entry(entry.provider.clone()).or_default();
            slot.retain(|e| !e.same_key(&entry));
            slot.push(entry);
        }
    }

    pub fn alias(&mut self, provider: impl Into<String>, priced_as: impl Into<String>) {
        self.aliases.insert(provider.into(), priced_as.into());
    }

    pub fn entries(&self) -> impl Iterator<Item = &PricingEntry> {
        self.providers.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.providers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct PricingTableBuilder {
    entries: Vec<PricingEntry>,
    aliases: Vec<(String, String)>,
}

impl PricingTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(mut self) -> Self {
        self.entries.extend(builtin_entries());
        self.aliases
            .push(("azure_openai".to_string(), "openai".to_string()));
        self
    }

    pub fn entry(mut self, entry: PricingEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn entries(mut self, entries: impl IntoIterator<Item = PricingEntry>) -> Self {
        self.entries.extend(entries);
        self
    }

    pub fn model(
        self,
        provider: impl Into<String>,
        model: impl Into<String>,
        input_per_mtok: Decimal,
        output_per_mtok: Decimal,
    ) -> Self {
        self.entry(PricingEntry::new(provider, model, input_per_mtok, output_per_mtok))
    }

    pub fn alias(mut self, provider: impl Into<String>, priced_as: impl Into<String>) -> Self {
        self.aliases.push((provider.into(), priced_as.into()));
        self
    }

    pub fn build(self) -> PricingTable {
        let mut table = PricingTable::default();
        table.upsert(self.entries);
        for (provider, target) in self.aliases {
            table.alias(provider, target);
        }
        table
    }
}

fn builtin_entries() -> Vec<PricingEntry> {
    let effective = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default();
    [
        ("openai", "gpt-5", dec!(1.25), dec!(10.00)),
        ("openai", "gpt-5-mini", dec!(0.25), dec!(2.00)),
        ("openai", "gpt-5-nano", dec!(0.05), dec!(0.40)),
        ("openai", "gpt-4.1", dec!(2.00), dec!(8.00)),
        ("openai", "gpt-4.1-mini", dec!(0.40), dec!(1.60)),
        ("openai", "gpt-4.1-nano", dec!(0.10), dec!(0.40)),
        ("openai", "gpt-4o", dec!(2.50), dec!(10.00)),
        ("openai", "gpt-4o-mini", dec!(0.15), dec!(0.60)),
        ("openai", "gpt-4-turbo", dec!(10.00), dec!(30.00)),
        ("openai", "gpt-3.5-turbo", dec!(0.50), dec!(1.50)),
        ("openai", "o1", dec!(15.00), dec!(60.00)),
        ("openai", "o1-mini", dec!(1.10), dec!(4.40)),
        ("openai", "o3", dec!(2.00), dec!(8.00)),
        ("openai", "o3-mini", dec!(1.10), dec!(4.40)),
        ("openai", "o4-mini", dec!(1.10), dec!(4.40)),
        ("openai", "text-embedding-3-small", dec!(0.02), dec!(0)),
        ("openai", "text-embedding-3-large", dec!(0.13), dec!(0)),
        ("anthropic", "claude-opus-4", dec!(15.00), dec!(75.00)),
        ("anthropic", "claude-opus-4-1", dec!(15.00), dec!(75.00)),
        ("anthropic", "claude-sonnet-4", dec!(3.00), dec!(15.00)),
        ("anthropic", "claude-sonnet-4-5", dec!(3.00), dec!(15.00)),
        ("anthropic", "claude-haiku-4-5", dec!(1.00), dec!(5.00)),
        ("anthropic", "claude-3-7-sonnet", dec!(3.00), dec!(15.00)),
        ("anthropic", "claude-3-5-sonnet", dec!(3.00), dec!(15.00)),
        ("anthropic", "claude-3-5-haiku", dec!(0.80), dec!(4.00)),
        ("anthropic", "claude-3-opus", dec!(15.00), dec!(75.00)),
        ("anthropic", "claude-3-haiku", dec!(0.25), dec!(1.25)),
        ("google", "gemini-2.5-pro", dec!(1.25), dec!(10.00)),
        ("google", "gemini-2.5-flash", dec!(0.30), dec!(2.50)),
        ("google", "gemini-2.5-flash-lite", dec!(0.10), dec!(0.40)),
        ("google", "gemini-2.0-flash", dec!(0.10), dec!(0.40)),
        ("google", "gemini-1.5-pro", dec!(1.25), dec!(5.00)),
        ("google", "gemini-1.5-flash", dec!(0.075), dec!(0.30)),
        ("mistral", "mistral-large", dec!(2.00), dec!(6.00)),
        ("mistral", "mistral-medium", dec!(0.40), dec!(2.00)),
        ("mistral", "mistral-small", dec!(0.20), dec!(0.60)),
        ("mistral", "codestral", dec!(0.30), dec!(0.90)),
        ("deepseek", "deepseek-chat", dec!(0.27), dec!(1.10)),
        ("deepseek", "deepseek-reasoner", dec!(0.55), dec!(2.19)),
        ("cohere", "command-r-plus", dec!(2.50), dec!(10.00)),
        ("cohere", "command-r", dec!(0.15), dec!(0.60)),
        ("cohere", "command-a", dec!(2.50), dec!(10.00)),
    ]
    .into_iter()
    .map(|(provider, model, input, output)| {
        PricingEntry::new(provider, model, input, output)
            .version(BUILTIN_PRICING_VERSION)
            .effective(effective)
    })
    .collect()
}

static BUILTIN_TABLE: LazyLock<PricingTable> =
    LazyLock::new(|| PricingTableBuilder::new().with_defaults().build());

pub fn builtin_pricing_table() -> &'static PricingTable {
    &BUILTIN_TABLE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    #[test]
    fn test_exact_and_prefix_lookup() {
        let table = builtin_pricing_table();
        let exact = table.lookup("openai", "gpt-4o-mini", None, today()).unwrap();
        assert_eq!(exact.model, "gpt-4o-mini");

        let dated = table
            .lookup("openai", "gpt-4o-2024-08-06", None, today())
            .unwrap();
        assert_eq!(dated.model, "gpt-4o");

        let sonnet = table
            .lookup("anthropic", "claude-sonnet-4-5-20250929", None, today())
            .unwrap();
        assert_eq!(sonnet.model, "claude-sonnet-4-5");
    }

    #[test]
    fn test_unknown_model_and_provider() {
        let table = builtin_pricing_table();
        assert!(table.lookup("openai", "davinci-002", None, today()).is_none());
        assert!(table.lookup("unknown", "gpt-4o", None, today()).is_none());
    }

    #[test]
    fn test_provider_alias() {
        let table = builtin_pricing_table();
        let entry = table.lookup("azure_openai", "gpt-4o", None, today()).unwrap();
        assert_eq!(entry.provider, "openai");
    }

    #[test]
    fn test_version_selection() {
        let d = |y, m, day| NaiveDate::from_ymd_opt(y, m, day).unwrap();
        let table = PricingTable::builder()
            .entry(PricingEntry::new("acme", "m1", dec!(1), dec!(2)).version("v1").effective(d(2024, 1, 1)))
            .entry(PricingEntry::new("acme", "m1", dec!(2), dec!(4)).version("v2").effective(d(2025, 1, 1)))
            .entry(PricingEntry::new("acme", "m1", dec!(3), dec!(6)).version("v3").effective(d(2030, 1, 1)))
            .build();

        let latest = table.lookup("acme", "m1", None, today()).unwrap();
        assert_eq!(latest.version, "v2");

        let pinned = table.lookup("acme", "m1", Some("v1"), today()).unwrap();
        assert_eq!(pinned.version, "v1");

        let missing_pin = table.lookup("acme", "m1", Some("v9"), today()).unwrap();
        assert_eq!(missing_pin.version, "v2");
    }

    #[test]
    fn test_upsert_replaces_same_key() {
        let mut table = PricingTable::builder().model("acme", "m1", dec!(1), dec!(1)).build();
        table.upsert([PricingEntry::new("ACME", "M1", dec!(9), dec!(9))]);
        assert_eq!(table.len(), 1);
        let entry = table.lookup("acme", "m1", None, today()).unwrap();
        assert_eq!(entry.input_per_mtok, dec!(9));
    }

    #[test]
    fn test_cached_rate_default() {
        let entry = PricingEntry::new("openai", "gpt-4o", dec!(2.50), dec!(10));
        assert_eq!(entry.cached_rate(), dec!(0.25));
        assert_eq!(entry.clone().cached(dec!(1.25)).cached_rate(), dec!(1.25));
    }

    #[test]
    fn test_entry_deserializes_numbers_and_strings() {
        let entry: PricingEntry = serde_json::from_str(
            r#"{"provider":"openai","model":"gpt-4o","version":"2025-01","effective_date":"2025-01-01",
                "input_per_mtok":"2.5","output_per_mtok":10}"#,
        )
        .unwrap();
        assert_eq!(entry.input_per_mtok, dec!(2.5));
        assert_eq!(entry.output_per_mtok, dec!(10));
        assert!(entry.cached_per_mtok.is_none());
    }
}
