//! Cost arithmetic over the active price table.

use std::sync::{Arc, RwLock};

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;
use serde::Serialize;

use super::table::{PricingEntry, PricingTable, builtin_pricing_table};
use crate::providers::Usage;

const TOKENS_PER_MTOK: Decimal = dec!(1_000_000);

/// Decimal places kept in every cost figure.
pub const COST_DECIMAL_PLACES: u32 = 8;

/// Per-tier cost of one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostBreakdown {
    pub input_cost: Decimal,
    pub output_cost: Decimal,
    pub cached_cost: Decimal,
    pub total: Decimal,
    pub pricing_version: Option<String>,
    /// No price entry matched; the zero cost means "unpriced", not "free".
    pub pricing_missing: bool,
}

impl CostBreakdown {
    pub fn missing() -> Self {
        Self {
            pricing_missing: true,
            ..Default::default()
        }
    }

    pub fn from_entry(entry: &PricingEntry, usage: &Usage) -> Self {
        let tier = |tokens: u64, rate: Decimal| {
            (Decimal::from(tokens) * rate / TOKENS_PER_MTOK)
                .round_dp(COST_DECIMAL_PLACES)
                .max(Decimal::ZERO)
        };
        let input_cost = tier(usage.input_tokens, entry.input_per_mtok);
        let output_cost = tier(usage.output_tokens, entry.output_per_mtok);
        let cached_cost = tier(usage.cached_tokens, entry.cached_rate());
        Self {
            input_cost,
            output_cost,
            cached_cost,
            total: input_cost + output_cost + cached_cost,
            pricing_version: Some(entry.version.clone()),
            pricing_missing: false,
        }
    }

    pub fn total_f64(&self) -> f64 {
        self.total.to_f64().unwrap_or(0.0)
    }
}

/// Prices usage against a swappable [`PricingTable`].
///
/// The table sits behind an `Arc` so a refresh replaces it atomically while
/// in-flight calculations keep the table they started with.
#[derive(Debug)]
pub struct CostCalculator {
    table: RwLock<Arc<PricingTable>>,
    pinned_version: Option<String>,
}

impl Default for CostCalculator {
    fn default() -> Self {
        Self::new(builtin_pricing_table().clone())
    }
}

impl CostCalculator {
    pub fn new(table: PricingTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
            pinned_version: None,
        }
    }

    pub fn with_pinned_version(mut self, version: Option<String>) -> Self {
        self.pinned_version = version;
        self
    }

    pub fn pinned_version(&self) -> Option<&str> {
        self.pinned_version.as_deref()
    }

    pub fn table(&self) -> Arc<PricingTable> {
        Arc::clone(&self.table.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn replace(&self, table: PricingTable) {
        *self.table.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(table);
    }

    /// Overlays `entries` on the current table and swaps it in.
    pub fn merge(&self, entries: Vec<PricingEntry>) -> usize {
        let count = entries.len();
        let mut next = (*self.table()).clone();
        next.upsert(entries);
        self.replace(next);
        count
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    pub fn cost(&self, provider: &str, usage: &Usage) -> CostBreakdown {
        let Some(model) = usage.model.as_deref() else {
            return CostBreakdown::missing();
        };
        let table = self.table();
        match table.lookup(provider, model, self.pinned_version(), Self::today()) {
            Some(entry) => CostBreakdown::from_entry(entry, usage),
            None => CostBreakdown::missing(),
        }
    }

    /// Worst-case cost of a call that has not run yet. Unpriced calls
    /// project to zero.
    pub fn projected_cost(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u64,
        max_output_tokens: Option<u64>,
    ) -> Decimal {
        let usage = Usage {
            input_tokens,
            output_tokens: max_output_tokens.unwrap_or(0),
            model: Some(model.to_string()),
            ..Default::default()
        };
        self.cost(provider, &usage).total
    }
}
