//! Pricing lookup and cost calculation.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

mod calculator;
mod source;
mod table;

pub use calculator::{COST_DECIMAL_PLACES, CostBreakdown, CostCalculator};
pub use source::{
    HttpPricingSource, PricingSource, StaticPricingSource, refresh_pricing, spawn_refresh,
};
pub use table::{
    BUILTIN_PRICING_VERSION, CACHE_READ_DISCOUNT, PricingEntry, PricingTable,
    PricingTableBuilder, builtin_pricing_table,
};

/// Scale factor for storing Decimal costs as AtomicU64 (6 decimal places precision).
pub(crate) const COST_SCALE_FACTOR: Decimal = dec!(1_000_000);
