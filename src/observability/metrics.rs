//! Tracker self-metrics.
//!
//! Lock-free atomics updated on the hot path; read them through
//! [`TrackerMetrics::summary`].

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;

use crate::pricing::COST_SCALE_FACTOR;

/// Thread-safe atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bucket_bounds: Vec<f64>,
    /// Sum of observations, scaled by 1000.
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            buckets,
            bucket_bounds,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn default_latency() -> Self {
        Self::new(vec![
            50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0, 60000.0,
        ])
    }

    pub fn observe(&self, value: f64) {
        let idx = self
            .bucket_bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bucket_bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add((value.max(0.0) * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0 / count as f64
    }

    /// Upper bound of the bucket holding the `q` quantile; `None` when empty
    /// or when it falls in the overflow bucket.
    pub fn quantile_bound(&self, q: f64) -> Option<f64> {
        let count = self.count();
        if count == 0 {
            return None;
        }
        let target = ((count as f64) * q.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (idx, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target {
                return self.bucket_bounds.get(idx).copied();
            }
        }
        None
    }
}

#[derive(Debug)]
pub struct TrackerMetrics {
    pub events_recorded: Counter,
    pub events_delivered: Counter,
    /// Evicted from a full buffer.
    pub events_dropped: Counter,
    pub flush_failures: Counter,
    pub flush_batches: Counter,
    pub buffered_events: Gauge,
    pub cap_checks: Counter,
    pub cap_blocks: Counter,
    pub cap_fail_open: Counter,
    pub pricing_missing: Counter,
    pub instrumentation_errors: Counter,
    pub rate_limited_skipped: Counter,
    pub call_latency_ms: Histogram,
    pub cost_total_micros: Counter,
}

impl Default for TrackerMetrics {
    fn default() -> Self {
        Self {
            events_recorded: Counter::new(),
            events_delivered: Counter::new(),
            events_dropped: Counter::new(),
            flush_failures: Counter::new(),
            flush_batches: Counter::new(),
            buffered_events: Gauge::new(),
            cap_checks: Counter::new(),
            cap_blocks: Counter::new(),
            cap_fail_open: Counter::new(),
            pricing_missing: Counter::new(),
            instrumentation_errors: Counter::new(),
            rate_limited_skipped: Counter::new(),
            call_latency_ms: Histogram::default_latency(),
            cost_total_micros: Counter::new(),
        }
    }
}

impl TrackerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cost(&self, cost_usd: Decimal) {
        let micros = (cost_usd * COST_SCALE_FACTOR)
            .round()
            .to_u64()
            .unwrap_or(0);
        self.cost_total_micros.add(micros);
    }

    pub fn total_cost_usd(&self) -> Decimal {
        Decimal::from(self.cost_total_micros.get()) / COST_SCALE_FACTOR
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            events_recorded: self.events_recorded.get(),
            events_delivered: self.events_delivered.get(),
            events_dropped: self.events_dropped.get(),
            flush_failures: self.flush_failures.get(),
            flush_batches: self.flush_batches.get(),
            buffered_events: self.buffered_events.get(),
            cap_checks: self.cap_checks.get(),
            cap_blocks: self.cap_blocks.get(),
            cap_fail_open: self.cap_fail_open.get(),
            pricing_missing: self.pricing_missing.get(),
            instrumentation_errors: self.instrumentation_errors.get(),
            rate_limited_skipped: self.rate_limited_skipped.get(),
            calls_observed: self.call_latency_ms.count(),
            avg_latency_ms: self.call_latency_ms.mean(),
            p95_latency_bound_ms: self.call_latency_ms.quantile_bound(0.95),
            total_cost_usd: self.total_cost_usd(),
        }
    }
}

/// Point-in-time copy of [`TrackerMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub events_recorded: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
    pub flush_failures: u64,
    pub flush_batches: u64,
    pub buffered_events: i64,
    pub cap_checks: u64,
    pub cap_blocks: u64,
    pub cap_fail_open: u64,
    pub pricing_missing: u64,
    pub instrumentation_errors: u64,
    pub rate_limited_skipped: u64,
    pub calls_observed: u64,
    pub avg_latency_ms: f64,
    pub p95_latency_bound_ms: Option<f64>,
    pub total_cost_usd: Decimal,
}
