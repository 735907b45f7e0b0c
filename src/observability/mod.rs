//! Tracing spans and self-metrics for the tracker.
//!
//! Every tracked call runs inside a `tracked.call` span whose usage fields are
//! filled in when the event is assembled. [`TrackerMetrics`] counts what the
//! tracker itself did: events recorded, delivered and dropped, cap checks and
//! fail-opens, swallowed instrumentation errors.
//!
//! The crate never installs a subscriber on its own. With the `subscriber`
//! feature, [`init_tracing`] sets up a formatter driven by an `EnvFilter`:
//!
//! ```rust,ignore
//! spendtrace::observability::init_tracing("spendtrace=debug,info");
//! ```

mod metrics;
mod spans;

pub use metrics::{Counter, Gauge, Histogram, MetricsSummary, TrackerMetrics};
pub use spans::CallSpan;

/// Installs a global `fmt` subscriber. `RUST_LOG` wins over `default_filter`
/// when set. Returns false if a subscriber was already installed.
#[cfg(feature = "subscriber")]
pub fn init_tracing(default_filter: &str) -> bool {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
