//! # spendtrace
//!
//! Automatic cost and latency attribution for outbound API calls: LLMs,
//! vector stores, payments and telephony.
//!
//! Calls made through a [`TrackedClient`] are identified by destination
//! host, their token usage is extracted (or estimated), priced, tagged with
//! the active [`context`] and delivered in batches to a collector. Nothing
//! about the call itself changes: bodies, headers, status codes and streams
//! pass through untouched, and tracking failures are logged rather than
//! returned.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use spendtrace::{Instrumentation, TrackerConfig, context};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), spendtrace::Error> {
//!     let tracker = Instrumentation::install(TrackerConfig::from_env()?)?;
//!     let client = tracker.wrap(reqwest::Client::new());
//!
//!     let _section = context::push_section("agent:researcher");
//!     let response = client
//!         .post("https://api.openai.com/v1/chat/completions")
//!         .bearer_auth(std::env::var("OPENAI_API_KEY").unwrap_or_default())
//!         .json(&serde_json::json!({
//!             "model": "gpt-4o-mini",
//!             "messages": [{"role": "user", "content": "Hello"}]
//!         }))
//!         .send()
//!         .await?;
//!     println!("{}", response.text().await?);
//!
//!     tracker.shutdown().await.ok();
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod caps;
pub mod config;
pub mod context;
pub mod events;
pub mod intercept;
mod instrument;
pub mod observability;
pub mod prelude;
pub mod pricing;
pub mod providers;

pub use caps::{
    Cap, CapCheckResponse, CapDecision, CapGuard, CapQuery, CapScope, CapService, CircuitBreaker,
    CircuitConfig, CircuitPermit, CircuitState, Enforcement, ExceededCap, HttpCapService,
};
pub use config::{
    CapGuardConfig, CollectorConfig, ConfigError, FlushConfig, PricingConfig, TrackerConfig,
};
pub use context::{ContextGuard, ContextSnapshot, Run};
pub use events::{
    Event, EventBuffer, EventStatus, FlushOutcome, HttpTransport, MemoryTransport, Transport,
};
pub use instrument::{Instrumentation, InstrumentationBuilder, record_global};
pub use intercept::{PendingCall, TrackedClient, TrackedRequestBuilder, TrackedResponse, TrackedStream};
pub use observability::{MetricsSummary, TrackerMetrics};
pub use pricing::{CostBreakdown, CostCalculator, PricingEntry, PricingSource, PricingTable};
pub use providers::{
    Adapter, ProviderCategory, ProviderInfo, ProviderRegistry, Usage, UsageParser, UsageSource,
};

use std::time::Duration;

/// Error type for spendtrace operations.
///
/// Application code only ever sees [`Error::CapExceeded`] and errors of the
/// wrapped call itself; tracking failures are logged instead.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Network connectivity or request failed.
    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON serialization or deserialization failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// File system operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// The collector, cap service or pricing service answered with an error.
    #[error("Collector error (HTTP {status}): {message}")]
    Collector { status: u16, message: String },

    /// A hard-block spending cap refused the call before it was sent.
    #[error("Spending cap exceeded: {message}")]
    CapExceeded {
        message: String,
        caps: Vec<ExceededCap>,
    },

    #[error("Operation timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Instrumentation is already installed")]
    AlreadyInstalled,

    #[error("Instrumentation is not installed")]
    NotInstalled,

    #[error("Instrumentation has been shut down")]
    Shutdown,
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network, timeout or 5xx failures that may succeed on retry
    Transient,
    /// Configuration, parsing, or setup errors
    Configuration,
    /// A spending cap refused the call
    Budget,
    /// Internal errors (IO, JSON, lifecycle misuse)
    Internal,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Network(_) | Error::Timeout(_) => ErrorCategory::Transient,
            Error::Collector {
                status: 408 | 429 | 500..=599,
                ..
            } => ErrorCategory::Transient,

            Error::Config(_) | Error::Parse(_) => ErrorCategory::Configuration,
            Error::Collector {
                status: 401 | 403,
                ..
            } => ErrorCategory::Configuration,

            Error::CapExceeded { .. } => ErrorCategory::Budget,

            Error::Io(_)
            | Error::Json(_)
            | Error::Collector { .. }
            | Error::AlreadyInstalled
            | Error::NotInstalled
            | Error::Shutdown => ErrorCategory::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    pub fn is_cap_exceeded(&self) -> bool {
        self.category() == ErrorCategory::Budget
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Collector { status, .. } => Some(*status),
            Error::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidValue { key, message } => {
                Error::Config(format!("Invalid value for {}: {}", key, message))
            }
            ConfigError::Serialization(e) => Error::Json(e),
            ConfigError::Yaml(message) => Error::Parse(message),
            ConfigError::Io(e) => Error::Io(e),
            ConfigError::ValidationErrors(errors) => Error::Config(errors.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
