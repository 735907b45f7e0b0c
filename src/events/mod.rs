//! Call events and their delivery to the collector.
//!
//! Each event moves `Created → Buffered → Flushing → Delivered`; a failed
//! flush returns it to `Buffered` ahead of anything newer. Nothing is
//! discarded on failure. The only loss path is overflow of a full buffer,
//! which evicts the oldest event and counts it.

mod backoff;
mod buffer;
mod flusher;
mod transport;

pub use backoff::ExponentialBackoff;
pub use buffer::{EventBuffer, FlushOutcome};
pub use flusher::Flusher;
pub use transport::{HttpTransport, MemoryTransport, Transport};

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::{ContextSnapshot, Run};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    #[default]
    Success,
    Error,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one outbound call attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub run_id: Uuid,
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub section: String,
    pub section_path: String,
    pub span_type: String,
    pub provider: String,
    pub endpoint: String,
    pub model: Option<String>,
    pub tenant_id: Option<String>,
    pub customer_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub cost_usd: Decimal,
    pub latency_ms: u64,
    pub status: EventStatus,
    pub is_streaming: bool,
    pub stream_cancelled: bool,
    pub pricing_missing: bool,
    pub pricing_version: Option<String>,
    #[serde(default)]
    pub event_metadata: BTreeMap<String, Value>,
    pub semantic_label: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Empty event carrying the identity of `context`, resolved against `run`.
    pub fn new(context: &ContextSnapshot, run: &Run) -> Self {
        let context = context.resolved(run);
        let event_metadata = context
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        Self {
            id: Uuid::new_v4(),
            run_id: context.run_id.unwrap_or(run.run_id),
            span_id: Uuid::new_v4(),
            parent_span_id: context.parent_span_id,
            section: context.section().to_string(),
            section_path: context.section_path(),
            span_type: String::new(),
            provider: String::new(),
            endpoint: String::new(),
            model: None,
            tenant_id: context.tenant_id.clone(),
            customer_id: context.customer_id.clone(),
            input_tokens: 0,
            output_tokens: 0,
            cached_tokens: 0,
            cost_usd: Decimal::ZERO,
            latency_ms: 0,
            status: EventStatus::Success,
            is_streaming: false,
            stream_cancelled: false,
            pricing_missing: false,
            pricing_version: None,
            event_metadata,
            semantic_label: context.semantic_label.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.event_metadata.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_new_event_from_context() {
        let run = Run::new();
        let context = ContextSnapshot::untracked()
            .with_section("agent:planner")
            .with_section("tool:search")
            .with_customer("cust_9")
            .with_metadata("feature", "search");
        let event = Event::new(&context, &run);
        assert_eq!(event.run_id, run.run_id);
        assert_eq!(event.parent_span_id, Some(run.root_span_id));
        assert_eq!(event.section, "tool:search");
        assert_eq!(event.section_path, "agent:planner/tool:search");
        assert_eq!(event.customer_id.as_deref(), Some("cust_9"));
        assert_eq!(event.event_metadata["feature"], "search");
        assert_ne!(event.span_id, run.root_span_id);
    }

    #[test]
    fn test_untracked_event() {
        let run = Run::new();
        let event = Event::new(&ContextSnapshot::untracked(), &run);
        assert_eq!(event.section, "untracked");
        assert_eq!(event.section_path, "untracked");
    }

    #[test]
    fn test_wire_format() {
        let run = Run::new();
        let mut event = Event::new(&ContextSnapshot::untracked(), &run);
        event.cost_usd = dec!(0.0125);
        event.status = EventStatus::Error;
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["cost_usd"], serde_json::json!(0.0125));
        assert_eq!(json["status"], "error");
        assert!(json.get("event_metadata").unwrap().is_object());
        assert!(json["parent_span_id"].is_string());

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back.cost_usd, dec!(0.0125));
    }
}
