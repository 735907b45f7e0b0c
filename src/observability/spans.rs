//! Tracing span for one tracked call.

use std::time::Duration;

use tracing::{Level, Span, field, span};

/// `tracked.call` span; usage fields are empty until [`CallSpan::finish`].
#[derive(Debug)]
pub struct CallSpan {
    span: Span,
}

impl CallSpan {
    pub fn new(provider: &str, endpoint: &str, model: Option<&str>) -> Self {
        let span = span!(
            Level::INFO,
            "tracked.call",
            provider = provider,
            endpoint = endpoint,
            model = model.unwrap_or(""),
            otel.name = "tracked.call",
            input_tokens = field::Empty,
            output_tokens = field::Empty,
            cost_usd = field::Empty,
            latency_ms = field::Empty,
            status = field::Empty,
        );
        Self { span }
    }

    pub fn record_model(&self, model: &str) {
        self.span.record("model", model);
    }

    pub fn finish(
        &self,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
        latency: Duration,
        status: &str,
    ) {
        self.span.record("input_tokens", input_tokens);
        self.span.record("output_tokens", output_tokens);
        self.span.record("cost_usd", cost_usd);
        self.span.record("latency_ms", latency.as_millis() as u64);
        self.span.record("status", status);
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}
