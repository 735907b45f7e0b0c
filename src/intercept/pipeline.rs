//! Parse, cost, assemble and enqueue: the path every tracked call ends on.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use serde_json::Value;
use url::Url;

use crate::caps::{CapDecision, CapQuery};
use crate::context::{self, ContextSnapshot};
use crate::events::{Event, EventStatus};
use crate::instrument::Shared;
use crate::observability::CallSpan;
use crate::providers::{
    ProviderInfo, RequestInfo, StreamAccumulator, Usage, estimate_tokens, extract_usage,
};
use crate::{Error, Result};

const RATE_LIMITED: u16 = 429;

enum Completion<'a> {
    Body(&'a [u8]),
    Stream {
        accumulator: StreamAccumulator,
        cancelled: bool,
        error: Option<String>,
    },
    Failed(String),
    Abandoned,
}

/// One outbound call attempt between request capture and its event.
///
/// Consumed by exactly one of [`finish_body`](Self::finish_body),
/// [`finish_stream`](Self::finish_stream) or [`fail`](Self::fail). Dropping
/// it unfinished still records the attempt, with whatever is known.
pub struct PendingCall {
    shared: Arc<Shared>,
    context: ContextSnapshot,
    provider: ProviderInfo,
    request: RequestInfo,
    span: CallSpan,
    started: Instant,
    latency: Option<Duration>,
    status: Option<u16>,
    done: bool,
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("provider", &self.provider.name)
            .field("endpoint", &self.request.endpoint)
            .field("model", &self.request.model)
            .field("streaming", &self.request.streaming)
            .field("status", &self.status)
            .field("done", &self.done)
            .finish()
    }
}

impl PendingCall {
    pub(crate) fn begin(
        shared: Arc<Shared>,
        method: &str,
        url: &Url,
        headers: &HeaderMap,
        body: Option<&[u8]>,
    ) -> Self {
        let provider = shared.registry.detect(url);
        let request = RequestInfo::analyze(method, url, headers, body, &provider.adapter);

        let mut context = context::current();
        if context.tenant_id.is_none()
            && let Some(tenant) = &shared.config.tenant_id
        {
            context = context.with_tenant(tenant.clone());
        }
        if context.customer_id.is_none()
            && let Some(customer) = &shared.config.customer_id
        {
            context = context.with_customer(customer.clone());
        }

        let span = CallSpan::new(&provider.name, &request.endpoint, request.model.as_deref());
        tracing::trace!(
            provider = %provider.name,
            endpoint = %request.endpoint,
            streaming = request.streaming,
            section = context.section(),
            "call started"
        );

        Self {
            shared,
            context,
            provider,
            request,
            span,
            started: Instant::now(),
            latency: None,
            status: None,
            done: false,
        }
    }

    pub fn provider(&self) -> &ProviderInfo {
        &self.provider
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    pub fn context(&self) -> &ContextSnapshot {
        &self.context
    }

    pub fn is_streaming(&self) -> bool {
        self.request.streaming
    }

    /// Response status, once headers have arrived.
    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    /// Overrides the measured latency, for calls timed by the caller.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn cap_query(&self) -> CapQuery {
        CapQuery {
            provider: self.provider.name.clone(),
            model: self.request.model.clone(),
            customer_id: self.context.customer_id.clone(),
            agent: self.context.agent().map(str::to_string),
        }
    }

    fn projected_cost(&self) -> rust_decimal::Decimal {
        let Some(model) = self.request.model.as_deref() else {
            return rust_decimal::Decimal::ZERO;
        };
        let (input, _) =
            estimate_tokens(&self.request.input_text, &self.provider.name, Some(model));
        self.shared.calculator.projected_cost(
            &self.provider.name,
            model,
            input,
            self.request.max_output_tokens,
        )
    }

    /// Runs the pre-flight cap check. A blocked call is finished here and
    /// produces no event.
    pub async fn admit(&mut self) -> Result<()> {
        if !self.shared.config.enabled {
            return Ok(());
        }
        let Some(guard) = &self.shared.caps else {
            return Ok(());
        };
        let query = self.cap_query();
        let projected = self.projected_cost();
        match guard.check(&query, projected).await {
            CapDecision::Blocked { message, caps } => {
                self.done = true;
                Err(Error::CapExceeded { message, caps })
            }
            CapDecision::Allowed | CapDecision::AllowedWithWarning(_) => Ok(()),
        }
    }

    /// Finishes with a fully read response body.
    pub fn finish_body(mut self, status: u16, body: &[u8]) {
        self.status = Some(status);
        self.complete(Completion::Body(body));
    }

    /// Finishes a streamed response. `cancelled` marks a stream the caller
    /// stopped reading before its end.
    pub fn finish_stream(
        mut self,
        accumulator: StreamAccumulator,
        cancelled: bool,
        error: Option<String>,
    ) {
        self.complete(Completion::Stream {
            accumulator,
            cancelled,
            error,
        });
    }

    /// Finishes a call that produced no response.
    pub fn fail(mut self, error: impl fmt::Display) {
        self.complete(Completion::Failed(error.to_string()));
    }

    fn complete(&mut self, completion: Completion<'_>) {
        if self.done {
            return;
        }
        self.done = true;
        if !self.shared.config.enabled {
            return;
        }

        let assembled = catch_unwind(AssertUnwindSafe(|| self.assemble(completion)));
        match assembled {
            Ok(Some(event)) => self.shared.buffer.push(event),
            Ok(None) => {}
            Err(_) => {
                self.shared.metrics.instrumentation_errors.inc();
                tracing::warn!(
                    provider = %self.provider.name,
                    endpoint = %self.request.endpoint,
                    "failed to record call; event skipped"
                );
            }
        }
    }

    fn assemble(&self, completion: Completion<'_>) -> Option<Event> {
        let latency = self.latency.unwrap_or_else(|| self.started.elapsed());
        let metrics = &self.shared.metrics;

        if self.status == Some(RATE_LIMITED) {
            metrics.rate_limited_skipped.inc();
            tracing::debug!(provider = %self.provider.name, "rate-limited call not tracked");
            return None;
        }
        let http_failed = self.status.is_some_and(|s| s >= 400);
        let allow_estimate = !http_failed;

        let mut body_unread = false;
        let (usage, streaming, cancelled, error) = match completion {
            Completion::Body(body) => (
                extract_usage(&self.provider, &self.request, body, allow_estimate),
                self.request.streaming,
                false,
                None,
            ),
            Completion::Stream {
                accumulator,
                cancelled,
                error,
            } => (
                accumulator.finish(&self.provider, &self.request, allow_estimate),
                true,
                cancelled,
                error,
            ),
            Completion::Failed(message) => (
                Usage {
                    model: self.request.model.clone(),
                    ..Default::default()
                },
                self.request.streaming,
                false,
                Some(message),
            ),
            Completion::Abandoned => {
                body_unread = self.status.is_some();
                let error = self
                    .status
                    .is_none()
                    .then(|| "call abandoned before a response arrived".to_string());
                (
                    extract_usage(&self.provider, &self.request, &[], allow_estimate),
                    self.request.streaming,
                    self.request.streaming,
                    error,
                )
            }
        };

        let mut usage = usage;
        if usage.model.is_none() && !self.provider.adapter.is_token_based() {
            usage.model = Some(self.request.endpoint.clone());
        }
        let cost = self.shared.calculator.cost(&self.provider.name, &usage);

        let mut event = Event::new(&self.context, &self.shared.run)
            .with_metadata("usage_source", usage.source.as_str())
            .with_metadata("http_method", self.request.method.clone())
            .with_metadata("adapter", self.provider.adapter.name());
        if let Some(status) = self.status {
            event = event.with_metadata("http_status", status);
        }
        if let Some(error) = &error {
            event = event.with_metadata("error", error.clone());
        }
        if body_unread {
            event = event.with_metadata("body_unread", Value::Bool(true));
        }
        if let Some(service) = &self.shared.config.service_name {
            event = event.with_metadata("service_name", service.clone());
        }

        event.span_type = self.provider.category.as_str().to_string();
        event.provider = self.provider.name.clone();
        event.endpoint = self.request.endpoint.clone();
        event.model = usage.model.clone();
        event.input_tokens = usage.input_tokens;
        event.output_tokens = usage.output_tokens;
        event.cached_tokens = usage.cached_tokens;
        event.cost_usd = cost.total;
        event.pricing_missing = cost.pricing_missing;
        event.pricing_version = cost.pricing_version.clone();
        event.latency_ms = latency.as_millis() as u64;
        event.status = if http_failed || error.is_some() {
            EventStatus::Error
        } else {
            EventStatus::Success
        };
        event.is_streaming = streaming;
        event.stream_cancelled = cancelled;

        metrics.call_latency_ms.observe(event.latency_ms as f64);
        metrics.record_cost(cost.total);
        if cost.pricing_missing {
            metrics.pricing_missing.inc();
        }
        if let Some(model) = &event.model {
            self.span.record_model(model);
        }
        self.span.finish(
            event.input_tokens,
            event.output_tokens,
            cost.total_f64(),
            latency,
            event.status.as_str(),
        );
        tracing::debug!(
            provider = %event.provider,
            model = event.model.as_deref().unwrap_or(""),
            input_tokens = event.input_tokens,
            output_tokens = event.output_tokens,
            cost_usd = %event.cost_usd,
            status = %event.status,
            "call tracked"
        );
        Some(event)
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.done {
            self.complete(Completion::Abandoned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::events::MemoryTransport;
    use crate::instrument::Instrumentation;
    use crate::providers::{Adapter, ProviderCategory, ProviderRegistry};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn tracker() -> (Instrumentation, MemoryTransport) {
        let transport = MemoryTransport::new();
        let instrumentation = Instrumentation::builder()
            .config(TrackerConfig::new().tenant_id("tenant-a"))
            .transport(transport.clone())
            .build()
            .unwrap();
        (instrumentation, transport)
    }

    fn openai_url() -> Url {
        "https://api.openai.com/v1/chat/completions".parse().unwrap()
    }

    fn request_body() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "say hello"}]
        }))
        .unwrap()
    }

    async fn drain(instrumentation: &Instrumentation, transport: &MemoryTransport) -> Vec<Event> {
        instrumentation.flush().await;
        transport.events()
    }

    #[tokio::test]
    async fn test_finish_body_prices_usage() {
        let (instrumentation, transport) = tracker();
        let body = request_body();
        let call =
            instrumentation.begin_call("POST", &openai_url(), &HeaderMap::new(), Some(&body));
        let response = json!({
            "model": "gpt-4o",
            "choices": [{"message": {"content": "hello"}}],
            "usage": {"prompt_tokens": 1000, "completion_tokens": 500}
        });
        call.finish_body(200, &serde_json::to_vec(&response).unwrap());

        let events = drain(&instrumentation, &transport).await;
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.provider, "openai");
        assert_eq!(event.span_type, "llm");
        assert_eq!(event.endpoint, "/v1/chat/completions");
        assert_eq!(event.input_tokens, 1000);
        assert_eq!(event.output_tokens, 500);
        assert_eq!(event.cost_usd, dec!(0.0075));
        assert_eq!(event.tenant_id.as_deref(), Some("tenant-a"));
        assert_eq!(event.event_metadata["usage_source"], "response");
        assert_eq!(event.event_metadata["http_status"], 200);
        assert!(!event.pricing_missing);
    }

    #[tokio::test]
    async fn test_rate_limited_not_recorded() {
        let (instrumentation, transport) = tracker();
        let call = instrumentation.begin_call("POST", &openai_url(), &HeaderMap::new(), None);
        call.finish_body(429, br#"{"error": {"message": "slow down"}}"#);
        assert!(drain(&instrumentation, &transport).await.is_empty());
        assert_eq!(instrumentation.metrics().rate_limited_skipped.get(), 1);
    }

    #[tokio::test]
    async fn test_error_status_uses_explicit_usage_only() {
        let (instrumentation, transport) = tracker();
        let body = request_body();
        let call =
            instrumentation.begin_call("POST", &openai_url(), &HeaderMap::new(), Some(&body));
        call.finish_body(500, br#"{"error": {"message": "internal"}}"#);

        let events = drain(&instrumentation, &transport).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, EventStatus::Error);
        assert_eq!(events[0].input_tokens, 0);
        assert_eq!(events[0].cost_usd, dec!(0));
    }

    #[tokio::test]
    async fn test_network_failure_records_error() {
        let (instrumentation, transport) = tracker();
        let call = instrumentation.begin_call("POST", &openai_url(), &HeaderMap::new(), None);
        call.fail("connection refused");

        let events = drain(&instrumentation, &transport).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, EventStatus::Error);
        assert_eq!(events[0].event_metadata["error"], "connection refused");
    }

    #[tokio::test]
    async fn test_drop_records_once() {
        let (instrumentation, transport) = tracker();
        {
            let mut call =
                instrumentation.begin_call("POST", &openai_url(), &HeaderMap::new(), None);
            call.set_status(200);
        }
        let events = drain(&instrumentation, &transport).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_metadata["body_unread"], true);
        assert_eq!(events[0].status, EventStatus::Success);
    }

    #[tokio::test]
    async fn test_cancelled_stream_partial_event() {
        let (instrumentation, transport) = tracker();
        let body = serde_json::to_vec(&json!({
            "model": "gpt-4o",
            "stream": true,
            "messages": [{"role": "user", "content": "greet me"}]
        }))
        .unwrap();
        let mut call =
            instrumentation.begin_call("POST", &openai_url(), &HeaderMap::new(), Some(&body));
        call.set_status(200);
        assert!(call.is_streaming());

        let mut accumulator = StreamAccumulator::new(call.provider().adapter.clone());
        accumulator.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n");
        accumulator.push(b"data: {\"choices\":[{\"delta\":{\"content\":\" wor\"}}]}\n\n");
        call.finish_stream(accumulator, true, None);

        let events = drain(&instrumentation, &transport).await;
        let event = &events[0];
        assert!(event.is_streaming);
        assert!(event.stream_cancelled);
        assert!((1..=3).contains(&event.output_tokens));
        assert!(event.cost_usd > dec!(0));
        assert_ne!(event.event_metadata["usage_source"], "response");
    }

    #[tokio::test]
    async fn test_unknown_host() {
        let (instrumentation, transport) = tracker();
        let url: Url = "https://internal.example.net/v2/lookup".parse().unwrap();
        let call = instrumentation.begin_call("GET", &url, &HeaderMap::new(), None);
        call.finish_body(200, br#"{"ok": true}"#);

        let events = drain(&instrumentation, &transport).await;
        let event = &events[0];
        assert_eq!(event.provider, "unknown");
        assert_eq!(event.cost_usd, dec!(0));
        assert!(event.pricing_missing);
        assert_eq!(event.model.as_deref(), Some("/v2/lookup"));
        assert_eq!(instrumentation.metrics().pricing_missing.get(), 1);
    }

    #[tokio::test]
    async fn test_section_captured_at_begin() {
        let (instrumentation, transport) = tracker();
        let call = {
            let _section = context::push_section("agent:writer");
            instrumentation.begin_call("POST", &openai_url(), &HeaderMap::new(), None)
        };
        call.finish_body(200, b"{}");
        let events = drain(&instrumentation, &transport).await;
        assert_eq!(events[0].section_path, "agent:writer");
        assert_eq!(events[0].run_id, instrumentation.run().run_id);
        assert_eq!(
            events[0].parent_span_id,
            Some(instrumentation.run().root_span_id)
        );
    }

    #[tokio::test]
    async fn test_disabled_records_nothing() {
        let transport = MemoryTransport::new();
        let instrumentation = Instrumentation::builder()
            .config(TrackerConfig::disabled())
            .transport(transport.clone())
            .build()
            .unwrap();
        let call = instrumentation.begin_call("POST", &openai_url(), &HeaderMap::new(), None);
        call.finish_body(200, b"{}");
        assert!(drain(&instrumentation, &transport).await.is_empty());
    }

    #[tokio::test]
    async fn test_custom_provider_via_registry() {
        let transport = MemoryTransport::new();
        let mut registry = ProviderRegistry::with_builtins();
        registry.map_host(
            "llm-gateway.internal",
            ProviderInfo::new("openai", ProviderCategory::Llm, Adapter::OpenAiStyle),
        );
        let instrumentation = Instrumentation::builder()
            .transport(transport.clone())
            .registry(registry)
            .build()
            .unwrap();
        let url: Url = "http://llm-gateway.internal/v1/chat/completions"
            .parse()
            .unwrap();
        let call = instrumentation.begin_call("POST", &url, &HeaderMap::new(), None);
        call.finish_body(
            200,
            br#"{"model":"gpt-4o-mini","usage":{"prompt_tokens":10,"completion_tokens":5}}"#,
        );
        let events = drain(&instrumentation, &transport).await;
        assert_eq!(events[0].provider, "openai");
        assert_eq!(events[0].model.as_deref(), Some("gpt-4o-mini"));
    }
}
