//! Event delivery tests against a mock collector
//!
//! Covers batching, retry after collector failures, background flushing,
//! the final flush on shutdown and configuration loaded from disk.
//!
//! Run: cargo nextest run --test delivery_tests

use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::json;
use spendtrace::{
    Event, EventBuffer, FlushOutcome, HttpTransport, Instrumentation, TrackerConfig,
    TrackerMetrics, context::ContextSnapshot, context::Run,
};
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const INGEST: &str = "/api/events/batch";

fn events(n: usize) -> Vec<Event> {
    let run = Run::new();
    (0..n)
        .map(|i| {
            Event::new(
                &ContextSnapshot::untracked().with_section(format!("step:{i}")),
                &run,
            )
        })
        .collect()
}

async fn delivered(server: &MockServer) -> Vec<serde_json::Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == INGEST && r.method.as_str() == "POST")
        .flat_map(|r| {
            serde_json::from_slice::<Vec<serde_json::Value>>(&r.body).unwrap_or_default()
        })
        .collect()
}

fn ingest_url(server: &MockServer) -> Url {
    format!("{}{INGEST}", server.uri()).parse().unwrap()
}

// =============================================================================
// Buffer and HTTP transport
// =============================================================================

mod buffer_tests {
    use super::*;

    #[tokio::test]
    async fn test_retry_after_collector_outage_delivers_once() {
        let collector = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(INGEST))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .up_to_n_times(1)
            .mount(&collector)
            .await;
        Mock::given(method("POST"))
            .and(path(INGEST))
            .respond_with(ResponseTemplate::new(202))
            .mount(&collector)
            .await;

        let metrics = Arc::new(TrackerMetrics::new());
        let transport = HttpTransport::new(ingest_url(&collector), None);
        let buffer = EventBuffer::new(Arc::new(transport), 2, 100, metrics.clone());
        let sent = events(5);
        for event in sent.clone() {
            buffer.push(event);
        }

        assert_eq!(buffer.flush().await, FlushOutcome::Requeued(5));
        assert_eq!(buffer.len(), 5);
        assert_eq!(metrics.flush_failures.get(), 1);

        assert_eq!(buffer.flush().await, FlushOutcome::Delivered(5));
        assert!(buffer.is_empty());

        let received = delivered(&collector).await;
        // The rejected batch is visible to the mock too; count distinct ids.
        let ids: HashSet<_> = received.iter().map(|e| e["id"].clone()).collect();
        assert_eq!(ids.len(), 5);
        let accepted: Vec<_> = received.iter().skip(2).map(|e| e["id"].clone()).collect();
        let expected: Vec<_> = sent.iter().map(|e| json!(e.id)).collect();
        assert_eq!(accepted, expected);
        assert_eq!(metrics.events_delivered.get(), 5);
    }

    #[tokio::test]
    async fn test_bearer_token_and_wire_shape() {
        let collector = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(INGEST))
            .and(header("authorization", "Bearer collector-secret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&collector)
            .await;

        let transport = HttpTransport::new(
            ingest_url(&collector),
            Some(SecretString::from("collector-secret".to_string())),
        );
        let buffer = EventBuffer::new(Arc::new(transport), 10, 100, Arc::new(TrackerMetrics::new()));
        buffer.push(events(1).remove(0));
        assert_eq!(buffer.flush().await, FlushOutcome::Delivered(1));

        let event = &delivered(&collector).await[0];
        assert_eq!(event["section_path"], "step:0");
        assert_eq!(event["status"], "success");
        assert!(event["cost_usd"].is_number());
        assert!(event["run_id"].is_string());
    }
}

// =============================================================================
// Instrumentation lifecycle
// =============================================================================

mod lifecycle_tests {
    use super::*;

    fn record_openai(tracker: &Instrumentation) {
        let url: Url = "https://api.openai.com/v1/chat/completions".parse().unwrap();
        tracker.record(
            "POST",
            &url,
            Some(br#"{"model":"gpt-4o-mini","messages":[]}"#),
            200,
            br#"{"model":"gpt-4o-mini","usage":{"prompt_tokens":100,"completion_tokens":20}}"#,
            Duration::from_millis(30),
        );
    }

    async fn collector() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(INGEST))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_background_flusher_delivers() {
        let server = collector().await;
        let config = TrackerConfig::new()
            .endpoint(server.uri().parse().unwrap())
            .api_key("flusher-key")
            .flush_interval(Duration::from_millis(50));
        let tracker = Instrumentation::new(config).unwrap();

        record_openai(&tracker);
        record_openai(&tracker);

        let mut received = Vec::new();
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            received = delivered(&server).await;
            if received.len() == 2 {
                break;
            }
        }
        assert_eq!(received.len(), 2);
        assert_eq!(received[0]["provider"], "openai");
        assert_eq!(received[0]["input_tokens"], 100);
        assert_eq!(tracker.buffered(), 0);

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests[0].headers["authorization"], "Bearer flusher-key");
    }

    #[tokio::test]
    async fn test_shutdown_flushes_remaining_events() {
        let server = collector().await;
        let config = TrackerConfig::new()
            .endpoint(server.uri().parse().unwrap())
            .flush_interval(Duration::from_secs(3600));
        let tracker = Instrumentation::new(config).unwrap();

        for _ in 0..3 {
            record_openai(&tracker);
        }
        assert_eq!(tracker.buffered(), 3);

        let outcome = tracker.shutdown().await.unwrap();
        assert_eq!(outcome, FlushOutcome::Delivered(3));
        assert_eq!(delivered(&server).await.len(), 3);
        assert!(tracker.is_shut_down());
        assert!(matches!(
            tracker.shutdown().await,
            Err(spendtrace::Error::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_batch_threshold_triggers_early_flush() {
        let server = collector().await;
        let config = TrackerConfig::new()
            .endpoint(server.uri().parse().unwrap())
            .batch_size(3)
            .flush_interval(Duration::from_secs(3600));
        let tracker = Instrumentation::new(config).unwrap();

        for _ in 0..3 {
            record_openai(&tracker);
        }

        let mut count = 0;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            count = delivered(&server).await.len();
            if count == 3 {
                break;
            }
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_config_file_builds_instrumentation() {
        let server = collector().await;
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            "service_name: billing-worker\ntenant_id: tenant-9\ncollector:\n  endpoint: {}\nflush:\n  interval_ms: 3600000\n",
            server.uri()
        )
        .unwrap();

        let config = TrackerConfig::from_file(file.path()).unwrap();
        let tracker = Instrumentation::new(config).unwrap();
        record_openai(&tracker);
        tracker.flush().await;

        let event = &delivered(&server).await[0];
        assert_eq!(event["tenant_id"], "tenant-9");
        assert_eq!(event["event_metadata"]["service_name"], "billing-worker");
    }

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let first = Instrumentation::install(TrackerConfig::disabled()).unwrap();
        let second = Instrumentation::install(TrackerConfig::new()).unwrap();
        assert_eq!(first.run().run_id, second.run().run_id);
        assert!(!second.is_enabled());

        let global = Instrumentation::try_global().unwrap();
        assert_eq!(global.run().run_id, first.run().run_id);
        assert!(matches!(
            first.set_global(),
            Err(spendtrace::Error::AlreadyInstalled)
        ));
    }
}
