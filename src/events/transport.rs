use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use super::Event;
use crate::{Error, Result};

/// Delivers one batch of events to the collector.
///
/// `Ok` means the whole batch was accepted. Any error keeps the batch
/// buffered for a later attempt.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    async fn send(&self, batch: &[Event]) -> Result<()>;
}

/// POSTs batches as a JSON array with bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
    api_key: Option<SecretString>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(url: Url, api_key: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            api_key,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, batch: &[Event]) -> Result<()> {
        let body = serde_json::to_vec(batch)?;
        let mut request = self
            .client
            .post(self.url.clone())
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(Error::Collector {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        })
    }
}

/// Keeps delivered events in memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    delivered: Arc<Mutex<Vec<Event>>>,
    batches: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
    fail_remaining: Arc<AtomicUsize>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` sends fail with a 503.
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Event> {
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, batch: &[Event]) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Collector {
                status: 503,
                message: "scripted failure".into(),
            });
        }
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(batch);
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
