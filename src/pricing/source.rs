//! Remote pricing service and periodic table refresh.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::calculator::CostCalculator;
use super::table::PricingEntry;
use crate::{Error, Result};

#[async_trait]
pub trait PricingSource: Send + Sync + Debug {
    async fn fetch(&self) -> Result<Vec<PricingEntry>>;
}

/// Fixed entries; useful in tests and for pricing overrides shipped with an
/// application.
#[derive(Debug, Clone, Default)]
pub struct StaticPricingSource {
    entries: Vec<PricingEntry>,
}

impl StaticPricingSource {
    pub fn new(entries: Vec<PricingEntry>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl PricingSource for StaticPricingSource {
    async fn fetch(&self) -> Result<Vec<PricingEntry>> {
        Ok(self.entries.clone())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PricingPayload {
    List(Vec<PricingEntry>),
    Wrapped {
        #[serde(alias = "pricing", alias = "models")]
        entries: Vec<PricingEntry>,
    },
}

/// GETs a JSON list of [`PricingEntry`] (bare, or under `entries`).
#[derive(Debug, Clone)]
pub struct HttpPricingSource {
    client: reqwest::Client,
    url: Url,
    api_key: Option<SecretString>,
}

impl HttpPricingSource {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            api_key: None,
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_api_key(mut self, api_key: Option<SecretString>) -> Self {
        self.api_key = api_key;
        self
    }
}

#[async_trait]
impl PricingSource for HttpPricingSource {
    async fn fetch(&self) -> Result<Vec<PricingEntry>> {
        let mut request = self.client.get(self.url.clone());
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Collector {
                status: status.as_u16(),
                message,
            });
        }
        let bytes = response.bytes().await?;
        let payload: PricingPayload = serde_json::from_slice(&bytes)?;
        Ok(match payload {
            PricingPayload::List(entries) | PricingPayload::Wrapped { entries } => entries,
        })
    }
}

/// Fetches once and merges the result. A failed or empty fetch leaves the
/// current table in place.
pub async fn refresh_pricing(
    calculator: &CostCalculator,
    source: &dyn PricingSource,
) -> Result<usize> {
    let entries = source.fetch().await?;
    if entries.is_empty() {
        tracing::debug!("pricing source returned no entries; keeping current table");
        return Ok(0);
    }
    let count = calculator.merge(entries);
    tracing::debug!(entries = count, "pricing table refreshed");
    Ok(count)
}

/// Refreshes immediately, then every `interval`, until `cancel` fires.
pub fn spawn_refresh(
    calculator: Arc<CostCalculator>,
    source: Arc<dyn PricingSource>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = refresh_pricing(&calculator, source.as_ref()).await {
                        tracing::warn!(error = %e, "pricing refresh failed; keeping previous table");
                    }
                }
            }
        }
    })
}
