//! The instrumentation handle.
//!
//! An [`Instrumentation`] owns everything a tracked call needs: the run, the
//! provider registry, pricing, the optional cap guard and the event buffer
//! with its flusher. Build one explicitly and pass it where calls are made,
//! or [`install`](Instrumentation::install) it once for the whole process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use reqwest::header::HeaderMap;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::caps::{CapGuard, CapService, HttpCapService};
use crate::config::TrackerConfig;
use crate::context::Run;
use crate::events::{
    EventBuffer, ExponentialBackoff, FlushOutcome, Flusher, HttpTransport, Transport,
};
use crate::intercept::{PendingCall, TrackedClient};
use crate::observability::TrackerMetrics;
use crate::pricing::{
    CostCalculator, HttpPricingSource, PricingSource, PricingTable, builtin_pricing_table,
    spawn_refresh,
};
use crate::providers::ProviderRegistry;
use crate::{Error, Result};

static GLOBAL: OnceLock<Instrumentation> = OnceLock::new();

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_FACTOR: f64 = 2.0;

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: TrackerConfig,
    pub(crate) run: Run,
    pub(crate) registry: ProviderRegistry,
    pub(crate) calculator: Arc<CostCalculator>,
    pub(crate) caps: Option<CapGuard>,
    pub(crate) buffer: Arc<EventBuffer>,
    pub(crate) metrics: Arc<TrackerMetrics>,
    flusher: Option<Flusher>,
    background: CancellationToken,
    shut_down: AtomicBool,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.background.cancel();
    }
}

/// Cheaply clonable handle; clones share one run and one buffer.
#[derive(Debug, Clone)]
pub struct Instrumentation {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
pub struct InstrumentationBuilder {
    config: TrackerConfig,
    transport: Option<Arc<dyn Transport>>,
    pricing: Option<PricingTable>,
    pricing_source: Option<Arc<dyn PricingSource>>,
    cap_service: Option<Arc<dyn CapService>>,
    registry: Option<ProviderRegistry>,
}

impl InstrumentationBuilder {
    pub fn config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    /// Delivery target; defaults to the collector's ingest endpoint.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Starting price table; defaults to the built-in one.
    pub fn pricing(mut self, table: PricingTable) -> Self {
        self.pricing = Some(table);
        self
    }

    /// Periodic price refresh; defaults to `pricing.service_url` when set.
    pub fn pricing_source(mut self, source: impl PricingSource + 'static) -> Self {
        self.pricing_source = Some(Arc::new(source));
        self
    }

    /// Used only when `caps.enabled` is set; defaults to the collector's cap
    /// endpoint.
    pub fn cap_service(mut self, service: impl CapService + 'static) -> Self {
        self.cap_service = Some(Arc::new(service));
        self
    }

    pub fn registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<Instrumentation> {
        let config = self.config;
        config.validate()?;

        let metrics = Arc::new(TrackerMetrics::new());
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                HttpTransport::new(
                    config.collector.ingest_url()?,
                    config.collector.api_key.clone(),
                )
                .with_timeout(config.collector.request_timeout),
            ),
        };
        let buffer = Arc::new(EventBuffer::new(
            transport,
            config.flush.batch_size,
            config.flush.max_buffered,
            metrics.clone(),
        ));

        let table = self
            .pricing
            .unwrap_or_else(|| builtin_pricing_table().clone());
        let calculator = Arc::new(
            CostCalculator::new(table).with_pinned_version(config.pricing.version.clone()),
        );

        let caps = if config.caps.enabled {
            let service: Arc<dyn CapService> = match self.cap_service {
                Some(service) => service,
                None => Arc::new(HttpCapService::new(
                    config.collector.cap_check_url()?,
                    config.collector.api_key.clone(),
                )),
            };
            Some(CapGuard::new(service, &config.caps, metrics.clone()))
        } else {
            None
        };

        let background = CancellationToken::new();
        let has_runtime = tokio::runtime::Handle::try_current().is_ok();
        let mut flusher = None;

        if config.enabled {
            let backoff = ExponentialBackoff::new(
                BACKOFF_INITIAL.min(config.flush.backoff_max),
                config.flush.backoff_max,
                BACKOFF_FACTOR,
            );
            flusher = Flusher::spawn(buffer.clone(), config.flush.interval, backoff);
            if flusher.is_none() {
                tracing::warn!("no tokio runtime; events are delivered only by explicit flush()");
            }

            let source = self.pricing_source.or_else(|| {
                config.pricing.service_url.clone().map(|url| {
                    Arc::new(
                        HttpPricingSource::new(url)
                            .with_api_key(config.collector.api_key.clone()),
                    ) as Arc<dyn PricingSource>
                })
            });
            match source {
                Some(source) if has_runtime => {
                    spawn_refresh(
                        calculator.clone(),
                        source,
                        config.pricing.refresh_interval,
                        background.child_token(),
                    );
                }
                Some(_) => tracing::warn!("no tokio runtime; pricing refresh disabled"),
                None => {}
            }
        }

        let run = Run::new();
        tracing::info!(
            run_id = %run.run_id,
            enabled = config.enabled,
            caps = caps.is_some(),
            collector = %config.collector.endpoint,
            "instrumentation ready"
        );

        Ok(Instrumentation {
            shared: Arc::new(Shared {
                config,
                run,
                registry: self.registry.unwrap_or_default(),
                calculator,
                caps,
                buffer,
                metrics,
                flusher,
                background,
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Builds and installs as the process-wide handle. See
    /// [`Instrumentation::install`].
    pub fn install(self) -> Result<Instrumentation> {
        if let Some(existing) = GLOBAL.get() {
            tracing::debug!("instrumentation already installed; reusing it");
            return Ok(existing.clone());
        }
        let built = self.build()?;
        match GLOBAL.set(built.clone()) {
            Ok(()) => Ok(built),
            Err(lost) => {
                tracing::debug!("instrumentation installed concurrently; reusing it");
                Ok(GLOBAL.get().cloned().unwrap_or(lost))
            }
        }
    }
}

impl Instrumentation {
    pub fn builder() -> InstrumentationBuilder {
        InstrumentationBuilder::default()
    }

    pub fn new(config: TrackerConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Installs a process-wide handle once. Later calls return the installed
    /// handle unchanged and ignore `config`.
    pub fn install(config: TrackerConfig) -> Result<Self> {
        Self::builder().config(config).install()
    }

    /// Makes this handle the process-wide one; fails if one is installed.
    pub fn set_global(&self) -> Result<()> {
        GLOBAL.set(self.clone()).map_err(|_| Error::AlreadyInstalled)
    }

    pub fn global() -> Option<Self> {
        GLOBAL.get().cloned()
    }

    pub fn try_global() -> Result<Self> {
        Self::global().ok_or(Error::NotInstalled)
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.config.enabled
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.shared.config
    }

    pub fn run(&self) -> &Run {
        &self.shared.run
    }

    pub fn metrics(&self) -> &TrackerMetrics {
        &self.shared.metrics
    }

    pub fn calculator(&self) -> &CostCalculator {
        &self.shared.calculator
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.shared.registry
    }

    pub fn cap_guard(&self) -> Option<&CapGuard> {
        self.shared.caps.as_ref()
    }

    /// Events waiting for delivery.
    pub fn buffered(&self) -> usize {
        self.shared.buffer.len()
    }

    pub fn wrap(&self, client: reqwest::Client) -> TrackedClient {
        TrackedClient::new(client, self.clone())
    }

    /// A tracked client over a default `reqwest::Client`.
    pub fn client(&self) -> TrackedClient {
        self.wrap(reqwest::Client::new())
    }

    /// Starts tracking a call made outside [`TrackedClient`]. The context
    /// is captured now.
    pub fn begin_call(
        &self,
        method: &str,
        url: &Url,
        headers: &HeaderMap,
        body: Option<&[u8]>,
    ) -> PendingCall {
        PendingCall::begin(self.shared.clone(), method, url, headers, body)
    }

    /// Records a completed call in one step. Usable from synchronous code.
    pub fn record(
        &self,
        method: &str,
        url: &Url,
        request_body: Option<&[u8]>,
        status: u16,
        response_body: &[u8],
        latency: Duration,
    ) {
        self.begin_call(method, url, &HeaderMap::new(), request_body)
            .with_latency(latency)
            .finish_body(status, response_body);
    }

    pub async fn flush(&self) -> FlushOutcome {
        self.shared.buffer.flush().await
    }

    /// Stops background work and makes one final flush attempt, bounded by
    /// `flush.shutdown_timeout`. Events still buffered after that are lost
    /// when the process exits.
    pub async fn shutdown(&self) -> Result<FlushOutcome> {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return Err(Error::Shutdown);
        }
        self.shared.background.cancel();
        if let Some(flusher) = &self.shared.flusher {
            flusher.stop().await;
        }

        let limit = self.shared.config.flush.shutdown_timeout;
        match tokio::time::timeout(limit, self.shared.buffer.flush()).await {
            Ok(outcome) => {
                tracing::info!(
                    ?outcome,
                    remaining = self.shared.buffer.len(),
                    "instrumentation shut down"
                );
                Ok(outcome)
            }
            Err(_) => {
                tracing::warn!(
                    remaining = self.shared.buffer.len(),
                    "final flush timed out"
                );
                Err(Error::Timeout(limit))
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }
}

/// Records through the installed handle; a no-op when none is installed.
pub fn record_global(
    method: &str,
    url: &Url,
    request_body: Option<&[u8]>,
    status: u16,
    response_body: &[u8],
    latency: Duration,
) {
    if let Some(instrumentation) = GLOBAL.get() {
        instrumentation.record(method, url, request_body, status, response_body, latency);
    }
}
