use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rust_decimal::Decimal;

use super::circuit::CircuitBreaker;
use super::service::CapService;
use super::{CapCheckResponse, CapDecision, CapQuery};
use crate::config::CapGuardConfig;
use crate::observability::TrackerMetrics;

/// Pre-flight cap check with a hard timeout, a short result cache and a
/// circuit breaker. Never returns an error: anything that prevents a check
/// yields [`CapDecision::Allowed`].
#[derive(Debug)]
pub struct CapGuard {
    service: Arc<dyn CapService>,
    timeout: Duration,
    cache_ttl: Duration,
    cache_capacity: usize,
    cache: DashMap<CapQuery, (Instant, CapCheckResponse)>,
    circuit: CircuitBreaker,
    metrics: Arc<TrackerMetrics>,
}

impl CapGuard {
    pub fn new(
        service: Arc<dyn CapService>,
        config: &CapGuardConfig,
        metrics: Arc<TrackerMetrics>,
    ) -> Self {
        Self {
            service,
            timeout: config.timeout,
            cache_ttl: config.cache_ttl,
            cache_capacity: config.cache_capacity,
            cache: DashMap::new(),
            circuit: CircuitBreaker::new(config.circuit.clone()),
            metrics,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    fn cached(&self, query: &CapQuery) -> Option<CapCheckResponse> {
        let entry = self.cache.get(query)?;
        let (at, response) = entry.value();
        if at.elapsed() < self.cache_ttl {
            Some(response.clone())
        } else {
            drop(entry);
            self.cache.remove(query);
            None
        }
    }

    pub fn cached_decisions(&self) -> usize {
        self.cache.len()
    }

    /// Caches `response` unless the cache is still full after expired
    /// entries are purged.
    fn remember(&self, query: &CapQuery, response: &CapCheckResponse) {
        if self.cache_ttl.is_zero() || self.cache_capacity == 0 {
            return;
        }
        if self.cache.len() >= self.cache_capacity {
            let ttl = self.cache_ttl;
            self.cache.retain(|_, (at, _)| at.elapsed() < ttl);
            if self.cache.len() >= self.cache_capacity {
                tracing::debug!(
                    capacity = self.cache_capacity,
                    "cap decision cache full; not caching"
                );
                return;
            }
        }
        self.cache
            .insert(query.clone(), (Instant::now(), response.clone()));
    }

    fn fail_open(&self, query: &CapQuery, reason: &str) -> CapDecision {
        self.metrics.cap_fail_open.inc();
        tracing::warn!(
            provider = %query.provider,
            model = query.model.as_deref().unwrap_or(""),
            reason,
            "cap check unavailable; allowing call"
        );
        CapDecision::Allowed
    }

    async fn fetch(&self, query: &CapQuery) -> Option<CapCheckResponse> {
        // Dropping this future mid-check drops the permit, which frees a
        // half-open trial slot.
        let Some(permit) = self.circuit.try_acquire() else {
            self.fail_open(query, "circuit open");
            return None;
        };
        match tokio::time::timeout(self.timeout, self.service.check(query)).await {
            Ok(Ok(response)) => {
                permit.success();
                self.remember(query, &response);
                Some(response)
            }
            Ok(Err(e)) => {
                permit.failure();
                self.fail_open(query, &e.to_string());
                None
            }
            Err(_) => {
                permit.failure();
                self.fail_open(query, "timed out");
                None
            }
        }
    }

    /// Decides whether a call projected to cost `projected` may proceed.
    pub async fn check(&self, query: &CapQuery, projected: Decimal) -> CapDecision {
        self.metrics.cap_checks.inc();

        let response = match self.cached(query) {
            Some(response) => response,
            None => match self.fetch(query).await {
                Some(response) => response,
                None => return CapDecision::Allowed,
            },
        };

        let decision = CapDecision::from_response(&response, projected);
        match &decision {
            CapDecision::Blocked { message, caps } => {
                self.metrics.cap_blocks.inc();
                tracing::info!(
                    provider = %query.provider,
                    caps = caps.len(),
                    %message,
                    "call blocked by spending cap"
                );
            }
            CapDecision::AllowedWithWarning(caps) => {
                for cap in caps {
                    tracing::warn!(cap = %cap, "alert-mode spending cap exceeded");
                }
            }
            CapDecision::Allowed => {}
        }
        decision
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::{CircuitConfig, CircuitState, Enforcement, ExceededCap, CapScope};
    use crate::{Error, Result};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Scripted {
        calls: AtomicUsize,
        delay: Duration,
        reply: Option<CapCheckResponse>,
    }

    impl Scripted {
        fn new(delay: Duration, reply: Option<CapCheckResponse>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                reply,
            })
        }
    }

    #[async_trait]
    impl CapService for Scripted {
        async fn check(&self, _query: &CapQuery) -> Result<CapCheckResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.reply
                .clone()
                .ok_or_else(|| Error::Collector { status: 500, message: "boom".into() })
        }
    }

    fn config(timeout: Duration) -> CapGuardConfig {
        CapGuardConfig {
            enabled: true,
            timeout,
            cache_ttl: Duration::from_secs(60),
            cache_capacity: 1024,
            circuit: CircuitConfig {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(60),
                success_threshold: 1,
            },
        }
    }

    fn query() -> CapQuery {
        CapQuery {
            provider: "openai".into(),
            model: Some("gpt-4o".into()),
            ..Default::default()
        }
    }

    fn blocked() -> CapCheckResponse {
        CapCheckResponse {
            allowed: false,
            exceeded_caps: vec![ExceededCap {
                cap_type: CapScope::Global,
                target_name: None,
                current: dec!(101),
                limit: dec!(100),
                period: "daily".into(),
                enforcement: Enforcement::HardBlock,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_timeout_fails_open_within_bound() {
        let service = Scripted::new(Duration::from_secs(30), Some(blocked()));
        let metrics = Arc::new(TrackerMetrics::new());
        let guard = CapGuard::new(service, &config(Duration::from_millis(50)), metrics.clone());

        let started = Instant::now();
        let decision = guard.check(&query(), dec!(1)).await;
        assert_eq!(decision, CapDecision::Allowed);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(metrics.cap_fail_open.get(), 1);
    }

    #[tokio::test]
    async fn test_blocked_and_cached() {
        let service = Scripted::new(Duration::ZERO, Some(blocked()));
        let metrics = Arc::new(TrackerMetrics::new());
        let guard = CapGuard::new(service.clone(), &config(Duration::from_secs(1)), metrics.clone());

        assert!(guard.check(&query(), dec!(0)).await.is_blocked());
        assert!(guard.check(&query(), dec!(0)).await.is_blocked());
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.cap_blocks.get(), 2);
        assert_eq!(metrics.cap_checks.get(), 2);
    }

    #[tokio::test]
    async fn test_errors_open_circuit() {
        let service = Scripted::new(Duration::ZERO, None);
        let metrics = Arc::new(TrackerMetrics::new());
        let guard = CapGuard::new(service.clone(), &config(Duration::from_secs(1)), metrics.clone());

        for _ in 0..4 {
            assert_eq!(guard.check(&query(), dec!(0)).await, CapDecision::Allowed);
        }
        assert_eq!(guard.circuit().state(), CircuitState::Open);
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.cap_fail_open.get(), 4);
    }

    /// Replays one scripted step per call; the last step repeats.
    #[derive(Debug)]
    struct Sequence {
        calls: AtomicUsize,
        steps: Vec<(Duration, Option<CapCheckResponse>)>,
    }

    #[async_trait]
    impl CapService for Sequence {
        async fn check(&self, _query: &CapQuery) -> Result<CapCheckResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let (delay, reply) = self.steps[n.min(self.steps.len() - 1)].clone();
            tokio::time::sleep(delay).await;
            reply.ok_or_else(|| Error::Collector { status: 503, message: "down".into() })
        }
    }

    #[tokio::test]
    async fn test_cancelled_half_open_check_does_not_wedge_circuit() {
        let service = Arc::new(Sequence {
            calls: AtomicUsize::new(0),
            steps: vec![
                (Duration::ZERO, None),
                (Duration::from_secs(10), Some(blocked())),
                (Duration::ZERO, Some(blocked())),
            ],
        });
        let mut config = config(Duration::from_secs(1));
        config.cache_ttl = Duration::ZERO;
        config.circuit = CircuitConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(20),
            success_threshold: 1,
        };
        let guard = CapGuard::new(service.clone(), &config, Arc::new(TrackerMetrics::new()));

        assert_eq!(guard.check(&query(), dec!(0)).await, CapDecision::Allowed);
        assert_eq!(guard.circuit().state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The caller gives up while the half-open check is still in flight.
        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), guard.check(&query(), dec!(0))).await;
        assert!(cancelled.is_err());
        assert_eq!(guard.circuit().state(), CircuitState::HalfOpen);

        for _ in 0..5 {
            assert!(guard.check(&query(), dec!(0)).await.is_blocked());
        }
        assert_eq!(guard.circuit().state(), CircuitState::Closed);
        assert_eq!(service.calls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_decision_cache_is_bounded() {
        let service = Scripted::new(Duration::ZERO, Some(CapCheckResponse::default()));
        let mut config = config(Duration::from_secs(1));
        config.cache_ttl = Duration::from_millis(150);
        config.cache_capacity = 4;
        let guard = CapGuard::new(service.clone(), &config, Arc::new(TrackerMetrics::new()));

        let customer = |i: usize| CapQuery {
            customer_id: Some(format!("cust-{i}")),
            ..query()
        };
        for i in 0..10 {
            guard.check(&customer(i), dec!(0)).await;
        }
        assert_eq!(guard.cached_decisions(), 4);
        assert_eq!(service.calls.load(Ordering::SeqCst), 10);

        tokio::time::sleep(Duration::from_millis(200)).await;
        guard.check(&customer(100), dec!(0)).await;
        assert_eq!(guard.cached_decisions(), 1);
    }
}
