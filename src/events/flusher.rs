use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backoff::ExponentialBackoff;
use super::buffer::{EventBuffer, FlushOutcome};

/// Background task that drains an [`EventBuffer`] on a timer or when the
/// batch threshold is reached, backing off while the collector fails.
#[derive(Debug)]
pub struct Flusher {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Flusher {
    /// Starts the flush loop on the current tokio runtime. Returns `None`
    /// outside a runtime; callers then flush explicitly.
    pub fn spawn(
        buffer: Arc<EventBuffer>,
        interval: Duration,
        backoff: ExponentialBackoff,
    ) -> Option<Self> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let cancel = CancellationToken::new();
        let handle = runtime.spawn(run(buffer, interval, backoff, cancel.clone()));
        Some(Self {
            cancel,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stops the loop and waits for an in-progress flush to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "flusher task ended abnormally");
        }
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    buffer: Arc<EventBuffer>,
    interval: Duration,
    backoff: ExponentialBackoff,
    cancel: CancellationToken,
) {
    let mut failures: u32 = 0;
    tracing::debug!(interval_ms = interval.as_millis() as u64, "flusher started");

    loop {
        let delay = if failures == 0 {
            interval
        } else {
            backoff.delay_for(failures).max(interval)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
            _ = buffer.threshold_reached(), if failures == 0 => {}
        }

        match buffer.flush().await {
            FlushOutcome::Delivered(_) | FlushOutcome::Empty => failures = 0,
            FlushOutcome::Requeued(n) => {
                failures = failures.saturating_add(1);
                tracing::debug!(
                    failures,
                    pending = n,
                    retry_in_ms = backoff.delay_for(failures).max(interval).as_millis() as u64,
                    "flush backing off"
                );
            }
            FlushOutcome::Skipped => {}
        }
    }

    tracing::debug!("flusher stopped");
}
