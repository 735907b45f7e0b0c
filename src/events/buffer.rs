use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::Event;
use super::transport::Transport;
use crate::observability::TrackerMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every drained event was accepted.
    Delivered(usize),
    /// A batch failed; this many events went back to the buffer.
    Requeued(usize),
    /// Another flush was already running.
    Skipped,
    Empty,
}

/// Bounded in-memory event queue with single-flight flushing.
///
/// Producers never wait on delivery: `push` takes a short lock and returns.
/// At most one flush runs at a time; events pushed during a flush wait for
/// the next one. `max_buffered` bounds queued and in-flight events together.
#[derive(Debug)]
pub struct EventBuffer {
    queue: Mutex<Queue>,
    transport: Arc<dyn Transport>,
    batch_size: usize,
    max_buffered: usize,
    flushing: AtomicBool,
    notify: Notify,
    metrics: Arc<TrackerMetrics>,
}

#[derive(Debug, Default)]
struct Queue {
    events: VecDeque<Event>,
    /// Taken by the running flush and not yet accepted or returned.
    in_flight: usize,
}

impl Queue {
    fn held(&self) -> usize {
        self.events.len() + self.in_flight
    }
}

/// Resets the single-flight flag when a flush ends, however it ends.
struct FlushingGuard<'a>(&'a AtomicBool);

impl Drop for FlushingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Events taken out of the queue by a flush and not yet accepted. Whatever
/// is left on drop goes back to the front of the queue, so an abandoned
/// flush (error or cancelled future) loses nothing.
struct InFlight<'a> {
    buffer: &'a EventBuffer,
    events: VecDeque<Event>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.events.is_empty() {
            self.buffer.requeue(std::mem::take(&mut self.events));
        }
    }
}

impl EventBuffer {
    pub fn new(
        transport: Arc<dyn Transport>,
        batch_size: usize,
        max_buffered: usize,
        metrics: Arc<TrackerMetrics>,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            queue: Mutex::new(Queue::default()),
            transport,
            batch_size,
            max_buffered: max_buffered.max(batch_size),
            flushing: AtomicBool::new(false),
            notify: Notify::new(),
            metrics,
        }
    }

    /// Events waiting for the next flush.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).events.len()
    }

    /// Events held in memory, queued or in flight.
    pub fn held(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).held()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    /// Appends an event, evicting the oldest queued one when full. When the
    /// whole bound is in flight the new event itself is dropped.
    pub fn push(&self, event: Event) {
        let (len, held, dropped) = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            let mut dropped = false;
            if queue.held() >= self.max_buffered {
                dropped = true;
                if queue.events.pop_front().is_some() {
                    queue.events.push_back(event);
                }
            } else {
                queue.events.push_back(event);
            }
            (queue.events.len(), queue.held(), dropped)
        };

        self.metrics.events_recorded.inc();
        self.metrics.buffered_events.set(held as i64);
        if dropped {
            self.metrics.events_dropped.inc();
            tracing::warn!(
                max_buffered = self.max_buffered,
                "event buffer full; dropped oldest event"
            );
        }
        if len >= self.batch_size {
            self.notify.notify_one();
        }
    }

    fn accepted(&self, count: usize) {
        let held = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.in_flight = queue.in_flight.saturating_sub(count);
            queue.held()
        };
        self.metrics.buffered_events.set(held as i64);
    }

    fn requeue(&self, events: VecDeque<Event>) {
        let count = events.len();
        let (len, dropped) = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.in_flight = queue.in_flight.saturating_sub(count);
            for event in events.into_iter().rev() {
                queue.events.push_front(event);
            }
            let mut dropped = 0;
            while queue.held() > self.max_buffered && queue.events.pop_front().is_some() {
                dropped += 1;
            }
            (queue.events.len(), dropped)
        };
        self.metrics.buffered_events.set(len as i64);
        if dropped > 0 {
            self.metrics.events_dropped.add(dropped);
            tracing::warn!(dropped, "event buffer full after requeue; dropped oldest events");
        }
        tracing::debug!(requeued = count, buffered = len, "events returned to buffer");
    }

    /// Sends everything buffered, in batches, oldest first. Stops at the
    /// first failed batch and returns it and everything after it to the
    /// front of the buffer.
    pub async fn flush(&self) -> FlushOutcome {
        if self.flushing.swap(true, Ordering::AcqRel) {
            return FlushOutcome::Skipped;
        }
        let _guard = FlushingGuard(&self.flushing);

        let drained: VecDeque<Event> = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            let drained = std::mem::take(&mut queue.events);
            queue.in_flight = drained.len();
            drained
        };
        if drained.is_empty() {
            return FlushOutcome::Empty;
        }

        let mut in_flight = InFlight {
            buffer: self,
            events: drained,
        };
        let mut delivered = 0;

        while !in_flight.events.is_empty() {
            let n = self.batch_size.min(in_flight.events.len());
            let result = {
                let batch = &in_flight.events.make_contiguous()[..n];
                self.transport.send(batch).await
            };
            match result {
                Ok(()) => {
                    in_flight.events.drain(..n);
                    self.accepted(n);
                    delivered += n;
                    self.metrics.events_delivered.add(n as u64);
                    self.metrics.flush_batches.inc();
                }
                Err(e) => {
                    let requeued = in_flight.events.len();
                    self.metrics.flush_failures.inc();
                    tracing::warn!(
                        error = %e,
                        requeued,
                        delivered,
                        "event flush failed; batch requeued"
                    );
                    return FlushOutcome::Requeued(requeued);
                }
            }
        }

        tracing::debug!(delivered, "events flushed");
        FlushOutcome::Delivered(delivered)
    }

    /// Resolves when the buffer has reached the batch threshold since the
    /// last call.
    pub async fn threshold_reached(&self) {
        self.notify.notified().await;
    }
}
