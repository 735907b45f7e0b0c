use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;

use super::pipeline::PendingCall;
use crate::providers::StreamAccumulator;

/// Watches chunks go by and finishes the call exactly once: at the end of
/// the stream, on a stream error, or when dropped early.
#[derive(Debug)]
struct StreamRecorder {
    state: Option<(PendingCall, StreamAccumulator)>,
}

impl StreamRecorder {
    fn observe(&mut self, chunk: &[u8]) {
        if let Some((_, accumulator)) = self.state.as_mut() {
            accumulator.push(chunk);
        }
    }

    fn finish(&mut self, cancelled: bool, error: Option<String>) {
        if let Some((call, accumulator)) = self.state.take() {
            call.finish_stream(accumulator, cancelled, error);
        }
    }
}

impl Drop for StreamRecorder {
    fn drop(&mut self) {
        if self.state.is_some() {
            tracing::debug!("tracked stream dropped before completion");
            self.finish(true, None);
        }
    }
}

pin_project! {
    /// Byte stream of a tracked response. Chunks pass through untouched.
    #[derive(Debug)]
    pub struct TrackedStream<S> {
        #[pin]
        inner: S,
        recorder: StreamRecorder,
    }
}

impl<S> TrackedStream<S> {
    /// `call` is `None` when tracking is disabled.
    pub(crate) fn new(inner: S, call: Option<PendingCall>) -> Self {
        let state = call.map(|call| {
            let accumulator = StreamAccumulator::new(call.provider().adapter.clone());
            (call, accumulator)
        });
        Self {
            inner,
            recorder: StreamRecorder { state },
        }
    }

    /// Whether the call has been recorded yet.
    pub fn is_finished(&self) -> bool {
        self.recorder.state.is_none()
    }
}

impl<S> Stream for TrackedStream<S>
where
    S: Stream<Item = reqwest::Result<Bytes>>,
{
    type Item = reqwest::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.recorder.observe(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.recorder.finish(false, Some(e.to_string()));
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.recorder.finish(false, None);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
