//! Transparent interception of outbound HTTP calls.
//!
//! [`TrackedClient`] is the async adapter over `reqwest`; callers that make
//! requests some other way record them through
//! [`Instrumentation::begin_call`](crate::Instrumentation::begin_call) or
//! [`Instrumentation::record`](crate::Instrumentation::record). Both end in
//! the same [`PendingCall`] pipeline, so each call attempt yields exactly
//! one event.

mod client;
mod pipeline;
mod stream;

pub use client::{TrackedClient, TrackedRequestBuilder, TrackedResponse};
pub use pipeline::PendingCall;
pub use stream::TrackedStream;
