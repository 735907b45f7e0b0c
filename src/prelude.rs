//! Prelude module for convenient imports.
//!
//! ```rust
//! use spendtrace::prelude::*;
//! ```

pub use crate::Error;
pub use crate::Result;

pub use crate::{Instrumentation, InstrumentationBuilder, TrackerConfig};

pub use crate::context::{self, ContextGuard, ContextSnapshot};

pub use crate::{TrackedClient, TrackedResponse, TrackedStream};

pub use crate::{CapDecision, Enforcement, Event, EventStatus, FlushOutcome, Usage};
