//! Propagatable execution identity: run id, customer, and section stack.
//!
//! Call sites read the context through [`current`], which always returns an
//! immutable [`ContextSnapshot`]. Sections are pushed with scoped guards so
//! the stack is restored exactly when a region exits, normally or not.
//!
//! Propagation differs by execution unit:
//!
//! - tokio tasks started with [`spawn`] (or wrapped with
//!   [`ContextSnapshot::scope`]) start from a copy of the spawner's snapshot;
//! - tasks started with plain `tokio::spawn` start untracked and keep their
//!   own sections, even when they share a worker thread with other tasks;
//! - OS threads and child processes start untracked. Export the snapshot with
//!   [`ContextSnapshot::export`] and install it on the other side with
//!   [`ContextSnapshot::restore`] + [`ContextSnapshot::install`].
//!
//! A missing context is never an error: calls are attributed to the
//! `untracked` section.

mod scope;
mod snapshot;

pub use scope::{
    ContextGuard, current, in_section, push_section, spawn, with_customer, with_label,
    with_metadata,
};
pub use snapshot::{ContextSnapshot, Run, SECTION_SEPARATOR, UNTRACKED_SECTION};
