//! Immutable execution identity captured at call time.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Section reported when no section is active.
pub const UNTRACKED_SECTION: &str = "untracked";

/// Separator used when joining the section stack into a path.
pub const SECTION_SEPARATOR: &str = "/";

/// Correlation identity for one logical execution.
///
/// Created once when instrumentation is installed and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    /// Root of the span tree; every tracked call without an explicit
    /// parent hangs off this span.
    pub root_span_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl Run {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            root_span_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

impl Default for Run {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the tracking context.
///
/// Snapshots are values: changing the context produces a new snapshot, so a
/// reader never observes a half-applied update from another task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    #[serde(default)]
    pub run_id: Option<Uuid>,
    #[serde(default)]
    pub parent_span_id: Option<Uuid>,
    #[serde(default)]
    pub sections: Vec<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub semantic_label: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ContextSnapshot {
    pub fn untracked() -> Self {
        Self::default()
    }

    /// Snapshot rooted at `run`.
    pub fn for_run(run: &Run) -> Self {
        Self {
            run_id: Some(run.run_id),
            parent_span_id: Some(run.root_span_id),
            ..Default::default()
        }
    }

    /// Innermost active section, or [`UNTRACKED_SECTION`].
    pub fn section(&self) -> &str {
        self.sections
            .last()
            .map(String::as_str)
            .unwrap_or(UNTRACKED_SECTION)
    }

    /// Ordered join of the section stack.
    pub fn section_path(&self) -> String {
        if self.sections.is_empty() {
            UNTRACKED_SECTION.to_string()
        } else {
            self.sections.join(SECTION_SEPARATOR)
        }
    }

    pub fn depth(&self) -> usize {
        self.sections.len()
    }

    pub fn is_tracked(&self) -> bool {
        !self.sections.is_empty()
    }

    /// Agent name when the innermost `agent:` section is active.
    pub fn agent(&self) -> Option<&str> {
        self.sections
            .iter()
            .rev()
            .find_map(|s| s.strip_prefix("agent:"))
    }

    pub fn with_section(&self, name: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.sections.push(name.into());
        next
    }

    pub fn with_customer(&self, customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: Some(customer_id.into()),
            ..self.clone()
        }
    }

    pub fn with_tenant(&self, tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            ..self.clone()
        }
    }

    pub fn with_label(&self, label: impl Into<String>) -> Self {
        Self {
            semantic_label: Some(label.into()),
            ..self.clone()
        }
    }

    pub fn with_metadata(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.metadata.insert(key.into(), value.into());
        next
    }

    pub fn with_parent_span(&self, span_id: Uuid) -> Self {
        Self {
            parent_span_id: Some(span_id),
            ..self.clone()
        }
    }

    /// Fills identity fields this snapshot does not carry from `run`.
    pub fn resolved(&self, run: &Run) -> Self {
        let mut next = self.clone();
        if next.run_id.is_none() {
            next.run_id = Some(run.run_id);
        }
        if next.parent_span_id.is_none() {
            next.parent_span_id = Some(run.root_span_id);
        }
        next
    }

    /// Serializes the snapshot for hand-off to another thread or process.
    pub fn export(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Reconstructs a snapshot produced by [`ContextSnapshot::export`].
    pub fn restore(encoded: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(encoded)?)
    }
}
