//! Where the active snapshot lives and how it moves between execution units.
//!
//! Three slots, checked in order:
//!
//! 1. inside [`ContextSnapshot::scope`] (or a task started with [`spawn`])
//!    the snapshot is task-local and follows the task across worker threads;
//! 2. any other tokio task gets its own slot keyed by its task id, so tasks
//!    sharing a worker thread never see each other's sections;
//! 3. everywhere else (plain threads, `block_on` futures) a thread-local
//!    slot is used.
//!
//! Neither a new OS thread nor a plain `tokio::spawn` inherits the caller's
//! context; use [`spawn`], or export the snapshot and install it there.
//!
//! Guards undo only the change they made, so a guard dropped out of order
//! never clobbers sections pushed after it.

use std::cell::RefCell;
use std::future::Future;
use std::sync::LazyLock;
use std::thread::ThreadId;

use dashmap::DashMap;
use tokio::task::{self, JoinHandle};

use super::snapshot::ContextSnapshot;

tokio::task_local! {
    static TASK_CONTEXT: RefCell<ContextSnapshot>;
}

thread_local! {
    static THREAD_CONTEXT: RefCell<ContextSnapshot> = RefCell::new(ContextSnapshot::untracked());
}

/// Contexts of unscoped tokio tasks with the number of live guards each.
/// An entry is removed when its last guard drops.
static UNSCOPED_TASKS: LazyLock<DashMap<task::Id, (ContextSnapshot, usize)>> =
    LazyLock::new(DashMap::new);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Scoped,
    Task(task::Id),
    Thread(ThreadId),
}

fn active_slot() -> Slot {
    if TASK_CONTEXT.try_with(|_| ()).is_ok() {
        Slot::Scoped
    } else if let Some(id) = task::try_id() {
        Slot::Task(id)
    } else {
        Slot::Thread(std::thread::current().id())
    }
}

fn read(slot: Slot) -> ContextSnapshot {
    match slot {
        Slot::Scoped => TASK_CONTEXT.with(|cell| cell.borrow().clone()),
        Slot::Task(id) => UNSCOPED_TASKS
            .get(&id)
            .map(|entry| entry.0.clone())
            .unwrap_or_default(),
        Slot::Thread(_) => THREAD_CONTEXT.with(|cell| cell.borrow().clone()),
    }
}

/// Applies `f` to the slot's snapshot. `Slot::Scoped` and `Slot::Thread`
/// must be the active slot.
fn modify<R>(slot: Slot, f: impl FnOnce(&mut ContextSnapshot) -> R) -> R {
    match slot {
        Slot::Scoped => TASK_CONTEXT.with(|cell| f(&mut cell.borrow_mut())),
        Slot::Task(id) => {
            let mut entry = UNSCOPED_TASKS
                .entry(id)
                .or_insert_with(|| (ContextSnapshot::untracked(), 0));
            f(&mut entry.0)
        }
        Slot::Thread(_) => THREAD_CONTEXT.with(|cell| f(&mut cell.borrow_mut())),
    }
}

/// Returns a copy of the active context.
pub fn current() -> ContextSnapshot {
    read(active_slot())
}

fn apply(change: impl FnOnce(&mut ContextSnapshot) -> Undo) -> ContextGuard {
    let slot = active_slot();
    if let Slot::Thread(_) = slot
        && tokio::runtime::Handle::try_current().is_ok()
    {
        tracing::debug!(
            "context changed on the thread slot inside a runtime; \
             concurrent futures on this thread share it"
        );
    }
    let undo = modify(slot, change);
    if let Slot::Task(id) = slot
        && let Some(mut entry) = UNSCOPED_TASKS.get_mut(&id)
    {
        entry.1 += 1;
    }
    ContextGuard {
        undo: Some(undo),
        slot,
    }
}

/// The inverse of one guarded change.
#[derive(Debug)]
enum Undo {
    Section {
        depth: usize,
        name: String,
    },
    Customer {
        previous: Option<String>,
        applied: String,
    },
    Label {
        previous: Option<String>,
        applied: String,
    },
    Metadata {
        key: String,
        previous: Option<String>,
        applied: String,
    },
    Replace {
        previous: ContextSnapshot,
    },
}

impl Undo {
    /// Reverts this change in `snapshot`. Returns false when the change is
    /// no longer there to revert.
    fn revert(self, snapshot: &mut ContextSnapshot) -> bool {
        match self {
            Undo::Section { depth, name } => {
                let upper = depth.min(snapshot.sections.len().saturating_sub(1));
                let found = snapshot
                    .sections
                    .get(..=upper)
                    .and_then(|below| below.iter().rposition(|s| *s == name));
                match found {
                    Some(index) => {
                        snapshot.sections.remove(index);
                        true
                    }
                    None => false,
                }
            }
            Undo::Customer { previous, applied } => {
                revert_field(&mut snapshot.customer_id, previous, &applied)
            }
            Undo::Label { previous, applied } => {
                revert_field(&mut snapshot.semantic_label, previous, &applied)
            }
            Undo::Metadata {
                key,
                previous,
                applied,
            } => {
                if snapshot.metadata.get(&key) != Some(&applied) {
                    return false;
                }
                match previous {
                    Some(value) => snapshot.metadata.insert(key, value),
                    None => snapshot.metadata.remove(&key),
                };
                true
            }
            Undo::Replace { previous } => {
                *snapshot = previous;
                true
            }
        }
    }
}

fn revert_field(field: &mut Option<String>, previous: Option<String>, applied: &str) -> bool {
    if field.as_deref() != Some(applied) {
        return false;
    }
    *field = previous;
    true
}

/// Pushes `name` onto the section stack until the guard is dropped.
///
/// ```rust
/// use spendtrace::context;
///
/// {
///     let _section = context::push_section("agent:researcher");
///     assert_eq!(context::current().section_path(), "agent:researcher");
/// }
/// assert_eq!(context::current().section_path(), "untracked");
/// ```
#[must_use = "the section is popped when the guard is dropped"]
pub fn push_section(name: impl Into<String>) -> ContextGuard {
    let name = name.into();
    apply(|snapshot| {
        let depth = snapshot.sections.len();
        snapshot.sections.push(name.clone());
        Undo::Section { depth, name }
    })
}

#[must_use = "the customer is restored when the guard is dropped"]
pub fn with_customer(customer_id: impl Into<String>) -> ContextGuard {
    let applied = customer_id.into();
    apply(|snapshot| Undo::Customer {
        previous: snapshot.customer_id.replace(applied.clone()),
        applied,
    })
}

#[must_use = "the label is restored when the guard is dropped"]
pub fn with_label(label: impl Into<String>) -> ContextGuard {
    let applied = label.into();
    apply(|snapshot| Undo::Label {
        previous: snapshot.semantic_label.replace(applied.clone()),
        applied,
    })
}

#[must_use = "the metadata is restored when the guard is dropped"]
pub fn with_metadata(key: impl Into<String>, value: impl Into<String>) -> ContextGuard {
    let (key, applied) = (key.into(), value.into());
    apply(|snapshot| Undo::Metadata {
        previous: snapshot.metadata.insert(key.clone(), applied.clone()),
        key,
        applied,
    })
}

/// Runs `future` with `name` pushed for its whole lifetime.
pub async fn in_section<F>(name: impl Into<String>, future: F) -> F::Output
where
    F: Future,
{
    current().with_section(name).scope(future).await
}

/// Spawns a task that starts from a copy of the caller's context.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(current().scope(future))
}

impl ContextSnapshot {
    /// Runs `future` with this snapshot as its task-local context.
    pub fn scope<F>(self, future: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        TASK_CONTEXT.scope(RefCell::new(self), future)
    }

    /// Runs `f` synchronously with this snapshot active.
    pub fn run<R>(self, f: impl FnOnce() -> R) -> R {
        TASK_CONTEXT.sync_scope(RefCell::new(self), f)
    }

    /// Makes this snapshot the active context of the current thread (or
    /// task) until the guard is dropped.
    #[must_use = "the previous context is restored when the guard is dropped"]
    pub fn install(self) -> ContextGuard {
        apply(move |snapshot| Undo::Replace {
            previous: std::mem::replace(snapshot, self),
        })
    }
}

/// Reverts its own change to the context on drop, including during
/// unwinding. Changes made by other guards in the meantime are kept.
#[derive(Debug)]
pub struct ContextGuard {
    undo: Option<Undo>,
    slot: Slot,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let Some(undo) = self.undo.take() else {
            return;
        };
        let reverted = match self.slot {
            Slot::Task(id) => {
                let reverted = UNSCOPED_TASKS
                    .get_mut(&id)
                    .map(|mut entry| undo.revert(&mut entry.0))
                    .unwrap_or(false);
                UNSCOPED_TASKS.remove_if(&id, |_, (_, guards)| *guards <= 1);
                if let Some(mut entry) = UNSCOPED_TASKS.get_mut(&id) {
                    entry.1 -= 1;
                }
                reverted
            }
            slot if slot == active_slot() => modify(slot, |snapshot| undo.revert(snapshot)),
            _ => {
                tracing::warn!(
                    "context guard dropped outside the scope that created it; context left unchanged"
                );
                return;
            }
        };
        if !reverted {
            tracing::debug!("context change already undone elsewhere; nothing to revert");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_balanced() {
        let before = current();
        {
            let _a = push_section("agent:planner");
            {
                let _b = push_section("tool:search");
                assert_eq!(current().section_path(), "agent:planner/tool:search");
            }
            assert_eq!(current().section_path(), "agent:planner");
        }
        assert_eq!(current(), before);
    }

    #[test]
    fn test_balanced_on_early_return() {
        fn failing() -> Result<(), &'static str> {
            let _section = push_section("feature:broken");
            Err("boom")
        }
        let before = current();
        assert!(failing().is_err());
        assert_eq!(current(), before);
    }

    #[test]
    fn test_balanced_on_panic() {
        let before = current();
        let result = std::panic::catch_unwind(|| {
            let _section = push_section("feature:panics");
            panic!("unwind");
        });
        assert!(result.is_err());
        assert_eq!(current(), before);
    }

    #[test]
    fn test_customer_and_label_guards() {
        {
            let _c = with_customer("cust-1");
            let _l = with_label("summarize");
            let snapshot = current();
            assert_eq!(snapshot.customer_id.as_deref(), Some("cust-1"));
            assert_eq!(snapshot.semantic_label.as_deref(), Some("summarize"));
        }
        assert!(current().customer_id.is_none());
    }

    #[test]
    fn test_new_thread_does_not_inherit() {
        let _section = push_section("agent:main");
        let seen = std::thread::spawn(|| current().section_path())
            .join()
            .unwrap();
        assert_eq!(seen, "untracked");
    }

    #[test]
    fn test_explicit_thread_handoff() {
        let _section = push_section("agent:main");
        let exported = current().export().unwrap();
        let seen = std::thread::spawn(move || {
            let restored = ContextSnapshot::restore(&exported).unwrap();
            let _guard = restored.install();
            current().section_path()
        })
        .join()
        .unwrap();
        assert_eq!(seen, "agent:main");
    }

    #[test]
    fn test_sync_run_scope() {
        let snapshot = ContextSnapshot::untracked().with_section("batch");
        let path = snapshot.run(|| current().section_path());
        assert_eq!(path, "batch");
        assert_eq!(current().section_path(), "untracked");
    }

    #[tokio::test]
    async fn test_spawn_inherits_snapshot() {
        let root = ContextSnapshot::untracked().with_section("agent:parent");
        let path = root
            .scope(async {
                let handle = spawn(async { current().section_path() });
                handle.await.unwrap()
            })
            .await;
        assert_eq!(path, "agent:parent");
    }

    #[tokio::test]
    async fn test_child_changes_do_not_leak_to_parent() {
        ContextSnapshot::untracked()
            .scope(async {
                let _section = push_section("agent:parent");
                spawn(async {
                    let _inner = push_section("tool:child");
                    assert_eq!(current().section_path(), "agent:parent/tool:child");
                })
                .await
                .unwrap();
                assert_eq!(current().section_path(), "agent:parent");
            })
            .await;
    }

    #[tokio::test]
    async fn test_in_section_async() {
        let path = in_section("feature:async", async {
            tokio::task::yield_now().await;
            current().section_path()
        })
        .await;
        assert_eq!(path, "feature:async");
        assert_eq!(current().section_path(), "untracked");
    }

    #[test]
    fn test_out_of_order_drop_keeps_later_sections() {
        let outer = push_section("agent:a");
        let inner = push_section("tool:b");
        drop(outer);
        assert_eq!(current().section_path(), "tool:b");
        drop(inner);
        assert_eq!(current().section_path(), "untracked");
    }

    #[test]
    fn test_customer_guard_keeps_newer_value() {
        ContextSnapshot::untracked().run(|| {
            let first = with_customer("cust-1");
            let second = with_customer("cust-2");
            drop(first);
            assert_eq!(current().customer_id.as_deref(), Some("cust-2"));
            drop(second);
            assert_eq!(current().customer_id.as_deref(), Some("cust-1"));
        });
        assert!(current().customer_id.is_none());
    }

    #[tokio::test]
    async fn test_interleaved_unscoped_tasks_isolated() {
        let (pushed_tx, pushed_rx) = tokio::sync::oneshot::channel::<()>();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

        let a = tokio::spawn(async move {
            let id = task::id();
            let path = {
                let _section = push_section("agent:a");
                pushed_tx.send(()).ok();
                done_rx.await.ok();
                current().section_path()
            };
            (id, path, current().section_path())
        });
        let b = tokio::spawn(async move {
            pushed_rx.await.ok();
            let seen = current().section_path();
            let _section = push_section("agent:b");
            tokio::task::yield_now().await;
            let inner = current().section_path();
            done_tx.send(()).ok();
            tokio::task::yield_now().await;
            (seen, inner)
        });

        let (seen, inner) = b.await.unwrap();
        assert_eq!(seen, "untracked");
        assert_eq!(inner, "agent:b");
        let (id, held, after) = a.await.unwrap();
        assert_eq!(held, "agent:a");
        assert_eq!(after, "untracked");
        assert!(!UNSCOPED_TASKS.contains_key(&id));
        assert_eq!(current().section_path(), "untracked");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unscoped_task_slot_follows_task() {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                tokio::spawn(async move {
                    let name = format!("worker:{i}");
                    let _section = push_section(name.clone());
                    for _ in 0..10 {
                        tokio::task::yield_now().await;
                        assert_eq!(current().section_path(), name);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_in_section_balanced_on_error() {
        let result: Result<(), &str> = in_section("feature:err", async { Err("failed") }).await;
        assert!(result.is_err());
        assert_eq!(current().section_path(), "untracked");
    }
}
