#![forbid(unsafe_code)]

//! Ref-counted notification suspension.
//!
//! While a [`Suspension`] is active on a notifier, `notify(name)` records the
//! name instead of dispatching it. The suspension is created lazily by the
//! first [`ChangeNotifier::suspend`](crate::ChangeNotifier::suspend) call;
//! nested calls bump its reference count. When the last [`SuspendGuard`] is
//! released the suspension is removed from the notifier *before* the pending
//! names are replayed, so replayed events are dispatched rather than buffered
//! again.
//!
//! # Invariants
//!
//! 1. At most one suspension exists per notifier; `ref_count >= 1` while it
//!    exists.
//! 2. Each pending name is replayed exactly once per suspend/resume cycle,
//!    however many times it was notified while suspended.
//! 3. A guard releases its reference at most once: [`SuspendGuard::release`]
//!    consumes the guard and `Drop` is a no-op afterwards.

use std::fmt;
use std::rc::Weak;
use std::sync::Arc;

use ahash::AHashSet;

use crate::disposal::{Disposable, DisposeError};
use crate::notifier::{ChangeNotifier, Inner};

/// Buffered state of an active suspension.
pub(crate) struct Suspension {
    id: u64,
    ref_count: usize,
    seen: AHashSet<Arc<str>>,
    pending: Vec<Arc<str>>,
}

impl Suspension {
    pub(crate) fn open(id: u64) -> Self {
        Self {
            id,
            ref_count: 0,
            seen: AHashSet::new(),
            pending: Vec::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn acquire(&mut self) {
        self.ref_count += 1;
    }

    /// Drop one reference. Returns `true` when the last one is gone.
    pub(crate) fn release(&mut self) -> bool {
        debug_assert!(self.ref_count > 0, "suspension released more than acquired");
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count == 0
    }

    /// Record `name`; duplicates collapse.
    pub(crate) fn record(&mut self, name: &str) {
        if self.seen.contains(name) {
            return;
        }
        let name: Arc<str> = Arc::from(name);
        self.seen.insert(Arc::clone(&name));
        self.pending.push(name);
    }

    /// Pending names in first-notified order.
    pub(crate) fn into_pending(self) -> Vec<Arc<str>> {
        self.pending
    }
}

/// Releases one reference on a notifier's suspension.
///
/// Obtained from [`ChangeNotifier::suspend`]. Release it explicitly with
/// [`release`](Self::release) or let it drop at the end of the scope; either
/// way the reference is released exactly once, including on early return and
/// panic unwinding.
#[must_use = "dropping the guard releases the suspension immediately"]
pub struct SuspendGuard {
    target: Option<Weak<Inner>>,
}

impl SuspendGuard {
    pub(crate) fn new(target: Weak<Inner>) -> Self {
        Self {
            target: Some(target),
        }
    }

    /// A guard that holds nothing, handed out by disposed notifiers.
    pub(crate) fn inert() -> Self {
        Self { target: None }
    }

    /// Release the reference now. Replays buffered names if this was the
    /// last outstanding guard.
    pub fn release(mut self) {
        self.release_ref();
    }

    /// Whether this guard still holds a reference.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.target.is_some()
    }

    fn release_ref(&mut self) {
        let Some(target) = self.target.take() else {
            return;
        };
        if let Some(inner) = target.upgrade() {
            ChangeNotifier::from_inner(inner).resume();
        }
    }
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        self.release_ref();
    }
}

impl Disposable for SuspendGuard {
    fn dispose(&mut self) -> Result<(), DisposeError> {
        self.release_ref();
        Ok(())
    }

    fn label(&self) -> &str {
        "SuspendGuard"
    }
}

impl fmt::Debug for SuspendGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspendGuard")
            .field("held", &self.is_held())
            .finish()
    }
}
