#![forbid(unsafe_code)]

//! Per-entity change notifier.
//!
//! [`ChangeNotifier`] is the core of an observable entity. It owns the
//! listener registry, the optional active [`Suspension`], and the canonical
//! event cache.
//!
//! # Architecture
//!
//! The notifier is a cheap `Rc` handle over shared state, so streams,
//! subscriptions and suspend guards can point back at it through `Weak`
//! references without keeping it alive.
//!
//! Listeners live in an explicit id → callback registry. Dispatch clones the
//! callbacks into a snapshot before invoking any of them, so a callback may
//! subscribe, unsubscribe, notify or suspend re-entrantly.
//!
//! # Invariants
//!
//! 1. Without an active suspension, `notify` dispatches synchronously to every
//!    listener registered at the time of the call, in registration order.
//! 2. With an active suspension, `notify` only records the name.
//! 3. A panicking listener is isolated: it is logged and the remaining
//!    listeners still receive the event.
//! 4. After [`dispose`](ChangeNotifier::dispose) nothing is dispatched and
//!    `suspend` hands out inert guards.
//!
//! The notifier is single-threaded (`!Send`); callers that mutate an entity
//! from several threads must serialize access themselves.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use smallvec::SmallVec;

use crate::disposal::panic_message;
use crate::event::{ChangeEvent, EventCache, WILDCARD};
use crate::stream::ChangeStream;
use crate::suspend::{SuspendGuard, Suspension};

/// Identifier of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Raw id value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

type Callback = Rc<dyn Fn(&ChangeEvent)>;

struct ListenerEntry {
    id: ListenerId,
    callback: Callback,
}

/// Shared notifier state.
pub(crate) struct Inner {
    listeners: RefCell<Vec<ListenerEntry>>,
    next_listener: Cell<u64>,
    suspension: RefCell<Option<Suspension>>,
    next_scope: Cell<u64>,
    cache: RefCell<EventCache>,
    disposed: Cell<bool>,
}

impl Inner {
    fn new(cache: EventCache) -> Self {
        Self {
            listeners: RefCell::new(Vec::new()),
            next_listener: Cell::new(1),
            suspension: RefCell::new(None),
            next_scope: Cell::new(1),
            cache: RefCell::new(cache),
            disposed: Cell::new(false),
        }
    }

    pub(crate) fn add_listener(&self, callback: Callback) -> Option<ListenerId> {
        if self.disposed.get() {
            tracing::warn!("listener registered on a disposed notifier; ignoring");
            return None;
        }
        let id = ListenerId(self.next_listener.get());
        self.next_listener.set(id.0 + 1);
        self.listeners
            .borrow_mut()
            .push(ListenerEntry { id, callback });
        Some(id)
    }

    pub(crate) fn has_listener(&self, id: ListenerId) -> bool {
        self.listeners.borrow().iter().any(|entry| entry.id == id)
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        match listeners.iter().position(|entry| entry.id == id) {
            Some(index) => {
                // Keep registration order for the remaining listeners.
                listeners.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Records property changes for one entity and delivers them to listeners.
///
/// # Example
///
/// ```
/// use chime_core::ChangeNotifier;
/// use std::cell::RefCell;
/// use std::rc::Rc;
///
/// let notifier = ChangeNotifier::new();
/// let seen = Rc::new(RefCell::new(Vec::new()));
/// let s = Rc::clone(&seen);
/// let _sub = notifier
///     .changes()
///     .subscribe(move |event| s.borrow_mut().push(event.to_string()));
///
/// {
///     let _guard = notifier.suspend();
///     notifier.notify("x");
///     notifier.notify("y");
///     notifier.notify("x");
///     assert!(seen.borrow().is_empty());
/// }
/// assert_eq!(*seen.borrow(), vec!["x", "y"]);
/// ```
#[derive(Clone)]
pub struct ChangeNotifier {
    inner: Rc<Inner>,
}

impl ChangeNotifier {
    /// Create a notifier with the default event cache.
    #[must_use]
    pub fn new() -> Self {
        Self::with_cache(EventCache::new())
    }

    /// Create a notifier whose event cache retains at most `capacity` names.
    #[must_use]
    pub fn with_cache_capacity(capacity: usize) -> Self {
        Self::with_cache(EventCache::with_capacity(capacity))
    }

    fn with_cache(cache: EventCache) -> Self {
        Self {
            inner: Rc::new(Inner::new(cache)),
        }
    }

    pub(crate) fn from_inner(inner: Rc<Inner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<Inner> {
        Rc::downgrade(&self.inner)
    }

    /// Report that `property` changed. The empty name is the wildcard.
    ///
    /// Dispatches immediately unless a suspension is active, in which case
    /// the name is buffered until the suspension ends.
    pub fn notify(&self, property: &str) {
        if self.inner.disposed.get() {
            tracing::warn!(property, "notify on a disposed notifier; ignoring");
            return;
        }
        if let Some(scope) = self.inner.suspension.borrow_mut().as_mut() {
            scope.record(property);
            return;
        }
        self.dispatch(property);
    }

    /// Report that every property changed.
    pub fn notify_all(&self) {
        self.notify(WILDCARD);
    }

    /// Assign `value` to `slot` and notify `property` if the value changed.
    ///
    /// Returns `true` when the slot was updated.
    pub fn set_and_notify<T: PartialEq>(&self, slot: &mut T, value: T, property: &str) -> bool {
        if *slot == value {
            return false;
        }
        *slot = value;
        self.notify(property);
        true
    }

    /// Suspend dispatch until the returned guard (and every other guard
    /// handed out for the same suspension) has been released.
    pub fn suspend(&self) -> SuspendGuard {
        if self.inner.disposed.get() {
            tracing::warn!("suspend on a disposed notifier; returning an inert guard");
            return SuspendGuard::inert();
        }
        let mut slot = self.inner.suspension.borrow_mut();
        let scope = slot.get_or_insert_with(|| {
            let id = self.inner.next_scope.get();
            self.inner.next_scope.set(id + 1);
            tracing::debug!(scope = id, "notifications suspended");
            Suspension::open(id)
        });
        scope.acquire();
        SuspendGuard::new(self.downgrade())
    }

    /// Release one suspension reference; replay when it was the last one.
    pub(crate) fn resume(&self) {
        let finished = {
            let mut slot = self.inner.suspension.borrow_mut();
            let Some(scope) = slot.as_mut() else {
                return;
            };
            if !scope.release() {
                return;
            }
            // Cleared before replay so replayed names are dispatched.
            slot.take()
        };
        let Some(scope) = finished else {
            return;
        };

        let id = scope.id();
        let pending = scope.into_pending();
        tracing::debug!(scope = id, pending = pending.len(), "notifications resumed");
        for name in pending {
            self.notify(&name);
        }
    }

    /// Whether a suspension is currently active.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.inner.suspension.borrow().is_some()
    }

    /// Number of outstanding guards on the active suspension (0 if none).
    #[must_use]
    pub fn suspension_depth(&self) -> usize {
        self.inner
            .suspension
            .borrow()
            .as_ref()
            .map_or(0, Suspension::ref_count)
    }

    /// Id of the active suspension. Stays the same across nested suspends.
    #[must_use]
    pub fn suspension_id(&self) -> Option<u64> {
        self.inner.suspension.borrow().as_ref().map(Suspension::id)
    }

    /// Number of distinct names buffered by the active suspension.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner
            .suspension
            .borrow()
            .as_ref()
            .map_or(0, Suspension::pending_len)
    }

    /// Register a raw listener. Prefer [`changes`](Self::changes), which
    /// returns an RAII [`Subscription`](crate::Subscription).
    ///
    /// Returns `None` if the notifier has been disposed.
    pub fn add_listener(&self, callback: impl Fn(&ChangeEvent) + 'static) -> Option<ListenerId> {
        self.inner.add_listener(Rc::new(callback))
    }

    /// Remove a raw listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.remove_listener(id)
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    /// A lazily-started stream of this notifier's change events.
    #[must_use]
    pub fn changes(&self) -> ChangeStream {
        ChangeStream::new(self.downgrade())
    }

    /// Stop all delivery: listeners are dropped and buffered names are
    /// discarded. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.replace(true) {
            return;
        }
        let listeners = std::mem::take(&mut *self.inner.listeners.borrow_mut());
        let discarded = self
            .inner
            .suspension
            .borrow_mut()
            .take()
            .map_or(0, |scope| scope.pending_len());
        tracing::debug!(
            listeners = listeners.len(),
            discarded,
            "change notifier disposed"
        );
        drop(listeners);
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    /// Number of names held by the event cache.
    #[must_use]
    pub fn cached_events(&self) -> usize {
        self.inner.cache.borrow().len()
    }

    fn dispatch(&self, property: &str) {
        let event = self.inner.cache.borrow_mut().event_for(property);
        let snapshot: SmallVec<[Callback; 8]> = self
            .inner
            .listeners
            .borrow()
            .iter()
            .map(|entry| Rc::clone(&entry.callback))
            .collect();

        tracing::trace!(property, listeners = snapshot.len(), "dispatching change");
        for callback in snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&event)));
            if let Err(payload) = outcome {
                tracing::error!(
                    property,
                    panic = %panic_message(payload.as_ref()),
                    "change listener panicked; continuing fan-out"
                );
            }
        }
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("listeners", &self.listener_count())
            .field("suspension_depth", &self.suspension_depth())
            .field("pending", &self.pending_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording(notifier: &ChangeNotifier) -> (ListenerId, Rc<RefCell<Vec<String>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let id = notifier
            .add_listener(move |event| s.borrow_mut().push(event.to_string()))
            .unwrap();
        (id, seen)
    }

    #[test]
    fn notify_dispatches_in_order() {
        let notifier = ChangeNotifier::new();
        let (_, seen) = recording(&notifier);

        notifier.notify("a");
        notifier.notify("b");
        notifier.notify("a");
        notifier.notify_all();
        assert_eq!(*seen.borrow(), vec!["a", "b", "a", "*"]);
    }

    #[test]
    fn suspended_notifications_coalesce() {
        let notifier = ChangeNotifier::new();
        let (_, seen) = recording(&notifier);

        let guard = notifier.suspend();
        notifier.notify("x");
        notifier.notify("y");
        notifier.notify("x");
        assert!(seen.borrow().is_empty());
        assert_eq!(notifier.pending_count(), 2);

        guard.release();
        assert_eq!(*seen.borrow(), vec!["x", "y"]);
        assert!(!notifier.is_suspended());
    }

    #[test]
    fn nested_suspension_replays_after_last_release() {
        let notifier = ChangeNotifier::new();
        let (_, seen) = recording(&notifier);

        let outer = notifier.suspend();
        let id = notifier.suspension_id();
        let inner = notifier.suspend();
        assert_eq!(notifier.suspension_depth(), 2);
        assert_eq!(notifier.suspension_id(), id, "nested suspend reuses the scope");

        notifier.notify("x");
        inner.release();
        assert!(seen.borrow().is_empty());
        assert_eq!(notifier.suspension_depth(), 1);

        outer.release();
        assert_eq!(*seen.borrow(), vec!["x"]);
    }

    #[test]
    fn drop_releases_guard() {
        let notifier = ChangeNotifier::new();
        let (_, seen) = recording(&notifier);
        {
            let _guard = notifier.suspend();
            notifier.notify("x");
        }
        assert_eq!(*seen.borrow(), vec!["x"]);
    }

    #[test]
    fn new_suspension_after_release_gets_new_id() {
        let notifier = ChangeNotifier::new();
        let first = {
            let _g = notifier.suspend();
            notifier.suspension_id()
        };
        let second = {
            let _g = notifier.suspend();
            notifier.suspension_id()
        };
        assert_ne!(first, second);
    }

    #[test]
    fn replay_is_not_rebuffered() {
        let notifier = ChangeNotifier::new();
        let observed_suspended = Rc::new(Cell::new(false));
        let n = notifier.clone();
        let o = Rc::clone(&observed_suspended);
        notifier
            .add_listener(move |_| o.set(o.get() || n.is_suspended()))
            .unwrap();

        let guard = notifier.suspend();
        notifier.notify("x");
        guard.release();
        assert!(!observed_suspended.get());
    }

    #[test]
    fn set_and_notify_skips_equal_values() {
        let notifier = ChangeNotifier::new();
        let (_, seen) = recording(&notifier);
        let mut title = String::from("a");

        assert!(!notifier.set_and_notify(&mut title, "a".to_string(), "title"));
        assert!(notifier.set_and_notify(&mut title, "b".to_string(), "title"));
        assert_eq!(title, "b");
        assert_eq!(*seen.borrow(), vec!["title"]);
    }

    #[test]
    fn listener_can_unsubscribe_during_dispatch() {
        let notifier = ChangeNotifier::new();
        let (_, seen) = recording(&notifier);
        let slot: Rc<Cell<Option<ListenerId>>> = Rc::new(Cell::new(None));

        let n = notifier.clone();
        let s = Rc::clone(&slot);
        let id = notifier
            .add_listener(move |_| {
                if let Some(id) = s.take() {
                    n.remove_listener(id);
                }
            })
            .unwrap();
        slot.set(Some(id));

        notifier.notify("a");
        notifier.notify("b");
        assert_eq!(notifier.listener_count(), 1);
        assert_eq!(*seen.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn listener_added_during_dispatch_sees_next_event_only() {
        let notifier = ChangeNotifier::new();
        let late = Rc::new(RefCell::new(Vec::new()));
        let n = notifier.clone();
        let l = Rc::clone(&late);
        let added = Rc::new(Cell::new(false));
        let a = Rc::clone(&added);
        notifier
            .add_listener(move |_| {
                if !a.replace(true) {
                    let l = Rc::clone(&l);
                    n.add_listener(move |event| l.borrow_mut().push(event.to_string()));
                }
            })
            .unwrap();

        notifier.notify("first");
        notifier.notify("second");
        assert_eq!(*late.borrow(), vec!["second"]);
    }

    #[test]
    fn panicking_listener_is_isolated() {
        let notifier = ChangeNotifier::new();
        notifier
            .add_listener(|_| panic!("listener exploded"))
            .unwrap();
        let (_, seen) = recording(&notifier);

        notifier.notify("a");
        notifier.notify("b");
        assert_eq!(*seen.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn replay_continues_past_panicking_listener() {
        let notifier = ChangeNotifier::new();
        notifier
            .add_listener(|event| {
                if event.property_name() == "x" {
                    panic!("x is cursed");
                }
            })
            .unwrap();
        let (_, seen) = recording(&notifier);

        let guard = notifier.suspend();
        notifier.notify("x");
        notifier.notify("y");
        guard.release();
        assert_eq!(*seen.borrow(), vec!["x", "y"]);
    }

    #[test]
    fn dispose_stops_delivery_and_discards_pending() {
        let notifier = ChangeNotifier::new();
        let (_, seen) = recording(&notifier);

        let guard = notifier.suspend();
        notifier.notify("x");
        notifier.dispose();
        guard.release();
        notifier.notify("y");

        assert!(seen.borrow().is_empty());
        assert!(notifier.is_disposed());
        assert_eq!(notifier.listener_count(), 0);
        assert!(!notifier.suspend().is_held());
        assert!(notifier.add_listener(|_| {}).is_none());
    }

    #[test]
    fn guard_outliving_notifier_is_harmless() {
        let notifier = ChangeNotifier::new();
        let guard = notifier.suspend();
        drop(notifier);
        guard.release();
    }

    #[test]
    fn dispatch_uses_event_cache() {
        let notifier = ChangeNotifier::with_cache_capacity(4);
        notifier.notify("a");
        notifier.notify("a");
        notifier.notify("b");
        notifier.notify_all();
        assert_eq!(notifier.cached_events(), 2);
    }

    #[test]
    fn debug_format() {
        let notifier = ChangeNotifier::new();
        let _g = notifier.suspend();
        let debug = format!("{notifier:?}");
        assert!(debug.contains("suspension_depth: 1"));
    }
}
