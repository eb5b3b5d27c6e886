#![forbid(unsafe_code)]

//! Push-based change streams over a [`ChangeNotifier`](crate::ChangeNotifier).
//!
//! A [`ChangeStream`] is a description, not a registration: creating one does
//! nothing until [`subscribe`](ChangeStream::subscribe) is called. Each
//! subscription registers its own listener and receives events from that
//! moment on; there is no history replay.
//!
//! # Invariants
//!
//! 1. Subscribers see events in dispatch order.
//! 2. Filters compose by intersection; wildcard events pass every filter.
//! 3. [`Subscription::unsubscribe`] is idempotent and only removes its own
//!    listener.
//! 4. A stream whose notifier is gone yields inactive subscriptions.

use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::mpsc;

use smallvec::SmallVec;

use crate::disposal::{Disposable, DisposeError};
use crate::event::ChangeEvent;
use crate::filter::NamedPropertyFilter;
use crate::notifier::{Inner, ListenerId};

/// A lazily-started, multi-subscriber sequence of [`ChangeEvent`]s.
#[derive(Clone)]
pub struct ChangeStream {
    source: Weak<Inner>,
    filters: SmallVec<[NamedPropertyFilter; 1]>,
}

impl ChangeStream {
    pub(crate) fn new(source: Weak<Inner>) -> Self {
        Self {
            source,
            filters: SmallVec::new(),
        }
    }

    /// Only pass events accepted by `filter` (and by any filter already
    /// attached).
    #[must_use]
    pub fn filter_by_name(mut self, filter: NamedPropertyFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Whether `event` passes every attached filter.
    #[must_use]
    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        self.filters.iter().all(|filter| filter.matches(event))
    }

    /// Start delivering events to `sink`.
    ///
    /// The returned [`Subscription`] unsubscribes when dropped.
    pub fn subscribe(&self, sink: impl Fn(&ChangeEvent) + 'static) -> Subscription {
        let Some(inner) = self.source.upgrade() else {
            tracing::debug!("subscribe on a dropped notifier; subscription is inactive");
            return Subscription::inactive();
        };
        let filters = self.filters.clone();
        let id = inner.add_listener(Rc::new(move |event: &ChangeEvent| {
            if filters.iter().all(|filter| filter.matches(event)) {
                sink(event);
            }
        }));
        Subscription {
            source: Rc::downgrade(&inner),
            id,
        }
    }

    /// Subscribe with a channel sink, for consumers that prefer to pull.
    ///
    /// Events queue in the returned receiver until read; the subscription
    /// ends when either handle is dropped.
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::Receiver<ChangeEvent>) {
        let (tx, rx) = mpsc::channel();
        let subscription = self.subscribe(move |event| {
            // Receiver gone: the consumer stopped listening.
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }
}

impl fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeStream")
            .field("live", &(self.source.strong_count() > 0))
            .field("filters", &self.filters)
            .finish()
    }
}

/// RAII handle for a stream subscription.
///
/// Dropping it (or calling [`unsubscribe`](Self::unsubscribe)) removes the
/// listener before the next dispatch. A dispatch already in progress may
/// still reach it once.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    source: Weak<Inner>,
    id: Option<ListenerId>,
}

impl Subscription {
    fn inactive() -> Self {
        Self {
            source: Weak::new(),
            id: None,
        }
    }

    /// Stop receiving events. Calling it again does nothing.
    pub fn unsubscribe(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        if let Some(inner) = self.source.upgrade() {
            inner.remove_listener(id);
        }
    }

    /// Whether the subscription is still registered.
    ///
    /// `false` after unsubscribing and after the notifier is disposed or
    /// dropped.
    #[must_use]
    pub fn is_active(&self) -> bool {
        match (self.id, self.source.upgrade()) {
            (Some(id), Some(inner)) => inner.has_listener(id),
            _ => false,
        }
    }

    /// The listener id, while active.
    #[must_use]
    pub fn id(&self) -> Option<ListenerId> {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl Disposable for Subscription {
    fn dispose(&mut self) -> Result<(), DisposeError> {
        self.unsubscribe();
        Ok(())
    }

    fn label(&self) -> &str {
        "Subscription"
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
