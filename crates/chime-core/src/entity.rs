#![forbid(unsafe_code)]

//! Observable entities.
//!
//! Any type holding a [`ChangeNotifier`] can implement [`Notifiable`] and get
//! the suspend / observe surface for free. [`NotifyingEntity`] bundles a
//! notifier with the [`DisposalGroup`] that owns everything the entity
//! acquires, and is the usual building block for such types.
//!
//! ```
//! use chime_core::{ChangeNotifier, Notifiable, NotifyingEntity, property};
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! struct Counter {
//!     base: NotifyingEntity,
//!     count: u32,
//!     label: String,
//! }
//!
//! impl Notifiable for Counter {
//!     fn notifier(&self) -> &ChangeNotifier {
//!         self.base.notifier()
//!     }
//! }
//!
//! impl Counter {
//!     fn increment(&mut self) {
//!         let next = self.count + 1;
//!         self.base.notifier().set_and_notify(&mut self.count, next, "count");
//!     }
//! }
//!
//! let mut counter = Counter { base: NotifyingEntity::new(), count: 0, label: String::new() };
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let s = Rc::clone(&seen);
//! let _sub = counter
//!     .observe_properties(&[property!(Counter, count)])
//!     .subscribe(move |e| s.borrow_mut().push(e.to_string()));
//!
//! {
//!     let _guard = counter.suspend_notifications();
//!     counter.increment();
//!     counter.increment();
//! }
//! assert_eq!(*seen.borrow(), vec!["count"]);
//! ```

use std::fmt;

use crate::disposal::{Disposable, DisposalErrors, DisposalGroup, DisposeError};
use crate::filter::{NamedPropertyFilter, Property};
use crate::notifier::ChangeNotifier;
use crate::stream::ChangeStream;
use crate::suspend::SuspendGuard;

/// An entity that reports property changes through a [`ChangeNotifier`].
pub trait Notifiable {
    /// The entity's notifier.
    fn notifier(&self) -> &ChangeNotifier;

    /// Suspend change delivery until the guard is released.
    fn suspend_notifications(&self) -> SuspendGuard {
        self.notifier().suspend()
    }

    /// Every change event of this entity.
    fn observe_changes(&self) -> ChangeStream {
        self.notifier().changes()
    }

    /// Change events for the given properties, plus wildcard events.
    fn observe_properties(&self, properties: &[Property<Self>]) -> ChangeStream
    where
        Self: Sized,
    {
        self.notifier()
            .changes()
            .filter_by_name(NamedPropertyFilter::for_entity(self, properties))
    }
}

/// Notifier plus disposal group: the lifetime core of an observable entity.
///
/// Disposing the entity releases the group first (so subscriptions it owns
/// detach cleanly) and then disposes the notifier.
#[derive(Default)]
pub struct NotifyingEntity {
    notifier: ChangeNotifier,
    disposables: DisposalGroup,
}

impl NotifyingEntity {
    /// Create a live entity core.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an entity core whose event cache holds at most `capacity` names.
    #[must_use]
    pub fn with_cache_capacity(capacity: usize) -> Self {
        Self {
            notifier: ChangeNotifier::with_cache_capacity(capacity),
            disposables: DisposalGroup::new(),
        }
    }

    /// The entity's notifier.
    #[must_use]
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// Resources released together with the entity.
    #[must_use]
    pub fn disposables(&self) -> &DisposalGroup {
        &self.disposables
    }

    /// Tear the entity down. Only the first call does any work.
    ///
    /// # Errors
    ///
    /// Returns the failures of any disposables that could not be released;
    /// the notifier is disposed regardless.
    pub fn dispose(&self) -> Result<(), DisposalErrors> {
        let result = self.disposables.dispose_all();
        self.notifier.dispose();
        result
    }

    /// Whether [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.notifier.is_disposed()
    }
}

impl Notifiable for NotifyingEntity {
    fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }
}

impl Disposable for NotifyingEntity {
    fn dispose(&mut self) -> Result<(), DisposeError> {
        Self::dispose(self).map_err(|errors| DisposeError::failed("NotifyingEntity", errors))
    }

    fn label(&self) -> &str {
        "NotifyingEntity"
    }
}

impl Drop for NotifyingEntity {
    fn drop(&mut self) {
        if let Err(errors) = Self::dispose(self) {
            tracing::warn!(error = %errors, "entity dropped with failing disposables");
        }
    }
}

impl fmt::Debug for NotifyingEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyingEntity")
            .field("notifier", &self.notifier)
            .field("disposables", &self.disposables)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disposal::on_dispose;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn dispose_releases_group_then_notifier() {
        let entity = NotifyingEntity::new();
        let released = Rc::new(Cell::new(0));
        let r = Rc::clone(&released);
        entity.disposables().add(on_dispose(move || r.set(r.get() + 1)));

        entity.dispose().unwrap();
        entity.dispose().unwrap();
        assert_eq!(released.get(), 1);
        assert!(entity.is_disposed());
    }

    #[test]
    fn subscription_owned_by_group_detaches_on_dispose() {
        let entity = NotifyingEntity::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let sub = entity
            .observe_changes()
            .subscribe(move |e| s.borrow_mut().push(e.to_string()));
        entity.disposables().add(sub);

        entity.notifier().notify("a");
        entity.dispose().unwrap();
        entity.notifier().notify("b");
        assert_eq!(*seen.borrow(), vec!["a"]);
        assert_eq!(entity.notifier().listener_count(), 0);
    }

    #[test]
    fn drop_disposes() {
        let released = Rc::new(Cell::new(false));
        {
            let entity = NotifyingEntity::with_cache_capacity(8);
            let r = Rc::clone(&released);
            entity.disposables().add(on_dispose(move || r.set(true)));
        }
        assert!(released.get());
    }

    #[test]
    fn trait_defaults_route_to_notifier() {
        let entity = NotifyingEntity::new();
        let guard = entity.suspend_notifications();
        assert!(entity.notifier().is_suspended());
        guard.release();
        assert!(!entity.notifier().is_suspended());
    }
}
