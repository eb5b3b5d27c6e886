#![forbid(unsafe_code)]

//! Change-notification coalescing for observable entities.
//!
//! This crate provides the primitives an observable entity is built from:
//!
//! - [`ChangeNotifier`]: records property changes and dispatches
//!   [`ChangeEvent`]s to listeners, or buffers them while suspended.
//! - [`SuspendGuard`]: RAII handle on a ref-counted suspension. Nested
//!   suspensions share one buffer; the last release replays each buffered
//!   name exactly once.
//! - [`Property`] / [`property!`] / [`NamedPropertyFilter`]: declarative,
//!   reflection-free selection of properties and name-based filtering.
//! - [`ChangeStream`] / [`Subscription`]: lazily-started, multi-subscriber
//!   event streams with RAII unsubscription.
//! - [`DisposalGroup`]: collective, exactly-once release of everything an
//!   entity acquires.
//! - [`Notifiable`] / [`NotifyingEntity`]: the entity-facing surface.
//!
//! # Threading
//!
//! Everything here is single-threaded (`Rc`-based and `!Send`): dispatch runs
//! synchronously on the caller's thread with no internal locking.
//!
//! # Example
//!
//! ```
//! use chime_core::{ChangeNotifier, NamedPropertyFilter};
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let notifier = ChangeNotifier::new();
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let s = Rc::clone(&seen);
//! let _sub = notifier
//!     .changes()
//!     .filter_by_name(NamedPropertyFilter::from_names(["x"]))
//!     .subscribe(move |e| s.borrow_mut().push(e.to_string()));
//!
//! let guard = notifier.suspend();
//! notifier.notify("");
//! notifier.notify("x");
//! notifier.notify("y");
//! guard.release();
//!
//! assert_eq!(*seen.borrow(), vec!["*", "x"]);
//! ```

pub mod disposal;
pub mod entity;
pub mod event;
pub mod filter;
pub mod notifier;
pub mod stream;
pub mod suspend;

pub use disposal::{
    Disposable, DisposalErrors, DisposalGroup, DisposeError, DisposeWith, OnDispose, on_dispose,
};
pub use entity::{Notifiable, NotifyingEntity};
pub use event::{ChangeEvent, DEFAULT_CACHE_CAPACITY, EventCache, WILDCARD};
pub use filter::{NamedPropertyFilter, Property};
pub use notifier::{ChangeNotifier, ListenerId};
pub use stream::{ChangeStream, Subscription};
pub use suspend::SuspendGuard;
