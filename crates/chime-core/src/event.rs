#![forbid(unsafe_code)]

//! Change events and the per-notifier canonical event cache.
//!
//! A [`ChangeEvent`] names the property that changed. The empty name is the
//! wildcard: "treat every property as changed". Wildcard events are never
//! rejected by a [`NamedPropertyFilter`](crate::NamedPropertyFilter).
//!
//! Events are cheap to clone (the name is an `Arc<str>`), so a notifier keeps
//! one canonical event per property name in an [`EventCache`] and hands out
//! clones instead of allocating on every dispatch.

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;

/// Property name carried by a wildcard event.
pub const WILDCARD: &str = "";

/// Default number of distinct property names an [`EventCache`] retains.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// An immutable "property changed" event.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ChangeEvent {
    name: Arc<str>,
}

impl ChangeEvent {
    /// Create an event for `name`. The empty name produces a wildcard event.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
        }
    }

    /// Create the wildcard ("all properties changed") event.
    #[must_use]
    pub fn wildcard() -> Self {
        Self::new(WILDCARD)
    }

    /// Name of the changed property; empty for the wildcard.
    #[inline]
    #[must_use]
    pub fn property_name(&self) -> &str {
        &self.name
    }

    /// Whether this event means "every property changed".
    #[inline]
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.name.is_empty()
    }
}

impl fmt::Debug for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wildcard() {
            f.write_str("ChangeEvent(*)")
        } else {
            write!(f, "ChangeEvent({:?})", &*self.name)
        }
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wildcard() {
            f.write_str("*")
        } else {
            f.write_str(&self.name)
        }
    }
}

/// Bounded cache mapping a property name to its canonical [`ChangeEvent`].
///
/// When the cache is full the next miss clears it; eviction is explicit and
/// memory never grows past `capacity` entries. A capacity of zero disables
/// caching entirely.
#[derive(Debug)]
pub struct EventCache {
    events: AHashMap<Arc<str>, ChangeEvent>,
    capacity: usize,
    wildcard: ChangeEvent,
    evictions: u64,
}

impl EventCache {
    /// Create a cache with [`DEFAULT_CACHE_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    /// Create a cache retaining at most `capacity` distinct names.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: AHashMap::with_capacity(capacity.min(DEFAULT_CACHE_CAPACITY)),
            capacity,
            wildcard: ChangeEvent::wildcard(),
            evictions: 0,
        }
    }

    /// Return the canonical event for `name`, creating it on a miss.
    pub fn event_for(&mut self, name: &str) -> ChangeEvent {
        if name.is_empty() {
            return self.wildcard.clone();
        }
        if let Some(event) = self.events.get(name) {
            return event.clone();
        }

        let event = ChangeEvent::new(name);
        if self.capacity == 0 {
            return event;
        }
        if self.events.len() >= self.capacity {
            tracing::trace!(
                capacity = self.capacity,
                "event cache full; clearing cached change events"
            );
            self.events.clear();
            self.evictions += 1;
        }
        self.events.insert(Arc::clone(&event.name), event.clone());
        event
    }

    /// Number of cached names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether no names are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Maximum number of cached names.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// How many times the cache was cleared because it was full.
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}

impl Default for EventCache {
    fn default() -> Self {
        Self::new()
    }
}
