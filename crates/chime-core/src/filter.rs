#![forbid(unsafe_code)]

//! Declarative property selection and name-based event filtering.
//!
//! A [`Property<E>`] names one property of entity type `E` without touching
//! an instance. The [`property!`](crate::property) macro builds one from a
//! field path and checks at compile time that the field exists on `E`; the
//! accessor it generates is never called.
//!
//! A [`NamedPropertyFilter`] resolves a set of properties to their names once
//! and then answers `matches(event)` for every event: true for the wildcard
//! and for any listed name.
//!
//! ```
//! use chime_core::{ChangeEvent, NamedPropertyFilter, property};
//!
//! struct Document {
//!     title: String,
//!     body: String,
//! }
//!
//! let filter = NamedPropertyFilter::new([property!(Document, title)]);
//! assert!(filter.matches(&ChangeEvent::new("title")));
//! assert!(!filter.matches(&ChangeEvent::new("body")));
//! assert!(filter.matches(&ChangeEvent::wildcard()));
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::event::ChangeEvent;

/// A statically named property of entity type `E`.
pub struct Property<E: ?Sized> {
    name: &'static str,
    _entity: PhantomData<fn(&E)>,
}

impl<E: ?Sized> Property<E> {
    /// Name a property explicitly.
    #[must_use]
    pub const fn named(name: &'static str) -> Self {
        Self {
            name,
            _entity: PhantomData,
        }
    }

    /// The property's runtime name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<E: ?Sized> Clone for Property<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E: ?Sized> Copy for Property<E> {}

impl<E: ?Sized> PartialEq for Property<E> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<E: ?Sized> Eq for Property<E> {}

impl<E: ?Sized> fmt::Debug for Property<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Property").field(&self.name).finish()
    }
}

/// Build a [`Property`] from an entity type and one of its fields.
///
/// The field must be accessible from the call site; the name is the field
/// identifier, or an explicit literal with `as`.
///
/// ```
/// use chime_core::property;
///
/// struct Settings {
///     port: u16,
/// }
///
/// let port = property!(Settings, port);
/// assert_eq!(port.name(), "port");
///
/// let renamed = property!(Settings, port as "Port");
/// assert_eq!(renamed.name(), "Port");
/// ```
#[macro_export]
macro_rules! property {
    ($entity:ty, $field:ident) => {
        $crate::property!($entity, $field as ::core::stringify!($field))
    };
    ($entity:ty, $field:ident as $name:expr) => {{
        let _: fn(&$entity) = |entity: &$entity| {
            let _ = &entity.$field;
        };
        $crate::Property::<$entity>::named($name)
    }};
}

/// Predicate letting through wildcard events and events for a fixed set of
/// property names.
///
/// Names are resolved once at construction; matching is a scan over a small
/// inline set. A filter with no names passes only wildcard events.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct NamedPropertyFilter {
    names: Arc<[Box<str>]>,
}

impl NamedPropertyFilter {
    /// Build a filter from typed property selectors.
    pub fn new<E: ?Sized>(properties: impl IntoIterator<Item = Property<E>>) -> Self {
        Self::from_names(properties.into_iter().map(|p| p.name()))
    }

    /// Build a filter for `entity`'s properties. The instance only anchors
    /// type inference; it is not inspected.
    pub fn for_entity<E>(_entity: &E, properties: &[Property<E>]) -> Self {
        Self::new(properties.iter().copied())
    }

    /// Build a filter from plain property names. Duplicates collapse; an
    /// empty name is ignored, since wildcards always pass.
    pub fn from_names<S: AsRef<str>>(names: impl IntoIterator<Item = S>) -> Self {
        let mut unique: SmallVec<[Box<str>; 4]> = SmallVec::new();
        for name in names {
            let name = name.as_ref();
            if name.is_empty() || unique.iter().any(|n| &**n == name) {
                continue;
            }
            unique.push(Box::from(name));
        }
        Self {
            names: unique.into_vec().into(),
        }
    }

    /// Whether `event` passes the filter.
    #[inline]
    #[must_use]
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.is_wildcard() || self.contains(event.property_name())
    }

    /// Whether `name` is one of the filter's names.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| &**n == name)
    }

    /// The filter's names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|n| &**n)
    }

    /// Number of distinct names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the filter has no names (passes wildcards only).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl fmt::Debug for NamedPropertyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

impl<E: ?Sized> FromIterator<Property<E>> for NamedPropertyFilter {
    fn from_iter<I: IntoIterator<Item = Property<E>>>(iter: I) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    struct Person {
        name: String,
        age: u32,
        email: String,
    }

    #[test]
    fn macro_uses_field_name() {
        assert_eq!(property!(Person, name).name(), "name");
        assert_eq!(property!(Person, age).name(), "age");
        assert_eq!(property!(Person, email as "Email").name(), "Email");
    }

    #[test]
    fn matches_listed_names_only() {
        let filter = NamedPropertyFilter::new([property!(Person, name), property!(Person, age)]);
        assert!(filter.matches(&ChangeEvent::new("name")));
        assert!(filter.matches(&ChangeEvent::new("age")));
        assert!(!filter.matches(&ChangeEvent::new("email")));
    }

    #[test]
    fn wildcard_always_passes() {
        let empty = NamedPropertyFilter::default();
        assert!(empty.is_empty());
        assert!(empty.matches(&ChangeEvent::wildcard()));
        assert!(!empty.matches(&ChangeEvent::new("name")));
    }

    #[test]
    fn duplicates_and_empty_names_collapse() {
        let filter = NamedPropertyFilter::from_names(["a", "b", "a", ""]);
        assert_eq!(filter.len(), 2);
        assert_eq!(filter.names().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn for_entity_infers_type() {
        let person = Person {
            name: "Ada".into(),
            age: 36,
            email: String::new(),
        };
        let filter = NamedPropertyFilter::for_entity(&person, &[property!(Person, email)]);
        assert!(filter.contains("email"));
    }

    #[test]
    fn collect_from_properties() {
        let filter: NamedPropertyFilter = [Property::<Person>::named("age")].into_iter().collect();
        assert!(filter.contains("age"));
    }

    #[test]
    fn debug_lists_names() {
        let filter = NamedPropertyFilter::from_names(["x"]);
        assert_eq!(format!("{filter:?}"), "{\"x\"}");
    }
}
