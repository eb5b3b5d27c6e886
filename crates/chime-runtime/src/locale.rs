#![forbid(unsafe_code)]

//! Process-wide locale as a notifying entity.
//!
//! [`LocaleContext`] publishes a single `locale` property. Entities whose
//! displayed text depends on the locale call [`refresh_on_locale_change`];
//! every later locale switch then raises a wildcard change on them so all of
//! their bindings re-read. The locale in effect at subscription time is not
//! replayed.
//!
//! # Invariants
//!
//! - Locale tags are normalized (`fr_FR.UTF-8` → `fr-FR`, `C` → `en`).
//! - Setting the current locale again is a no-op: no version bump, no event.

use std::cell::{Cell, RefCell};
use std::env;
use std::fmt;
use std::rc::Rc;

use chime_core::{ChangeEvent, ChangeNotifier, ChangeStream, NotifyingEntity, Subscription};

/// Normalized locale tag, e.g. `en-US`.
pub type Locale = String;

/// Name of the property raised when the locale switches.
pub const LOCALE_PROPERTY: &str = "locale";

/// Environment variables consulted by [`detect_system_locale`], in order.
pub const LOCALE_ENV_VARS: [&str; 3] = ["LC_ALL", "LC_MESSAGES", "LANG"];

const FALLBACK_LOCALE: &str = "en";

struct LocaleState {
    notifier: ChangeNotifier,
    locale: RefCell<Locale>,
    version: Cell<u64>,
}

/// Shared, observable current locale.
///
/// Cloning yields another handle on the same context.
#[derive(Clone)]
pub struct LocaleContext {
    state: Rc<LocaleState>,
}

impl LocaleContext {
    /// Context starting at `locale`.
    #[must_use]
    pub fn new(locale: &str) -> Self {
        Self {
            state: Rc::new(LocaleState {
                notifier: ChangeNotifier::new(),
                locale: RefCell::new(normalize_or_fallback(locale)),
                version: Cell::new(0),
            }),
        }
    }

    /// Context starting at the locale detected from the environment.
    #[must_use]
    pub fn system() -> Self {
        Self::new(&detect_system_locale())
    }

    /// The active locale.
    #[must_use]
    pub fn current_locale(&self) -> Locale {
        self.state.locale.borrow().clone()
    }

    /// Number of effective locale switches so far.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.state.version.get()
    }

    /// Switch locale. Returns `false` when `locale` normalizes to the
    /// current one.
    pub fn set_locale(&self, locale: &str) -> bool {
        let next = normalize_or_fallback(locale);
        {
            let mut current = self.state.locale.borrow_mut();
            if *current == next {
                return false;
            }
            tracing::debug!(from = %current, to = %next, "locale changed");
            *current = next;
        }
        self.state.version.set(self.state.version.get() + 1);
        self.state.notifier.notify(LOCALE_PROPERTY);
        true
    }

    /// Stream of locale changes.
    #[must_use]
    pub fn changes(&self) -> ChangeStream {
        self.state.notifier.changes()
    }

    /// Raise a wildcard change on `target` after every later locale switch.
    ///
    /// The returned subscription holds a handle on `target`'s notifier until
    /// it is dropped or disposed.
    pub fn bind_refresh(&self, target: &ChangeNotifier) -> Subscription {
        let target = target.clone();
        self.changes().subscribe(move |event: &ChangeEvent| {
            if event.property_name() == LOCALE_PROPERTY || event.is_wildcard() {
                target.notify_all();
            }
        })
    }
}

impl Default for LocaleContext {
    fn default() -> Self {
        Self::new(FALLBACK_LOCALE)
    }
}

impl fmt::Debug for LocaleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocaleContext")
            .field("locale", &*self.state.locale.borrow())
            .field("version", &self.state.version.get())
            .finish()
    }
}

/// Refresh `entity` on every later locale switch.
///
/// The subscription joins the entity's disposal group, so disposing the
/// entity ends it.
pub fn refresh_on_locale_change(locale: &LocaleContext, entity: &NotifyingEntity) {
    let subscription = locale.bind_refresh(entity.notifier());
    entity.disposables().add(subscription);
}

/// Detect the locale from `LC_ALL`, `LC_MESSAGES`, then `LANG`.
///
/// Falls back to `en` when none yields a usable tag.
#[must_use]
pub fn detect_system_locale() -> Locale {
    detect_locale_with(|key| env::var(key).ok())
}

/// [`detect_system_locale`] over an arbitrary variable lookup.
pub fn detect_locale_with(lookup: impl Fn(&str) -> Option<String>) -> Locale {
    LOCALE_ENV_VARS
        .into_iter()
        .find_map(|key| lookup(key).as_deref().and_then(normalize_locale))
        .unwrap_or_else(|| FALLBACK_LOCALE.to_owned())
}

/// Normalize a POSIX or BCP 47 style tag. `None` if nothing usable remains.
#[must_use]
pub fn normalize_locale(raw: &str) -> Option<Locale> {
    // Drop `.codeset` and `@modifier`.
    let tag = raw
        .trim()
        .split(['.', '@'])
        .next()
        .unwrap_or_default()
        .trim();
    if tag.is_empty() {
        return None;
    }
    if tag.eq_ignore_ascii_case("C") || tag.eq_ignore_ascii_case("POSIX") {
        return Some(FALLBACK_LOCALE.to_owned());
    }

    let mut parts = tag.split(['_', '-']).filter(|part| !part.is_empty());
    let language = parts.next()?.to_ascii_lowercase();
    let mut normalized = language;
    for part in parts {
        normalized.push('-');
        if part.len() == 2 {
            normalized.push_str(&part.to_ascii_uppercase());
        } else {
            normalized.push_str(part);
        }
    }
    Some(normalized)
}

fn normalize_or_fallback(raw: &str) -> Locale {
    normalize_locale(raw).unwrap_or_else(|| FALLBACK_LOCALE.to_owned())
}
