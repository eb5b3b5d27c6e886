#![forbid(unsafe_code)]

//! Collective ownership of resources acquired during an entity's lifetime.
//!
//! A [`DisposalGroup`] takes ownership of every [`Disposable`] added to it and
//! releases them together, exactly once, when [`DisposalGroup::dispose_all`]
//! runs or the group is dropped.
//!
//! # Invariants
//!
//! 1. Members are released in reverse registration order.
//! 2. `dispose_all()` releases members on the first call only; later calls
//!    return `Ok(())` without touching anything.
//! 3. A member that fails (returns `Err` or panics) does not prevent the
//!    remaining members from being released. Failures are collected and
//!    returned together once every member has been visited.
//! 4. A member added while the group is disposing, or after it has been
//!    disposed, is released immediately instead of being stored.
//!
//! # Example
//!
//! ```
//! use chime_core::{DisposalGroup, on_dispose};
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! let released = Rc::new(Cell::new(0));
//! let group = DisposalGroup::new();
//! let r = Rc::clone(&released);
//! group.add(on_dispose(move || r.set(r.get() + 1)));
//!
//! group.dispose_all().unwrap();
//! group.dispose_all().unwrap();
//! assert_eq!(released.get(), 1);
//! ```

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};

/// Failure reported by a single member while it was being released.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DisposeError {
    /// The resource reported an error.
    #[error("{resource} failed to release: {message}")]
    Failed {
        /// Label of the failing resource.
        resource: String,
        /// Reason reported by the resource.
        message: String,
    },
    /// The resource panicked while releasing.
    #[error("{resource} panicked while releasing: {message}")]
    Panicked {
        /// Label of the failing resource.
        resource: String,
        /// Panic payload, when it was a string.
        message: String,
    },
}

impl DisposeError {
    /// Convenience constructor for [`DisposeError::Failed`].
    pub fn failed(resource: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Failed {
            resource: resource.into(),
            message: message.to_string(),
        }
    }
}

/// Every failure captured by one [`DisposalGroup::dispose_all`] pass.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} resource(s) failed to release", .0.len())]
pub struct DisposalErrors(pub Vec<DisposeError>);

impl DisposalErrors {
    /// The individual failures, in release order.
    #[must_use]
    pub fn errors(&self) -> &[DisposeError] {
        &self.0
    }
}

/// A resource with an explicit release step.
///
/// `dispose` may be called at most once by a [`DisposalGroup`], but
/// implementations should still tolerate repeated calls.
pub trait Disposable {
    /// Release the resource.
    fn dispose(&mut self) -> Result<(), DisposeError>;

    /// Human-readable label used in logs and errors.
    fn label(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A [`Disposable`] that runs a closure once.
///
/// Created by [`on_dispose`].
pub struct OnDispose<F: FnOnce()> {
    action: Option<F>,
}

/// Wrap a closure as a [`Disposable`]. The closure runs on the first
/// `dispose` call only.
pub fn on_dispose<F: FnOnce()>(action: F) -> OnDispose<F> {
    OnDispose {
        action: Some(action),
    }
}

impl<F: FnOnce()> Disposable for OnDispose<F> {
    fn dispose(&mut self) -> Result<(), DisposeError> {
        if let Some(action) = self.action.take() {
            action();
        }
        Ok(())
    }

    fn label(&self) -> &str {
        "on_dispose"
    }
}

impl<F: FnOnce()> fmt::Debug for OnDispose<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnDispose")
            .field("pending", &self.action.is_some())
            .finish()
    }
}

enum GroupState {
    Open(Vec<Box<dyn Disposable>>),
    Disposing,
    Disposed,
}

/// Collects disposables and releases them together, exactly once.
///
/// The group is single-threaded: it is meant to be owned by one entity and
/// touched from that entity's thread.
pub struct DisposalGroup {
    state: RefCell<GroupState>,
    late_errors: RefCell<Vec<DisposeError>>,
}

impl DisposalGroup {
    /// Create an empty, open group.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RefCell::new(GroupState::Open(Vec::new())),
            late_errors: RefCell::new(Vec::new()),
        }
    }

    /// Transfer ownership of `disposable` to the group.
    ///
    /// The group takes ownership, so the disposable cannot be handed back;
    /// `add` returns the group instead so additions can be chained. To
    /// register a value at the end of a builder expression, use
    /// [`DisposeWith::dispose_with`].
    ///
    /// If the group is already disposing or disposed, the disposable is
    /// released right away.
    pub fn add<D: Disposable + 'static>(&self, disposable: D) -> &Self {
        let mut disposable: Box<dyn Disposable> = Box::new(disposable);
        let disposing = {
            let mut state = self.state.borrow_mut();
            match &mut *state {
                GroupState::Open(members) => {
                    members.push(disposable);
                    return self;
                }
                GroupState::Disposing => true,
                GroupState::Disposed => false,
            }
        };

        if let Err(err) = release(disposable.as_mut()) {
            if disposing {
                // Reported by the in-progress dispose_all.
                self.late_errors.borrow_mut().push(err);
            } else {
                tracing::warn!(error = %err, "resource added to a disposed group failed to release");
            }
        }
        self
    }

    /// Release every member. Only the first call does any work.
    ///
    /// # Errors
    ///
    /// Returns every failure captured during this pass once all members have
    /// been released.
    pub fn dispose_all(&self) -> Result<(), DisposalErrors> {
        let members = {
            let mut state = self.state.borrow_mut();
            match mem::replace(&mut *state, GroupState::Disposing) {
                GroupState::Open(members) => members,
                other => {
                    *state = other;
                    return Ok(());
                }
            }
        };

        let count = members.len();
        let mut errors = Vec::new();
        for mut member in members.into_iter().rev() {
            if let Err(err) = release(member.as_mut()) {
                errors.push(err);
            }
        }
        errors.append(&mut self.late_errors.borrow_mut());
        *self.state.borrow_mut() = GroupState::Disposed;

        tracing::debug!(members = count, failures = errors.len(), "disposal group released");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DisposalErrors(errors))
        }
    }

    /// Number of members still held.
    #[must_use]
    pub fn len(&self) -> usize {
        match &*self.state.borrow() {
            GroupState::Open(members) => members.len(),
            GroupState::Disposing | GroupState::Disposed => 0,
        }
    }

    /// Whether the group holds no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `dispose_all` has started.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        !matches!(&*self.state.borrow(), GroupState::Open(_))
    }
}

impl Default for DisposalGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DisposalGroup {
    fn drop(&mut self) {
        if let Err(errors) = self.dispose_all() {
            for err in errors.errors() {
                tracing::warn!(error = %err, "resource failed to release on drop");
            }
        }
    }
}

impl fmt::Debug for DisposalGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisposalGroup")
            .field("members", &self.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Disposable for DisposalGroup {
    fn dispose(&mut self) -> Result<(), DisposeError> {
        self.dispose_all()
            .map_err(|errors| DisposeError::failed("DisposalGroup", errors))
    }
}

/// Hand a disposable over to a [`DisposalGroup`] in method-chain position.
pub trait DisposeWith: Disposable + Sized + 'static {
    /// Add `self` to `group`.
    fn dispose_with(self, group: &DisposalGroup) {
        group.add(self);
    }
}

impl<D: Disposable + 'static> DisposeWith for D {}

/// Release one member, converting a panic into a [`DisposeError`].
fn release(member: &mut dyn Disposable) -> Result<(), DisposeError> {
    let resource = member.label().to_owned();
    match panic::catch_unwind(AssertUnwindSafe(|| member.dispose())) {
        Ok(result) => result,
        Err(payload) => Err(DisposeError::Panicked {
            resource,
            message: panic_message(payload.as_ref()),
        }),
    }
}

/// Best-effort extraction of a panic payload's message.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Failing;

    impl Disposable for Failing {
        fn dispose(&mut self) -> Result<(), DisposeError> {
            Err(DisposeError::failed("failing", "boom"))
        }

        fn label(&self) -> &str {
            "failing"
        }
    }

    struct Panicking;

    impl Disposable for Panicking {
        fn dispose(&mut self) -> Result<(), DisposeError> {
            panic!("release exploded");
        }

        fn label(&self) -> &str {
            "panicking"
        }
    }

    fn recorder(
        log: &Rc<RefCell<Vec<&'static str>>>,
        tag: &'static str,
    ) -> impl Disposable + use<> {
        let log = Rc::clone(log);
        on_dispose(move || log.borrow_mut().push(tag))
    }

    #[test]
    fn releases_in_reverse_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let group = DisposalGroup::new();
        group
            .add(recorder(&log, "first"))
            .add(recorder(&log, "second"))
            .add(recorder(&log, "third"));
        assert_eq!(group.len(), 3);

        group.dispose_all().unwrap();
        assert_eq!(*log.borrow(), vec!["third", "second", "first"]);
        assert!(group.is_disposed());
        assert!(group.is_empty());
    }

    #[test]
    fn dispose_all_is_idempotent() {
        let count = Rc::new(Cell::new(0));
        let group = DisposalGroup::new();
        let c = Rc::clone(&count);
        group.add(on_dispose(move || c.set(c.get() + 1)));

        group.dispose_all().unwrap();
        group.dispose_all().unwrap();
        drop(group);
        assert_eq!(count.get(), 1, "member released exactly once");
    }

    #[test]
    fn failures_do_not_stop_remaining_members() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let group = DisposalGroup::new();
        group
            .add(recorder(&log, "a"))
            .add(Failing)
            .add(Panicking)
            .add(recorder(&log, "b"));

        let err = group.dispose_all().unwrap_err();
        assert_eq!(*log.borrow(), vec!["b", "a"]);
        assert_eq!(err.errors().len(), 2);
        assert!(matches!(err.errors()[0], DisposeError::Panicked { .. }));
        assert!(matches!(err.errors()[1], DisposeError::Failed { .. }));
        assert_eq!(err.to_string(), "2 resource(s) failed to release");
    }

    #[test]
    fn panic_message_is_captured() {
        let group = DisposalGroup::new();
        group.add(Panicking);
        let err = group.dispose_all().unwrap_err();
        assert_eq!(
            err.errors()[0].to_string(),
            "panicking panicked while releasing: release exploded"
        );
    }

    #[test]
    fn add_after_dispose_releases_immediately() {
        let group = DisposalGroup::new();
        group.dispose_all().unwrap();

        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        group.add(on_dispose(move || c.set(c.get() + 1)));
        assert_eq!(count.get(), 1);
        assert!(group.is_empty());
    }

    #[test]
    fn add_during_dispose_is_released_in_same_pass() {
        let group = Rc::new(DisposalGroup::new());
        let late = Rc::new(Cell::new(false));

        let g = Rc::downgrade(&group);
        let l = Rc::clone(&late);
        group.add(on_dispose(move || {
            if let Some(group) = g.upgrade() {
                let l = Rc::clone(&l);
                group.add(on_dispose(move || l.set(true)));
            }
        }));

        group.dispose_all().unwrap();
        assert!(late.get(), "member added mid-dispose was released");
    }

    #[test]
    fn late_failures_are_reported_by_dispose_all() {
        let group = Rc::new(DisposalGroup::new());
        let g = Rc::downgrade(&group);
        group.add(on_dispose(move || {
            if let Some(group) = g.upgrade() {
                group.add(Failing);
            }
        }));

        let err = group.dispose_all().unwrap_err();
        assert_eq!(err.errors().len(), 1);
    }

    #[test]
    fn drop_releases_members() {
        let count = Rc::new(Cell::new(0));
        {
            let group = DisposalGroup::new();
            let c = Rc::clone(&count);
            on_dispose(move || c.set(c.get() + 1)).dispose_with(&group);
        }
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn on_dispose_runs_once() {
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        let mut d = on_dispose(move || c.set(c.get() + 1));
        d.dispose().unwrap();
        d.dispose().unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn debug_format() {
        let group = DisposalGroup::new();
        group.add(on_dispose(|| {}));
        let debug = format!("{group:?}");
        assert!(debug.contains("members: 1"));
        assert!(debug.contains("disposed: false"));
    }
}
