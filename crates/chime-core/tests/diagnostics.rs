#![forbid(unsafe_code)]

//! Integration tests: diagnostics emitted through `tracing` on misuse and
//! listener failure.

use std::fmt;
use std::sync::{Arc, Mutex};

use chime_core::{ChangeNotifier, DisposalGroup, DisposeError, on_dispose};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};

#[derive(Debug, Clone)]
struct Captured {
    level: Level,
    message: String,
    fields: Vec<(String, String)>,
}

#[derive(Clone, Default)]
struct CaptureLayer {
    events: Arc<Mutex<Vec<Captured>>>,
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .push((field.name().to_owned(), format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields.push((field.name().to_owned(), value.to_owned()));
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        self.events.lock().unwrap().push(Captured {
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

/// Run `f` with a thread-local capturing subscriber; return what it logged.
fn capture(f: impl FnOnce()) -> Vec<Captured> {
    let layer = CaptureLayer::default();
    let events = Arc::clone(&layer.events);
    let subscriber = tracing_subscriber::registry().with(layer);
    tracing::subscriber::with_default(subscriber, f);
    let captured = events.lock().unwrap().clone();
    captured
}

fn at_level(events: &[Captured], level: Level) -> Vec<&Captured> {
    events.iter().filter(|e| e.level == level).collect()
}

fn field<'a>(event: &'a Captured, name: &str) -> Option<&'a str> {
    event
        .fields
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

// ============================================================================
// Notifier
// ============================================================================

#[test]
fn listener_panic_is_logged_as_error() {
    let events = capture(|| {
        let notifier = ChangeNotifier::new();
        notifier.add_listener(|_| panic!("listener exploded")).unwrap();
        notifier.notify("title");
    });

    let errors = at_level(&events, Level::ERROR);
    assert_eq!(errors.len(), 1, "{events:?}");
    assert!(errors[0].message.contains("panicked"), "{:?}", errors[0]);
    assert_eq!(field(errors[0], "property"), Some("title"));
    assert!(
        field(errors[0], "panic").is_some_and(|p| p.contains("listener exploded")),
        "{:?}",
        errors[0]
    );
}

#[test]
fn notify_after_dispose_is_logged_as_warning() {
    let events = capture(|| {
        let notifier = ChangeNotifier::new();
        notifier.dispose();
        notifier.notify("title");
    });

    let warnings = at_level(&events, Level::WARN);
    assert_eq!(warnings.len(), 1, "{events:?}");
    assert!(warnings[0].message.contains("disposed"));
    assert_eq!(field(warnings[0], "property"), Some("title"));
}

#[test]
fn suspension_lifecycle_is_logged_at_debug() {
    let events = capture(|| {
        let notifier = ChangeNotifier::new();
        let guard = notifier.suspend();
        notifier.notify("a");
        notifier.notify("a");
        guard.release();
    });

    let debug = at_level(&events, Level::DEBUG);
    assert!(debug.iter().any(|e| e.message.contains("suspended")));
    let resumed = debug
        .iter()
        .find(|e| e.message.contains("resumed"))
        .expect("resume logged");
    assert_eq!(field(resumed, "pending"), Some("1"));
}

#[test]
fn healthy_dispatch_logs_nothing_above_debug() {
    let events = capture(|| {
        let notifier = ChangeNotifier::new();
        let _sub = notifier.changes().subscribe(|_| {});
        notifier.notify("a");
        notifier.notify_all();
    });
    assert!(
        events
            .iter()
            .all(|e| e.level != Level::WARN && e.level != Level::ERROR),
        "{events:?}"
    );
}

// ============================================================================
// Disposal
// ============================================================================

#[test]
fn late_failure_on_disposed_group_is_logged_as_warning() {
    struct Failing;
    impl chime_core::Disposable for Failing {
        fn dispose(&mut self) -> Result<(), DisposeError> {
            Err(DisposeError::failed("socket", "already closed"))
        }
    }

    let events = capture(|| {
        let group = DisposalGroup::new();
        group.add(on_dispose(|| {}));
        group.dispose_all().unwrap();
        group.add(Failing);
    });

    let warnings = at_level(&events, Level::WARN);
    assert_eq!(warnings.len(), 1, "{events:?}");
    assert!(
        field(warnings[0], "error").is_some_and(|e| e.contains("already closed")),
        "{:?}",
        warnings[0]
    );
}
