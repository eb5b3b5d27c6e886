#![forbid(unsafe_code)]

//! Integration tests: heartbeat sharing and config-driven wiring.

use std::io::Write;
use std::thread;
use std::time::Duration;

use chime_core::{DisposeWith, NotifyingEntity};
use chime_runtime::{
    ConfigError, Heartbeat, HeartbeatConfig, HeartbeatState, LocaleContext, RuntimeConfig,
    refresh_on_locale_change,
};

// ============================================================================
// Heartbeat
// ============================================================================

#[test]
fn late_subscriber_only_sees_future_ticks() {
    let heartbeat = Heartbeat::start(HeartbeatConfig::new(Duration::from_millis(100))).unwrap();
    thread::sleep(Duration::from_millis(250));

    let produced = heartbeat.ticks_produced();
    assert!(produced >= 1, "heartbeat ticks without subscribers");

    let listener = heartbeat.listen();
    let first = listener.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(
        first.sequence >= produced,
        "got tick {} after {} had been produced",
        first.sequence,
        produced
    );
}

#[test]
fn listener_moves_to_another_thread() {
    let heartbeat = Heartbeat::start(HeartbeatConfig::new(Duration::from_millis(10))).unwrap();
    let listener = heartbeat.listen();

    let handle = thread::spawn(move || {
        let a = listener.recv_timeout(Duration::from_secs(5)).unwrap();
        let b = listener.recv_timeout(Duration::from_secs(5)).unwrap();
        (a.sequence, b.sequence)
    });
    let (a, b) = handle.join().unwrap();
    assert_eq!(b, a + 1);
}

#[test]
fn disposing_owning_entity_stops_heartbeat() {
    let entity = NotifyingEntity::new();
    let heartbeat = Heartbeat::start(HeartbeatConfig::new(Duration::from_millis(10))).unwrap();
    let listener = heartbeat.listen();
    listener.recv_timeout(Duration::from_secs(5)).unwrap();

    heartbeat.dispose_with(entity.disposables());
    entity.dispose().unwrap();

    listener.drain();
    assert!(listener.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn dropping_heartbeat_closes_listeners() {
    let heartbeat = Heartbeat::start(HeartbeatConfig::new(Duration::from_millis(10))).unwrap();
    let listener = heartbeat.listen();
    drop(heartbeat);
    listener.drain();
    assert!(listener.recv().is_err());
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn config_file_drives_heartbeat() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[heartbeat]\ninterval_ms = 20\n\n[events]\ncache_capacity = 8").unwrap();

    let config = RuntimeConfig::load(file.path()).unwrap();
    assert_eq!(config.events.cache_capacity, 8);

    let heartbeat = Heartbeat::new(config.heartbeat_config()).unwrap();
    assert_eq!(heartbeat.interval(), Duration::from_millis(20));
    assert_eq!(heartbeat.state(), HeartbeatState::Unconnected);
}

#[test]
fn missing_config_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let err = RuntimeConfig::load(&path).unwrap_err();
    match err {
        ConfigError::Io { path: reported, .. } => assert_eq!(reported, path),
        other => panic!("unexpected error: {other}"),
    }
}

// ============================================================================
// Locale
// ============================================================================

#[test]
fn locale_switch_refreshes_every_bound_entity() {
    let locale = LocaleContext::new("en");
    let a = NotifyingEntity::new();
    let b = NotifyingEntity::new();
    let (_sa, ra) = a.notifier().changes().subscribe_channel();
    let (_sb, rb) = b.notifier().changes().subscribe_channel();
    refresh_on_locale_change(&locale, &a);
    refresh_on_locale_change(&locale, &b);

    b.dispose().unwrap();
    locale.set_locale("nl_NL.UTF-8");

    assert_eq!(locale.current_locale(), "nl-NL");
    assert!(ra.try_recv().unwrap().is_wildcard());
    assert!(rb.try_recv().is_err());
}
