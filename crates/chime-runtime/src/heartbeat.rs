#![forbid(unsafe_code)]

//! Shared periodic heartbeat.
//!
//! A [`Heartbeat`] owns one background worker that ticks at a fixed interval
//! and fans every tick out to all current listeners. It is *hot*: once
//! connected it ticks whether or not anyone listens, and a listener only
//! receives ticks produced after it subscribed.
//!
//! # Lifecycle
//!
//! ```text
//!   new() ──► Unconnected ──connect()──► Connected ──dispose()──► Disposed
//!                  └──────────────────dispose()───────────────────────┘
//! ```
//!
//! The worker connection is owned by the heartbeat's
//! [`DisposalGroup`]; disposing the heartbeat stops the worker, joins it and
//! closes every listener. A disposed heartbeat cannot be reconnected.
//!
//! # Threading
//!
//! Ticks are produced on the worker thread. [`HeartbeatListener`] is `Send`,
//! so consumers can move it to whichever thread should observe ticks. The
//! subscriber list is published through [`ArcSwap`] snapshots, so the worker
//! never blocks subscribe or unsubscribe.
//!
//! Each listener queues at most [`HeartbeatConfig::backlog`] ticks. The worker
//! never blocks on a slow listener: ticks that do not fit are dropped for that
//! listener, which then sees a gap in [`Tick::sequence`].
//!
//! # Example
//!
//! ```no_run
//! use chime_runtime::heartbeat::{Heartbeat, HeartbeatConfig};
//! use std::time::Duration;
//!
//! let heartbeat = Heartbeat::start(HeartbeatConfig::new(Duration::from_millis(100)))?;
//! let listener = heartbeat.listen();
//! let tick = listener.recv_timeout(Duration::from_secs(1))?;
//! assert!(tick.sequence >= 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::cell::Cell;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use chime_core::{Disposable, DisposalErrors, DisposalGroup, DisposeError};
use web_time::Instant;

/// Default heartbeat interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of undelivered ticks queued per listener.
pub const DEFAULT_BACKLOG: usize = 8;

/// Heartbeat configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between ticks. Must be non-zero.
    pub interval: Duration,
    /// Ticks queued per listener before further ticks are dropped for it.
    /// Values below 1 are treated as 1.
    pub backlog: usize,
}

impl HeartbeatConfig {
    /// Configuration ticking every `interval`.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            backlog: DEFAULT_BACKLOG,
        }
    }

    /// Replace the per-listener backlog.
    #[must_use]
    pub const fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog;
        self
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}

/// One heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// 1-based tick number since the heartbeat connected.
    pub sequence: u64,
    /// When the worker produced the tick.
    pub at: Instant,
}

/// Lifecycle state of a [`Heartbeat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// Built but not ticking.
    Unconnected,
    /// Worker running.
    Connected,
    /// Permanently stopped.
    Disposed,
}

/// Errors from heartbeat construction and connection.
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// The configured interval was zero.
    #[error("heartbeat interval must be non-zero")]
    ZeroInterval,
    /// `connect` was called on a connected heartbeat.
    #[error("heartbeat is already connected")]
    AlreadyConnected,
    /// The heartbeat has been disposed; build a new one instead.
    #[error("heartbeat has been disposed")]
    Disposed,
    /// The worker thread could not be spawned.
    #[error("failed to spawn heartbeat worker: {0}")]
    Spawn(#[source] io::Error),
}

struct Slot {
    id: u64,
    tx: mpsc::SyncSender<Tick>,
}

/// State shared between the heartbeat, its worker and its listeners.
struct Shared {
    subscribers: ArcSwap<Vec<Arc<Slot>>>,
    next_listener: AtomicU64,
    produced: AtomicU64,
    dropped: AtomicU64,
    stop: Mutex<bool>,
    wake: Condvar,
}

impl Shared {
    fn new() -> Self {
        Self {
            subscribers: ArcSwap::from_pointee(Vec::new()),
            next_listener: AtomicU64::new(1),
            produced: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            stop: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    fn register(&self, slot: Arc<Slot>) {
        self.subscribers.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&slot));
            next
        });
    }

    fn deregister(&self, id: u64) {
        self.subscribers.rcu(|current| {
            current
                .iter()
                .filter(|slot| slot.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    fn broadcast(&self, tick: Tick) {
        let subscribers = self.subscribers.load();
        for slot in subscribers.iter() {
            match slot.tx.try_send(tick) {
                Ok(()) => {}
                Err(mpsc::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(
                        listener = slot.id,
                        sequence = tick.sequence,
                        "listener backlog full; tick dropped"
                    );
                }
                // A listener that went away deregisters itself on drop.
                Err(mpsc::TrySendError::Disconnected(_)) => {}
            }
        }
    }

    fn request_stop(&self) {
        let mut stopped = self.stop.lock().unwrap_or_else(PoisonError::into_inner);
        *stopped = true;
        self.wake.notify_all();
    }
}

/// Worker loop: tick every `interval` until stopped.
fn run(shared: Arc<Shared>, interval: Duration) {
    let mut next = Instant::now() + interval;
    let mut sequence = 0u64;
    loop {
        {
            let mut stopped = shared.stop.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if *stopped {
                    tracing::debug!(ticks = sequence, "heartbeat worker stopped");
                    return;
                }
                let now = Instant::now();
                if now >= next {
                    break;
                }
                let (guard, _) = shared
                    .wake
                    .wait_timeout(stopped, next - now)
                    .unwrap_or_else(PoisonError::into_inner);
                stopped = guard;
            }
        }

        sequence += 1;
        let at = Instant::now();
        next += interval;
        if next <= at {
            // Stalled past a whole interval; skip the missed ticks.
            next = at + interval;
        }
        shared.produced.store(sequence, Ordering::Release);
        tracing::trace!(sequence, "heartbeat tick");
        shared.broadcast(Tick { sequence, at });
    }
}

/// Running worker; owned by the heartbeat's disposal group.
struct Connection {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Disposable for Connection {
    fn dispose(&mut self) -> Result<(), DisposeError> {
        self.shared.request_stop();
        match self.worker.take() {
            Some(worker) => worker
                .join()
                .map_err(|_| DisposeError::failed("heartbeat worker", "worker thread panicked")),
            None => Ok(()),
        }
    }

    fn label(&self) -> &str {
        "heartbeat connection"
    }
}

/// A hot, shared periodic tick source.
pub struct Heartbeat {
    interval: Duration,
    backlog: usize,
    shared: Arc<Shared>,
    state: Cell<HeartbeatState>,
    disposables: DisposalGroup,
}

impl Heartbeat {
    /// Build an unconnected heartbeat.
    ///
    /// # Errors
    ///
    /// [`HeartbeatError::ZeroInterval`] if `config.interval` is zero.
    pub fn new(config: HeartbeatConfig) -> Result<Self, HeartbeatError> {
        if config.interval.is_zero() {
            return Err(HeartbeatError::ZeroInterval);
        }
        Ok(Self {
            interval: config.interval,
            backlog: config.backlog.max(1),
            shared: Arc::new(Shared::new()),
            state: Cell::new(HeartbeatState::Unconnected),
            disposables: DisposalGroup::new(),
        })
    }

    /// Build and immediately connect a heartbeat.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new) and [`connect`](Self::connect).
    pub fn start(config: HeartbeatConfig) -> Result<Self, HeartbeatError> {
        let heartbeat = Self::new(config)?;
        heartbeat.connect()?;
        Ok(heartbeat)
    }

    /// Start the worker. Ticks begin even with no listeners.
    ///
    /// # Errors
    ///
    /// - [`HeartbeatError::AlreadyConnected`] on a second call.
    /// - [`HeartbeatError::Disposed`] after disposal.
    /// - [`HeartbeatError::Spawn`] if the worker thread cannot be created.
    pub fn connect(&self) -> Result<(), HeartbeatError> {
        match self.state.get() {
            HeartbeatState::Unconnected => {}
            HeartbeatState::Connected => return Err(HeartbeatError::AlreadyConnected),
            HeartbeatState::Disposed => return Err(HeartbeatError::Disposed),
        }

        let shared = Arc::clone(&self.shared);
        let interval = self.interval;
        let worker = thread::Builder::new()
            .name("chime-heartbeat".into())
            .spawn(move || run(shared, interval))
            .map_err(HeartbeatError::Spawn)?;

        self.disposables.add(Connection {
            shared: Arc::clone(&self.shared),
            worker: Some(worker),
        });
        self.state.set(HeartbeatState::Connected);
        tracing::debug!(interval_ms = self.interval.as_millis() as u64, "heartbeat connected");
        Ok(())
    }

    /// Subscribe to future ticks.
    ///
    /// At most the configured backlog of ticks is queued for the listener;
    /// later ticks are dropped for it until it catches up. On a disposed
    /// heartbeat the listener is returned already closed.
    #[must_use]
    pub fn listen(&self) -> HeartbeatListener {
        let (tx, rx) = mpsc::sync_channel(self.backlog);
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        if self.state.get() == HeartbeatState::Disposed {
            drop(tx);
            return HeartbeatListener {
                id,
                rx,
                shared: Weak::new(),
            };
        }
        self.shared.register(Arc::new(Slot { id, tx }));
        HeartbeatListener {
            id,
            rx,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Stop ticking permanently and close every listener. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the failure if the worker thread panicked.
    pub fn dispose(&self) -> Result<(), DisposalErrors> {
        if self.state.replace(HeartbeatState::Disposed) == HeartbeatState::Disposed {
            return Ok(());
        }
        let result = self.disposables.dispose_all();
        self.shared.request_stop();
        // Dropping the senders closes every listener.
        self.shared.subscribers.store(Arc::new(Vec::new()));
        tracing::debug!("heartbeat disposed");
        result
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> HeartbeatState {
        self.state.get()
    }

    /// Configured interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of ticks produced so far.
    #[must_use]
    pub fn ticks_produced(&self) -> u64 {
        self.shared.produced.load(Ordering::Acquire)
    }

    /// Ticks dropped because a listener's backlog was full, across all
    /// listeners.
    #[must_use]
    pub fn ticks_dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Per-listener backlog.
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.backlog
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.shared.subscribers.load().len()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Err(errors) = self.dispose() {
            tracing::warn!(error = %errors, "heartbeat dropped with a failing worker");
        }
    }
}

impl Disposable for Heartbeat {
    fn dispose(&mut self) -> Result<(), DisposeError> {
        Self::dispose(self).map_err(|errors| DisposeError::failed("Heartbeat", errors))
    }

    fn label(&self) -> &str {
        "Heartbeat"
    }
}

impl fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heartbeat")
            .field("interval", &self.interval)
            .field("backlog", &self.backlog)
            .field("state", &self.state.get())
            .field("listeners", &self.listener_count())
            .field("ticks", &self.ticks_produced())
            .finish()
    }
}

/// Receiving end of a heartbeat subscription.
///
/// Dropping the listener deregisters it.
pub struct HeartbeatListener {
    id: u64,
    rx: mpsc::Receiver<Tick>,
    shared: Weak<Shared>,
}

impl HeartbeatListener {
    /// Block until the next tick.
    ///
    /// # Errors
    ///
    /// Fails once the heartbeat has been disposed.
    pub fn recv(&self) -> Result<Tick, mpsc::RecvError> {
        self.rx.recv()
    }

    /// Wait at most `timeout` for the next tick.
    ///
    /// # Errors
    ///
    /// Times out, or fails once the heartbeat has been disposed.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Tick, mpsc::RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Take the next tick if one is queued.
    ///
    /// # Errors
    ///
    /// Empty, or disconnected once the heartbeat has been disposed.
    pub fn try_recv(&self) -> Result<Tick, mpsc::TryRecvError> {
        self.rx.try_recv()
    }

    /// Take every queued tick without blocking.
    pub fn drain(&self) -> Vec<Tick> {
        self.rx.try_iter().collect()
    }
}

impl Drop for HeartbeatListener {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.deregister(self.id);
        }
    }
}

impl fmt::Debug for HeartbeatListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatListener")
            .field("id", &self.id)
            .finish()
    }
}
