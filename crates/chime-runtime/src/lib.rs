#![forbid(unsafe_code)]

//! Runtime services around [`chime_core`].
//!
//! - [`heartbeat`]: one shared, hot periodic tick source with RAII listeners.
//! - [`locale`]: observable locale that refreshes bound entities on switch.
//! - [`config`]: TOML runtime configuration with environment overrides.
//! - [`logging`]: opt-in `tracing` subscriber driven by `CHIME_LOG`.

pub mod config;
pub mod heartbeat;
pub mod locale;
pub mod logging;

pub use config::{ConfigError, RuntimeConfig};
pub use heartbeat::{
    Heartbeat, HeartbeatConfig, HeartbeatError, HeartbeatListener, HeartbeatState, Tick,
};
pub use locale::{Locale, LocaleContext, detect_system_locale, refresh_on_locale_change};
pub use logging::LoggingError;
