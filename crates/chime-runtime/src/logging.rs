#![forbid(unsafe_code)]

//! Opt-in `tracing` subscriber for binaries and tests.
//!
//! Libraries in this workspace only emit `tracing` events. Applications that
//! want them on stderr call [`init`] once at startup; the filter comes from
//! `CHIME_LOG` (e.g. `CHIME_LOG=chime_core=trace`) and defaults to `warn`.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directives.
pub const LOG_ENV: &str = "CHIME_LOG";

/// Directives used when `CHIME_LOG` is unset or empty.
pub const DEFAULT_DIRECTIVES: &str = "warn";

/// Logging setup errors.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("failed to install log subscriber: {0}")]
    Install(String),
}

/// Install a stderr subscriber filtered by `CHIME_LOG`.
///
/// # Errors
///
/// Fails if the directives are invalid or a global subscriber is already
/// installed.
pub fn init() -> Result<(), LoggingError> {
    let directives = std::env::var(LOG_ENV).ok();
    init_with(directives.as_deref())
}

/// Install a stderr subscriber with explicit directives.
///
/// # Errors
///
/// As [`init`].
pub fn init_with(directives: Option<&str>) -> Result<(), LoggingError> {
    let filter = build_filter(directives)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| LoggingError::Install(err.to_string()))
}

/// Filter for `directives`, falling back to [`DEFAULT_DIRECTIVES`].
///
/// # Errors
///
/// [`LoggingError::Filter`] when the directives do not parse.
pub fn build_filter(directives: Option<&str>) -> Result<EnvFilter, LoggingError> {
    let directives = directives
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .unwrap_or(DEFAULT_DIRECTIVES);
    Ok(EnvFilter::try_new(directives)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_directives_use_default() {
        assert!(build_filter(Some("  ")).is_ok());
        assert!(build_filter(None).is_ok());
    }

    #[test]
    fn per_crate_directives_parse() {
        assert!(build_filter(Some("chime_core=trace,chime_runtime=debug")).is_ok());
    }

    #[test]
    fn malformed_directives_are_rejected() {
        let err = build_filter(Some("chime_core=loud")).unwrap_err();
        assert!(matches!(err, LoggingError::Filter(_)));
    }

    #[test]
    fn second_install_fails() {
        // Whichever call wins, at most one install succeeds.
        let first = init_with(Some("off"));
        let second = init_with(Some("off"));
        assert!(first.is_err() || second.is_err());
    }
}
