#![forbid(unsafe_code)]

//! Observable settings with explicit, typed conversion.
//!
//! ```
//! use chime_settings::SettingsStore;
//!
//! let store = SettingsStore::from_toml_str("[server]\nport = \"8080\"\n")?;
//! let port: u16 = store.get("server.port")?;
//! assert_eq!(port, 8080);
//! # Ok::<(), chime_settings::SettingsError>(())
//! ```

use std::path::PathBuf;

pub mod convert;
pub mod store;

pub use convert::{ConverterRegistry, convert_value, parse_duration};
pub use store::SettingsStore;

/// Settings errors.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The stored value could not be converted to the requested type.
    #[error("setting {name:?} ({kind}) cannot be read as {target}: {reason}")]
    Conversion {
        name: String,
        target: &'static str,
        kind: &'static str,
        reason: String,
    },
    /// The empty name is reserved for "every property changed".
    #[error("setting name must not be empty")]
    EmptyName,
    #[error("invalid settings TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
