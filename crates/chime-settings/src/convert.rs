#![forbid(unsafe_code)]

//! Typed conversion of stored setting values.
//!
//! A stored [`Value`] is turned into the requested type by the first stage
//! that applies:
//!
//! 1. A converter registered for the target type in a [`ConverterRegistry`].
//!    A converter may decline a value (returns `None`), in which case the
//!    next stage runs.
//! 2. Change of type through `serde`: direct deserialization; then, for
//!    strings, the string re-read as a JSON scalar (`"8080"` → `8080`); then,
//!    for numbers and booleans, their text form (`8080` → `"8080"`).
//!
//! Nothing is ever cast unchecked. When no stage succeeds the caller gets a
//! [`SettingsError::Conversion`].

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::SettingsError;

type ErasedConverter = dyn Fn(&Value) -> Option<Result<Box<dyn Any>, String>>;

/// Per-type converters consulted before generic conversion.
pub struct ConverterRegistry {
    converters: HashMap<TypeId, (&'static str, Box<ErasedConverter>)>,
}

impl ConverterRegistry {
    /// Registry with no converters.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            converters: HashMap::new(),
        }
    }

    /// Registry with the built-in `bool` and [`Duration`] converters.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(convert_bool).register(convert_duration);
        registry
    }

    /// Install `convert` for `T`, replacing any previous converter.
    ///
    /// `convert` returns `None` for values it does not handle and
    /// `Some(Err(reason))` for values it handles but rejects.
    pub fn register<T: 'static>(
        &mut self,
        convert: impl Fn(&Value) -> Option<Result<T, String>> + 'static,
    ) -> &mut Self {
        let erased = move |value: &Value| {
            convert(value).map(|result| result.map(|converted| Box::new(converted) as Box<dyn Any>))
        };
        self.converters
            .insert(TypeId::of::<T>(), (type_name::<T>(), Box::new(erased)));
        self
    }

    /// Whether a converter is registered for `T`.
    #[must_use]
    pub fn handles<T: 'static>(&self) -> bool {
        self.converters.contains_key(&TypeId::of::<T>())
    }

    /// Run the converter for `T`, if any accepts `value`.
    pub fn convert<T: 'static>(&self, value: &Value) -> Option<Result<T, String>> {
        let (_, convert) = self.converters.get(&TypeId::of::<T>())?;
        let converted = convert(value)?;
        Some(converted.and_then(|boxed| {
            boxed
                .downcast::<T>()
                .map(|typed| *typed)
                .map_err(|_| format!("converter did not produce {}", type_name::<T>()))
        }))
    }

    /// Number of registered converters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.converters.len()
    }

    /// Whether no converters are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.converters.values().map(|(name, _)| *name).collect();
        types.sort_unstable();
        f.debug_struct("ConverterRegistry")
            .field("types", &types)
            .finish()
    }
}

/// Convert the value stored under `name` to `T`.
///
/// # Errors
///
/// [`SettingsError::Conversion`] when neither a registered converter nor
/// generic conversion yields a `T`.
pub fn convert_value<T>(
    registry: &ConverterRegistry,
    name: &str,
    value: &Value,
) -> Result<T, SettingsError>
where
    T: DeserializeOwned + 'static,
{
    if let Some(result) = registry.convert::<T>(value) {
        tracing::trace!(name, target = type_name::<T>(), "registered converter applied");
        return result.map_err(|reason| conversion_error::<T>(name, value, reason));
    }
    change_type(value).map_err(|err| conversion_error::<T>(name, value, err.to_string()))
}

/// Generic change of type; the error is the one from direct deserialization.
fn change_type<T: DeserializeOwned>(value: &Value) -> Result<T, serde_json::Error> {
    let direct = match serde_json::from_value(value.clone()) {
        Ok(converted) => return Ok(converted),
        Err(err) => err,
    };
    let restated = match value {
        Value::String(text) => serde_json::from_str::<Value>(text.trim())
            .ok()
            .filter(|parsed| matches!(parsed, Value::Number(_) | Value::Bool(_))),
        Value::Number(_) | Value::Bool(_) => Some(Value::String(value.to_string())),
        _ => None,
    };
    match restated {
        Some(restated) => serde_json::from_value(restated).map_err(|_| direct),
        None => Err(direct),
    }
}

fn conversion_error<T>(name: &str, value: &Value, reason: String) -> SettingsError {
    SettingsError::Conversion {
        name: name.to_owned(),
        target: type_name::<T>(),
        kind: value_kind(value),
        reason,
    }
}

/// Short name of a value's JSON kind, for messages.
#[must_use]
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "table",
    }
}

/// `yes`/`no`, `on`/`off`, `true`/`false` and `1`/`0`, as strings or numbers.
fn convert_bool(value: &Value) -> Option<Result<bool, String>> {
    match value {
        Value::String(text) => Some(match text.trim().to_ascii_lowercase().as_str() {
            "yes" | "on" | "true" | "1" => Ok(true),
            "no" | "off" | "false" | "0" => Ok(false),
            other => Err(format!("{other:?} is not a recognised boolean")),
        }),
        Value::Number(number) => Some(match number.as_u64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(format!("{number} is not 0 or 1")),
        }),
        _ => None,
    }
}

/// Integer milliseconds, or a string such as `250ms`, `2s`, `1m` or `1h`.
fn convert_duration(value: &Value) -> Option<Result<Duration, String>> {
    match value {
        Value::Number(number) => Some(
            number
                .as_u64()
                .map(Duration::from_millis)
                .ok_or_else(|| format!("{number} is not a whole number of milliseconds")),
        ),
        Value::String(text) => Some(parse_duration(text)),
        _ => None,
    }
}

/// Parse `<digits><unit>` where unit is `ms`, `s`, `m`, `h` or absent (ms).
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("{text:?} does not start with a number"))?;
    let millis_per_unit: u64 = match unit.trim() {
        "" | "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => return Err(format!("unknown duration unit {other:?}")),
    };
    amount
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("{text:?} overflows"))
}
