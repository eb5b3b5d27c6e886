#![forbid(unsafe_code)]

//! Observable in-memory settings.
//!
//! [`SettingsStore`] maps setting names to JSON values and is itself a
//! notifying entity: every effective change raises the setting's name.
//! Bulk loads run under one suspension, so a listener sees each changed
//! name once per load.
//!
//! TOML documents are flattened: nested tables become dotted names, so
//!
//! ```toml
//! [network]
//! port = "8080"
//! ```
//!
//! stores `network.port`.

use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use chime_core::{ChangeNotifier, DisposalErrors, Notifiable, NotifyingEntity};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::SettingsError;
use crate::convert::{ConverterRegistry, convert_value};

/// Name → value settings with change notification and typed reads.
#[derive(Default)]
pub struct SettingsStore {
    entity: NotifyingEntity,
    values: RefCell<BTreeMap<String, Value>>,
    converters: ConverterRegistry,
}

impl SettingsStore {
    /// Empty store with the built-in converters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store using `converters`.
    #[must_use]
    pub fn with_converters(converters: ConverterRegistry) -> Self {
        Self {
            converters,
            ..Self::default()
        }
    }

    /// Store populated from a TOML document.
    ///
    /// # Errors
    ///
    /// [`SettingsError::Parse`] for malformed TOML.
    pub fn from_toml_str(input: &str) -> Result<Self, SettingsError> {
        let store = Self::new();
        store.merge_toml_str(input)?;
        Ok(store)
    }

    /// Store populated from a TOML file.
    ///
    /// # Errors
    ///
    /// [`SettingsError::Io`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let input = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self::from_toml_str(&input)?;
        tracing::debug!(path = %path.display(), settings = store.len(), "settings loaded");
        Ok(store)
    }

    /// Converters consulted by [`get`](Self::get).
    pub fn converters_mut(&mut self) -> &mut ConverterRegistry {
        &mut self.converters
    }

    /// Read `name` as `T`.
    ///
    /// Missing and null settings yield `T::default()`.
    ///
    /// # Errors
    ///
    /// [`SettingsError::Conversion`] if the stored value cannot become a `T`.
    pub fn get<T>(&self, name: &str) -> Result<T, SettingsError>
    where
        T: DeserializeOwned + Default + 'static,
    {
        let values = self.values.borrow();
        match values.get(name) {
            None | Some(Value::Null) => Ok(T::default()),
            Some(value) => convert_value(&self.converters, name, value),
        }
    }

    /// Read `name` as `T`, or `fallback` if it is missing or null.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub fn get_or<T>(&self, name: &str, fallback: T) -> Result<T, SettingsError>
    where
        T: DeserializeOwned + 'static,
    {
        let values = self.values.borrow();
        match values.get(name) {
            None | Some(Value::Null) => Ok(fallback),
            Some(value) => convert_value(&self.converters, name, value),
        }
    }

    /// The stored value, unconverted.
    #[must_use]
    pub fn raw(&self, name: &str) -> Option<Value> {
        self.values.borrow().get(name).cloned()
    }

    /// Store `value` under `name`; notifies `name` when the value changed.
    ///
    /// Returns whether the stored value changed.
    ///
    /// # Errors
    ///
    /// [`SettingsError::EmptyName`] for the empty name, which is reserved
    /// for "every property changed".
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<bool, SettingsError> {
        if name.is_empty() {
            return Err(SettingsError::EmptyName);
        }
        let changed = self.insert(name, value.into());
        if changed {
            self.entity.notifier().notify(name);
        }
        Ok(changed)
    }

    /// Remove `name`, notifying if it was present.
    pub fn remove(&self, name: &str) -> Option<Value> {
        let removed = self.values.borrow_mut().remove(name);
        if removed.is_some() {
            self.entity.notifier().notify(name);
        }
        removed
    }

    /// Merge a TOML document; returns how many settings changed.
    ///
    /// Listeners see each changed name once, after the whole document is
    /// applied.
    ///
    /// # Errors
    ///
    /// [`SettingsError::Parse`] for malformed TOML; nothing is applied.
    pub fn merge_toml_str(&self, input: &str) -> Result<usize, SettingsError> {
        let table: toml::Table = input.parse()?;
        let mut flat = Vec::new();
        flatten("", table, &mut flat);

        let _batch = self.entity.notifier().suspend();
        let mut changed = 0;
        for (name, value) in flat {
            if self.insert(&name, value) {
                self.entity.notifier().notify(&name);
                changed += 1;
            }
        }
        tracing::debug!(changed, "settings merged");
        Ok(changed)
    }

    /// Whether `name` is stored.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.borrow().contains_key(name)
    }

    /// Stored names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = String> + use<> {
        let names: Vec<String> = self.values.borrow().keys().cloned().collect();
        names.into_iter()
    }

    /// Borrow all stored values.
    ///
    /// Do not call [`set`](Self::set) while the borrow is held.
    pub fn values(&self) -> Ref<'_, BTreeMap<String, Value>> {
        self.values.borrow()
    }

    /// Number of stored settings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.borrow().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.borrow().is_empty()
    }

    /// Dispose the underlying entity; later changes are not delivered.
    ///
    /// # Errors
    ///
    /// Failures from resources added to the entity's disposal group.
    pub fn dispose(&self) -> Result<(), DisposalErrors> {
        self.entity.dispose()
    }

    /// The entity state backing this store.
    #[must_use]
    pub fn entity(&self) -> &NotifyingEntity {
        &self.entity
    }

    fn insert(&self, name: &str, value: Value) -> bool {
        let mut values = self.values.borrow_mut();
        if values.get(name) == Some(&value) {
            return false;
        }
        values.insert(name.to_owned(), value);
        true
    }
}

impl Notifiable for SettingsStore {
    fn notifier(&self) -> &ChangeNotifier {
        self.entity.notifier()
    }
}

impl fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsStore")
            .field("values", &*self.values.borrow())
            .field("converters", &self.converters)
            .finish()
    }
}

fn flatten(prefix: &str, table: toml::Table, out: &mut Vec<(String, Value)>) {
    for (key, value) in table {
        let name = if prefix.is_empty() {
            key
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(nested) => flatten(&name, nested, out),
            leaf => out.push((name, toml_to_json(leaf))),
        }
    }
}

fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(text) => Value::String(text),
        toml::Value::Integer(number) => Value::from(number),
        // JSON has no non-finite numbers; keep them as their TOML spelling.
        toml::Value::Float(number) => match serde_json::Number::from_f64(number) {
            Some(finite) => Value::Number(finite),
            None if number.is_nan() => Value::String("nan".to_owned()),
            None if number.is_sign_negative() => Value::String("-inf".to_owned()),
            None => Value::String("inf".to_owned()),
        },
        toml::Value::Boolean(flag) => Value::Bool(flag),
        toml::Value::Datetime(datetime) => Value::String(datetime.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(key, value)| (key, toml_to_json(value)))
                .collect(),
        ),
    }
}
