//! Raw option map handed to the Config Resolver.
//!
//! The option parser fills an [`OptionMap`] with string, boolean, or list
//! values keyed by option name. The map is plain data: it carries no
//! defaults and performs no validation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Every key the Config Resolver recognizes.
pub const KNOWN_KEYS: &[&str] = &[
    "image",
    "command",
    "overlay",
    "shell",
    "userns",
    "pid",
    "ipc",
    "net",
    "uts",
    "hostname",
    "readonly",
    "home",
    "workdir",
    "scratchdir",
    "pwd",
    "app",
    "bind",
    "contain",
    "containall",
    "cleanenv",
    "nv",
    "fakeroot",
    "keep-privs",
    "no-privs",
    "add-caps",
    "drop-caps",
    "allow-setuid",
];

/// A single option value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    /// A boolean toggle.
    Bool(bool),
    /// A single string.
    Str(String),
    /// A repeatable option.
    List(Vec<String>),
}

/// Ordered map of raw options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionMap(BTreeMap<String, OptionValue>);

impl OptionMap {
    /// Creates an empty option map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a boolean option.
    #[must_use]
    pub fn with_flag(mut self, key: &str, value: bool) -> Self {
        self.set_flag(key, value);
        self
    }

    /// Sets a string option.
    #[must_use]
    pub fn with_value(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_value(key, value);
        self
    }

    /// Appends to a repeatable option.
    #[must_use]
    pub fn with_item(mut self, key: &str, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    /// Sets a boolean option in place.
    pub fn set_flag(&mut self, key: &str, value: bool) {
        let _ = self.0.insert(key.to_owned(), OptionValue::Bool(value));
    }

    /// Sets a string option in place.
    pub fn set_value(&mut self, key: &str, value: impl Into<String>) {
        let _ = self.0.insert(key.to_owned(), OptionValue::Str(value.into()));
    }

    /// Sets a list option in place, replacing any previous value.
    pub fn set_list(&mut self, key: &str, values: Vec<String>) {
        let _ = self.0.insert(key.to_owned(), OptionValue::List(values));
    }

    /// Appends a value to a repeatable option.
    ///
    /// A previously stored single string becomes the first list item.
    pub fn push(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.remove(key) {
            Some(OptionValue::List(mut items)) => {
                items.push(value);
                let _ = self.0.insert(key.to_owned(), OptionValue::List(items));
            }
            Some(OptionValue::Str(first)) => {
                let _ = self
                    .0
                    .insert(key.to_owned(), OptionValue::List(vec![first, value]));
            }
            Some(OptionValue::Bool(_)) | None => {
                let _ = self.0.insert(key.to_owned(), OptionValue::List(vec![value]));
            }
        }
    }

    /// Returns the raw value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.0.get(key)
    }

    /// Returns `true` if `key` is present, whatever its value.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterates over keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Returns an error for the first key not in [`KNOWN_KEYS`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownOption`] naming the offending key.
    pub fn check_known(&self) -> Result<(), ConfigError> {
        match self.keys().find(|k| !KNOWN_KEYS.contains(k)) {
            Some(key) => Err(ConfigError::UnknownOption { key: key.to_owned() }),
            None => Ok(()),
        }
    }

    /// Reads a boolean option; `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] if the value is not a boolean.
    pub fn flag(&self, key: &'static str) -> Result<Option<bool>, ConfigError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(OptionValue::Bool(b)) => Ok(Some(*b)),
            Some(OptionValue::Str(s)) => match s.as_str() {
                "true" | "yes" | "1" => Ok(Some(true)),
                "false" | "no" | "0" => Ok(Some(false)),
                _ => Err(ConfigError::InvalidOption {
                    key,
                    message: format!("expected a boolean, got \"{s}\""),
                }),
            },
            Some(OptionValue::List(_)) => Err(ConfigError::InvalidOption {
                key,
                message: "expected a boolean, got a list".into(),
            }),
        }
    }

    /// Reads a boolean option, treating absence as `false`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] if the value is not a boolean.
    pub fn enabled(&self, key: &'static str) -> Result<bool, ConfigError> {
        Ok(self.flag(key)?.unwrap_or(false))
    }

    /// Reads a single string option; empty strings count as absent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] for booleans or multi-item lists.
    pub fn value(&self, key: &'static str) -> Result<Option<&str>, ConfigError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(OptionValue::Str(s)) => Ok(Some(s.as_str()).filter(|s| !s.is_empty())),
            Some(OptionValue::List(items)) if items.len() == 1 => {
                Ok(items.first().map(String::as_str).filter(|s| !s.is_empty()))
            }
            Some(OptionValue::List(_)) => Err(ConfigError::InvalidOption {
                key,
                message: "given more than once".into(),
            }),
            Some(OptionValue::Bool(_)) => Err(ConfigError::InvalidOption {
                key,
                message: "expected a value, got a boolean".into(),
            }),
        }
    }

    /// Reads a repeatable option as a list; a single string is one item.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] if the value is a boolean.
    pub fn items(&self, key: &'static str) -> Result<Vec<&str>, ConfigError> {
        match self.0.get(key) {
            None => Ok(Vec::new()),
            Some(OptionValue::Str(s)) => Ok(vec![s.as_str()]),
            Some(OptionValue::List(items)) => Ok(items.iter().map(String::as_str).collect()),
            Some(OptionValue::Bool(_)) => Err(ConfigError::InvalidOption {
                key,
                message: "expected a list, got a boolean".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_promotes_string_to_list() {
        let mut map = OptionMap::new().with_value("bind", "/a");
        map.push("bind", "/b");
        assert_eq!(map.items("bind").unwrap(), vec!["/a", "/b"]);
    }

    #[test]
    fn flag_accepts_string_booleans() {
        let map = OptionMap::new()
            .with_value("contain", "yes")
            .with_value("pid", "0");
        assert_eq!(map.flag("contain").unwrap(), Some(true));
        assert_eq!(map.flag("pid").unwrap(), Some(false));
        assert_eq!(map.flag("ipc").unwrap(), None);
    }

    #[test]
    fn flag_rejects_garbage() {
        let map = OptionMap::new().with_value("contain", "maybe");
        assert!(matches!(
            map.flag("contain"),
            Err(ConfigError::InvalidOption { key: "contain", .. })
        ));
    }

    #[test]
    fn value_rejects_repeated_single_option() {
        let map = OptionMap::new().with_item("home", "/a").with_item("home", "/b");
        assert!(map.value("home").is_err());
    }

    #[test]
    fn unknown_key_is_reported() {
        let map = OptionMap::new().with_flag("writable-tmpfs", true);
        assert!(matches!(
            map.check_known(),
            Err(ConfigError::UnknownOption { key }) if key == "writable-tmpfs"
        ));
    }

    #[test]
    fn json_shape_is_plain_key_values() {
        let map = OptionMap::new()
            .with_flag("contain", true)
            .with_value("image", "/img")
            .with_item("bind", "/data:/mnt:ro");
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(
            json,
            r#"{"bind":["/data:/mnt:ro"],"contain":true,"image":"/img"}"#
        );
        let back: OptionMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
