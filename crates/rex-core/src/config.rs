//! Branch configuration
//!
//! A [`Config`] is the ordered key/value mapping that identifies one branch.
//! Keys may address nested mappings with `/` separated paths
//! (`"model/lr"` reads `{"model": {"lr": ...}}`).

use crate::error::{ExperimentError, Result};
use indexmap::IndexMap;
use rex_expr::Value;
use serde::{Deserialize, Serialize};

/// Flat string rendering of a config, used for reporting
pub type ConfigAlias = IndexMap<String, String>;

/// Ordered branch configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Config(IndexMap<String, Value>);

impl Config {
    /// Empty config
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object
    ///
    /// # Errors
    ///
    /// Returns [`ExperimentError::Config`] when `json` is not an object.
    pub fn from_json(json: serde_json::Value) -> Result<Self> {
        match Value::from(json) {
            Value::Map(map) => Ok(Self(map)),
            Value::Null => Ok(Self::new()),
            other => Err(ExperimentError::Config(format!(
                "expected a mapping, got {}",
                other.kind()
            ))),
        }
    }

    /// Builder-style insert
    #[inline]
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or replace a top-level key
    #[inline]
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up a key; a key containing `/` falls back to a nested path
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        if let Some(value) = self.0.get(key) {
            return Some(value);
        }
        let mut parts = key.split('/');
        let first = self.0.get(parts.next()?)?;
        parts.try_fold(first, |value, part| value.get(part))
    }

    /// Check if a key is present
    #[inline]
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove a top-level key and return its value
    ///
    /// The rest of the config keeps its order.
    #[inline]
    pub fn pop(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    /// Merge `other` on top of `self`; keys of `other` win
    #[must_use]
    pub fn merge(&self, other: &Config) -> Config {
        let mut merged = self.0.clone();
        for (key, value) in &other.0 {
            merged.insert(key.clone(), value.clone());
        }
        Self(merged)
    }

    /// Flat string view: nested mappings are flattened with `/` keys
    #[must_use]
    pub fn alias(&self) -> ConfigAlias {
        let mut alias = ConfigAlias::new();
        for (key, value) in &self.0 {
            flatten_into(&mut alias, key, value);
        }
        alias
    }

    /// Config as a mapping value
    #[inline]
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Map(self.0.clone())
    }

    /// Iterate over top-level entries in order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of top-level keys
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn flatten_into(alias: &mut ConfigAlias, prefix: &str, value: &Value) {
    match value {
        Value::Map(map) if !map.is_empty() => {
            for (key, inner) in map {
                flatten_into(alias, &format!("{prefix}/{key}"), inner);
            }
        }
        other => {
            alias.insert(prefix.to_string(), other.to_alias_string());
        }
    }
}

impl From<IndexMap<String, Value>> for Config {
    fn from(map: IndexMap<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Config {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn nested_paths_resolve() {
        let config = Config::from_json(serde_json::json!({"model": {"lr": 0.1}, "x": 1})).unwrap();
        assert_eq!(config.get("model/lr"), Some(&Value::from(0.1)));
        assert_eq!(config.get("x"), Some(&Value::from(1)));
        assert_eq!(config.get("model/depth"), None);
    }

    #[test]
    fn pop_keeps_remaining_order() {
        let mut config = Config::new().with("a", 1).with("id", "b0").with("c", 3);
        assert_eq!(config.pop("id"), Some(Value::from("b0")));
        assert_eq!(config.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(), vec!["a", "c"]);
        assert_eq!(config.pop("id"), None);
    }

    #[test]
    fn merge_prefers_right_hand_side() {
        let base = Config::new().with("x", 1).with("y", 2);
        let merged = base.merge(&Config::new().with("y", 3).with("z", 4));
        assert_eq!(merged, Config::new().with("x", 1).with("y", 3).with("z", 4));
    }

    #[test]
    fn alias_flattens_nested_values() {
        let config = Config::from_json(serde_json::json!({"model": {"act": "relu"}, "n": 2})).unwrap();
        let alias = config.alias();
        assert_eq!(alias.get("model/act").map(String::as_str), Some("relu"));
        assert_eq!(alias.get("n").map(String::as_str), Some("2"));
    }

    #[test]
    fn non_object_json_is_rejected() {
        let err = Config::from_json(serde_json::json!([1, 2])).unwrap_err();
        assert!(err.is_configuration_bug());
    }
}
