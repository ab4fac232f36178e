//! Dynamic values exchanged between units
//!
//! [`Value`] covers the JSON-like data that configs, unit outputs and saved
//! results carry. Anything that is not data (a model handle, a batch object)
//! travels as [`Value::Opaque`], a shared type-erased pointer.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Dynamic value produced by units and read by expressions
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    /// Absence of a value
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// UTF-8 string
    Str(String),
    /// Ordered sequence
    List(Vec<Value>),
    /// Key-unique mapping, insertion ordered
    Map(IndexMap<String, Value>),
    /// Shared non-data payload
    Opaque(Opaque),
}

impl Value {
    /// Wrap an arbitrary payload as an opaque value
    #[inline]
    #[must_use]
    pub fn opaque<T: Any + Send + Sync>(payload: T) -> Self {
        Self::Opaque(Opaque::new(payload))
    }

    /// Check for `Null`
    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Integer view
    #[inline]
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view, widening integers
    #[inline]
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean view
    #[inline]
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// String view
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Sequence view
    #[inline]
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    /// Mapping view
    #[inline]
    #[must_use]
    pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Self::Map(v) => Some(v),
            _ => None,
        }
    }

    /// Opaque payload view
    #[inline]
    #[must_use]
    pub fn as_opaque(&self) -> Option<&Opaque> {
        match self {
            Self::Opaque(v) => Some(v),
            _ => None,
        }
    }

    /// Look up a key of a mapping value
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Short name of the variant, used in diagnostics
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Opaque(_) => "opaque",
        }
    }

    /// Render the value for a flat config alias
    ///
    /// Strings are rendered bare, everything else as compact JSON.
    #[must_use]
    pub fn to_alias_string(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            other => other.to_json().to_string(),
        }
    }

    /// Convert into a `serde_json` value
    ///
    /// Opaque payloads are rendered as a `"<opaque type>"` marker string.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(v) => serde_json::Value::Bool(*v),
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Str(v) => serde_json::Value::String(v.clone()),
            Self::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Self::Opaque(o) => serde_json::Value::String(format!("<opaque {}>", o.type_name())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(v) => Self::Bool(v),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float))
                .unwrap_or(Self::Null),
            serde_json::Value::String(s) => Self::Str(s),
            serde_json::Value::Array(items) => Self::List(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(map: IndexMap<String, Value>) -> Self {
        Self::Map(map)
    }
}

impl From<Opaque> for Value {
    fn from(v: Opaque) -> Self {
        Self::Opaque(v)
    }
}

/// Type-erased shared payload
///
/// Cloning shares the payload. Equality is pointer identity.
#[derive(Clone)]
pub struct Opaque {
    type_name: &'static str,
    inner: Arc<dyn Any + Send + Sync>,
}

impl Opaque {
    /// Wrap a payload
    #[must_use]
    pub fn new<T: Any + Send + Sync>(payload: T) -> Self {
        Self::from_arc(Arc::new(payload))
    }

    /// Wrap an already shared payload
    #[must_use]
    pub fn from_arc<T: Any + Send + Sync>(payload: Arc<T>) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            inner: payload,
        }
    }

    /// Name of the wrapped type
    #[inline]
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Borrow the payload as `T`
    #[inline]
    #[must_use]
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Share the payload as `Arc<T>`
    #[must_use]
    pub fn downcast_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.inner).downcast::<T>().ok()
    }
}

impl PartialEq for Opaque {
    fn eq(&self, other: &Self) -> bool {
        Arc::as_ptr(&self.inner).cast::<()>() == Arc::as_ptr(&other.inner).cast::<()>()
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Opaque").field(&self.type_name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn value_from_json_keeps_structure() {
        let json = serde_json::json!({"x": 10, "lr": 0.5, "tags": ["a", "b"], "on": true});
        let value = Value::from(json);

        assert_eq!(value.get("x"), Some(&Value::Int(10)));
        assert_eq!(value.get("lr"), Some(&Value::Float(0.5)));
        assert_eq!(
            value.get("tags"),
            Some(&Value::List(vec![Value::from("a"), Value::from("b")]))
        );
        assert_eq!(value.get("on").and_then(Value::as_bool), Some(true));
    }

    #[test]
    fn map_keys_keep_insertion_order() {
        let json = serde_json::json!({"b": 1, "a": 2});
        let value = Value::from(json);
        let keys: Vec<&str> = value.as_map().unwrap().keys().map(String::as_str).collect();
        // serde_json without preserve_order sorts keys; the map must at least be stable
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"a") && keys.contains(&"b"));
    }

    #[test]
    fn alias_string_renders_strings_bare() {
        assert_eq!(Value::from("relu").to_alias_string(), "relu");
        assert_eq!(Value::from(3).to_alias_string(), "3");
        assert_eq!(Value::from(vec![1, 2]).to_alias_string(), "[1,2]");
    }

    #[test]
    fn as_f64_widens_integers() {
        assert_eq!(Value::from(4).as_f64(), Some(4.0));
        assert_eq!(Value::from(2.5).as_f64(), Some(2.5));
        assert_eq!(Value::from("x").as_f64(), None);
    }

    #[test]
    fn opaque_equality_is_identity() {
        let shared = Opaque::new(vec![1u8, 2, 3]);
        let same = shared.clone();
        let other = Opaque::new(vec![1u8, 2, 3]);

        assert_eq!(shared, same);
        assert_ne!(shared, other);
        assert_eq!(shared.downcast_ref::<Vec<u8>>(), Some(&vec![1u8, 2, 3]));
        assert!(shared.downcast_ref::<String>().is_none());
    }

    #[test]
    fn opaque_downcast_arc_shares_payload() {
        let payload = Arc::new(String::from("model"));
        let opaque = Opaque::from_arc(Arc::clone(&payload));
        let back = opaque.downcast_arc::<String>().unwrap();
        assert!(Arc::ptr_eq(&payload, &back));
    }

    #[test]
    fn serialize_round_trips_through_json() {
        let value = Value::from(vec![Value::from(1), Value::from("two"), Value::Null]);
        let text = serde_json::to_string(&value).unwrap();
        assert_eq!(text, r#"[1,"two",null]"#);
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, value);
    }
}
