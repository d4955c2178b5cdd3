//! Structured data values carried across the worker boundary.
//!
//! [`Value`] is the universe of data that may travel between the controller
//! and a worker thread: primitives, byte buffers, timestamps, and nested
//! lists/maps. Compound nodes are reference-counted, so an ordinary
//! `clone()` is a cheap handle copy and moving a `Value` to another thread
//! carries no serialization cost.
//!
//! ## Detachment and sharing
//!
//! [`Value::deep_clone`] produces a physically independent copy of the whole
//! graph. A memo table keyed by node address preserves intra-graph sharing:
//! when two fields of the original refer to the same node, the corresponding
//! fields of the copy refer to the same (new) node. Compound nodes are
//! immutable once built, so reference cycles cannot occur.
//!
//! ## JSON mapping
//!
//! `Value` serializes to the obvious JSON shape via the manual
//! `Serialize`/`Deserialize` impls below. Two variants are lossy on the JSON
//! side: `Bytes` becomes a byte sequence and `Timestamp` becomes fractional
//! seconds since the Unix epoch, and neither round-trips back into its
//! original variant. The in-process transport never serializes, so this
//! affects diagnostics output only.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A structured, thread-portable data value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// A byte buffer. Shared by handle; copied by [`Value::deep_clone`].
    Bytes(Arc<Vec<u8>>),
    Timestamp(SystemTime),
    List(Arc<Vec<Value>>),
    Map(Arc<BTreeMap<String, Value>>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

// ── Construction ──────────────────────────────────────────────────────────────

impl Value {
    /// A string value.
    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    /// A byte-buffer value.
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(Arc::new(bytes.into()))
    }

    /// A list value.
    pub fn list(items: impl IntoIterator<Item = Value>) -> Value {
        Value::List(Arc::new(items.into_iter().collect()))
    }

    /// A map value from `(key, value)` pairs.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Value {
        Value::Map(Arc::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    /// Looks up `key` when this value is a map.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.get(key),
            _ => None,
        }
    }

    /// Returns the string slice when this value is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer when this value is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}

impl From<SystemTime> for Value {
    fn from(v: SystemTime) -> Value {
        Value::Timestamp(v)
    }
}

// ── Deep clone ────────────────────────────────────────────────────────────────

impl Value {
    /// Copies the entire value graph into fresh storage.
    ///
    /// Structural equality with the original is preserved, every compound
    /// node is a new allocation, and intra-graph sharing survives: if two
    /// fields of the original referred to one node, the copy's two fields
    /// refer to one (new) node. Verified with [`Value::ptr_eq`].
    pub fn deep_clone(&self) -> Value {
        let mut memo: HashMap<usize, Value> = HashMap::new();
        self.deep_clone_inner(&mut memo)
    }

    fn deep_clone_inner(&self, memo: &mut HashMap<usize, Value>) -> Value {
        match self {
            Value::Bytes(node) => {
                let key = Arc::as_ptr(node) as usize;
                if let Some(hit) = memo.get(&key) {
                    return hit.clone();
                }
                let copy = Value::Bytes(Arc::new(node.as_ref().clone()));
                memo.insert(key, copy.clone());
                copy
            }
            Value::List(node) => {
                let key = Arc::as_ptr(node) as usize;
                if let Some(hit) = memo.get(&key) {
                    return hit.clone();
                }
                let items: Vec<Value> =
                    node.iter().map(|item| item.deep_clone_inner(memo)).collect();
                let copy = Value::List(Arc::new(items));
                memo.insert(key, copy.clone());
                copy
            }
            Value::Map(node) => {
                let key = Arc::as_ptr(node) as usize;
                if let Some(hit) = memo.get(&key) {
                    return hit.clone();
                }
                let entries: BTreeMap<String, Value> = node
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_clone_inner(memo)))
                    .collect();
                let copy = Value::Map(Arc::new(entries));
                memo.insert(key, copy.clone());
                copy
            }
            leaf => leaf.clone(),
        }
    }

    /// Returns `true` when `a` and `b` are the same compound node (the same
    /// allocation, not merely equal contents). Always `false` for leaves.
    pub fn ptr_eq(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Bytes(x), Value::Bytes(y)) => Arc::ptr_eq(x, y),
            (Value::List(x), Value::List(y)) => Arc::ptr_eq(x, y),
            (Value::Map(x), Value::Map(y)) => Arc::ptr_eq(x, y),
            _ => false,
        }
    }
}

// ── JSON conversion ───────────────────────────────────────────────────────────

impl Value {
    /// Converts a `serde_json::Value` into a [`Value`].
    ///
    /// JSON integers that fit `i64` become `Int`; all other numbers become
    /// `Float`.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::list(items.into_iter().map(Value::from_json))
            }
            serde_json::Value::Object(entries) => Value::map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v))),
            ),
        }
    }

    /// Converts this value into a `serde_json::Value` for diagnostics.
    ///
    /// `Bytes` and `Timestamp` are lowered per the JSON mapping above.
    /// Non-finite floats become `null` (JSON has no representation).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn timestamp_secs(t: &SystemTime) -> f64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(n) => serializer.serialize_i64(*n),
            Value::Float(n) => serializer.serialize_f64(*n),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bytes(b) => serializer.serialize_bytes(b),
            Value::Timestamp(t) => serializer.serialize_f64(timestamp_secs(t)),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items.iter() {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries.iter() {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a structured data value")
    }

    fn visit_unit<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        Value::deserialize(deserializer)
    }

    fn visit_bool<E>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Value, E> {
        Ok(i64::try_from(v)
            .map(Value::Int)
            .unwrap_or(Value::Float(v as f64)))
    }

    fn visit_f64<E>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E>(self, v: &str) -> Result<Value, E> {
        Ok(Value::Str(v.to_string()))
    }

    fn visit_string<E>(self, v: String) -> Result<Value, E> {
        Ok(Value::Str(v))
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Value, E> {
        Ok(Value::bytes(v.to_vec()))
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Value, E> {
        Ok(Value::bytes(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element::<Value>()? {
            items.push(item);
        }
        Ok(Value::List(Arc::new(items)))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut entries = BTreeMap::new();
        while let Some((k, v)) = map.next_entry::<String, Value>()? {
            entries.insert(k, v);
        }
        Ok(Value::Map(Arc::new(entries)))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

// ── Display ───────────────────────────────────────────────────────────────────

/// Renders the value the way it appears in error messages, e.g.
/// `The module exported 3.141592653589793`.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::Str(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Timestamp(_) => f.write_str("<timestamp>"),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_graph() -> (Value, Value) {
        // One node referenced from two fields of the same map.
        let shared = Value::map([("n", Value::Int(1))]);
        let root = Value::map([("x", shared.clone()), ("y", shared.clone())]);
        (root, shared)
    }

    // ── deep_clone ───────────────────────────────────────────────────────────

    #[test]
    fn test_deep_clone_structural_equality() {
        let original = Value::map([
            ("s", Value::str("text")),
            ("n", Value::Int(7)),
            ("f", Value::Float(2.5)),
            ("list", Value::list([Value::Bool(true), Value::Null])),
            ("bytes", Value::bytes(vec![1, 2, 3])),
        ]);
        let copy = original.deep_clone();
        assert_eq!(copy, original);
    }

    #[test]
    fn test_deep_clone_produces_fresh_nodes() {
        let original = Value::map([("inner", Value::list([Value::Int(1)]))]);
        let copy = original.deep_clone();
        assert!(
            !Value::ptr_eq(&original, &copy),
            "top-level node must be a new allocation"
        );
        assert!(!Value::ptr_eq(
            original.get("inner").unwrap(),
            copy.get("inner").unwrap()
        ));
    }

    #[test]
    fn test_deep_clone_preserves_intra_graph_sharing() {
        let (root, _shared) = shared_graph();
        assert!(Value::ptr_eq(
            root.get("x").unwrap(),
            root.get("y").unwrap()
        ));

        let copy = root.deep_clone();
        // Both fields of the copy point at the same new node.
        assert!(
            Value::ptr_eq(copy.get("x").unwrap(), copy.get("y").unwrap()),
            "sharing must survive the deep clone"
        );
        // And that node is not the original shared node.
        assert!(!Value::ptr_eq(
            root.get("x").unwrap(),
            copy.get("x").unwrap()
        ));
    }

    #[test]
    fn test_handle_clone_shares_nodes() {
        let original = Value::map([("k", Value::Int(1))]);
        let handle = original.clone();
        assert!(Value::ptr_eq(&original, &handle));
    }

    // ── JSON conversion ──────────────────────────────────────────────────────

    #[test]
    fn test_from_json_covers_all_shapes() {
        let json = serde_json::json!({
            "null": null,
            "bool": true,
            "int": 42,
            "float": 1.5,
            "str": "hi",
            "list": [1, 2],
        });
        let value = Value::from_json(json);
        assert_eq!(value.get("null"), Some(&Value::Null));
        assert_eq!(value.get("bool"), Some(&Value::Bool(true)));
        assert_eq!(value.get("int"), Some(&Value::Int(42)));
        assert_eq!(value.get("float"), Some(&Value::Float(1.5)));
        assert_eq!(value.get("str"), Some(&Value::str("hi")));
        assert_eq!(
            value.get("list"),
            Some(&Value::list([Value::Int(1), Value::Int(2)]))
        );
    }

    #[test]
    fn test_json_round_trip_for_json_shaped_values() {
        let value = Value::map([
            ("a", Value::Int(1)),
            ("b", Value::list([Value::str("x"), Value::Bool(false)])),
        ]);
        let json = serde_json::to_string(&value).expect("serialize Value");
        let back: Value = serde_json::from_str(&json).expect("deserialize Value");
        assert_eq!(back, value);
    }

    #[test]
    fn test_bytes_serialize_as_sequence() {
        let value = Value::bytes(vec![7, 8]);
        assert_eq!(value.to_json(), serde_json::json!([7, 8]));
    }

    // ── Display ──────────────────────────────────────────────────────────────

    #[test]
    fn test_display_float_full_precision() {
        let value = Value::Float(std::f64::consts::PI);
        assert_eq!(value.to_string(), "3.141592653589793");
    }

    #[test]
    fn test_display_compound() {
        let value = Value::map([("k", Value::list([Value::Int(1), Value::str("s")]))]);
        assert_eq!(value.to_string(), "{k: [1, s]}");
    }
}
