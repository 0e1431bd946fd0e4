//! Property values and the instance structs nodes keep their data in.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A single property value.
///
/// Integers and floats compare numerically with each other. `Object` models a
/// nullable object reference; bound references are reset after a condition
/// has been evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Object { object: Option<u64> },
}

impl Value {
    pub const NULL_OBJECT: Value = Value::Object { object: None };

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Truthiness used by boolean conditions and the `Not` function.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::Object { object } => object.is_some(),
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object { .. })
    }

    /// Numeric-aware comparison. Returns `None` for incomparable kinds.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Object { object: a }, Value::Object { object: b }) => {
                if a == b {
                    Some(Ordering::Equal)
                } else {
                    None
                }
            }
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }

    pub(crate) fn hash_into<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Bool(b) => {
                0u8.hash(state);
                b.hash(state);
            }
            Value::Int(i) => {
                1u8.hash(state);
                i.hash(state);
            }
            Value::Float(f) => {
                2u8.hash(state);
                f.to_bits().hash(state);
            }
            Value::Text(s) => {
                3u8.hash(state);
                s.hash(state);
            }
            Value::Object { object } => {
                4u8.hash(state);
                object.hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Object { object: Some(id) } => write!(f, "object#{}", id),
            Value::Object { object: None } => write!(f, "null"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

// ──────────────────────────────────────────────
// Instance structs
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: Value,
}

/// Named, ordered property bag. Property indices used by bindings are field
/// positions, fixed at compile time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStruct {
    pub fields: Vec<Field>,
}

impl InstanceStruct {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field insertion; replaces an existing field of the same name.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set_named(name, value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.fields.get(index).map(|f| &f.value)
    }

    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    /// Sets the field at `index`. Returns false when out of range.
    pub fn set(&mut self, index: usize, value: Value) -> bool {
        match self.fields.get_mut(index) {
            Some(field) => {
                field.value = value;
                true
            }
            None => false,
        }
    }

    pub fn set_named(&mut self, name: &str, value: Value) {
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(field) => field.value = value,
            None => self.fields.push(Field {
                name: name.to_owned(),
                value,
            }),
        }
    }

    pub fn f64_named(&self, name: &str) -> Option<f64> {
        self.get_named(name).and_then(Value::as_f64)
    }

    pub fn i64_named(&self, name: &str) -> Option<i64> {
        self.get_named(name).and_then(Value::as_i64)
    }

    pub fn bool_named(&self, name: &str) -> bool {
        self.get_named(name).is_some_and(Value::is_truthy)
    }

    /// Sets every field of `other` by name, appending the ones we lack.
    pub fn apply_named(&mut self, other: &InstanceStruct) {
        for field in &other.fields {
            self.set_named(&field.name, field.value.clone());
        }
    }

    /// Overwrites fields present in `overrides` by name, keeping layout.
    pub fn apply_overrides(&mut self, overrides: &InstanceStruct) {
        for field in &mut self.fields {
            if let Some(value) = overrides.get_named(&field.name) {
                field.value = value.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_compare_crosses_int_and_float() {
        assert_eq!(
            Value::Int(2).compare(&Value::Float(2.0)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Value::Float(1.5).compare(&Value::Int(2)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Text("a".into()).compare(&Value::Int(1)), None);
    }

    #[test]
    fn untagged_json_values() {
        let v: Value = serde_json::from_str("3").unwrap();
        assert_eq!(v, Value::Int(3));
        let v: Value = serde_json::from_str("3.5").unwrap();
        assert_eq!(v, Value::Float(3.5));
        let v: Value = serde_json::from_str(r#"{"object": null}"#).unwrap();
        assert_eq!(v, Value::NULL_OBJECT);
    }

    #[test]
    fn overrides_keep_layout() {
        let mut base = InstanceStruct::new().with("a", 1i64).with("b", true);
        base.apply_overrides(&InstanceStruct::new().with("b", false).with("c", 3i64));
        assert_eq!(base.len(), 2);
        assert_eq!(base.get(1), Some(&Value::Bool(false)));
        assert_eq!(base.index_of("c"), None);
    }
}
