// src/document.rs
use crate::error::{PipestatError, Result};
use crate::value::{Map, Value};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

/// A record flowing through the pipeline
///
/// Keys keep their insertion order. Fields are addressed with dotted paths
/// (`"address.city"`); reading a path through an array field applies the rest
/// of the path to every element and collects the results.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    fields: Map,
}

impl Document {
    pub fn new() -> Self {
        Document { fields: Map::new() }
    }

    /// Document from a JSON object
    pub fn from_json(json: &JsonValue) -> Result<Self> {
        match Value::from(json) {
            Value::Document(fields) => Ok(Document { fields }),
            other => Err(PipestatError::InvalidPipeline(format!(
                "document must be an object, got {}",
                other.kind().name()
            ))),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        self.as_value().to_json()
    }

    pub fn as_map(&self) -> &Map {
        &self.fields
    }

    pub fn into_map(self) -> Map {
        self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Document(self.fields)
    }

    fn as_value(&self) -> Value {
        Value::Document(self.fields.clone())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, String, Value> {
        self.fields.iter()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Top-level field, no path splitting
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Top-level insert, no path splitting
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    /// Top-level removal keeping the order of the remaining keys
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.shift_remove(key)
    }

    /// Resolve a dotted path
    ///
    /// Absent segments and non-document intermediates yield `Value::Missing`.
    /// When an intermediate segment holds an array, the remaining path is
    /// resolved against each element and the non-missing results are
    /// collected into an array.
    pub fn get(&self, path: &str) -> Value {
        // Fast path: no dots means simple field access
        if !path.contains('.') {
            return self.fields.get(path).cloned().unwrap_or(Value::Missing);
        }
        let parts: Vec<&str> = path.split('.').collect();
        resolve_in_map(&self.fields, &parts)
    }

    /// Resolve a dotted path, substituting `default` for Missing
    pub fn get_or(&self, path: &str, default: Value) -> Value {
        match self.get(path) {
            Value::Missing => default,
            found => found,
        }
    }

    /// Set a value at a dotted path
    ///
    /// Intermediate documents are created as needed; a non-document
    /// intermediate is replaced by a document. Setting `Missing` deletes.
    pub fn set(&mut self, path: &str, value: Value) {
        if value.is_missing() {
            self.delete(path);
            return;
        }
        if !path.contains('.') {
            self.fields.insert(path.to_string(), value);
            return;
        }
        let parts: Vec<&str> = path.split('.').collect();
        set_in_map(&mut self.fields, &parts, value);
    }

    /// Remove the leaf at a dotted path; no-op when absent
    pub fn delete(&mut self, path: &str) -> Option<Value> {
        if !path.contains('.') {
            return self.fields.shift_remove(path);
        }
        let parts: Vec<&str> = path.split('.').collect();
        delete_in_map(&mut self.fields, &parts)
    }
}

fn resolve_in_map(map: &Map, parts: &[&str]) -> Value {
    let Some(found) = map.get(parts[0]) else {
        return Value::Missing;
    };
    let rest = &parts[1..];
    if rest.is_empty() {
        return found.clone();
    }
    match found {
        Value::Document(inner) => resolve_in_map(inner, rest),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter_map(|item| match item {
                    Value::Document(inner) => Some(resolve_in_map(inner, rest)),
                    _ => None,
                })
                .filter(|v| !v.is_missing())
                .collect(),
        ),
        _ => Value::Missing,
    }
}

fn set_in_map(map: &mut Map, parts: &[&str], value: Value) {
    if parts.len() == 1 {
        map.insert(parts[0].to_string(), value);
        return;
    }
    let slot = map
        .entry(parts[0].to_string())
        .or_insert_with(|| Value::Document(Map::new()));
    if !matches!(slot, Value::Document(_)) {
        *slot = Value::Document(Map::new());
    }
    if let Value::Document(inner) = slot {
        set_in_map(inner, &parts[1..], value);
    }
}

fn delete_in_map(map: &mut Map, parts: &[&str]) -> Option<Value> {
    if parts.len() == 1 {
        return map.shift_remove(parts[0]);
    }
    match map.get_mut(parts[0])? {
        Value::Document(inner) => delete_in_map(inner, &parts[1..]),
        _ => None,
    }
}

impl From<Map> for Document {
    fn from(fields: Map) -> Self {
        Document { fields }
    }
}

impl TryFrom<JsonValue> for Document {
    type Error = PipestatError;

    fn try_from(json: JsonValue) -> Result<Self> {
        match Value::from(json) {
            Value::Document(fields) => Ok(Document { fields }),
            other => Err(PipestatError::InvalidPipeline(format!(
                "document must be an object, got {}",
                other.kind().name()
            ))),
        }
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Document {
            fields: iter.into_iter().collect(),
        }
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.as_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = JsonValue::deserialize(deserializer)?;
        Document::try_from(json).map_err(serde::de::Error::custom)
    }
}
