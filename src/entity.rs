//! Entity contract and the property-keyed row representation.
//!
//! The engine works internally on [`Row`] values; typed entities convert at
//! the repository boundary through the [`Entity`] trait. `from_row` is the
//! per-type materializer: the code-generation or hand-written equivalent of
//! constructor selection in a reflective runtime.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::descriptor::{track, EntityDescriptor};
use crate::error::{Error, Result};
use crate::value::Value;

// ── Row ───────────────────────────────────────────────────────

/// A heterogeneous record keyed by property name.
///
/// Serializes as a flat JSON object (property → value), which is exactly
/// the NDJSON line format used by bulk export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    values: BTreeMap<String, Value>,
}

impl Row {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property value, replacing any existing one.
    pub fn set(&mut self, property: &str, value: impl Into<Value>) {
        self.values.insert(property.to_string(), value.into());
    }

    /// Builder-style [`Self::set`].
    #[must_use]
    pub fn with(mut self, property: &str, value: impl Into<Value>) -> Self {
        self.set(property, value);
        self
    }

    #[must_use]
    pub fn get(&self, property: &str) -> Option<&Value> {
        self.values.get(property)
    }

    pub fn remove(&mut self, property: &str) -> Option<Value> {
        self.values.remove(property)
    }

    #[must_use]
    pub fn contains(&self, property: &str) -> bool {
        self.values.contains_key(property)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    // ── Typed accessors ───────────────────────────────────────

    #[must_use]
    pub fn get_i64(&self, property: &str) -> Option<i64> {
        self.get(property).and_then(Value::as_i64)
    }

    #[must_use]
    pub fn get_bool(&self, property: &str) -> Option<bool> {
        self.get(property).and_then(Value::as_bool)
    }

    #[must_use]
    pub fn get_str(&self, property: &str) -> Option<&str> {
        self.get(property).and_then(Value::as_str)
    }

    #[must_use]
    pub fn get_datetime(&self, property: &str) -> Option<DateTime<Utc>> {
        self.get(property).and_then(Value::as_datetime)
    }

    // ── Tracking fields ───────────────────────────────────────

    #[must_use]
    pub fn version(&self) -> Option<i64> {
        self.get_i64(track::VERSION)
    }

    pub fn set_version(&mut self, version: i64) {
        self.set(track::VERSION, version);
    }

    #[must_use]
    pub fn created_time(&self) -> Option<DateTime<Utc>> {
        self.get_datetime(track::CREATED_TIME)
    }

    #[must_use]
    pub fn last_write_time(&self) -> Option<DateTime<Utc>> {
        self.get_datetime(track::LAST_WRITE_TIME)
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.get_bool(track::IS_DELETED).unwrap_or(false)
    }

    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.get_bool(track::IS_ARCHIVED).unwrap_or(false)
    }

    #[must_use]
    pub fn absolute_expiration(&self) -> Option<DateTime<Utc>> {
        self.get_datetime(track::ABSOLUTE_EXPIRATION)
    }

    /// The caller-facing key value for this row under the given descriptor,
    /// rendered as a string.
    #[must_use]
    pub fn key_string(&self, descriptor: &EntityDescriptor) -> String {
        match self.get(descriptor.key_property()) {
            Some(Value::Text(s)) => s.clone(),
            Some(Value::Integer(i)) => i.to_string(),
            Some(Value::Real(f)) => f.to_string(),
            Some(Value::Blob(_)) => "<blob>".to_string(),
            Some(Value::Null) | None => String::new(),
        }
    }

    /// Deep equality ignoring the named properties (used by list updates to
    /// compare payloads while excluding tracking fields).
    #[must_use]
    pub fn equals_excluding(&self, other: &Self, excluded: &[&str]) -> bool {
        let filtered = |row: &Self| -> BTreeMap<String, Value> {
            row.values
                .iter()
                .filter(|(k, _)| !excluded.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        filtered(self) == filtered(other)
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

// ── Keys ──────────────────────────────────────────────────────

/// Key types usable as a repository key.
pub trait KeyValue: Clone + fmt::Display {
    /// The key as a bindable SQL value.
    fn to_value(&self) -> Value;
}

impl KeyValue for String {
    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }
}

impl KeyValue for i64 {
    fn to_value(&self) -> Value {
        Value::Integer(*self)
    }
}

impl KeyValue for uuid::Uuid {
    fn to_value(&self) -> Value {
        Value::Text(self.to_string())
    }
}

// ── Entity ────────────────────────────────────────────────────

/// A persistable type with a static descriptor and row conversions.
///
/// Tracking fields (`Version`, `CreatedTime`, `LastWriteTime`, tombstones)
/// are managed by the engine: `to_row` may omit them, and `from_row` should
/// read whatever the engine stamped.
pub trait Entity: Sized {
    /// Caller-facing key type.
    type Key: KeyValue;

    /// The immutable descriptor for this type.
    fn descriptor() -> &'static EntityDescriptor;

    /// The key of this instance.
    fn key(&self) -> Self::Key;

    /// Convert to a property-keyed row.
    fn to_row(&self) -> Row;

    /// Materialize from a property-keyed row.
    ///
    /// # Errors
    ///
    /// Returns an error when a required property is missing or cannot be
    /// converted.
    fn from_row(row: &Row) -> Result<Self>;
}

/// Error helper for materializers: a required property was absent.
#[must_use]
pub fn missing_property(entity: &str, property: &str) -> Error {
    Error::InvalidDescriptor {
        entity: entity.to_string(),
        message: format!("row is missing required property {property}"),
    }
}

// ── Caller info ───────────────────────────────────────────────

/// Source location stamp attached to mutations for auditing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerInfo {
    pub file: String,
    pub member: String,
    pub line: u32,
}

impl CallerInfo {
    #[must_use]
    pub fn new(file: &str, member: &str, line: u32) -> Self {
        Self {
            file: file.to_string(),
            member: member.to_string(),
            line,
        }
    }

    /// Capture the caller's source location.
    #[must_use]
    #[track_caller]
    pub fn current(member: &str) -> Self {
        let location = std::panic::Location::caller();
        Self {
            file: location.file().to_string(),
            member: member.to_string(),
            line: location.line(),
        }
    }
}

impl fmt::Display for CallerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.file, self.line, self.member)
    }
}
