//! Canonical records exchanged between fetcher, reconciler, and writer.

use crate::value::{Fields, Value};

/// A canonical record of one entity type.
///
/// `external_id` is the source system's identifier and the join key for
/// reconciliation. `internal_id` is the identifier the target assigned once
/// the record was created there; it is `None` for records that only exist
/// on the desired side.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub external_id: String,
    pub internal_id: Option<String>,
    pub fields: Fields,
}

impl Record {
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            internal_id: None,
            fields: Fields::new(),
        }
    }

    /// A record read back from a target, where only the internal id is known up front.
    pub fn from_target(internal_id: impl Into<String>, fields: Fields) -> Self {
        Self {
            external_id: String::new(),
            internal_id: Some(internal_id.into()),
            fields,
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Field value, with absent fields read as [`Value::Null`].
    pub fn value(&self, field: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.fields.get(field).unwrap_or(&NULL)
    }

    /// Fields to send in a create/update payload.
    ///
    /// With `scrub` set, nullish fields are dropped so the target keeps its
    /// own defaults instead of being overwritten with blanks.
    pub fn payload(&self, scrub: bool) -> Fields {
        self.fields
            .iter()
            .filter(|(_, v)| !scrub || !v.is_nullish())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Normalize an identifier for cross-system matching.
///
/// The two systems format numeric ids differently (`42`, `"42"`, `"42.0"`,
/// `" 42 "`); all of those normalize to `"42"`. Non-numeric ids are only trimmed.
pub fn normalize_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return i.to_string();
    }
    match trimmed.parse::<f64>() {
        Ok(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => (f as i64).to_string(),
        _ => trimmed.to_string(),
    }
}

/// Normalized identifier held in a field, if any.
pub fn id_of(value: &Value) -> Option<String> {
    if value.is_nullish() {
        return None;
    }
    Some(normalize_id(&value.canonical()))
}
