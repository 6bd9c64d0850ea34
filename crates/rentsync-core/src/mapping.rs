//! Label → target field identifier mapping.
//!
//! The CRM exposes custom fields under generated identifiers
//! (`UF_CRM_1571234567`); configuration refers to them by their human
//! labels. The mapping is built once per run from the target's field
//! metadata and is read-only afterwards.

use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("field label '{0}' does not resolve to a target field")]
    Unknown(String),
    #[error("{} field label(s) missing from the target schema: {}", .0.len(), .0.join(", "))]
    MissingLabels(Vec<String>),
}

/// Case-insensitive label → field identifier lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMapping {
    by_label: BTreeMap<String, String>,
}

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, label: &str, field_id: impl Into<String>) {
        self.by_label
            .insert(label.trim().to_lowercase(), field_id.into());
    }

    /// Resolve a label to its field identifier.
    pub fn field(&self, label: &str) -> Result<&str, MappingError> {
        self.by_label
            .get(&label.trim().to_lowercase())
            .map(String::as_str)
            .ok_or_else(|| MappingError::Unknown(label.to_string()))
    }

    /// Check that every label a normalizer needs resolves.
    ///
    /// Reports all missing labels at once rather than the first one.
    pub fn validate<'a>(
        &self,
        required: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), MappingError> {
        let missing: Vec<String> = required
            .into_iter()
            .filter(|label| self.field(label).is_err())
            .map(str::to_string)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(MappingError::MissingLabels(missing))
        }
    }

    pub fn len(&self) -> usize {
        self.by_label.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_label.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.by_label.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<L: AsRef<str>, F: Into<String>> FromIterator<(L, F)> for FieldMapping {
    fn from_iter<I: IntoIterator<Item = (L, F)>>(iter: I) -> Self {
        let mut mapping = FieldMapping::new();
        for (label, field) in iter {
            mapping.insert(label.as_ref(), field);
        }
        mapping
    }
}
