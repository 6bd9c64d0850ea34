//! Three-way reconciliation of desired and current record sets.
//!
//! # Algorithm
//!
//! 1. Index the current records by the normalized value of
//!    [`ReconcileOptions::id_field`], the field on the target side that holds
//!    the source system's external id.
//! 2. For each desired record, claim the first unclaimed current record whose
//!    id matches the desired `external_id`.
//!    - Claimed and some compared field differs → `to_update`, stamped with the
//!      current record's `internal_id`.
//!    - Claimed and nothing differs → unchanged.
//!    - Nothing to claim → `to_add`.
//! 3. Every current record left unclaimed is stale → `to_remove`.
//!
//! A claimed record leaves the working set, so a duplicate desired record
//! finds nothing to match and is added again.
//!
//! # Field comparison
//!
//! See [`differ`]. Only top-level fields of the desired record are visited;
//! fields that only exist on the current side are target-owned and ignored.

use std::collections::{BTreeSet, HashMap, VecDeque};

use tracing::{debug, warn};

use crate::record::{id_of, normalize_id, Record};
use crate::value::{Fields, Scalar, Value};

/// Per-entity reconciliation settings.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    /// Field on the current side holding the source's external id.
    pub id_field: String,
    /// When set, only these fields are compared.
    pub mutable_fields: Option<BTreeSet<String>>,
    /// Fields never compared (the target's own id, audit columns).
    pub ignored_fields: BTreeSet<String>,
}

impl ReconcileOptions {
    pub fn new(id_field: impl Into<String>) -> Self {
        Self {
            id_field: id_field.into(),
            ..Default::default()
        }
    }

    pub fn with_mutable_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mutable_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_ignored_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    fn compares(&self, field: &str) -> bool {
        if field == self.id_field || self.ignored_fields.contains(field) {
            return false;
        }
        match &self.mutable_fields {
            Some(allowed) => allowed.contains(field),
            None => true,
        }
    }
}

/// The `{add, update, remove}` triple for one entity type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub to_add: Vec<Record>,
    /// Desired records stamped with the matched target `internal_id`.
    pub to_update: Vec<Record>,
    /// Internal ids of stale target records.
    pub to_remove: Vec<String>,
    /// Matched records with no differing field.
    pub unchanged: usize,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_remove.is_empty()
    }

    /// Number of write operations this change set implies.
    pub fn operations(&self) -> usize {
        self.to_add.len() + self.to_update.len() + self.to_remove.len()
    }
}

/// Compute the change set converging `current` to `desired`.
pub fn reconcile(desired: Vec<Record>, current: Vec<Record>, options: &ReconcileOptions) -> ChangeSet {
    let mut slots: Vec<Option<Record>> = current.into_iter().map(Some).collect();
    let mut index: HashMap<String, VecDeque<usize>> = HashMap::new();
    for (pos, slot) in slots.iter().enumerate() {
        if let Some(id) = slot.as_ref().and_then(|r| id_of(r.value(&options.id_field))) {
            index.entry(id).or_default().push_back(pos);
        }
    }

    let mut changes = ChangeSet::default();
    let mut missing_fields = BTreeSet::new();

    for mut record in desired {
        let key = normalize_id(&record.external_id);
        let claimed = index
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .and_then(|pos| slots[pos].take());

        match claimed {
            Some(existing) => {
                match first_difference(&record.fields, &existing.fields, options, &mut missing_fields) {
                    Some(field) => {
                        debug!(
                            external_id = %record.external_id,
                            field = %field,
                            "record differs from target"
                        );
                        record.internal_id = existing
                            .internal_id
                            .clone()
                            .or_else(|| id_of(existing.value(&options.id_field)));
                        changes.to_update.push(record);
                    }
                    None => changes.unchanged += 1,
                }
            }
            None => changes.to_add.push(record),
        }
    }

    for stale in slots.into_iter().flatten() {
        let internal_id = stale
            .internal_id
            .clone()
            .or_else(|| id_of(stale.value(&options.id_field)));
        match internal_id {
            Some(id) => changes.to_remove.push(id),
            None => warn!(
                id_field = %options.id_field,
                "stale target record carries no identifier; it cannot be removed"
            ),
        }
    }

    for field in &missing_fields {
        warn!(
            field = %field,
            "field does not exist on the target; check the field mapping (skipped in comparison)"
        );
    }

    changes
}

/// Whether any compared field of `desired` differs from `current`.
///
/// Rules, per top-level field (the id field and ignored fields excluded):
///
/// - two nullish values (null, absent, `""`, `"0"`) never differ;
/// - lists differ on length or on any element, compared in order;
/// - sub-records recurse with the same rules;
/// - a timestamp is compared as an instant against a timestamp or a string
///   parsed with its own offset;
/// - a number is compared numerically against numeric text;
/// - anything else compares canonical strings.
///
/// A desired field missing from `current` is a mapping error: it is logged
/// and treated as equal so it cannot block the other fields.
pub fn differ(desired: &Fields, current: &Fields, options: &ReconcileOptions) -> bool {
    let mut missing = BTreeSet::new();
    let result = first_difference(desired, current, options, &mut missing).is_some();
    for field in &missing {
        warn!(field = %field, "field does not exist on the target; skipped in comparison");
    }
    result
}

fn first_difference(
    desired: &Fields,
    current: &Fields,
    options: &ReconcileOptions,
    missing: &mut BTreeSet<String>,
) -> Option<String> {
    for (field, wanted) in desired {
        if !options.compares(field) {
            continue;
        }
        let Some(actual) = current.get(field) else {
            missing.insert(field.clone());
            continue;
        };
        if values_differ(wanted, actual) {
            return Some(field.clone());
        }
    }
    None
}

/// Variant-by-variant comparison of one desired value against one current value.
pub fn values_differ(desired: &Value, current: &Value) -> bool {
    if desired.is_nullish() && current.is_nullish() {
        return false;
    }
    match desired {
        Value::Null => true,
        Value::List(wanted) => list_differs(wanted, current),
        Value::Record(wanted) => record_differs(wanted, current),
        Value::Timestamp(ts) => match current.as_timestamp() {
            Some(actual) => *ts != actual,
            None => true,
        },
        Value::Date(day) => current.as_date() != Some(*day),
        Value::Scalar(scalar) => scalar_differs(scalar, current),
    }
}

fn list_differs(wanted: &[Value], current: &Value) -> bool {
    match current {
        Value::List(actual) => {
            wanted.len() != actual.len()
                || wanted.iter().zip(actual).any(|(w, a)| values_differ(w, a))
        }
        _ => true,
    }
}

fn record_differs(wanted: &Fields, current: &Value) -> bool {
    match current {
        Value::Record(actual) => wanted
            .iter()
            .any(|(k, w)| values_differ(w, actual.get(k).unwrap_or(&Value::Null))),
        _ => true,
    }
}

fn scalar_differs(wanted: &Scalar, current: &Value) -> bool {
    match (wanted, current) {
        (Scalar::Int(_) | Scalar::Float(_), Value::Scalar(Scalar::Text(_)))
        | (Scalar::Text(_), Value::Scalar(Scalar::Int(_) | Scalar::Float(_))) => {
            let desired = Value::Scalar(wanted.clone());
            match (desired.as_f64(), current.as_f64()) {
                (Some(a), Some(b)) => (a - b).abs() > 1e-9,
                _ => desired.canonical() != current.canonical(),
            }
        }
        (Scalar::Text(text), Value::Timestamp(actual)) => match crate::value::parse_timestamp(text) {
            Some(ts) => ts != *actual,
            None => true,
        },
        (Scalar::Text(text), Value::Date(actual)) => crate::value::parse_date(text) != Some(*actual),
        _ => Value::Scalar(wanted.clone()).canonical() != current.canonical(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::parse_timestamp;

    fn desired(id: i64) -> Record {
        Record::new(id.to_string()).with("id", id)
    }

    fn current(internal: &str, id: i64) -> Record {
        Record::from_target(internal, Fields::new()).with("id", id)
    }

    fn fields(pairs: &[(&str, Value)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn identical_sets_produce_no_changes() {
        let d = vec![desired(1).with("name", "A")];
        let c = vec![current("c1", 1).with("name", "A")];
        let changes = reconcile(d, c, &ReconcileOptions::new("id"));
        assert!(changes.is_empty());
        assert_eq!(changes.unchanged, 1);
    }

    #[test]
    fn changed_field_is_updated_with_internal_id() {
        let d = vec![desired(1).with("name", "A")];
        let c = vec![current("c1", 1).with("name", "B")];
        let changes = reconcile(d, c, &ReconcileOptions::new("id"));
        assert_eq!(changes.to_update.len(), 1);
        assert_eq!(changes.to_update[0].internal_id.as_deref(), Some("c1"));
        assert_eq!(changes.to_update[0].value("name"), &Value::text("A"));
        assert!(changes.to_add.is_empty());
        assert!(changes.to_remove.is_empty());
    }

    #[test]
    fn unmatched_records_are_added_and_removed() {
        let d = vec![desired(2).with("name", "C")];
        let c = vec![current("c1", 1).with("name", "B")];
        let changes = reconcile(d, c, &ReconcileOptions::new("id"));
        assert_eq!(changes.to_add.len(), 1);
        assert_eq!(changes.to_add[0].external_id, "2");
        assert_eq!(changes.to_remove, vec!["c1".to_string()]);
    }

    #[test]
    fn ids_match_across_formats() {
        let d = vec![Record::new("42").with("name", "A")];
        let c = vec![Record::from_target("9", Fields::new())
            .with("UF_SOURCE_ID", "42.0")
            .with("name", "A")];
        let changes = reconcile(d, c, &ReconcileOptions::new("UF_SOURCE_ID"));
        assert!(changes.is_empty());
    }

    #[test]
    fn duplicate_desired_record_is_added_after_claim() {
        let d = vec![desired(1).with("name", "A"), desired(1).with("name", "A")];
        let c = vec![current("c1", 1).with("name", "A")];
        let changes = reconcile(d, c, &ReconcileOptions::new("id"));
        assert_eq!(changes.unchanged, 1);
        assert_eq!(changes.to_add.len(), 1);
    }

    #[test]
    fn every_record_is_classified_once() {
        let d = vec![
            desired(1).with("name", "same"),
            desired(2).with("name", "new value"),
            desired(3).with("name", "added"),
        ];
        let c = vec![
            current("c1", 1).with("name", "same"),
            current("c2", 2).with("name", "old value"),
            current("c4", 4).with("name", "stale"),
            current("c5", 5).with("name", "stale too"),
        ];
        let changes = reconcile(d, c, &ReconcileOptions::new("id"));
        assert_eq!(changes.unchanged + changes.to_update.len() + changes.to_add.len(), 3);
        assert_eq!(changes.unchanged + changes.to_update.len() + changes.to_remove.len(), 4);
        assert_eq!(changes.to_remove, vec!["c4".to_string(), "c5".to_string()]);
    }

    #[test]
    fn applying_changes_converges() {
        let d = vec![desired(1).with("name", "A"), desired(2).with("name", "B")];
        let c = vec![current("c1", 1).with("name", "old"), current("c9", 9)];
        let changes = reconcile(d.clone(), c, &ReconcileOptions::new("id"));

        let mut after: Vec<Record> = changes
            .to_update
            .iter()
            .map(|r| Record::from_target(r.internal_id.clone().unwrap(), r.fields.clone()))
            .collect();
        after.extend(
            changes
                .to_add
                .iter()
                .enumerate()
                .map(|(i, r)| Record::from_target(format!("n{i}"), r.fields.clone())),
        );

        let second = reconcile(d, after, &ReconcileOptions::new("id"));
        assert!(second.is_empty());
        assert_eq!(second.unchanged, 2);
    }

    #[test]
    fn nullish_values_are_equivalent() {
        let opts = ReconcileOptions::new("id");
        assert!(!differ(&fields(&[("f", Value::text(""))]), &fields(&[("f", Value::Null)]), &opts));
        assert!(!differ(&fields(&[("f", Value::text("0"))]), &fields(&[("f", Value::Null)]), &opts));
        assert!(differ(&fields(&[("f", Value::text("0"))]), &fields(&[("f", Value::text("1"))]), &opts));
    }

    #[test]
    fn timestamps_compare_as_instants() {
        let opts = ReconcileOptions::new("id");
        let wanted = fields(&[("start", Value::Timestamp(parse_timestamp("2024-03-01T10:00:00+01:00").unwrap()))]);
        let same = fields(&[("start", Value::text("2024-03-01T10:00:00+01:00"))]);
        let same_instant = fields(&[("start", Value::text("2024-03-01T09:00:00+00:00"))]);
        let next_day = fields(&[("start", Value::text("2024-03-02T10:00:00+01:00"))]);
        assert!(!differ(&wanted, &same, &opts));
        assert!(!differ(&wanted, &same_instant, &opts));
        assert!(differ(&wanted, &next_day, &opts));
        assert!(differ(&wanted, &fields(&[("start", Value::text("garbage"))]), &opts));
    }

    #[test]
    fn numbers_compare_against_numeric_text() {
        let opts = ReconcileOptions::new("id");
        assert!(!differ(&fields(&[("amount", Value::float(300.0))]), &fields(&[("amount", Value::text("300.00"))]), &opts));
        assert!(differ(&fields(&[("amount", Value::float(300.5))]), &fields(&[("amount", Value::text("300"))]), &opts));
    }

    #[test]
    fn lists_compare_in_order() {
        let opts = ReconcileOptions::new("id");
        let phone = |n: &str| Value::Record(fields(&[("VALUE", Value::text(n)), ("VALUE_TYPE", Value::text("WORK"))]));
        let wanted = fields(&[("PHONE", Value::List(vec![phone("1"), phone("2")]))]);
        let same = fields(&[("PHONE", Value::List(vec![phone("1"), phone("2")]))]);
        let swapped = fields(&[("PHONE", Value::List(vec![phone("2"), phone("1")]))]);
        let shorter = fields(&[("PHONE", Value::List(vec![phone("1")]))]);
        assert!(!differ(&wanted, &same, &opts));
        assert!(differ(&wanted, &swapped, &opts));
        assert!(differ(&wanted, &shorter, &opts));
    }

    #[test]
    fn sub_record_extra_target_keys_are_ignored() {
        let opts = ReconcileOptions::new("id");
        let wanted = fields(&[("PHONE", Value::List(vec![Value::Record(fields(&[("VALUE", Value::text("1"))]))]))]);
        let current = fields(&[(
            "PHONE",
            Value::List(vec![Value::Record(fields(&[("ID", Value::text("77")), ("VALUE", Value::text("1"))]))]),
        )]);
        assert!(!differ(&wanted, &current, &opts));
    }

    #[test]
    fn field_missing_on_target_is_skipped() {
        let opts = ReconcileOptions::new("id");
        let wanted = fields(&[("UF_CRM_GONE", Value::text("x")), ("TITLE", Value::text("A"))]);
        let current = fields(&[("TITLE", Value::text("A"))]);
        assert!(!differ(&wanted, &current, &opts));
    }

    #[test]
    fn allow_list_limits_compared_fields() {
        let opts = ReconcileOptions::new("id").with_mutable_fields(["STAGE_ID"]);
        let wanted = fields(&[("STAGE_ID", Value::text("NEW")), ("TITLE", Value::text("A"))]);
        let current = fields(&[("STAGE_ID", Value::text("NEW")), ("TITLE", Value::text("B"))]);
        assert!(!differ(&wanted, &current, &opts));

        let d = vec![Record::new("1").with("id", 1).with("STAGE_ID", "NEW").with("TITLE", "A")];
        let c = vec![current_record_with_title("B")];
        let changes = reconcile(d, c, &opts);
        assert!(changes.to_update.is_empty());
    }

    fn current_record_with_title(title: &str) -> Record {
        current("c1", 1).with("STAGE_ID", "NEW").with("TITLE", title)
    }

    #[test]
    fn ignored_fields_are_not_compared() {
        let opts = ReconcileOptions::new("UF_ID").with_ignored_fields(["ID"]);
        let wanted = fields(&[("ID", Value::text("5")), ("TITLE", Value::text("A"))]);
        let current = fields(&[("ID", Value::text("6")), ("TITLE", Value::text("A"))]);
        assert!(!differ(&wanted, &current, &opts));
    }
}
