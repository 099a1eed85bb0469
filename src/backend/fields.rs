use std::collections::BTreeMap;

use crate::model::{FieldValues, LogEntry};

/// Upper bound on entries drained when collecting distinct values. Keeps
/// the generic fallback from slurping an unbounded backend.
pub const FIELD_SCAN_CAP: usize = 1000;

/// Accumulate distinct values per requested field from a batch of entries.
/// The synthetic `level` and `message` fields participate alongside
/// extracted fields.
pub fn accumulate(values: &mut FieldValues, entries: &[LogEntry], fields: &[String]) {
    for entry in entries {
        for field in fields {
            if let Some(value) = entry.field_value(field) {
                values.entry(field.clone()).or_default().insert(value);
            }
        }
    }
}

/// Finalize into sorted lists for deterministic output. Requested fields
/// with no observed values still appear, empty.
pub fn into_sorted(mut values: FieldValues, fields: &[String]) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    for field in fields {
        let set = values.remove(field).unwrap_or_default();
        out.insert(field.clone(), set.into_iter().collect());
    }
    out
}
