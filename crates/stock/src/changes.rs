//! Change tracking for document and row fields.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;

use stockline_core::{DocumentId, RowId};
use stockline_events::FieldChanged;

/// Ordered list of field changes produced by one engine operation.
///
/// An empty change set means the operation settled without touching the
/// document (e.g. a repeated recomputation, or a lookup that failed).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    changes: Vec<FieldChanged>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldChanged> {
        self.changes.iter()
    }

    /// Whether `field` of `row_id` changed (`None` for header fields).
    pub fn touched(&self, row_id: Option<RowId>, field: &str) -> bool {
        self.changes
            .iter()
            .any(|c| c.row_id == row_id && c.field == field)
    }

    /// Latest value written to `field` of `row_id`, if any.
    pub fn latest(&self, row_id: Option<RowId>, field: &str) -> Option<&JsonValue> {
        self.changes
            .iter()
            .rev()
            .find(|c| c.row_id == row_id && c.field == field)
            .map(|c| &c.current)
    }

    /// Field names touched, in order of first change.
    pub fn fields(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for change in &self.changes {
            if !seen.contains(&change.field.as_str()) {
                seen.push(change.field.as_str());
            }
        }
        seen
    }

    fn push(&mut self, change: FieldChanged) {
        self.changes.push(change);
    }
}

impl IntoIterator for ChangeSet {
    type Item = FieldChanged;
    type IntoIter = std::vec::IntoIter<FieldChanged>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

/// Writes fields and records every write that changes a value.
#[derive(Debug)]
pub struct Recorder<'a> {
    document_id: DocumentId,
    row_id: Option<RowId>,
    changes: &'a mut ChangeSet,
}

impl<'a> Recorder<'a> {
    pub fn row(document_id: DocumentId, row_id: RowId, changes: &'a mut ChangeSet) -> Self {
        Self {
            document_id,
            row_id: Some(row_id),
            changes,
        }
    }

    pub fn header(document_id: DocumentId, changes: &'a mut ChangeSet) -> Self {
        Self {
            document_id,
            row_id: None,
            changes,
        }
    }

    /// Assign `value` to `slot`; returns whether the value changed.
    pub fn set<T>(&mut self, slot: &mut T, value: T, field: &'static str) -> bool
    where
        T: PartialEq + Serialize,
    {
        if *slot == value {
            return false;
        }
        let previous = to_json(slot);
        let current = to_json(&value);
        *slot = value;
        self.changes.push(FieldChanged {
            document_id: self.document_id,
            row_id: self.row_id,
            field: field.to_string(),
            previous,
            current,
            occurred_at: Utc::now(),
        });
        true
    }
}

fn to_json<T: Serialize>(value: &T) -> JsonValue {
    serde_json::to_value(value).unwrap_or(JsonValue::Null)
}
