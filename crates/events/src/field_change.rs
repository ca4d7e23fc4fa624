//! Field-level change events emitted while rows are recomputed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use stockline_core::{DocumentId, RowId};

use crate::event::Event;

/// Event: a single document or row field took a new value.
///
/// `row_id` is `None` for header fields (purpose, totals, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChanged {
    pub document_id: DocumentId,
    pub row_id: Option<RowId>,
    pub field: String,
    pub previous: JsonValue,
    pub current: JsonValue,
    pub occurred_at: DateTime<Utc>,
}

impl FieldChanged {
    pub fn is_header(&self) -> bool {
        self.row_id.is_none()
    }
}

impl Event for FieldChanged {
    fn event_type(&self) -> &'static str {
        if self.is_header() {
            "stock.document.field_changed"
        } else {
            "stock.row.field_changed"
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
