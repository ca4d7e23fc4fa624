//! Per-row request slots.
//!
//! Every row has one slot per group of dependent fields. Opening a slot hands
//! out a ticket and supersedes any earlier ticket for the same slot; a service
//! response is applied only while its ticket is still current.

use std::collections::HashMap;

use stockline_core::RowId;

/// Group of row fields written by one kind of lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Serial number suggestion.
    Serial,
    /// Rate lookup, location details and manual rate edits.
    Valuation,
    ItemDetails,
    Uom,
    /// Retained sample check of a received batch.
    Sample,
    /// Reconciliation stock-balance snapshot.
    Balance,
}

impl SlotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotKind::Serial => "serial",
            SlotKind::Valuation => "valuation",
            SlotKind::ItemDetails => "item_details",
            SlotKind::Uom => "uom",
            SlotKind::Sample => "sample",
            SlotKind::Balance => "balance",
        }
    }
}

impl core::fmt::Display for SlotKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proof that a request was the latest one issued for its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub row_id: RowId,
    pub kind: SlotKind,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct RequestSlots {
    generations: HashMap<(RowId, SlotKind), u64>,
}

impl RequestSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a new ticket, superseding the previous one.
    pub fn open(&mut self, row_id: RowId, kind: SlotKind) -> Ticket {
        let generation = self.generations.entry((row_id, kind)).or_insert(0);
        *generation += 1;
        Ticket {
            row_id,
            kind,
            generation: *generation,
        }
    }

    pub fn is_current(&self, ticket: &Ticket) -> bool {
        self.generations
            .get(&(ticket.row_id, ticket.kind))
            .is_some_and(|g| *g == ticket.generation)
    }

    /// Number of open slots across all rows.
    pub fn tracked(&self) -> usize {
        self.generations.len()
    }

    /// Drop every slot of a removed row.
    pub fn forget_row(&mut self, row_id: RowId) {
        self.generations.retain(|(id, _), _| *id != row_id);
    }
}
