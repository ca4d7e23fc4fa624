//! Capabilities shared by stock documents.
//!
//! Each document kind is one concrete type implementing the capabilities it
//! has; engines are written against these traits rather than a controller
//! hierarchy.

use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;

use stockline_core::{DocumentId, Entity, RowId};

/// A row of a document's item table.
pub trait LineItem: Entity<Id = RowId> {
    fn item_code(&self) -> Option<&str>;

    fn has_item(&self) -> bool {
        self.item_code().is_some()
    }
}

/// A document that exclusively owns an ordered list of line items.
pub trait HasLineItems {
    type Row: LineItem;

    fn document_id(&self) -> DocumentId;

    fn rows(&self) -> &[Self::Row];

    fn rows_mut(&mut self) -> &mut Vec<Self::Row>;

    fn row(&self, id: RowId) -> Option<&Self::Row> {
        self.rows().iter().find(|r| *r.id() == id)
    }

    fn row_mut(&mut self, id: RowId) -> Option<&mut Self::Row> {
        self.rows_mut().iter_mut().find(|r| *r.id() == id)
    }

    /// Append a row and return its identifier.
    fn add_row(&mut self, row: Self::Row) -> RowId {
        let id = *row.id();
        self.rows_mut().push(row);
        id
    }

    fn remove_row(&mut self, id: RowId) -> Option<Self::Row> {
        let rows = self.rows_mut();
        let idx = rows.iter().position(|r| *r.id() == id)?;
        Some(rows.remove(idx))
    }

    fn row_ids(&self) -> Vec<RowId> {
        self.rows().iter().map(|r| *r.id()).collect()
    }
}

/// A line item that moves stock out of and/or into a location.
pub trait HasRowLocations: LineItem {
    fn source_location(&self) -> Option<&str>;

    fn target_location(&self) -> Option<&str>;

    /// Location used for lookups: the source when drawing stock, else the target.
    fn location(&self) -> Option<&str> {
        self.source_location().or_else(|| self.target_location())
    }

    /// Negative when the row draws from a source location, positive otherwise.
    fn signed_qty(&self, qty: Decimal) -> Decimal {
        if self.source_location().is_some() {
            -qty
        } else {
            qty
        }
    }
}

/// Posting date and time a valuation is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostingInstant {
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl stockline_core::ValueObject for PostingInstant {}

/// Header values every valuation lookup needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuationContext {
    pub voucher_type: &'static str,
    pub company: Option<String>,
    pub posting: PostingInstant,
}

/// A document whose rows are valued at its posting instant.
pub trait SupportsValuation: HasLineItems {
    /// Voucher type reported to lookups (e.g. "Stock Entry").
    fn voucher_type(&self) -> &'static str;

    fn company(&self) -> Option<&str>;

    fn posting(&self) -> PostingInstant;

    fn valuation_context(&self) -> ValuationContext {
        ValuationContext {
            voucher_type: self.voucher_type(),
            company: self.company().map(str::to_string),
            posting: self.posting(),
        }
    }
}
