//! Stock reconciliation document: counted stock compared against the books.

use chrono::{NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockline_core::{DocumentId, Entity, RowId};

use crate::capabilities::{HasLineItems, LineItem, PostingInstant, SupportsValuation};
use crate::entry::split_serials;
use crate::value::present;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconciliationPurpose {
    #[serde(rename = "Stock Reconciliation")]
    StockReconciliation,
    #[serde(rename = "Opening Stock")]
    OpeningStock,
}

impl ReconciliationPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationPurpose::StockReconciliation => "Stock Reconciliation",
            ReconciliationPurpose::OpeningStock => "Opening Stock",
        }
    }
}

impl core::fmt::Display for ReconciliationPurpose {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconciliation line item.
///
/// `current_*` fields hold the booked snapshot at the posting instant; `qty`
/// and `valuation_rate` hold the counted values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRow {
    pub id: RowId,
    pub item_code: Option<String>,
    pub item_name: Option<String>,
    pub warehouse: Option<String>,
    pub batch_no: Option<String>,
    pub serial_no: Option<String>,
    pub qty: Decimal,
    pub valuation_rate: Decimal,
    pub amount: Decimal,
    pub current_qty: Decimal,
    pub current_valuation_rate: Decimal,
    pub current_amount: Decimal,
    pub current_serial_no: Option<String>,
    /// User-entered shrinkage: `qty = current_qty - quantity_difference`.
    pub quantity_difference: Decimal,
    pub amount_difference: Decimal,
}

impl ReconciliationRow {
    pub fn new() -> Self {
        Self {
            id: RowId::new(),
            item_code: None,
            item_name: None,
            warehouse: None,
            batch_no: None,
            serial_no: None,
            qty: Decimal::ZERO,
            valuation_rate: Decimal::ZERO,
            amount: Decimal::ZERO,
            current_qty: Decimal::ZERO,
            current_valuation_rate: Decimal::ZERO,
            current_amount: Decimal::ZERO,
            current_serial_no: None,
            quantity_difference: Decimal::ZERO,
            amount_difference: Decimal::ZERO,
        }
    }

    pub fn with_item(mut self, item_code: impl Into<String>) -> Self {
        self.item_code = Some(item_code.into());
        self
    }

    pub fn with_warehouse(mut self, warehouse: impl Into<String>) -> Self {
        self.warehouse = Some(warehouse.into());
        self
    }

    pub fn warehouse(&self) -> Option<&str> {
        present(&self.warehouse)
    }

    pub fn serial_numbers(&self) -> Vec<&str> {
        split_serials(self.serial_no.as_deref())
    }
}

impl Default for ReconciliationRow {
    fn default() -> Self {
        Self::new()
    }
}

impl Entity for ReconciliationRow {
    type Id = RowId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl LineItem for ReconciliationRow {
    fn item_code(&self) -> Option<&str> {
        present(&self.item_code)
    }
}

/// Stock reconciliation document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockReconciliation {
    pub id: DocumentId,
    pub company: Option<String>,
    pub purpose: ReconciliationPurpose,
    pub posting_date: NaiveDate,
    pub posting_time: NaiveTime,
    /// Default warehouse for new rows.
    pub set_warehouse: Option<String>,
    /// Counting by scanner: booked quantities are not copied into `qty`.
    pub scan_mode: bool,
    pub expense_account: Option<String>,
    pub cost_center: Option<String>,
    /// Sum of row `amount_difference`.
    pub difference_amount: Decimal,
    pub items: Vec<ReconciliationRow>,
}

impl StockReconciliation {
    pub fn new(company: impl Into<String>, purpose: ReconciliationPurpose) -> Self {
        let now = Utc::now().naive_utc();
        Self {
            id: DocumentId::new(),
            company: Some(company.into()),
            purpose,
            posting_date: now.date(),
            posting_time: now.time(),
            set_warehouse: None,
            scan_mode: false,
            expense_account: None,
            cost_center: None,
            difference_amount: Decimal::ZERO,
            items: Vec::new(),
        }
    }

    pub fn with_posting(mut self, date: NaiveDate, time: NaiveTime) -> Self {
        self.posting_date = date;
        self.posting_time = time;
        self
    }
}

impl HasLineItems for StockReconciliation {
    type Row = ReconciliationRow;

    fn document_id(&self) -> DocumentId {
        self.id
    }

    fn rows(&self) -> &[Self::Row] {
        &self.items
    }

    fn rows_mut(&mut self) -> &mut Vec<Self::Row> {
        &mut self.items
    }
}

impl SupportsValuation for StockReconciliation {
    fn voucher_type(&self) -> &'static str {
        "Stock Reconciliation"
    }

    fn company(&self) -> Option<&str> {
        present(&self.company)
    }

    fn posting(&self) -> PostingInstant {
        PostingInstant {
            date: self.posting_date,
            time: self.posting_time,
        }
    }
}
