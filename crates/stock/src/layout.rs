//! Purpose-driven field visibility for the stock entry form.

use serde::Serialize;

use crate::entry::{StockEntry, StockEntryPurpose, StockEntryRow};
use crate::value::present;

/// Which header fields are editable and which row columns are shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StockEntryLayout {
    pub from_warehouse_editable: bool,
    pub to_warehouse_editable: bool,
    pub retain_sample_column: bool,
    pub sample_quantity_column: bool,
    pub additional_cost_column: bool,
    /// The header BOM can be changed only while no work order drives the entry.
    pub bom_editable: bool,
    pub alternate_item_action: bool,
}

impl StockEntryLayout {
    pub fn for_entry(doc: &StockEntry) -> Self {
        let receipt = doc.purpose == StockEntryPurpose::MaterialReceipt;
        let issue = doc.purpose == StockEntryPurpose::MaterialIssue;
        Self {
            from_warehouse_editable: !receipt,
            to_warehouse_editable: !issue,
            retain_sample_column: receipt,
            sample_quantity_column: receipt,
            additional_cost_column: !issue,
            bom_editable: present(&doc.work_order).is_none(),
            alternate_item_action: doc.has_alternative_items(),
        }
    }
}

/// Grid colour of a stock entry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RowIndicator {
    /// Nothing leaves a warehouse.
    Blue,
    /// Enough stock on hand.
    Green,
    /// Short of stock.
    Orange,
}

pub fn row_indicator(row: &StockEntryRow) -> RowIndicator {
    if present(&row.s_warehouse).is_none() {
        RowIndicator::Blue
    } else if row.qty <= row.actual_qty {
        RowIndicator::Green
    } else {
        RowIndicator::Orange
    }
}
