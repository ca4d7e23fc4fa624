//! Stock entry document: stock moved between locations, optionally through
//! a manufacturing step.

use chrono::{NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use stockline_core::{DocumentId, Entity, RowId};

use crate::capabilities::{HasLineItems, HasRowLocations, LineItem, PostingInstant, SupportsValuation};
use crate::changes::Recorder;
use crate::config::EngineConfig;
use crate::value::{as_decimal, as_flag, as_text, is_truthy, present};

/// What a stock entry is used for. Drives which fields are editable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StockEntryPurpose {
    #[serde(rename = "Material Issue")]
    MaterialIssue,
    #[serde(rename = "Material Receipt")]
    MaterialReceipt,
    #[serde(rename = "Material Transfer")]
    MaterialTransfer,
    #[serde(rename = "Material Transfer for Manufacture")]
    MaterialTransferForManufacture,
    #[serde(rename = "Material Consumption for Manufacture")]
    MaterialConsumptionForManufacture,
    #[serde(rename = "Manufacture")]
    Manufacture,
    #[serde(rename = "Repack")]
    Repack,
    #[serde(rename = "Send to Subcontractor")]
    SendToSubcontractor,
}

impl StockEntryPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockEntryPurpose::MaterialIssue => "Material Issue",
            StockEntryPurpose::MaterialReceipt => "Material Receipt",
            StockEntryPurpose::MaterialTransfer => "Material Transfer",
            StockEntryPurpose::MaterialTransferForManufacture => "Material Transfer for Manufacture",
            StockEntryPurpose::MaterialConsumptionForManufacture => {
                "Material Consumption for Manufacture"
            }
            StockEntryPurpose::Manufacture => "Manufacture",
            StockEntryPurpose::Repack => "Repack",
            StockEntryPurpose::SendToSubcontractor => "Send to Subcontractor",
        }
    }

    /// Purposes whose batch picker is restricted to batches valid at the posting date.
    pub fn filters_batches_by_posting_date(&self) -> bool {
        matches!(
            self,
            StockEntryPurpose::MaterialTransferForManufacture
                | StockEntryPurpose::Manufacture
                | StockEntryPurpose::Repack
                | StockEntryPurpose::SendToSubcontractor
        )
    }
}

impl core::fmt::Display for StockEntryPurpose {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stock entry line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockEntryRow {
    pub id: RowId,
    pub item_code: Option<String>,
    pub item_name: Option<String>,
    pub item_group: Option<String>,
    pub description: Option<String>,
    /// Source warehouse.
    pub s_warehouse: Option<String>,
    /// Target warehouse.
    pub t_warehouse: Option<String>,
    pub qty: Decimal,
    pub uom: Option<String>,
    pub stock_uom: Option<String>,
    pub conversion_factor: Decimal,
    /// `qty` expressed in the stock UOM.
    pub transfer_qty: Decimal,
    pub basic_rate: Decimal,
    pub valuation_rate: Decimal,
    /// `transfer_qty * basic_rate`.
    pub basic_amount: Decimal,
    /// On-hand quantity at the row's location.
    pub actual_qty: Decimal,
    pub batch_no: Option<String>,
    /// Newline-separated serial numbers.
    pub serial_no: Option<String>,
    pub has_batch_no: bool,
    pub has_serial_no: bool,
    pub bom_no: Option<String>,
    pub expense_account: Option<String>,
    pub cost_center: Option<String>,
    pub project: Option<String>,
    pub allow_zero_valuation_rate: bool,
    pub allow_alternative_item: bool,
    pub original_item: Option<String>,
    pub sample_quantity: Decimal,
    pub retain_sample: bool,
}

impl StockEntryRow {
    pub fn new() -> Self {
        Self {
            id: RowId::new(),
            item_code: None,
            item_name: None,
            item_group: None,
            description: None,
            s_warehouse: None,
            t_warehouse: None,
            qty: Decimal::ZERO,
            uom: None,
            stock_uom: None,
            conversion_factor: Decimal::ONE,
            transfer_qty: Decimal::ZERO,
            basic_rate: Decimal::ZERO,
            valuation_rate: Decimal::ZERO,
            basic_amount: Decimal::ZERO,
            actual_qty: Decimal::ZERO,
            batch_no: None,
            serial_no: None,
            has_batch_no: false,
            has_serial_no: false,
            bom_no: None,
            expense_account: None,
            cost_center: None,
            project: None,
            allow_zero_valuation_rate: false,
            allow_alternative_item: false,
            original_item: None,
            sample_quantity: Decimal::ZERO,
            retain_sample: false,
        }
    }

    pub fn with_item(mut self, item_code: impl Into<String>) -> Self {
        self.item_code = Some(item_code.into());
        self
    }

    pub fn with_qty(mut self, qty: Decimal) -> Self {
        self.qty = qty;
        self
    }

    pub fn with_conversion_factor(mut self, factor: Decimal) -> Self {
        self.conversion_factor = factor;
        self
    }

    pub fn with_source(mut self, warehouse: impl Into<String>) -> Self {
        self.s_warehouse = Some(warehouse.into());
        self
    }

    pub fn with_target(mut self, warehouse: impl Into<String>) -> Self {
        self.t_warehouse = Some(warehouse.into());
        self
    }

    pub fn serial_numbers(&self) -> Vec<&str> {
        split_serials(self.serial_no.as_deref())
    }

    /// Batch- or serial-tracked item with no identifier chosen yet.
    ///
    /// A batch-only item is satisfied by a batch; anything serial-tracked
    /// needs serial numbers.
    pub fn lacks_batch_or_serial(&self) -> bool {
        if self.has_batch_no && !self.has_serial_no {
            present(&self.batch_no).is_none()
        } else {
            present(&self.serial_no).is_none()
        }
    }

    /// Copy one looked-up value into the row.
    ///
    /// Falsy values and unknown fields are ignored. Returns whether the row changed.
    pub(crate) fn merge_value(
        &mut self,
        field: &str,
        value: &JsonValue,
        config: &EngineConfig,
        rec: &mut Recorder<'_>,
    ) -> bool {
        if !is_truthy(value) {
            return false;
        }

        macro_rules! text {
            ($slot:ident) => {
                match as_text(value) {
                    Some(v) => rec.set(&mut self.$slot, Some(v), stringify!($slot)),
                    None => false,
                }
            };
        }
        macro_rules! number {
            ($slot:ident, $round:ident) => {
                match as_decimal(value) {
                    Some(v) => rec.set(&mut self.$slot, config.$round(v), stringify!($slot)),
                    None => false,
                }
            };
        }
        macro_rules! flag {
            ($slot:ident) => {
                match as_flag(value) {
                    Some(v) => rec.set(&mut self.$slot, v, stringify!($slot)),
                    None => false,
                }
            };
        }

        match field {
            "item_name" => text!(item_name),
            "item_group" => text!(item_group),
            "description" => text!(description),
            "s_warehouse" => text!(s_warehouse),
            "t_warehouse" => text!(t_warehouse),
            "uom" => text!(uom),
            "stock_uom" => text!(stock_uom),
            "batch_no" => text!(batch_no),
            "serial_no" => text!(serial_no),
            "bom_no" => text!(bom_no),
            "expense_account" => text!(expense_account),
            "cost_center" => text!(cost_center),
            "project" => text!(project),
            "original_item" => text!(original_item),
            "qty" => number!(qty, round_qty),
            "conversion_factor" => match as_decimal(value) {
                Some(v) => rec.set(&mut self.conversion_factor, v, "conversion_factor"),
                None => false,
            },
            "transfer_qty" => number!(transfer_qty, round_qty),
            "basic_rate" => number!(basic_rate, round_rate),
            "valuation_rate" => number!(valuation_rate, round_rate),
            "actual_qty" => number!(actual_qty, round_qty),
            "sample_quantity" => number!(sample_quantity, round_qty),
            "has_batch_no" => flag!(has_batch_no),
            "has_serial_no" => flag!(has_serial_no),
            "allow_alternative_item" => flag!(allow_alternative_item),
            "retain_sample" => flag!(retain_sample),
            other => {
                tracing::debug!(field = other, row_id = %self.id, "ignoring unknown item detail field");
                false
            }
        }
    }
}

impl Default for StockEntryRow {
    fn default() -> Self {
        Self::new()
    }
}

impl Entity for StockEntryRow {
    type Id = RowId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl LineItem for StockEntryRow {
    fn item_code(&self) -> Option<&str> {
        present(&self.item_code)
    }
}

impl HasRowLocations for StockEntryRow {
    fn source_location(&self) -> Option<&str> {
        present(&self.s_warehouse)
    }

    fn target_location(&self) -> Option<&str> {
        present(&self.t_warehouse)
    }
}

/// Landed cost charged on top of the moved stock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdditionalCost {
    pub id: RowId,
    pub description: Option<String>,
    pub expense_account: Option<String>,
    /// Amount in the charge's currency.
    pub amount: Decimal,
    pub exchange_rate: Decimal,
    /// Amount in the company currency.
    pub base_amount: Decimal,
}

impl AdditionalCost {
    pub fn new(amount: Decimal) -> Self {
        Self {
            id: RowId::new(),
            description: None,
            expense_account: None,
            amount,
            exchange_rate: Decimal::ONE,
            base_amount: Decimal::ZERO,
        }
    }

    pub fn with_exchange_rate(mut self, rate: Decimal) -> Self {
        self.exchange_rate = rate;
        self
    }
}

/// Stock entry document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockEntry {
    pub id: DocumentId,
    pub company: Option<String>,
    pub purpose: StockEntryPurpose,
    pub posting_date: NaiveDate,
    pub posting_time: NaiveTime,
    /// Default source warehouse for new rows.
    pub from_warehouse: Option<String>,
    /// Default target warehouse for new rows.
    pub to_warehouse: Option<String>,
    pub bom_no: Option<String>,
    pub work_order: Option<String>,
    /// Set when the entry is raised from a job card; the work order then
    /// does not drive the header.
    pub job_card: Option<String>,
    /// Finished quantity the entry manufactures.
    pub fg_completed_qty: Decimal,
    pub from_bom: bool,
    pub use_multi_level_bom: bool,
    pub inspection_required: bool,
    pub customer: Option<String>,
    pub customer_name: Option<String>,
    pub customer_address: Option<String>,
    pub supplier: Option<String>,
    pub supplier_name: Option<String>,
    pub supplier_address: Option<String>,
    pub delivery_note_no: Option<String>,
    pub sales_invoice_no: Option<String>,
    pub purchase_receipt_no: Option<String>,
    pub address_display: Option<String>,
    pub items: Vec<StockEntryRow>,
    pub additional_costs: Vec<AdditionalCost>,
    pub total_additional_costs: Decimal,
}

impl StockEntry {
    /// Draft entry posted now.
    pub fn new(company: impl Into<String>, purpose: StockEntryPurpose) -> Self {
        let now = Utc::now().naive_utc();
        Self {
            id: DocumentId::new(),
            company: Some(company.into()),
            purpose,
            posting_date: now.date(),
            posting_time: now.time(),
            from_warehouse: None,
            to_warehouse: None,
            bom_no: None,
            work_order: None,
            job_card: None,
            fg_completed_qty: Decimal::ZERO,
            from_bom: false,
            use_multi_level_bom: false,
            inspection_required: false,
            customer: None,
            customer_name: None,
            customer_address: None,
            supplier: None,
            supplier_name: None,
            supplier_address: None,
            delivery_note_no: None,
            sales_invoice_no: None,
            purchase_receipt_no: None,
            address_display: None,
            items: Vec::new(),
            additional_costs: Vec::new(),
            total_additional_costs: Decimal::ZERO,
        }
    }

    pub fn with_posting(mut self, date: NaiveDate, time: NaiveTime) -> Self {
        self.posting_date = date;
        self.posting_time = time;
        self
    }

    pub fn additional_cost_mut(&mut self, id: RowId) -> Option<&mut AdditionalCost> {
        self.additional_costs.iter_mut().find(|c| c.id == id)
    }

    pub fn has_alternative_items(&self) -> bool {
        self.items.iter().any(|r| r.allow_alternative_item)
    }
}

impl HasLineItems for StockEntry {
    type Row = StockEntryRow;

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

impl SupportsValuation for StockEntry {
    fn voucher_type(&self) -> &'static str {
        "Stock Entry"
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

pub(crate) fn split_serials(raw: Option<&str>) -> Vec<&str> {
    raw.map(|s| {
        s.trim()
            .split('\n')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use serde_json::json;

    use super::*;
    use crate::changes::ChangeSet;

    #[test]
    fn purpose_serializes_with_display_names() {
        let json = serde_json::to_value(StockEntryPurpose::MaterialTransferForManufacture).unwrap();
        assert_eq!(json, json!("Material Transfer for Manufacture"));
        let back: StockEntryPurpose = serde_json::from_value(json!("Send to Subcontractor")).unwrap();
        assert_eq!(back, StockEntryPurpose::SendToSubcontractor);
    }

    #[test]
    fn signed_qty_is_negative_when_drawing_from_source() {
        let outgoing = StockEntryRow::new().with_source("Stores");
        let incoming = StockEntryRow::new().with_target("Finished Goods");
        assert_eq!(outgoing.signed_qty(dec!(4)), dec!(-4));
        assert_eq!(incoming.signed_qty(dec!(4)), dec!(4));
        assert_eq!(outgoing.location(), Some("Stores"));
        assert_eq!(incoming.location(), Some("Finished Goods"));
    }

    #[test]
    fn blank_item_code_is_not_an_item() {
        let row = StockEntryRow::new().with_item("   ");
        assert!(!row.has_item());
    }

    #[test]
    fn batch_only_items_are_satisfied_by_a_batch() {
        let mut row = StockEntryRow::new().with_item("FLOUR");
        row.has_batch_no = true;
        assert!(row.lacks_batch_or_serial());
        row.batch_no = Some("B-001".to_string());
        assert!(!row.lacks_batch_or_serial());

        row.has_serial_no = true;
        assert!(row.lacks_batch_or_serial());
    }

    #[test]
    fn merge_skips_falsy_and_unknown_values() {
        let config = EngineConfig::default();
        let mut row = StockEntryRow::new().with_item("BOLT");
        let mut changes = ChangeSet::new();
        let mut rec = Recorder::row(DocumentId::new(), row.id, &mut changes);

        assert!(row.merge_value("uom", &json!("Box"), &config, &mut rec));
        assert!(row.merge_value("basic_rate", &json!(2.456), &config, &mut rec));
        assert!(row.merge_value("has_serial_no", &json!(1), &config, &mut rec));
        assert!(!row.merge_value("qty", &json!(0), &config, &mut rec));
        assert!(!row.merge_value("warranty_period", &json!("12"), &config, &mut rec));

        assert_eq!(row.uom.as_deref(), Some("Box"));
        assert_eq!(row.basic_rate, dec!(2.46));
        assert!(row.has_serial_no);
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn rows_are_addressed_by_stable_id() {
        let mut entry = StockEntry::new("Acme", StockEntryPurpose::MaterialTransfer);
        let first = entry.add_row(StockEntryRow::new().with_item("A"));
        let second = entry.add_row(StockEntryRow::new().with_item("B"));

        entry.remove_row(first);
        assert!(entry.row(first).is_none());
        assert_eq!(entry.row(second).and_then(|r| r.item_code()), Some("B"));
    }
}
