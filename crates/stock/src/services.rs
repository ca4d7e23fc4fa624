//! External collaborators of the recomputation engines.
//!
//! Every lookup is a remote procedure the engine does not control. Each
//! returns `Ok(None)` (or an empty list) when it has nothing to say; the
//! engines treat that exactly like an error: the dependent fields keep their
//! last known value.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use stockline_core::RowId;

use crate::entry::StockEntryPurpose;
use crate::error::ServiceResult;
use crate::reconciliation::ReconciliationPurpose;
use crate::value::as_flag;

/// The document row a lookup is made on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherRef {
    pub voucher_type: String,
    pub voucher_no: RowId,
}

/// Input of the rate and location-details lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateQuery {
    pub item_code: Option<String>,
    pub warehouse: Option<String>,
    pub batch_no: Option<String>,
    pub serial_no: Option<String>,
    pub company: Option<String>,
    pub posting_date: NaiveDate,
    pub posting_time: NaiveTime,
    /// Base-unit quantity, negative when stock leaves the warehouse.
    pub qty: Decimal,
    pub voucher: VoucherRef,
    pub allow_zero_valuation: bool,
}

/// On-hand quantity and rate at a location.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LocationDetails {
    pub actual_qty: Option<Decimal>,
    pub basic_rate: Option<Decimal>,
}

/// Input of the serial number suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialNoQuery {
    pub item_code: Option<String>,
    pub warehouse: Option<String>,
    pub stock_qty: Decimal,
}

/// Input of the item-master detail lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDetailsQuery {
    pub item_code: String,
    pub warehouse: Option<String>,
    pub qty: Decimal,
    pub transfer_qty: Decimal,
    pub batch_no: Option<String>,
    pub serial_no: Option<String>,
    pub bom_no: Option<String>,
    pub expense_account: Option<String>,
    pub cost_center: Option<String>,
    pub company: Option<String>,
    pub voucher: VoucherRef,
    pub allow_zero_valuation: bool,
}

/// Field map returned by the item master; merged into the row as-is.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemDetails {
    pub fields: Map<String, JsonValue>,
}

impl ItemDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn has_batch_no(&self) -> bool {
        self.flag("has_batch_no")
    }

    pub fn has_serial_no(&self) -> bool {
        self.flag("has_serial_no")
    }

    fn flag(&self, field: &str) -> bool {
        self.fields.get(field).and_then(as_flag).unwrap_or(false)
    }
}

/// Input of the UOM conversion lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UomQuery {
    pub item_code: String,
    pub uom: String,
    pub qty: Decimal,
}

/// Input of the retained-sample check for one received batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleQuery {
    pub item_code: String,
    pub batch_no: Option<String>,
    pub sample_quantity: Decimal,
    /// Received quantity in the stock UOM.
    pub qty: Decimal,
}

/// Header values a work order hands down to its stock entries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkOrderDetails {
    pub from_bom: bool,
    pub bom_no: Option<String>,
    pub fg_completed_qty: Decimal,
    pub use_multi_level_bom: bool,
    pub wip_warehouse: Option<String>,
    pub fg_warehouse: Option<String>,
}

/// Input of the manufacturing row fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionItemsQuery {
    pub purpose: StockEntryPurpose,
    pub company: Option<String>,
    pub work_order: Option<String>,
    pub bom_no: String,
    pub fg_completed_qty: Decimal,
    pub use_multi_level_bom: bool,
    pub from_warehouse: Option<String>,
    pub to_warehouse: Option<String>,
}

/// One row of a manufacturing entry: a consumed material or the finished good.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionItem {
    pub item_code: String,
    pub item_name: Option<String>,
    pub stock_uom: Option<String>,
    pub qty: Decimal,
    pub s_warehouse: Option<String>,
    pub t_warehouse: Option<String>,
    pub bom_no: Option<String>,
    pub expense_account: Option<String>,
    pub cost_center: Option<String>,
}

impl ProductionItem {
    pub fn new(item_code: impl Into<String>, qty: Decimal) -> Self {
        Self {
            item_code: item_code.into(),
            item_name: None,
            stock_uom: None,
            qty,
            s_warehouse: None,
            t_warehouse: None,
            bom_no: None,
            expense_account: None,
            cost_center: None,
        }
    }

    pub fn consumed_from(mut self, warehouse: impl Into<String>) -> Self {
        self.s_warehouse = Some(warehouse.into());
        self
    }

    pub fn produced_into(mut self, warehouse: impl Into<String>) -> Self {
        self.t_warehouse = Some(warehouse.into());
        self
    }
}

/// What the user asked to pull out of a bill of materials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BomExpansionRequest {
    pub bom_no: String,
    pub qty: Decimal,
    pub source_warehouse: Option<String>,
    pub target_warehouse: Option<String>,
    /// Include sub-assembly components.
    pub fetch_exploded: bool,
}

/// BOM expansion as sent to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BomItemsQuery {
    pub bom_no: String,
    pub qty: Decimal,
    pub company: String,
    pub source_warehouse: Option<String>,
    pub target_warehouse: Option<String>,
    pub fetch_exploded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BomItem {
    pub item_code: String,
    pub item_name: Option<String>,
    pub item_group: Option<String>,
    pub stock_uom: Option<String>,
    pub conversion_factor: Option<Decimal>,
    pub qty: Decimal,
    pub expense_account: Option<String>,
    pub project: Option<String>,
    pub allow_alternative_item: bool,
}

impl BomItem {
    pub fn new(item_code: impl Into<String>, qty: Decimal) -> Self {
        Self {
            item_code: item_code.into(),
            item_name: None,
            item_group: None,
            stock_uom: None,
            conversion_factor: None,
            qty,
            expense_account: None,
            project: None,
            allow_alternative_item: false,
        }
    }
}

/// A bill of materials as loaded into the document cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bom {
    pub name: String,
    pub items: Vec<BomItem>,
}

/// Input of the stock-balance lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceQuery {
    pub item_code: String,
    pub warehouse: String,
    pub posting_date: NaiveDate,
    pub posting_time: NaiveTime,
    pub batch_no: Option<String>,
}

/// Booked stock at a posting instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockBalance {
    pub qty: Decimal,
    pub rate: Decimal,
    pub serial_nos: Option<String>,
}

/// Input of the bulk "items held at a warehouse" fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseItemsQuery {
    pub warehouse: String,
    pub company: Option<String>,
    pub posting_date: NaiveDate,
    pub posting_time: NaiveTime,
    pub item_group: Option<String>,
    pub ignore_empty_stock: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseItem {
    pub item_code: String,
    pub item_name: Option<String>,
    pub warehouse: String,
    pub batch_no: Option<String>,
    pub qty: Option<Decimal>,
    pub valuation_rate: Option<Decimal>,
    pub current_qty: Option<Decimal>,
    pub current_valuation_rate: Option<Decimal>,
}

/// Which of the row's warehouses the selector should draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarehouseKind {
    Source,
    Target,
}

/// Opens the batch/serial selector for one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionRequest {
    pub row_id: RowId,
    pub item_code: String,
    pub warehouse_kind: WarehouseKind,
    pub warehouse: Option<String>,
    pub qty: Decimal,
    pub has_batch_no: bool,
    pub has_serial_no: bool,
}

/// Values the user picked in the selector.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchSerialSelection {
    pub batch_no: Option<String>,
    pub serial_nos: Vec<String>,
    pub qty: Option<Decimal>,
}

/// Result of one selector interaction. There is no retry: a skip is final.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SelectionOutcome {
    Selected(BatchSerialSelection),
    Skipped,
}

/// Rate, location-details and serial number lookups.
#[async_trait]
pub trait ValuationService: Send + Sync {
    /// Incoming valuation rate for a movement.
    async fn incoming_rate(&self, query: &RateQuery) -> ServiceResult<Option<Decimal>>;

    /// On-hand quantity and rate at the query's warehouse.
    async fn location_details(&self, query: &RateQuery) -> ServiceResult<Option<LocationDetails>>;

    /// Serial numbers to pre-fill for an outgoing quantity (newline-separated).
    async fn serial_nos(&self, query: &SerialNoQuery) -> ServiceResult<Option<String>>;
}

#[async_trait]
pub trait ItemMasterService: Send + Sync {
    async fn item_details(&self, query: &ItemDetailsQuery) -> ServiceResult<Option<ItemDetails>>;

    /// Conversion factor (and derived quantities) for a UOM change.
    async fn uom_details(&self, query: &UomQuery) -> ServiceResult<Option<ItemDetails>>;

    /// Sample quantity the batch may still retain, at most the requested one.
    async fn retainable_sample_qty(&self, query: &SampleQuery) -> ServiceResult<Option<Decimal>>;
}

#[async_trait]
pub trait ManufacturingService: Send + Sync {
    async fn work_order_details(
        &self,
        work_order: &str,
        company: Option<&str>,
    ) -> ServiceResult<Option<WorkOrderDetails>>;

    /// Rows a manufacturing entry should carry; they replace the current rows.
    async fn production_items(&self, query: &ProductionItemsQuery) -> ServiceResult<Vec<ProductionItem>>;
}

#[async_trait]
pub trait BomService: Send + Sync {
    /// Items to append for a BOM expansion, in BOM order.
    async fn bom_items(&self, query: &BomItemsQuery) -> ServiceResult<Vec<BomItem>>;

    async fn bom(&self, bom_no: &str) -> ServiceResult<Option<Bom>>;
}

#[async_trait]
pub trait StockBalanceService: Send + Sync {
    async fn stock_balance(&self, query: &BalanceQuery) -> ServiceResult<Option<StockBalance>>;

    async fn warehouse_items(&self, query: &WarehouseItemsQuery) -> ServiceResult<Vec<WarehouseItem>>;
}

#[async_trait]
pub trait SettingsService: Send + Sync {
    async fn material_consumption_enabled(&self) -> ServiceResult<bool>;

    async fn perpetual_inventory_enabled(&self, company: &str) -> ServiceResult<bool>;

    async fn difference_account(
        &self,
        purpose: ReconciliationPurpose,
        company: &str,
    ) -> ServiceResult<Option<String>>;

    /// The company's default stock adjustment account.
    async fn stock_adjustment_account(&self, company: &str) -> ServiceResult<Option<String>>;
}

/// The batch/serial selection dialog.
///
/// One call is one interaction: the dialog is acquired, shown and released
/// within `select`.
#[async_trait]
pub trait BatchSerialSelector: Send + Sync {
    async fn select(&self, request: &SelectionRequest) -> ServiceResult<SelectionOutcome>;
}

/// Every collaborator an engine talks to.
#[derive(Clone)]
pub struct StockServices {
    pub valuation: Arc<dyn ValuationService>,
    pub item_master: Arc<dyn ItemMasterService>,
    pub bom: Arc<dyn BomService>,
    pub manufacturing: Arc<dyn ManufacturingService>,
    pub balance: Arc<dyn StockBalanceService>,
    pub settings: Arc<dyn SettingsService>,
    pub selector: Arc<dyn BatchSerialSelector>,
}

impl StockServices {
    /// Use one implementation for every collaborator.
    pub fn from_shared<S>(services: Arc<S>) -> Self
    where
        S: ValuationService
            + ItemMasterService
            + BomService
            + ManufacturingService
            + StockBalanceService
            + SettingsService
            + BatchSerialSelector
            + 'static,
    {
        Self {
            valuation: services.clone(),
            item_master: services.clone(),
            bom: services.clone(),
            manufacturing: services.clone(),
            balance: services.clone(),
            settings: services.clone(),
            selector: services,
        }
    }

    pub fn with_valuation(mut self, valuation: Arc<dyn ValuationService>) -> Self {
        self.valuation = valuation;
        self
    }

    pub fn with_item_master(mut self, item_master: Arc<dyn ItemMasterService>) -> Self {
        self.item_master = item_master;
        self
    }

    pub fn with_selector(mut self, selector: Arc<dyn BatchSerialSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_balance(mut self, balance: Arc<dyn StockBalanceService>) -> Self {
        self.balance = balance;
        self
    }
}

impl core::fmt::Debug for StockServices {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StockServices").finish_non_exhaustive()
    }
}
