//! In-memory collaborators for tests/dev.
//!
//! - No IO
//! - Every request is recorded in call order
//! - Any kind of call can be made to fail

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::{ServiceError, ServiceResult};
use crate::reconciliation::ReconciliationPurpose;
use crate::services::{
    BalanceQuery, BatchSerialSelector, Bom, BomItem, BomItemsQuery, BomService, ItemDetails,
    ItemDetailsQuery, ItemMasterService, LocationDetails, ManufacturingService, ProductionItem,
    ProductionItemsQuery, RateQuery, SampleQuery, SelectionOutcome, SelectionRequest,
    SerialNoQuery, SettingsService, StockBalance, StockBalanceService, UomQuery, ValuationService,
    WarehouseItem, WarehouseItemsQuery, WorkOrderDetails,
};

/// Kind of collaborator call, used for failure injection and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    IncomingRate,
    LocationDetails,
    SerialNos,
    ItemDetails,
    UomDetails,
    SampleQty,
    BomItems,
    Bom,
    WorkOrderDetails,
    ProductionItems,
    StockBalance,
    WarehouseItems,
    Settings,
    Select,
}

/// A recorded collaborator call with its request.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceCall {
    IncomingRate(RateQuery),
    LocationDetails(RateQuery),
    SerialNos(SerialNoQuery),
    ItemDetails(ItemDetailsQuery),
    UomDetails(UomQuery),
    SampleQty(SampleQuery),
    BomItems(BomItemsQuery),
    Bom(String),
    WorkOrderDetails(String),
    ProductionItems(ProductionItemsQuery),
    StockBalance(BalanceQuery),
    WarehouseItems(WarehouseItemsQuery),
    MaterialConsumptionEnabled,
    PerpetualInventoryEnabled(String),
    DifferenceAccount(ReconciliationPurpose, String),
    StockAdjustmentAccount(String),
    Select(SelectionRequest),
}

impl ServiceCall {
    pub fn kind(&self) -> CallKind {
        match self {
            ServiceCall::IncomingRate(_) => CallKind::IncomingRate,
            ServiceCall::LocationDetails(_) => CallKind::LocationDetails,
            ServiceCall::SerialNos(_) => CallKind::SerialNos,
            ServiceCall::ItemDetails(_) => CallKind::ItemDetails,
            ServiceCall::UomDetails(_) => CallKind::UomDetails,
            ServiceCall::SampleQty(_) => CallKind::SampleQty,
            ServiceCall::BomItems(_) => CallKind::BomItems,
            ServiceCall::Bom(_) => CallKind::Bom,
            ServiceCall::WorkOrderDetails(_) => CallKind::WorkOrderDetails,
            ServiceCall::ProductionItems(_) => CallKind::ProductionItems,
            ServiceCall::StockBalance(_) => CallKind::StockBalance,
            ServiceCall::WarehouseItems(_) => CallKind::WarehouseItems,
            ServiceCall::MaterialConsumptionEnabled
            | ServiceCall::PerpetualInventoryEnabled(_)
            | ServiceCall::DifferenceAccount(..)
            | ServiceCall::StockAdjustmentAccount(_) => CallKind::Settings,
            ServiceCall::Select(_) => CallKind::Select,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    rates: HashMap<String, Decimal>,
    location_details: HashMap<(String, String), LocationDetails>,
    serial_nos: HashMap<String, String>,
    item_details: HashMap<String, ItemDetails>,
    uom_details: HashMap<(String, String), ItemDetails>,
    sample_limits: HashMap<String, Decimal>,
    bom_items: HashMap<String, Vec<BomItem>>,
    boms: HashMap<String, Bom>,
    work_orders: HashMap<String, WorkOrderDetails>,
    production_items: HashMap<String, Vec<ProductionItem>>,
    balances: HashMap<(String, String, Option<String>), StockBalance>,
    warehouse_items: HashMap<String, Vec<WarehouseItem>>,
    material_consumption_enabled: bool,
    perpetual_inventory: HashSet<String>,
    difference_accounts: HashMap<ReconciliationPurpose, String>,
    stock_adjustment_accounts: HashMap<String, String>,
    selections: HashMap<String, SelectionOutcome>,
    failing: HashSet<CallKind>,
    calls: Vec<ServiceCall>,
}

/// Table-driven implementation of every collaborator trait.
#[derive(Debug, Default)]
pub struct InMemoryStockServices {
    state: Mutex<State>,
}

impl InMemoryStockServices {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state_mut(&mut self) -> &mut State {
        self.state.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_rate(mut self, item_code: impl Into<String>, rate: Decimal) -> Self {
        self.state_mut().rates.insert(item_code.into(), rate);
        self
    }

    pub fn with_location_details(
        mut self,
        item_code: impl Into<String>,
        warehouse: impl Into<String>,
        details: LocationDetails,
    ) -> Self {
        self.state_mut()
            .location_details
            .insert((item_code.into(), warehouse.into()), details);
        self
    }

    pub fn with_serial_nos(mut self, item_code: impl Into<String>, serials: impl Into<String>) -> Self {
        self.state_mut().serial_nos.insert(item_code.into(), serials.into());
        self
    }

    pub fn with_item_details(mut self, item_code: impl Into<String>, details: ItemDetails) -> Self {
        self.state_mut().item_details.insert(item_code.into(), details);
        self
    }

    pub fn with_uom_details(
        mut self,
        item_code: impl Into<String>,
        uom: impl Into<String>,
        details: ItemDetails,
    ) -> Self {
        self.state_mut()
            .uom_details
            .insert((item_code.into(), uom.into()), details);
        self
    }

    /// Most samples an item may retain per batch.
    pub fn with_sample_limit(mut self, item_code: impl Into<String>, limit: Decimal) -> Self {
        self.state_mut().sample_limits.insert(item_code.into(), limit);
        self
    }

    pub fn with_work_order(mut self, work_order: impl Into<String>, details: WorkOrderDetails) -> Self {
        self.state_mut().work_orders.insert(work_order.into(), details);
        self
    }

    /// Rows produced for a BOM, whatever the finished quantity.
    pub fn with_production_items(mut self, bom_no: impl Into<String>, items: Vec<ProductionItem>) -> Self {
        self.state_mut().production_items.insert(bom_no.into(), items);
        self
    }

    pub fn with_stock_adjustment_account(
        mut self,
        company: impl Into<String>,
        account: impl Into<String>,
    ) -> Self {
        self.state_mut()
            .stock_adjustment_accounts
            .insert(company.into(), account.into());
        self
    }

    pub fn with_bom_items(mut self, bom_no: impl Into<String>, items: Vec<BomItem>) -> Self {
        self.state_mut().bom_items.insert(bom_no.into(), items);
        self
    }

    pub fn with_bom(mut self, bom: Bom) -> Self {
        self.state_mut().boms.insert(bom.name.clone(), bom);
        self
    }

    pub fn with_balance(
        mut self,
        item_code: impl Into<String>,
        warehouse: impl Into<String>,
        batch_no: Option<&str>,
        balance: StockBalance,
    ) -> Self {
        self.state_mut().balances.insert(
            (item_code.into(), warehouse.into(), batch_no.map(str::to_string)),
            balance,
        );
        self
    }

    pub fn with_warehouse_items(mut self, warehouse: impl Into<String>, items: Vec<WarehouseItem>) -> Self {
        self.state_mut().warehouse_items.insert(warehouse.into(), items);
        self
    }

    pub fn with_material_consumption(mut self, enabled: bool) -> Self {
        self.state_mut().material_consumption_enabled = enabled;
        self
    }

    pub fn with_perpetual_inventory(mut self, company: impl Into<String>) -> Self {
        self.state_mut().perpetual_inventory.insert(company.into());
        self
    }

    pub fn with_difference_account(
        mut self,
        purpose: ReconciliationPurpose,
        account: impl Into<String>,
    ) -> Self {
        self.state_mut().difference_accounts.insert(purpose, account.into());
        self
    }

    pub fn with_selection(mut self, item_code: impl Into<String>, outcome: SelectionOutcome) -> Self {
        self.state_mut().selections.insert(item_code.into(), outcome);
        self
    }

    /// Replace a rate while requests are in flight.
    pub fn set_rate(&self, item_code: impl Into<String>, rate: Decimal) {
        self.state().rates.insert(item_code.into(), rate);
    }

    /// Make every subsequent call of `kind` fail.
    pub fn fail(&self, kind: CallKind) {
        self.state().failing.insert(kind);
    }

    pub fn recover(&self, kind: CallKind) {
        self.state().failing.remove(&kind);
    }

    /// Recorded calls, oldest first.
    pub fn calls(&self) -> Vec<ServiceCall> {
        self.state().calls.clone()
    }

    pub fn call_kinds(&self) -> Vec<CallKind> {
        self.state().calls.iter().map(ServiceCall::kind).collect()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.state().calls.iter().filter(|c| c.kind() == kind).count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Record the call and fail it if its kind is marked failing.
    fn record(&self, call: ServiceCall) -> ServiceResult<MutexGuard<'_, State>> {
        let kind = call.kind();
        let mut state = self.state();
        state.calls.push(call);
        if state.failing.contains(&kind) {
            return Err(ServiceError::Unavailable(format!("{kind:?} lookup failed")));
        }
        Ok(state)
    }
}

#[async_trait]
impl ValuationService for InMemoryStockServices {
    async fn incoming_rate(&self, query: &RateQuery) -> ServiceResult<Option<Decimal>> {
        let state = self.record(ServiceCall::IncomingRate(query.clone()))?;
        Ok(query
            .item_code
            .as_ref()
            .and_then(|code| state.rates.get(code).copied()))
    }

    async fn location_details(&self, query: &RateQuery) -> ServiceResult<Option<LocationDetails>> {
        let state = self.record(ServiceCall::LocationDetails(query.clone()))?;
        let key = match (&query.item_code, &query.warehouse) {
            (Some(item), Some(warehouse)) => (item.clone(), warehouse.clone()),
            _ => return Ok(None),
        };
        Ok(state.location_details.get(&key).cloned())
    }

    async fn serial_nos(&self, query: &SerialNoQuery) -> ServiceResult<Option<String>> {
        let state = self.record(ServiceCall::SerialNos(query.clone()))?;
        Ok(query
            .item_code
            .as_ref()
            .and_then(|code| state.serial_nos.get(code).cloned()))
    }
}

#[async_trait]
impl ItemMasterService for InMemoryStockServices {
    async fn item_details(&self, query: &ItemDetailsQuery) -> ServiceResult<Option<ItemDetails>> {
        let state = self.record(ServiceCall::ItemDetails(query.clone()))?;
        Ok(state.item_details.get(&query.item_code).cloned())
    }

    async fn uom_details(&self, query: &UomQuery) -> ServiceResult<Option<ItemDetails>> {
        let state = self.record(ServiceCall::UomDetails(query.clone()))?;
        Ok(state
            .uom_details
            .get(&(query.item_code.clone(), query.uom.clone()))
            .cloned())
    }

    async fn retainable_sample_qty(&self, query: &SampleQuery) -> ServiceResult<Option<Decimal>> {
        let state = self.record(ServiceCall::SampleQty(query.clone()))?;
        Ok(state
            .sample_limits
            .get(&query.item_code)
            .map(|limit| query.sample_quantity.min(*limit)))
    }
}

#[async_trait]
impl ManufacturingService for InMemoryStockServices {
    async fn work_order_details(
        &self,
        work_order: &str,
        _company: Option<&str>,
    ) -> ServiceResult<Option<WorkOrderDetails>> {
        let state = self.record(ServiceCall::WorkOrderDetails(work_order.to_string()))?;
        Ok(state.work_orders.get(work_order).cloned())
    }

    async fn production_items(&self, query: &ProductionItemsQuery) -> ServiceResult<Vec<ProductionItem>> {
        let state = self.record(ServiceCall::ProductionItems(query.clone()))?;
        Ok(state
            .production_items
            .get(&query.bom_no)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl BomService for InMemoryStockServices {
    async fn bom_items(&self, query: &BomItemsQuery) -> ServiceResult<Vec<BomItem>> {
        let state = self.record(ServiceCall::BomItems(query.clone()))?;
        Ok(state.bom_items.get(&query.bom_no).cloned().unwrap_or_default())
    }

    async fn bom(&self, bom_no: &str) -> ServiceResult<Option<Bom>> {
        let state = self.record(ServiceCall::Bom(bom_no.to_string()))?;
        Ok(state.boms.get(bom_no).cloned())
    }
}

#[async_trait]
impl StockBalanceService for InMemoryStockServices {
    async fn stock_balance(&self, query: &BalanceQuery) -> ServiceResult<Option<StockBalance>> {
        let state = self.record(ServiceCall::StockBalance(query.clone()))?;
        let exact = (
            query.item_code.clone(),
            query.warehouse.clone(),
            query.batch_no.clone(),
        );
        let any_batch = (query.item_code.clone(), query.warehouse.clone(), None);
        Ok(state
            .balances
            .get(&exact)
            .or_else(|| state.balances.get(&any_batch))
            .cloned())
    }

    async fn warehouse_items(&self, query: &WarehouseItemsQuery) -> ServiceResult<Vec<WarehouseItem>> {
        let state = self.record(ServiceCall::WarehouseItems(query.clone()))?;
        let items = state
            .warehouse_items
            .get(&query.warehouse)
            .cloned()
            .unwrap_or_default();
        Ok(items
            .into_iter()
            .filter(|i| !query.ignore_empty_stock || i.current_qty.is_some_and(|q| !q.is_zero()))
            .collect())
    }
}

#[async_trait]
impl SettingsService for InMemoryStockServices {
    async fn material_consumption_enabled(&self) -> ServiceResult<bool> {
        let state = self.record(ServiceCall::MaterialConsumptionEnabled)?;
        Ok(state.material_consumption_enabled)
    }

    async fn perpetual_inventory_enabled(&self, company: &str) -> ServiceResult<bool> {
        let state = self.record(ServiceCall::PerpetualInventoryEnabled(company.to_string()))?;
        Ok(state.perpetual_inventory.contains(company))
    }

    async fn difference_account(
        &self,
        purpose: ReconciliationPurpose,
        company: &str,
    ) -> ServiceResult<Option<String>> {
        let state = self.record(ServiceCall::DifferenceAccount(purpose, company.to_string()))?;
        Ok(state.difference_accounts.get(&purpose).cloned())
    }

    async fn stock_adjustment_account(&self, company: &str) -> ServiceResult<Option<String>> {
        let state = self.record(ServiceCall::StockAdjustmentAccount(company.to_string()))?;
        Ok(state.stock_adjustment_accounts.get(company).cloned())
    }
}

#[async_trait]
impl BatchSerialSelector for InMemoryStockServices {
    async fn select(&self, request: &SelectionRequest) -> ServiceResult<SelectionOutcome> {
        let state = self.record(ServiceCall::Select(request.clone()))?;
        Ok(state
            .selections
            .get(&request.item_code)
            .cloned()
            .unwrap_or(SelectionOutcome::Skipped))
    }
}
