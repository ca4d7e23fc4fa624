//! Recomputation rules of the stock entry form.
//!
//! Each `on_*` operation reacts to one observed edit. Operations read what
//! they need from the form, release it while a collaborator is awaited, and
//! apply the answer only if no newer request for the same row and field group
//! was issued in the meantime.

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;

use stockline_core::{DocumentId, RowId, is_blank};
use stockline_events::{FieldChanged, Publisher};

use crate::capabilities::{HasLineItems, HasRowLocations, LineItem, SupportsValuation};
use crate::changes::{ChangeSet, Recorder};
use crate::config::EngineConfig;
use crate::entry::{StockEntry, StockEntryPurpose, StockEntryRow};
use crate::error::{EngineError, EngineResult};
use crate::form::{Form, FormState};
use crate::layout::{RowIndicator, StockEntryLayout, row_indicator};
use crate::recompute;
use crate::services::{
    BatchSerialSelection, BomExpansionRequest, BomItem, BomItemsQuery, ItemDetailsQuery,
    ProductionItem, ProductionItemsQuery, RateQuery, SampleQuery, SelectionOutcome,
    SelectionRequest, SerialNoQuery, StockServices, UomQuery, VoucherRef, WarehouseKind,
};
use crate::slots::{SlotKind, Ticket};
use crate::value::present;

pub type EntryForm = Form<StockEntry>;

/// Filters for the batch picker of one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchQuery {
    pub item_code: String,
    /// Only batches not expired at this date.
    pub posting_date: Option<NaiveDate>,
    pub warehouse: Option<String>,
}

/// Per-row account that is copied into rows still lacking one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAccount {
    ExpenseAccount,
    CostCenter,
}

impl RowAccount {
    fn slot(self, row: &mut StockEntryRow) -> (&mut Option<String>, &'static str) {
        match self {
            RowAccount::ExpenseAccount => (&mut row.expense_account, "expense_account"),
            RowAccount::CostCenter => (&mut row.cost_center, "cost_center"),
        }
    }
}

#[derive(Clone)]
pub struct StockEntryEngine {
    services: StockServices,
    config: EngineConfig,
    publisher: Option<Arc<dyn Publisher<FieldChanged>>>,
}

impl core::fmt::Debug for StockEntryEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StockEntryEngine")
            .field("config", &self.config)
            .field("publishes", &self.publisher.is_some())
            .finish_non_exhaustive()
    }
}

impl StockEntryEngine {
    pub fn new(services: StockServices, config: EngineConfig) -> Self {
        Self {
            services,
            config,
            publisher: None,
        }
    }

    /// Publish every recorded change, e.g. to refresh a grid.
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher<FieldChanged>>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Quantity edited: base quantity, serial numbers, then the rate.
    pub async fn on_quantity_changed(&self, form: &EntryForm, row_id: RowId) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let (serial, valuation) = {
            let mut guard = form.lock().await;
            let state = &mut *guard;
            let document_id = state.doc.id;
            let row = state
                .doc
                .row_mut(row_id)
                .ok_or(EngineError::RowNotFound(row_id))?;
            recompute::refresh_transfer_qty(
                row,
                &self.config,
                &mut Recorder::row(document_id, row_id, &mut changes),
            )?;
            (
                state.slots.open(row_id, SlotKind::Serial),
                state.slots.open(row_id, SlotKind::Valuation),
            )
        };

        self.refresh_serial_nos(form, &serial, &mut changes).await;
        let outcome = self.refresh_rate(form, &valuation, &mut changes).await;
        self.conclude(changes, outcome)
    }

    pub async fn on_conversion_factor_changed(
        &self,
        form: &EntryForm,
        row_id: RowId,
    ) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let valuation = {
            let mut guard = form.lock().await;
            let state = &mut *guard;
            let document_id = state.doc.id;
            let row = state
                .doc
                .row_mut(row_id)
                .ok_or(EngineError::RowNotFound(row_id))?;
            recompute::refresh_transfer_qty(
                row,
                &self.config,
                &mut Recorder::row(document_id, row_id, &mut changes),
            )?;
            state.slots.open(row_id, SlotKind::Valuation)
        };

        let outcome = self.refresh_rate(form, &valuation, &mut changes).await;
        self.conclude(changes, outcome)
    }

    /// Source warehouse edited on a row.
    ///
    /// Fails with a validation error when the row has no item. Rows that
    /// follow a BOM are left alone.
    pub async fn on_source_location_changed(
        &self,
        form: &EntryForm,
        row_id: RowId,
    ) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let outcome = self.source_location_chain(form, row_id, &mut changes).await;
        self.conclude(changes, outcome)
    }

    pub async fn on_target_location_changed(
        &self,
        form: &EntryForm,
        row_id: RowId,
    ) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let outcome = self.target_location_chain(form, row_id, &mut changes).await;
        self.conclude(changes, outcome)
    }

    /// Basic rate typed in by the user.
    ///
    /// Supersedes any rate lookup still in flight for the row.
    pub async fn on_valuation_rate_changed(
        &self,
        form: &EntryForm,
        row_id: RowId,
    ) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        {
            let mut guard = form.lock().await;
            let state = &mut *guard;
            let document_id = state.doc.id;
            let row = state
                .doc
                .row_mut(row_id)
                .ok_or(EngineError::RowNotFound(row_id))?;
            let typed = row.basic_rate;
            recompute::apply_rate(
                row,
                typed,
                &self.config,
                &mut Recorder::row(document_id, row_id, &mut changes),
            )?;
            state.slots.open(row_id, SlotKind::Valuation);
        }
        Ok(self.finish(changes))
    }

    /// Item picked on a row: item master details, BOM alternatives,
    /// batch/serial selection, then base quantity and rate.
    pub async fn on_item_changed(&self, form: &EntryForm, row_id: RowId) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let (details_ticket, query, bom_to_load, purpose) = {
            let mut guard = form.lock().await;
            let state = &mut *guard;
            let row = state.doc.row(row_id).ok_or(EngineError::RowNotFound(row_id))?;
            let Some(item_code) = row.item_code() else {
                tracing::debug!(row_id = %row_id, "item cleared, nothing to fetch");
                return Ok(changes);
            };
            let context = state.doc.valuation_context();
            let query = ItemDetailsQuery {
                item_code: item_code.to_string(),
                warehouse: row.location().map(str::to_string),
                qty: row.qty,
                transfer_qty: row.transfer_qty,
                batch_no: present(&row.batch_no).map(str::to_string),
                serial_no: present(&row.serial_no).map(str::to_string),
                bom_no: present(&row.bom_no).map(str::to_string),
                expense_account: present(&row.expense_account).map(str::to_string),
                cost_center: present(&row.cost_center).map(str::to_string),
                company: context.company,
                voucher: VoucherRef {
                    voucher_type: context.voucher_type.to_string(),
                    voucher_no: row_id,
                },
                allow_zero_valuation: true,
            };
            let bom_to_load = present(&state.doc.bom_no)
                .filter(|name| state.bom_cache.needs_load(name))
                .map(str::to_string);
            let purpose = state.doc.purpose;
            (
                state.slots.open(row_id, SlotKind::ItemDetails),
                query,
                bom_to_load,
                purpose,
            )
        };

        let details = match self.services.item_master.item_details(&query).await {
            Ok(Some(details)) => details,
            Ok(None) => {
                tracing::debug!(row_id = %row_id, item_code = %query.item_code, "item master returned nothing");
                return Ok(self.finish(changes));
            }
            Err(err) => {
                tracing::warn!(row_id = %row_id, item_code = %query.item_code, error = %err, "item details lookup failed");
                return Ok(self.finish(changes));
            }
        };

        if let Some(bom_no) = bom_to_load {
            self.load_bom(form, &bom_no).await;
        }

        let selection = {
            let mut guard = form.lock().await;
            let state = &mut *guard;
            if !state.slots.is_current(&details_ticket) {
                tracing::debug!(row_id = %row_id, slot = %SlotKind::ItemDetails, "discarding stale response");
                return Ok(self.finish(changes));
            }
            let document_id = state.doc.id;
            let Some(row) = state.doc.items.iter_mut().find(|r| r.id == row_id) else {
                return Ok(self.finish(changes));
            };
            let mut rec = Recorder::row(document_id, row_id, &mut changes);
            for (field, value) in &details.fields {
                row.merge_value(field, value, &self.config, &mut rec);
            }
            if let Some(bom_item) = row.item_code().and_then(|code| state.bom_cache.item(code)) {
                rec.set(
                    &mut row.allow_alternative_item,
                    bom_item.allow_alternative_item,
                    "allow_alternative_item",
                );
                if bom_item.allow_alternative_item {
                    rec.set(&mut row.original_item, Some(bom_item.item_code.clone()), "original_item");
                }
            }
            self.selection_request(purpose, row)
        };

        if let Some(request) = selection {
            match self.services.selector.select(&request).await {
                Ok(SelectionOutcome::Selected(selection)) => {
                    let applied = form
                        .apply_current(&details_ticket, &mut changes, |row, rec| {
                            apply_selection(row, selection, &self.config, rec)
                        })
                        .await;
                    if applied.is_none() {
                        return Ok(self.finish(changes));
                    }
                }
                Ok(SelectionOutcome::Skipped) => {
                    tracing::debug!(row_id = %row_id, "batch/serial selection skipped");
                }
                Err(err) => {
                    tracing::warn!(row_id = %row_id, error = %err, "batch/serial selector failed");
                }
            }
        }

        // The rate slot opens here, once the merged details settle the base quantity.
        let settled = form
            .apply_then_open(&details_ticket, SlotKind::Valuation, &mut changes, |row, rec| {
                recompute::refresh_transfer_qty(row, &self.config, rec)
            })
            .await;
        let outcome = self.price_settled_row(form, settled, &mut changes).await;
        self.conclude(changes, outcome)
    }

    pub async fn on_uom_changed(&self, form: &EntryForm, row_id: RowId) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let (uom_ticket, query) = {
            let mut guard = form.lock().await;
            let state = &mut *guard;
            let row = state.doc.row(row_id).ok_or(EngineError::RowNotFound(row_id))?;
            let (Some(item_code), Some(uom)) = (row.item_code(), present(&row.uom)) else {
                return Ok(changes);
            };
            let query = UomQuery {
                item_code: item_code.to_string(),
                uom: uom.to_string(),
                qty: row.qty,
            };
            (state.slots.open(row_id, SlotKind::Uom), query)
        };

        let details = match self.services.item_master.uom_details(&query).await {
            Ok(Some(details)) => details,
            Ok(None) => return Ok(self.finish(changes)),
            Err(err) => {
                tracing::warn!(row_id = %row_id, uom = %query.uom, error = %err, "UOM details lookup failed");
                return Ok(self.finish(changes));
            }
        };

        let settled = form
            .apply_then_open(&uom_ticket, SlotKind::Valuation, &mut changes, |row, rec| {
                for (field, value) in &details.fields {
                    row.merge_value(field, value, &self.config, rec);
                }
                recompute::refresh_transfer_qty(row, &self.config, rec)
            })
            .await;
        let outcome = self.price_settled_row(form, settled, &mut changes).await;
        self.conclude(changes, outcome)
    }

    /// New row: inherit header warehouses and the first row's accounts.
    pub async fn on_row_added(&self, form: &EntryForm, row_id: RowId) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        {
            let mut guard = form.lock().await;
            let doc = &mut guard.doc;
            let document_id = doc.id;
            let from_warehouse = present(&doc.from_warehouse).map(str::to_string);
            let to_warehouse = present(&doc.to_warehouse).map(str::to_string);
            let first_accounts = doc
                .items
                .first()
                .filter(|first| first.id != row_id)
                .map(|first| (first.expense_account.clone(), first.cost_center.clone()));

            let row = doc.row_mut(row_id).ok_or(EngineError::RowNotFound(row_id))?;
            let mut rec = Recorder::row(document_id, row_id, &mut changes);

            let lacks_accounts =
                present(&row.expense_account).is_none() || present(&row.cost_center).is_none();
            if let (true, Some((expense_account, cost_center))) = (lacks_accounts, first_accounts) {
                if expense_account.is_some() {
                    rec.set(&mut row.expense_account, expense_account, "expense_account");
                }
                if cost_center.is_some() {
                    rec.set(&mut row.cost_center, cost_center, "cost_center");
                }
            }
            if row.source_location().is_none() && from_warehouse.is_some() {
                rec.set(&mut row.s_warehouse, from_warehouse, "s_warehouse");
            }
            if row.target_location().is_none() && to_warehouse.is_some() {
                rec.set(&mut row.t_warehouse, to_warehouse, "t_warehouse");
            }
        }
        Ok(self.finish(changes))
    }

    /// Row expense account edited: copied into every row that has none.
    pub async fn on_expense_account_changed(
        &self,
        form: &EntryForm,
        row_id: RowId,
    ) -> EngineResult<ChangeSet> {
        self.copy_account_to_rows(form, row_id, RowAccount::ExpenseAccount)
            .await
    }

    /// Row cost center edited: copied into every row that has none.
    pub async fn on_cost_center_changed(&self, form: &EntryForm, row_id: RowId) -> EngineResult<ChangeSet> {
        self.copy_account_to_rows(form, row_id, RowAccount::CostCenter)
            .await
    }

    /// Retained sample edited on a row.
    ///
    /// Only receipts retain samples. The sample may not exceed the received
    /// quantity, and is capped at what the batch may still retain.
    pub async fn on_sample_quantity_changed(
        &self,
        form: &EntryForm,
        row_id: RowId,
    ) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let outcome = self.validate_sample_quantity(form, row_id, &mut changes).await;
        self.conclude(changes, outcome)
    }

    /// Batch edited on a row: the retained sample is checked against the new batch.
    pub async fn on_batch_changed(&self, form: &EntryForm, row_id: RowId) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let outcome = self.validate_sample_quantity(form, row_id, &mut changes).await;
        self.conclude(changes, outcome)
    }

    /// Header source warehouse edited: pushed into every row.
    pub async fn on_from_location_changed(&self, form: &EntryForm) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let rows = self
            .fill_row_warehouses(form, WarehouseKind::Source, &mut changes)
            .await;
        for row_id in rows {
            match self.source_location_chain(form, row_id, &mut changes).await {
                Ok(()) | Err(EngineError::RowNotFound(_)) => {}
                Err(err) => return self.conclude(changes, Err(err)),
            }
        }
        Ok(self.finish(changes))
    }

    /// Header target warehouse edited: pushed into every row.
    pub async fn on_to_location_changed(&self, form: &EntryForm) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let rows = self
            .fill_row_warehouses(form, WarehouseKind::Target, &mut changes)
            .await;
        for row_id in rows {
            match self.target_location_chain(form, row_id, &mut changes).await {
                Ok(()) | Err(EngineError::RowNotFound(_)) => {}
                Err(err) => return self.conclude(changes, Err(err)),
            }
        }
        Ok(self.finish(changes))
    }

    /// Purpose edited; `previous` is the value before the edit.
    ///
    /// Consuming material for manufacture must be enabled in the
    /// manufacturing settings, otherwise the purpose is reverted and a
    /// business-rule error is returned.
    pub async fn on_purpose_changed(
        &self,
        form: &EntryForm,
        previous: StockEntryPurpose,
    ) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let purpose = form.read(|doc| doc.purpose).await;

        if purpose == StockEntryPurpose::MaterialConsumptionForManufacture {
            match self.services.settings.material_consumption_enabled().await {
                Ok(true) => {}
                Ok(false) => {
                    {
                        let mut guard = form.lock().await;
                        let doc = &mut guard.doc;
                        if doc.purpose == purpose {
                            let document_id = doc.id;
                            Recorder::header(document_id, &mut changes).set(
                                &mut doc.purpose,
                                previous,
                                "purpose",
                            );
                        }
                    }
                    return self.conclude(
                        changes,
                        Err(EngineError::business_rule(
                            "purpose",
                            "Material Consumption is not set in Manufacturing Settings.",
                        )),
                    );
                }
                Err(err) => {
                    tracing::warn!(error = %err, "could not read manufacturing settings, keeping purpose");
                }
            }
        }

        {
            let mut guard = form.lock().await;
            let doc = &mut guard.doc;
            let document_id = doc.id;
            reset_purpose_fields(doc, &mut Recorder::header(document_id, &mut changes));
        }
        Ok(self.finish(changes))
    }

    /// Header BOM reference edited: reload the document's BOM cache.
    pub async fn on_bom_changed(&self, form: &EntryForm) -> EngineResult<ChangeSet> {
        let to_load = {
            let mut guard = form.lock().await;
            let state = &mut *guard;
            let bom_no = present(&state.doc.bom_no).map(str::to_string);
            if state.bom_cache.invalidate_if_changed(bom_no.as_deref()) {
                tracing::debug!(bom_no = ?bom_no, "BOM reference changed, cache cleared");
            }
            bom_no.filter(|name| state.bom_cache.needs_load(name))
        };
        if let Some(bom_no) = to_load {
            self.load_bom(form, &bom_no).await;
        }
        Ok(ChangeSet::new())
    }

    /// Work order picked: copy its BOM, finished quantity and warehouses into
    /// the header, then fetch the manufacturing rows.
    ///
    /// Entries raised from a job card keep their header.
    pub async fn on_work_order_changed(&self, form: &EntryForm) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let request = form
            .read(|doc| {
                if present(&doc.job_card).is_some() {
                    return None;
                }
                present(&doc.work_order)
                    .map(|work_order| (work_order.to_string(), present(&doc.company).map(str::to_string)))
            })
            .await;
        let Some((work_order, company)) = request else {
            return Ok(changes);
        };

        let details = match self
            .services
            .manufacturing
            .work_order_details(&work_order, company.as_deref())
            .await
        {
            Ok(Some(details)) => details,
            Ok(None) => {
                tracing::debug!(work_order = %work_order, "work order not found");
                return Ok(changes);
            }
            Err(err) => {
                tracing::warn!(work_order = %work_order, error = %err, "work order lookup failed");
                return Ok(changes);
            }
        };

        {
            let mut guard = form.lock().await;
            let doc = &mut guard.doc;
            if present(&doc.work_order) != Some(work_order.as_str()) {
                tracing::debug!(work_order = %work_order, "work order changed while loading");
                return Ok(changes);
            }
            let document_id = doc.id;
            let mut rec = Recorder::header(document_id, &mut changes);
            rec.set(&mut doc.from_bom, details.from_bom, "from_bom");
            rec.set(&mut doc.bom_no, details.bom_no, "bom_no");
            rec.set(
                &mut doc.fg_completed_qty,
                self.config.round_qty(details.fg_completed_qty),
                "fg_completed_qty",
            );
            rec.set(&mut doc.use_multi_level_bom, details.use_multi_level_bom, "use_multi_level_bom");

            let (from_default, to_default) = match doc.purpose {
                StockEntryPurpose::MaterialTransferForManufacture => (None, details.wip_warehouse),
                StockEntryPurpose::Manufacture => (details.wip_warehouse, details.fg_warehouse),
                StockEntryPurpose::MaterialConsumptionForManufacture => (details.wip_warehouse, None),
                _ => (None, None),
            };
            if present(&doc.from_warehouse).is_none() && from_default.is_some() {
                rec.set(&mut doc.from_warehouse, from_default, "from_warehouse");
            }
            if present(&doc.to_warehouse).is_none() && to_default.is_some() {
                rec.set(&mut doc.to_warehouse, to_default, "to_warehouse");
            }
        }

        let outcome = self.fetch_production_items(form, &mut changes).await;
        self.conclude(changes, outcome)
    }

    /// Finished quantity edited: the manufacturing rows are fetched again.
    pub async fn on_fg_completed_qty_changed(&self, form: &EntryForm) -> EngineResult<ChangeSet> {
        self.get_items(form).await
    }

    /// Replace the rows with what the header BOM (or work order) calls for
    /// at the finished quantity.
    pub async fn get_items(&self, form: &EntryForm) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let outcome = self.fetch_production_items(form, &mut changes).await;
        self.conclude(changes, outcome)
    }

    /// Append one row per stock item of a bill of materials.
    pub async fn expand_bom(
        &self,
        form: &EntryForm,
        request: BomExpansionRequest,
    ) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        if is_blank(request.qty) {
            return Err(EngineError::validation("Quantity is required"));
        }
        let query = {
            let state = form.lock().await;
            let doc = &state.doc;
            let company = present(&doc.company)
                .ok_or_else(|| EngineError::validation("Company field is required"))?;
            let (source_warehouse, target_warehouse) = match doc.purpose {
                StockEntryPurpose::MaterialIssue => (request.source_warehouse, None),
                StockEntryPurpose::MaterialReceipt => (None, request.target_warehouse),
                _ => (request.source_warehouse, request.target_warehouse),
            };
            BomItemsQuery {
                bom_no: request.bom_no,
                qty: request.qty,
                company: company.to_string(),
                source_warehouse,
                target_warehouse,
                fetch_exploded: request.fetch_exploded,
            }
        };

        let items = match self.services.bom.bom_items(&query).await {
            Ok(items) if items.is_empty() => {
                return Err(EngineError::validation("BOM does not contain any stock item"));
            }
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(bom_no = %query.bom_no, error = %err, "BOM expansion failed");
                return Ok(changes);
            }
        };

        let pushed = {
            let mut guard = form.lock().await;
            let state = &mut *guard;
            if state.doc.items.first().is_some_and(|row| !row.has_item()) {
                let removed = state.doc.items.remove(0);
                state.slots.forget_row(removed.id);
            }
            let seeds = items
                .into_iter()
                .map(|item| RowSeed::from_bom(item, &query))
                .collect();
            self.push_rows(state, seeds, &mut changes)
        };

        let outcome = match pushed {
            Ok(tickets) => {
                tracing::info!(bom_no = %query.bom_no, rows = tickets.len(), "expanded bill of materials");
                self.refresh_rates(form, &tickets, &mut changes).await
            }
            Err(err) => Err(err),
        };
        self.conclude(changes, outcome)
    }

    /// Additional cost line edited: company-currency amount, then the total.
    pub async fn on_additional_cost_changed(
        &self,
        form: &EntryForm,
        cost_id: RowId,
    ) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let outcome = {
            let mut guard = form.lock().await;
            let doc = &mut guard.doc;
            let document_id = doc.id;
            let cost = doc
                .additional_cost_mut(cost_id)
                .ok_or(EngineError::RowNotFound(cost_id))?;
            let base_amount = recompute::amount(cost.amount, cost.exchange_rate, &self.config)?;
            Recorder::row(document_id, cost_id, &mut changes).set(
                &mut cost.base_amount,
                base_amount,
                "base_amount",
            );
            self.refresh_totals(doc, &mut changes)
        };
        self.conclude(changes, outcome)
    }

    pub async fn recompute_document_totals(&self, form: &EntryForm) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let outcome = {
            let mut guard = form.lock().await;
            self.refresh_totals(&mut guard.doc, &mut changes)
        };
        self.conclude(changes, outcome)
    }

    /// Fill blank row expense accounts with the company's stock adjustment
    /// account. Only applies under perpetual inventory.
    pub async fn set_default_accounts(&self, form: &EntryForm) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let Some(company) = form
            .read(|doc| present(&doc.company).map(str::to_string))
            .await
        else {
            return Ok(changes);
        };

        match self.services.settings.perpetual_inventory_enabled(&company).await {
            Ok(true) => {}
            Ok(false) => return Ok(changes),
            Err(err) => {
                tracing::warn!(company = %company, error = %err, "could not read perpetual inventory setting");
                return Ok(changes);
            }
        }
        let account = match self.services.settings.stock_adjustment_account(&company).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                tracing::debug!(company = %company, "company has no stock adjustment account");
                return Ok(changes);
            }
            Err(err) => {
                tracing::warn!(company = %company, error = %err, "stock adjustment account lookup failed");
                return Ok(changes);
            }
        };

        {
            let mut guard = form.lock().await;
            let doc = &mut guard.doc;
            if present(&doc.company) != Some(company.as_str()) {
                tracing::debug!(company = %company, "company changed while loading defaults");
                return Ok(changes);
            }
            let document_id = doc.id;
            for row in doc.items.iter_mut() {
                if present(&row.expense_account).is_none() {
                    Recorder::row(document_id, row.id, &mut changes).set(
                        &mut row.expense_account,
                        Some(account.clone()),
                        "expense_account",
                    );
                }
            }
        }
        Ok(self.finish(changes))
    }

    /// Last pass before the document is saved: rows without a UOM take
    /// their stock UOM.
    pub async fn before_save(&self, form: &EntryForm) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        {
            let mut guard = form.lock().await;
            let doc = &mut guard.doc;
            let document_id = doc.id;
            for row in doc.items.iter_mut() {
                if present(&row.uom).is_none() && present(&row.stock_uom).is_some() {
                    let stock_uom = row.stock_uom.clone();
                    Recorder::row(document_id, row.id, &mut changes).set(&mut row.uom, stock_uom, "uom");
                }
            }
        }
        Ok(self.finish(changes))
    }

    /// Filters for the row's batch picker.
    pub async fn batch_query(&self, form: &EntryForm, row_id: RowId) -> EngineResult<BatchQuery> {
        let state = form.lock().await;
        let doc = &state.doc;
        let row = doc.row(row_id).ok_or(EngineError::RowNotFound(row_id))?;
        let item_code = row
            .item_code()
            .ok_or_else(|| EngineError::validation("Please enter Item Code to get Batch Number"))?;

        Ok(BatchQuery {
            item_code: item_code.to_string(),
            posting_date: doc
                .purpose
                .filters_batches_by_posting_date()
                .then_some(doc.posting_date),
            warehouse: if doc.purpose == StockEntryPurpose::MaterialReceipt {
                None
            } else {
                row.location().map(str::to_string)
            },
        })
    }

    pub async fn layout(&self, form: &EntryForm) -> StockEntryLayout {
        form.read(StockEntryLayout::for_entry).await
    }

    pub async fn row_indicator(&self, form: &EntryForm, row_id: RowId) -> EngineResult<RowIndicator> {
        form.read(|doc| doc.row(row_id).map(row_indicator))
            .await
            .ok_or(EngineError::RowNotFound(row_id))
    }

    async fn source_location_chain(
        &self,
        form: &EntryForm,
        row_id: RowId,
        changes: &mut ChangeSet,
    ) -> EngineResult<()> {
        let (serial, valuation) = {
            let mut guard = form.lock().await;
            let state = &mut *guard;
            let document_id = state.doc.id;
            let row = state
                .doc
                .row_mut(row_id)
                .ok_or(EngineError::RowNotFound(row_id))?;
            if present(&row.bom_no).is_some() {
                tracing::debug!(row_id = %row_id, "row follows its BOM, skipping location lookup");
                return Ok(());
            }
            if !row.has_item() {
                return Err(EngineError::validation("Please select an Item Code first"));
            }
            if row.source_location().is_some() {
                Recorder::row(document_id, row_id, changes).set(
                    &mut row.allow_zero_valuation_rate,
                    false,
                    "allow_zero_valuation_rate",
                );
            }
            (
                state.slots.open(row_id, SlotKind::Serial),
                state.slots.open(row_id, SlotKind::Valuation),
            )
        };

        self.refresh_serial_nos(form, &serial, changes).await;
        self.refresh_location_details(form, &valuation, changes).await
    }

    async fn target_location_chain(
        &self,
        form: &EntryForm,
        row_id: RowId,
        changes: &mut ChangeSet,
    ) -> EngineResult<()> {
        let valuation = {
            let mut guard = form.lock().await;
            let state = &mut *guard;
            let row = state.doc.row(row_id).ok_or(EngineError::RowNotFound(row_id))?;
            if present(&row.bom_no).is_some() {
                tracing::debug!(row_id = %row_id, "row follows its BOM, skipping location lookup");
                return Ok(());
            }
            if !row.has_item() {
                return Err(EngineError::validation("Please select an Item Code first"));
            }
            state.slots.open(row_id, SlotKind::Valuation)
        };

        self.refresh_location_details(form, &valuation, changes).await
    }

    /// Write the header warehouse into every row; returns the rows with an item.
    async fn fill_row_warehouses(
        &self,
        form: &EntryForm,
        kind: WarehouseKind,
        changes: &mut ChangeSet,
    ) -> Vec<RowId> {
        let mut guard = form.lock().await;
        let doc = &mut guard.doc;
        let document_id = doc.id;
        let header = match kind {
            WarehouseKind::Source => present(&doc.from_warehouse),
            WarehouseKind::Target => present(&doc.to_warehouse),
        }
        .map(str::to_string);
        let Some(warehouse) = header else {
            return Vec::new();
        };

        let mut with_items = Vec::new();
        for row in doc.items.iter_mut() {
            let mut rec = Recorder::row(document_id, row.id, changes);
            match kind {
                WarehouseKind::Source => {
                    rec.set(&mut row.s_warehouse, Some(warehouse.clone()), "s_warehouse")
                }
                WarehouseKind::Target => {
                    rec.set(&mut row.t_warehouse, Some(warehouse.clone()), "t_warehouse")
                }
            };
            if row.has_item() {
                with_items.push(row.id);
            }
        }
        with_items
    }

    async fn copy_account_to_rows(
        &self,
        form: &EntryForm,
        row_id: RowId,
        account: RowAccount,
    ) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        {
            let mut guard = form.lock().await;
            let doc = &mut guard.doc;
            let document_id = doc.id;
            let edited = doc.row_mut(row_id).ok_or(EngineError::RowNotFound(row_id))?;
            let Some(value) = present(account.slot(edited).0).map(str::to_string) else {
                return Ok(changes);
            };
            for row in doc.items.iter_mut() {
                let id = row.id;
                let (slot, field) = account.slot(row);
                if present(slot).is_none() {
                    Recorder::row(document_id, id, &mut changes).set(slot, Some(value.clone()), field);
                }
            }
        }
        Ok(self.finish(changes))
    }

    async fn validate_sample_quantity(
        &self,
        form: &EntryForm,
        row_id: RowId,
        changes: &mut ChangeSet,
    ) -> EngineResult<()> {
        let (ticket, query) = {
            let mut guard = form.lock().await;
            let state = &mut *guard;
            let receipt = state.doc.purpose == StockEntryPurpose::MaterialReceipt;
            let row = state.doc.row(row_id).ok_or(EngineError::RowNotFound(row_id))?;
            let Some(item_code) = row.item_code() else {
                return Ok(());
            };
            if !receipt || is_blank(row.sample_quantity) {
                return Ok(());
            }
            if row.sample_quantity > row.transfer_qty {
                return Err(EngineError::validation(format!(
                    "Sample quantity {} cannot be more than received quantity {}",
                    row.sample_quantity, row.transfer_qty
                )));
            }
            let query = SampleQuery {
                item_code: item_code.to_string(),
                batch_no: present(&row.batch_no).map(str::to_string),
                sample_quantity: row.sample_quantity,
                qty: row.transfer_qty,
            };
            (state.slots.open(row_id, SlotKind::Sample), query)
        };

        match self.services.item_master.retainable_sample_qty(&query).await {
            Ok(Some(allowed)) => {
                form.apply_current(&ticket, changes, |row, rec| {
                    rec.set(&mut row.sample_quantity, self.config.round_qty(allowed), "sample_quantity")
                })
                .await;
            }
            Ok(None) => {
                tracing::debug!(row_id = %row_id, item_code = %query.item_code, "no sample limit");
            }
            Err(err) => {
                tracing::warn!(row_id = %row_id, item_code = %query.item_code, error = %err, "sample quantity check failed");
            }
        }
        Ok(())
    }

    async fn fetch_production_items(&self, form: &EntryForm, changes: &mut ChangeSet) -> EngineResult<()> {
        let query = form
            .read(|doc| {
                let bom_no = present(&doc.bom_no)
                    .filter(|_| !is_blank(doc.fg_completed_qty))
                    .ok_or_else(|| EngineError::validation("BOM and Manufacturing Quantity are required"))?;
                Ok::<_, EngineError>(ProductionItemsQuery {
                    purpose: doc.purpose,
                    company: present(&doc.company).map(str::to_string),
                    work_order: present(&doc.work_order).map(str::to_string),
                    bom_no: bom_no.to_string(),
                    fg_completed_qty: doc.fg_completed_qty,
                    use_multi_level_bom: doc.use_multi_level_bom,
                    from_warehouse: present(&doc.from_warehouse).map(str::to_string),
                    to_warehouse: present(&doc.to_warehouse).map(str::to_string),
                })
            })
            .await?;

        let items = match self.services.manufacturing.production_items(&query).await {
            Ok(items) if items.is_empty() => {
                tracing::debug!(bom_no = %query.bom_no, "no manufacturing rows returned");
                return Ok(());
            }
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(bom_no = %query.bom_no, error = %err, "manufacturing rows lookup failed");
                return Ok(());
            }
        };

        let (tickets, bom_to_load) = {
            let mut guard = form.lock().await;
            let state = &mut *guard;
            if present(&state.doc.bom_no) != Some(query.bom_no.as_str()) {
                tracing::debug!(bom_no = %query.bom_no, "BOM reference changed while fetching rows");
                return Ok(());
            }
            for removed in state.doc.items.drain(..) {
                state.slots.forget_row(removed.id);
            }
            let seeds = items.into_iter().map(RowSeed::from).collect();
            let tickets = self.push_rows(state, seeds, changes)?;
            state.bom_cache.invalidate_if_changed(Some(query.bom_no.as_str()));
            let bom_to_load = state
                .bom_cache
                .needs_load(&query.bom_no)
                .then(|| query.bom_no.clone());
            (tickets, bom_to_load)
        };

        tracing::info!(bom_no = %query.bom_no, rows = tickets.len(), "fetched manufacturing rows");
        if let Some(bom_no) = bom_to_load {
            self.load_bom(form, &bom_no).await;
        }
        self.refresh_rates(form, &tickets, changes).await
    }

    /// Append generated rows and open a rate lookup for each.
    fn push_rows(
        &self,
        state: &mut FormState<StockEntry>,
        seeds: Vec<RowSeed>,
        changes: &mut ChangeSet,
    ) -> EngineResult<Vec<Ticket>> {
        let document_id = state.doc.id;
        let mut tickets = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let row = seed.into_row(document_id, &self.config, changes)?;
            tickets.push(state.slots.open(row.id, SlotKind::Valuation));
            state.doc.items.push(row);
        }
        Ok(tickets)
    }

    async fn refresh_serial_nos(&self, form: &EntryForm, ticket: &Ticket, changes: &mut ChangeSet) {
        let query = form
            .query_current(ticket, |_, row| {
                if row.item_code().is_none() && row.source_location().is_none() && is_blank(row.qty) {
                    return None;
                }
                Some(SerialNoQuery {
                    item_code: row.item_code().map(str::to_string),
                    warehouse: row.source_location().map(str::to_string),
                    stock_qty: row.transfer_qty,
                })
            })
            .await;
        let Some(query) = query else {
            return;
        };

        let serials = match self.services.valuation.serial_nos(&query).await {
            Ok(Some(serials)) if !serials.trim().is_empty() => serials,
            Ok(_) => return,
            Err(err) => {
                tracing::warn!(row_id = %ticket.row_id, slot = %ticket.kind, error = %err, "serial number lookup failed");
                return;
            }
        };
        form.apply_current(ticket, changes, |row, rec| {
            rec.set(&mut row.serial_no, Some(serials), "serial_no");
        })
        .await;
    }

    /// Price a row whose base quantity was just settled under `ticket`.
    async fn price_settled_row(
        &self,
        form: &EntryForm,
        settled: Option<(EngineResult<bool>, Ticket)>,
        changes: &mut ChangeSet,
    ) -> EngineResult<()> {
        match settled {
            Some((Ok(_), valuation)) => self.refresh_rate(form, &valuation, changes).await,
            Some((Err(err), _)) => Err(err),
            None => Ok(()),
        }
    }

    async fn refresh_rates(&self, form: &EntryForm, tickets: &[Ticket], changes: &mut ChangeSet) -> EngineResult<()> {
        for ticket in tickets {
            self.refresh_rate(form, ticket, changes).await?;
        }
        Ok(())
    }

    async fn refresh_rate(&self, form: &EntryForm, ticket: &Ticket, changes: &mut ChangeSet) -> EngineResult<()> {
        let query = form
            .query_current(ticket, |doc, row| {
                if row.item_code().is_none() && present(&row.serial_no).is_none() {
                    return None;
                }
                Some(rate_query(doc, row))
            })
            .await;
        let Some(query) = query else {
            return Ok(());
        };

        match self.services.valuation.incoming_rate(&query).await {
            Ok(Some(rate)) => form
                .apply_current(ticket, changes, |row, rec| {
                    recompute::apply_rate(row, rate, &self.config, rec)
                })
                .await
                .unwrap_or(Ok(())),
            Ok(None) => {
                tracing::debug!(row_id = %ticket.row_id, item_code = ?query.item_code, "no incoming rate");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(row_id = %ticket.row_id, item_code = ?query.item_code, error = %err, "rate lookup failed");
                Ok(())
            }
        }
    }

    async fn refresh_location_details(
        &self,
        form: &EntryForm,
        ticket: &Ticket,
        changes: &mut ChangeSet,
    ) -> EngineResult<()> {
        let query = form
            .query_current(ticket, |doc, row| Some(rate_query(doc, row)))
            .await;
        let Some(query) = query else {
            return Ok(());
        };

        match self.services.valuation.location_details(&query).await {
            Ok(Some(details)) => form
                .apply_current(ticket, changes, |row, rec| {
                    if let Some(actual_qty) = details.actual_qty {
                        rec.set(&mut row.actual_qty, self.config.round_qty(actual_qty), "actual_qty");
                    }
                    match details.basic_rate {
                        Some(rate) => recompute::apply_rate(row, rate, &self.config, rec),
                        None => Ok(()),
                    }
                })
                .await
                .unwrap_or(Ok(())),
            Ok(None) => {
                tracing::debug!(row_id = %ticket.row_id, warehouse = ?query.warehouse, "no location details");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(row_id = %ticket.row_id, warehouse = ?query.warehouse, error = %err, "location details lookup failed");
                Ok(())
            }
        }
    }

    async fn load_bom(&self, form: &EntryForm, bom_no: &str) {
        match self.services.bom.bom(bom_no).await {
            Ok(Some(bom)) => {
                let mut guard = form.lock().await;
                let state = &mut *guard;
                if present(&state.doc.bom_no) == Some(bom_no) {
                    state.bom_cache.store(bom);
                } else {
                    tracing::debug!(bom_no, "BOM reference changed while loading");
                }
            }
            Ok(None) => tracing::debug!(bom_no, "BOM not found"),
            Err(err) => tracing::warn!(bom_no, error = %err, "BOM lookup failed"),
        }
    }

    fn selection_request(&self, purpose: StockEntryPurpose, row: &StockEntryRow) -> Option<SelectionRequest> {
        if self.config.hide_serial_batch_selector || purpose == StockEntryPurpose::MaterialReceipt {
            return None;
        }
        if !(row.has_batch_no || row.has_serial_no) || !row.lacks_batch_or_serial() {
            return None;
        }
        let item_code = row.item_code()?;
        let (warehouse_kind, warehouse) = match row.source_location() {
            Some(warehouse) => (WarehouseKind::Source, Some(warehouse)),
            None => (WarehouseKind::Target, row.target_location()),
        };
        Some(SelectionRequest {
            row_id: row.id,
            item_code: item_code.to_string(),
            warehouse_kind,
            warehouse: warehouse.map(str::to_string),
            qty: row.qty,
            has_batch_no: row.has_batch_no,
            has_serial_no: row.has_serial_no,
        })
    }

    fn refresh_totals(&self, doc: &mut StockEntry, changes: &mut ChangeSet) -> EngineResult<()> {
        let total = recompute::total(doc.additional_costs.iter().map(|c| c.base_amount), &self.config)?;
        Recorder::header(doc.id, changes).set(
            &mut doc.total_additional_costs,
            total,
            "total_additional_costs",
        );
        Ok(())
    }

    fn publish(&self, changes: &ChangeSet) {
        if let Some(publisher) = &self.publisher {
            for change in changes.iter() {
                publisher.publish_lossy(change.clone());
            }
        }
    }

    fn finish(&self, changes: ChangeSet) -> ChangeSet {
        self.publish(&changes);
        changes
    }

    /// Publish what was written, then report how the operation ended.
    fn conclude(&self, changes: ChangeSet, outcome: EngineResult<()>) -> EngineResult<ChangeSet> {
        self.publish(&changes);
        outcome.map(|()| changes)
    }
}

/// Starting values of a generated row.
struct RowSeed {
    item_code: String,
    item_name: Option<String>,
    item_group: Option<String>,
    stock_uom: Option<String>,
    conversion_factor: Option<Decimal>,
    qty: Decimal,
    s_warehouse: Option<String>,
    t_warehouse: Option<String>,
    bom_no: Option<String>,
    expense_account: Option<String>,
    cost_center: Option<String>,
    project: Option<String>,
}

impl RowSeed {
    fn from_bom(item: BomItem, query: &BomItemsQuery) -> Self {
        Self {
            item_code: item.item_code,
            item_name: item.item_name,
            item_group: item.item_group,
            stock_uom: item.stock_uom,
            conversion_factor: item.conversion_factor,
            qty: item.qty,
            s_warehouse: query.source_warehouse.clone(),
            t_warehouse: query.target_warehouse.clone(),
            bom_no: None,
            expense_account: item.expense_account,
            cost_center: None,
            project: item.project,
        }
    }

    fn into_row(
        self,
        document_id: DocumentId,
        config: &EngineConfig,
        changes: &mut ChangeSet,
    ) -> EngineResult<StockEntryRow> {
        let mut row = StockEntryRow::new();
        let mut rec = Recorder::row(document_id, row.id, changes);
        let conversion_factor = self
            .conversion_factor
            .filter(|factor| !is_blank(*factor))
            .unwrap_or(Decimal::ONE);
        rec.set(&mut row.item_code, Some(self.item_code), "item_code");
        rec.set(&mut row.item_name, self.item_name, "item_name");
        rec.set(&mut row.item_group, self.item_group, "item_group");
        rec.set(&mut row.s_warehouse, self.s_warehouse, "s_warehouse");
        rec.set(&mut row.t_warehouse, self.t_warehouse, "t_warehouse");
        rec.set(&mut row.uom, self.stock_uom.clone(), "uom");
        rec.set(&mut row.stock_uom, self.stock_uom, "stock_uom");
        rec.set(&mut row.conversion_factor, conversion_factor, "conversion_factor");
        rec.set(&mut row.qty, config.round_qty(self.qty), "qty");
        rec.set(&mut row.bom_no, self.bom_no, "bom_no");
        rec.set(&mut row.expense_account, self.expense_account, "expense_account");
        rec.set(&mut row.cost_center, self.cost_center, "cost_center");
        rec.set(&mut row.project, self.project, "project");
        recompute::refresh_transfer_qty(&mut row, config, &mut rec)?;
        Ok(row)
    }
}

impl From<ProductionItem> for RowSeed {
    fn from(item: ProductionItem) -> Self {
        Self {
            item_code: item.item_code,
            item_name: item.item_name,
            item_group: None,
            stock_uom: item.stock_uom,
            conversion_factor: None,
            qty: item.qty,
            s_warehouse: item.s_warehouse,
            t_warehouse: item.t_warehouse,
            bom_no: item.bom_no,
            expense_account: item.expense_account,
            cost_center: item.cost_center,
            project: None,
        }
    }
}

fn rate_query(doc: &StockEntry, row: &StockEntryRow) -> RateQuery {
    let context = doc.valuation_context();
    RateQuery {
        item_code: row.item_code().map(str::to_string),
        warehouse: row.location().map(str::to_string),
        batch_no: present(&row.batch_no).map(str::to_string),
        serial_no: present(&row.serial_no).map(str::to_string),
        company: context.company,
        posting_date: context.posting.date,
        posting_time: context.posting.time,
        qty: row.signed_qty(row.transfer_qty),
        voucher: VoucherRef {
            voucher_type: context.voucher_type.to_string(),
            voucher_no: row.id,
        },
        allow_zero_valuation: true,
    }
}

fn apply_selection(
    row: &mut StockEntryRow,
    selection: BatchSerialSelection,
    config: &EngineConfig,
    rec: &mut Recorder<'_>,
) {
    if let Some(batch_no) = selection.batch_no.filter(|b| !b.trim().is_empty()) {
        rec.set(&mut row.batch_no, Some(batch_no), "batch_no");
    }
    if !selection.serial_nos.is_empty() {
        rec.set(&mut row.serial_no, Some(selection.serial_nos.join("\n")), "serial_no");
    }
    if let Some(qty) = selection.qty {
        rec.set(&mut row.qty, config.round_qty(qty), "qty");
    }
}

/// Clear header fields that do not apply to the new purpose.
fn reset_purpose_fields(doc: &mut StockEntry, rec: &mut Recorder<'_>) {
    rec.set(&mut doc.customer, None, "customer");
    rec.set(&mut doc.customer_name, None, "customer_name");
    rec.set(&mut doc.customer_address, None, "customer_address");
    rec.set(&mut doc.delivery_note_no, None, "delivery_note_no");
    rec.set(&mut doc.sales_invoice_no, None, "sales_invoice_no");
    if doc.purpose != StockEntryPurpose::SendToSubcontractor {
        rec.set(&mut doc.supplier, None, "supplier");
        rec.set(&mut doc.supplier_name, None, "supplier_name");
        rec.set(&mut doc.supplier_address, None, "supplier_address");
        rec.set(&mut doc.purchase_receipt_no, None, "purchase_receipt_no");
        rec.set(&mut doc.address_display, None, "address_display");
    }
    if doc.purpose == StockEntryPurpose::MaterialReceipt {
        rec.set(&mut doc.from_bom, false, "from_bom");
    }
}
