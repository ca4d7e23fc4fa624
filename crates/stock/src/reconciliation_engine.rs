//! Recomputation rules of the stock reconciliation form.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockline_core::{DocumentId, RowId};
use stockline_events::{FieldChanged, Publisher};

use crate::capabilities::{HasLineItems, LineItem, SupportsValuation};
use crate::changes::{ChangeSet, Recorder};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::form::Form;
use crate::reconciliation::{ReconciliationPurpose, ReconciliationRow, StockReconciliation};
use crate::recompute;
use crate::services::{BalanceQuery, StockServices, WarehouseItem, WarehouseItemsQuery};
use crate::slots::{SlotKind, Ticket};
use crate::value::present;

pub type ReconciliationForm = Form<StockReconciliation>;

/// Items to pull into the table from one warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FetchItemsRequest {
    pub warehouse: Option<String>,
    pub item_group: Option<String>,
    /// Skip items with no stock at the posting instant.
    pub ignore_empty_stock: bool,
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    services: StockServices,
    config: EngineConfig,
    publisher: Option<Arc<dyn Publisher<FieldChanged>>>,
}

impl core::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("config", &self.config)
            .field("publishes", &self.publisher.is_some())
            .finish_non_exhaustive()
    }
}

impl ReconciliationEngine {
    pub fn new(services: StockServices, config: EngineConfig) -> Self {
        Self {
            services,
            config,
            publisher: None,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher<FieldChanged>>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn on_item_changed(&self, form: &ReconciliationForm, row_id: RowId) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let outcome = self.location_chain(form, row_id, &mut changes).await;
        self.conclude(changes, outcome)
    }

    pub async fn on_location_changed(
        &self,
        form: &ReconciliationForm,
        row_id: RowId,
    ) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let outcome = self.location_chain(form, row_id, &mut changes).await;
        self.conclude(changes, outcome)
    }

    pub async fn on_batch_changed(&self, form: &ReconciliationForm, row_id: RowId) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let ticket = self.open_balance(form, row_id).await?;
        let outcome = self.refresh_balance(form, &ticket, &mut changes).await;
        self.conclude(changes, outcome)
    }

    /// Shrinkage entered: `qty = current_qty - quantity_difference`.
    ///
    /// Only applies once the row has both a quantity and a valuation rate.
    pub async fn on_difference_delta_changed(
        &self,
        form: &ReconciliationForm,
        row_id: RowId,
    ) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let outcome = self
            .edit_row(form, row_id, &mut changes, |row, rec| {
                if row.qty.is_zero() || row.valuation_rate.is_zero() {
                    tracing::debug!(row_id = %row_id, "quantity or rate missing, delta ignored");
                    return Ok(false);
                }
                let qty = recompute::qty_from_delta(row.current_qty, row.quantity_difference, &self.config)?;
                rec.set(&mut row.qty, qty, "qty");
                recompute::refresh_reconciliation_amounts(row, &self.config, rec)?;
                Ok(true)
            })
            .await;
        self.conclude(changes, outcome)
    }

    pub async fn on_valuation_rate_changed(
        &self,
        form: &ReconciliationForm,
        row_id: RowId,
    ) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let outcome = self
            .edit_row(form, row_id, &mut changes, |row, rec| {
                let rate = self.config.round_rate(row.valuation_rate);
                rec.set(&mut row.valuation_rate, rate, "valuation_rate");
                recompute::refresh_reconciliation_amounts(row, &self.config, rec)?;
                Ok(true)
            })
            .await;
        self.conclude(changes, outcome)
    }

    /// Serial numbers entered: one unit per serial number.
    pub async fn on_serial_no_changed(
        &self,
        form: &ReconciliationForm,
        row_id: RowId,
    ) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let outcome = self
            .edit_row(form, row_id, &mut changes, |row, rec| {
                let count = row.serial_numbers().len();
                if count == 0 {
                    return Ok(false);
                }
                rec.set(&mut row.qty, Decimal::from(count), "qty");
                recompute::refresh_reconciliation_amounts(row, &self.config, rec)?;
                Ok(true)
            })
            .await;
        self.conclude(changes, outcome)
    }

    pub async fn on_row_added(&self, form: &ReconciliationForm, row_id: RowId) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        {
            let mut guard = form.lock().await;
            let doc = &mut guard.doc;
            let document_id = doc.id;
            let default_warehouse = present(&doc.set_warehouse).map(str::to_string);
            let row = doc.row_mut(row_id).ok_or(EngineError::RowNotFound(row_id))?;
            if row.warehouse().is_none() && default_warehouse.is_some() {
                Recorder::row(document_id, row_id, &mut changes).set(
                    &mut row.warehouse,
                    default_warehouse,
                    "warehouse",
                );
            }
        }
        Ok(self.finish(changes))
    }

    /// Header default warehouse edited: copied into every row, then each
    /// moved row is refreshed.
    pub async fn on_set_warehouse_changed(&self, form: &ReconciliationForm) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let moved = {
            let mut guard = form.lock().await;
            let doc = &mut guard.doc;
            let document_id = doc.id;
            let header = present(&doc.set_warehouse).map(str::to_string);
            match header {
                Some(warehouse) => doc
                    .items
                    .iter_mut()
                    .filter_map(|row| {
                        Recorder::row(document_id, row.id, &mut changes)
                            .set(&mut row.warehouse, Some(warehouse.clone()), "warehouse")
                            .then_some(row.id)
                    })
                    .collect(),
                None => Vec::new(),
            }
        };

        for row_id in moved {
            match self.location_chain(form, row_id, &mut changes).await {
                Ok(()) | Err(EngineError::RowNotFound(_)) => {}
                Err(err) => return self.conclude(changes, Err(err)),
            }
        }
        Ok(self.finish(changes))
    }

    /// Posting date or time edited: every row's snapshot is refetched.
    pub async fn on_posting_time_changed(&self, form: &ReconciliationForm) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let tickets: Vec<Ticket> = {
            let mut guard = form.lock().await;
            let state = &mut *guard;
            state
                .doc
                .row_ids()
                .into_iter()
                .map(|row_id| state.slots.open(row_id, SlotKind::Balance))
                .collect()
        };
        for ticket in &tickets {
            if let Err(err) = self.refresh_balance(form, ticket, &mut changes).await {
                return self.conclude(changes, Err(err));
            }
        }
        Ok(self.finish(changes))
    }

    /// Replace the table with the items held at a warehouse.
    ///
    /// An empty or failed answer leaves the table as it was.
    pub async fn fetch_items(
        &self,
        form: &ReconciliationForm,
        request: FetchItemsRequest,
    ) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let warehouse = present(&request.warehouse)
            .ok_or_else(|| EngineError::validation("Warehouse is required to fetch items"))?
            .to_string();
        let (document_id, query) = form
            .read(|doc| {
                let context = doc.valuation_context();
                let query = WarehouseItemsQuery {
                    warehouse: warehouse.clone(),
                    company: context.company,
                    posting_date: context.posting.date,
                    posting_time: context.posting.time,
                    item_group: present(&request.item_group).map(str::to_string),
                    ignore_empty_stock: request.ignore_empty_stock,
                };
                (doc.id, query)
            })
            .await;

        let items = match self.services.balance.warehouse_items(&query).await {
            Ok(items) if items.is_empty() => {
                tracing::debug!(warehouse = %warehouse, "no items to fetch");
                return Ok(changes);
            }
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(warehouse = %warehouse, error = %err, "warehouse item fetch failed");
                return Ok(changes);
            }
        };

        // Rows are built off the document so a failure leaves the table untouched.
        let rows = items
            .into_iter()
            .map(|item| self.seed_row(document_id, item, &mut changes))
            .collect::<EngineResult<Vec<_>>>()?;

        let mut guard = form.lock().await;
        let state = &mut *guard;
        for old in state.doc.items.drain(..) {
            state.slots.forget_row(old.id);
        }
        state.doc.items.extend(rows);
        tracing::info!(warehouse = %warehouse, rows = state.doc.items.len(), "fetched warehouse items");
        let outcome = self.refresh_totals(&mut state.doc, &mut changes);
        drop(guard);
        self.conclude(changes, outcome)
    }

    pub async fn on_purpose_changed(&self, form: &ReconciliationForm) -> EngineResult<ChangeSet> {
        self.refresh_difference_account(form).await
    }

    /// With perpetual inventory, the purpose's difference account becomes the
    /// header expense account.
    pub async fn refresh_difference_account(&self, form: &ReconciliationForm) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let (company, purpose) = form
            .read(|doc| (doc.company().map(str::to_string), doc.purpose))
            .await;
        let Some(company) = company else {
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

        let account = match self.services.settings.difference_account(purpose, &company).await {
            Ok(Some(account)) => account,
            Ok(None) => return Ok(changes),
            Err(err) => {
                tracing::warn!(company = %company, purpose = %purpose, error = %err, "difference account lookup failed");
                return Ok(changes);
            }
        };

        {
            let mut guard = form.lock().await;
            let doc = &mut guard.doc;
            if doc.purpose == purpose && doc.company() == Some(company.as_str()) {
                let document_id = doc.id;
                Recorder::header(document_id, &mut changes).set(
                    &mut doc.expense_account,
                    Some(account),
                    "expense_account",
                );
            }
        }
        Ok(self.finish(changes))
    }

    pub async fn recompute_document_totals(&self, form: &ReconciliationForm) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        let outcome = {
            let mut guard = form.lock().await;
            self.refresh_totals(&mut guard.doc, &mut changes)
        };
        self.conclude(changes, outcome)
    }

    /// Item or warehouse edited: drop the batch (outside scan mode), then refresh.
    async fn location_chain(
        &self,
        form: &ReconciliationForm,
        row_id: RowId,
        changes: &mut ChangeSet,
    ) -> EngineResult<()> {
        let ticket = {
            let mut guard = form.lock().await;
            let state = &mut *guard;
            let document_id = state.doc.id;
            let scan_mode = state.doc.scan_mode;
            let row = state
                .doc
                .row_mut(row_id)
                .ok_or(EngineError::RowNotFound(row_id))?;
            if !scan_mode && present(&row.batch_no).is_some() {
                Recorder::row(document_id, row_id, changes).set(&mut row.batch_no, None, "batch_no");
            }
            state.slots.open(row_id, SlotKind::Balance)
        };
        self.refresh_balance(form, &ticket, changes).await
    }

    async fn open_balance(&self, form: &ReconciliationForm, row_id: RowId) -> EngineResult<Ticket> {
        let mut guard = form.lock().await;
        let state = &mut *guard;
        state.doc.row(row_id).ok_or(EngineError::RowNotFound(row_id))?;
        Ok(state.slots.open(row_id, SlotKind::Balance))
    }

    /// Synchronous edit of one row; the header total follows when `edit`
    /// reports that it touched the row.
    async fn edit_row(
        &self,
        form: &ReconciliationForm,
        row_id: RowId,
        changes: &mut ChangeSet,
        edit: impl FnOnce(&mut ReconciliationRow, &mut Recorder<'_>) -> EngineResult<bool>,
    ) -> EngineResult<()> {
        let mut guard = form.lock().await;
        let doc = &mut guard.doc;
        let document_id = doc.id;
        let row = doc.row_mut(row_id).ok_or(EngineError::RowNotFound(row_id))?;
        if edit(row, &mut Recorder::row(document_id, row_id, changes))? {
            self.refresh_totals(doc, changes)?;
        }
        Ok(())
    }

    /// Copy the booked stock at the posting instant into the row.
    async fn refresh_balance(
        &self,
        form: &ReconciliationForm,
        ticket: &Ticket,
        changes: &mut ChangeSet,
    ) -> EngineResult<()> {
        let request = form
            .query_current(ticket, |doc, row| {
                let (Some(item_code), Some(warehouse)) = (row.item_code(), row.warehouse()) else {
                    tracing::debug!(row_id = %row.id, "item or warehouse missing, balance not fetched");
                    return None;
                };
                let query = BalanceQuery {
                    item_code: item_code.to_string(),
                    warehouse: warehouse.to_string(),
                    posting_date: doc.posting_date,
                    posting_time: doc.posting_time,
                    batch_no: present(&row.batch_no).map(str::to_string),
                };
                Some((query, doc.scan_mode, doc.purpose))
            })
            .await;
        let Some((query, scan_mode, purpose)) = request else {
            return Ok(());
        };

        let balance = match self.services.balance.stock_balance(&query).await {
            Ok(Some(balance)) => balance,
            Ok(None) => {
                tracing::debug!(row_id = %ticket.row_id, item_code = %query.item_code, "no stock balance");
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(row_id = %ticket.row_id, item_code = %query.item_code, error = %err, "stock balance lookup failed");
                return Ok(());
            }
        };

        let applied = form
            .apply_current(ticket, changes, |row, rec| {
                let qty = self.config.round_qty(balance.qty);
                let rate = self.config.round_rate(balance.rate);
                let current_amount = recompute::amount(qty, rate, &self.config)?;
                if !scan_mode {
                    rec.set(&mut row.qty, qty, "qty");
                }
                rec.set(&mut row.valuation_rate, rate, "valuation_rate");
                rec.set(&mut row.current_qty, qty, "current_qty");
                rec.set(&mut row.current_valuation_rate, rate, "current_valuation_rate");
                rec.set(&mut row.current_amount, current_amount, "current_amount");
                rec.set(&mut row.current_serial_no, balance.serial_nos.clone(), "current_serial_no");
                if purpose == ReconciliationPurpose::StockReconciliation && !scan_mode {
                    rec.set(&mut row.serial_no, balance.serial_nos, "serial_no");
                }
                recompute::refresh_reconciliation_amounts(row, &self.config, rec)
            })
            .await;

        match applied {
            Some(outcome) => {
                outcome?;
                let mut guard = form.lock().await;
                self.refresh_totals(&mut guard.doc, changes)
            }
            None => Ok(()),
        }
    }

    /// A fetched warehouse item as a new, fully computed row.
    fn seed_row(
        &self,
        document_id: DocumentId,
        item: WarehouseItem,
        changes: &mut ChangeSet,
    ) -> EngineResult<ReconciliationRow> {
        let mut row = ReconciliationRow::new();
        let qty = self.config.round_qty(item.qty.unwrap_or_default());
        let rate = self.config.round_rate(item.valuation_rate.unwrap_or_default());
        let current_qty = self.config.round_qty(item.current_qty.unwrap_or_default());
        let current_rate = self
            .config
            .round_rate(item.current_valuation_rate.unwrap_or_default());
        let current_amount = recompute::amount(current_qty, current_rate, &self.config)?;

        let mut rec = Recorder::row(document_id, row.id, changes);
        rec.set(&mut row.item_code, Some(item.item_code), "item_code");
        rec.set(&mut row.item_name, item.item_name, "item_name");
        rec.set(&mut row.warehouse, Some(item.warehouse), "warehouse");
        rec.set(&mut row.batch_no, item.batch_no, "batch_no");
        rec.set(&mut row.qty, qty, "qty");
        rec.set(&mut row.valuation_rate, rate, "valuation_rate");
        rec.set(&mut row.current_qty, current_qty, "current_qty");
        rec.set(&mut row.current_valuation_rate, current_rate, "current_valuation_rate");
        rec.set(&mut row.current_amount, current_amount, "current_amount");
        recompute::refresh_reconciliation_amounts(&mut row, &self.config, &mut rec)?;
        Ok(row)
    }

    fn refresh_totals(&self, doc: &mut StockReconciliation, changes: &mut ChangeSet) -> EngineResult<()> {
        let total = recompute::total(doc.items.iter().map(|r| r.amount_difference), &self.config)?;
        Recorder::header(doc.id, changes).set(&mut doc.difference_amount, total, "difference_amount");
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
