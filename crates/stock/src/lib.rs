//! `stockline-stock`: line-item recomputation for stock documents.
//!
//! Two documents are supported: stock entries (material moved between
//! warehouses, optionally through manufacturing) and stock reconciliations
//! (counted stock compared against the books). Each has an engine reacting to
//! field edits on a shared [`Form`]: derived fields are recomputed, external
//! lookups go through the collaborator traits in [`services`], and every
//! actual write is reported in a [`ChangeSet`].

pub mod bom_cache;
pub mod capabilities;
pub mod changes;
pub mod config;
pub mod entry;
pub mod entry_engine;
pub mod error;
pub mod form;
pub mod in_memory;
pub mod layout;
pub mod recompute;
pub mod reconciliation;
pub mod reconciliation_engine;
pub mod services;
pub mod slots;

mod value;

pub use capabilities::{
    HasLineItems, HasRowLocations, LineItem, PostingInstant, SupportsValuation, ValuationContext,
};
pub use changes::{ChangeSet, Recorder};
pub use config::{EngineConfig, PrecisionConfig};
pub use entry::{AdditionalCost, StockEntry, StockEntryPurpose, StockEntryRow};
pub use entry_engine::{BatchQuery, EntryForm, RowAccount, StockEntryEngine};
pub use error::{EngineError, EngineResult, ServiceError, ServiceResult};
pub use form::{Form, FormState};
pub use in_memory::{CallKind, InMemoryStockServices, ServiceCall};
pub use layout::{RowIndicator, StockEntryLayout, row_indicator};
pub use reconciliation::{ReconciliationPurpose, ReconciliationRow, StockReconciliation};
pub use reconciliation_engine::{FetchItemsRequest, ReconciliationEngine, ReconciliationForm};
pub use services::StockServices;
pub use slots::{RequestSlots, SlotKind, Ticket};
