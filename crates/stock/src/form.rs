//! Shared handle to a document being edited.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use stockline_core::RowId;

use crate::bom_cache::BomCache;
use crate::capabilities::HasLineItems;
use crate::changes::{ChangeSet, Recorder};
use crate::slots::{RequestSlots, SlotKind, Ticket};

/// Document plus the per-form state the engines keep beside it.
#[derive(Debug)]
pub struct FormState<D> {
    pub doc: D,
    pub(crate) slots: RequestSlots,
    pub(crate) bom_cache: BomCache,
}

/// Cheaply cloneable handle to one open document.
///
/// Engine operations lock the form only between service calls, so several
/// operations on the same form may be in flight at once.
#[derive(Debug)]
pub struct Form<D> {
    inner: Arc<Mutex<FormState<D>>>,
}

impl<D> Clone for Form<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D> Form<D> {
    pub fn new(doc: D) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FormState {
                doc,
                slots: RequestSlots::new(),
                bom_cache: BomCache::new(),
            })),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, FormState<D>> {
        self.inner.lock().await
    }

    /// Run a read-only closure against the document.
    pub async fn read<R>(&self, f: impl FnOnce(&D) -> R) -> R {
        let state = self.inner.lock().await;
        f(&state.doc)
    }

    /// Mutate the document directly, bypassing the engines (user typing into a field).
    pub async fn edit<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        let mut state = self.inner.lock().await;
        f(&mut state.doc)
    }
}

impl<D: HasLineItems> Form<D> {
    /// Build a request from the ticket's row, unless the ticket was superseded
    /// or the row removed before the request could be issued.
    pub(crate) async fn query_current<R>(
        &self,
        ticket: &Ticket,
        build: impl FnOnce(&D, &D::Row) -> Option<R>,
    ) -> Option<R> {
        let state = self.inner.lock().await;
        if !state.slots.is_current(ticket) {
            tracing::debug!(row_id = %ticket.row_id, slot = %ticket.kind, "request superseded before issue");
            return None;
        }
        let row = state.doc.row(ticket.row_id)?;
        build(&state.doc, row)
    }

    /// Apply a response to the ticket's row.
    ///
    /// Returns `None` when the response is stale or the row is gone; nothing
    /// is written in that case.
    pub(crate) async fn apply_current<R>(
        &self,
        ticket: &Ticket,
        changes: &mut ChangeSet,
        apply: impl FnOnce(&mut D::Row, &mut Recorder<'_>) -> R,
    ) -> Option<R> {
        let mut guard = self.inner.lock().await;
        apply_locked(&mut guard, ticket, changes, apply)
    }

    /// Apply a response, then open the `next` slot of the same row before the
    /// form is released.
    ///
    /// A follow-up request issued this way supersedes anything opened while
    /// the response was in flight, and is itself superseded by later edits.
    pub(crate) async fn apply_then_open<R>(
        &self,
        ticket: &Ticket,
        next: SlotKind,
        changes: &mut ChangeSet,
        apply: impl FnOnce(&mut D::Row, &mut Recorder<'_>) -> R,
    ) -> Option<(R, Ticket)> {
        let mut guard = self.inner.lock().await;
        let applied = apply_locked(&mut guard, ticket, changes, apply)?;
        Some((applied, guard.slots.open(ticket.row_id, next)))
    }

    /// Remove a row together with its request slots, so responses still in
    /// flight for it are dropped.
    pub async fn remove_row(&self, row_id: RowId) -> Option<D::Row> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let removed = state.doc.remove_row(row_id)?;
        state.slots.forget_row(row_id);
        Some(removed)
    }
}

fn apply_locked<D: HasLineItems, R>(
    state: &mut FormState<D>,
    ticket: &Ticket,
    changes: &mut ChangeSet,
    apply: impl FnOnce(&mut D::Row, &mut Recorder<'_>) -> R,
) -> Option<R> {
    if !state.slots.is_current(ticket) {
        tracing::debug!(row_id = %ticket.row_id, slot = %ticket.kind, "discarding stale response");
        return None;
    }
    let document_id = state.doc.document_id();
    let Some(row) = state.doc.row_mut(ticket.row_id) else {
        tracing::debug!(row_id = %ticket.row_id, slot = %ticket.kind, "row removed before response");
        return None;
    };
    let mut rec = Recorder::row(document_id, ticket.row_id, changes);
    Some(apply(row, &mut rec))
}

impl<D: Clone> Form<D> {
    pub async fn snapshot(&self) -> D {
        self.inner.lock().await.doc.clone()
    }
}
