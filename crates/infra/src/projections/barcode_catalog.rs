use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use stocktake_core::BranchId;
use stocktake_events::EventEnvelope;
use stocktake_products::ProductId;
use stocktake_receiving::{GoodsReceiptId, ReceiptEvent};
use stocktake_serials::{PrintableLabel, SerialNumber, expand_for_printing};
use stocktake_stock::StockUnitId;

use super::RECEIPT_AGGREGATE;
use super::cursors::{CursorCheck, CursorError, StreamCursors};
use crate::read_model::BranchStore;

/// One barcode catalog row: the serial-to-unit mapping plus print state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRow {
    pub serial: SerialNumber,
    pub unit_id: StockUnitId,
    pub product_id: ProductId,
    pub receipt_id: GoodsReceiptId,
    pub printed: bool,
    pub printed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum BarcodeCatalogProjectionError {
    #[error("failed to deserialize receipt event: {0}")]
    Deserialize(String),

    #[error("branch isolation violation: {0}")]
    BranchIsolation(String),

    #[error(transparent)]
    Cursor(#[from] CursorError),
}

/// Barcode catalog projection.
///
/// Resolves scanned codes back to stock units and answers which labels of a
/// receipt still need printing. Rows appear when a receipt posts and flip to
/// printed when the print is acknowledged.
pub struct BarcodeCatalogProjection<S>
where
    S: BranchStore<SerialNumber, CatalogRow>,
{
    store: S,
    cursors: StreamCursors,
    /// Serial -> issuing branch. Serials are drawn from one
    /// installation-global numbering space, so a scanned code must resolve
    /// even when the unit was issued to another branch.
    issued_by: RwLock<HashMap<SerialNumber, BranchId>>,
}

impl<S> BarcodeCatalogProjection<S>
where
    S: BranchStore<SerialNumber, CatalogRow>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: StreamCursors::new(),
            issued_by: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a serial to its catalog row, if the serial is known.
    pub fn resolve(&self, branch_id: BranchId, serial: SerialNumber) -> Option<CatalogRow> {
        self.store.get(branch_id, &serial)
    }

    /// Resolve a serial across all branches.
    ///
    /// Branch-scoped reads stay partitioned; this lookup exists for scan
    /// ingestion, where a code issued to another branch is a real unit out
    /// of scope (the audit records it as unexpected), not an unknown code.
    pub fn resolve_anywhere(&self, serial: SerialNumber) -> Option<(BranchId, CatalogRow)> {
        let branch_id = *self.issued_by.read().ok()?.get(&serial)?;
        let row = self.store.get(branch_id, &serial)?;
        Some((branch_id, row))
    }

    /// All catalog rows of one receipt, in serial order.
    pub fn list_for_receipt(
        &self,
        branch_id: BranchId,
        receipt_id: GoodsReceiptId,
    ) -> Vec<CatalogRow> {
        let mut rows: Vec<CatalogRow> = self
            .store
            .list(branch_id)
            .into_iter()
            .filter(|r| r.receipt_id == receipt_id)
            .collect();
        rows.sort_by_key(|r| r.serial);
        rows
    }

    /// Printable labels for a receipt, `copies` per serial.
    pub fn labels_for_receipt(
        &self,
        branch_id: BranchId,
        receipt_id: GoodsReceiptId,
        copies: u32,
    ) -> Vec<PrintableLabel> {
        let serials: Vec<SerialNumber> = self
            .list_for_receipt(branch_id, receipt_id)
            .into_iter()
            .map(|r| r.serial)
            .collect();
        expand_for_printing(serials, copies)
    }

    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), BarcodeCatalogProjectionError> {
        if envelope.aggregate_type() != RECEIPT_AGGREGATE {
            return Ok(());
        }

        let branch_id = envelope.branch_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        match self.cursors.check(branch_id, aggregate_id, seq)? {
            CursorCheck::Duplicate => return Ok(()),
            CursorCheck::Apply => {}
        }

        let event: ReceiptEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| BarcodeCatalogProjectionError::Deserialize(e.to_string()))?;

        match &event {
            ReceiptEvent::ReceiptPosted(posted) => {
                if posted.branch_id != branch_id {
                    return Err(BarcodeCatalogProjectionError::BranchIsolation(
                        "event branch_id does not match envelope branch_id".to_string(),
                    ));
                }
                for issued in &posted.issued {
                    self.store.upsert(
                        branch_id,
                        issued.serial,
                        CatalogRow {
                            serial: issued.serial,
                            unit_id: issued.unit_id,
                            product_id: issued.product_id,
                            receipt_id: posted.receipt_id,
                            printed: false,
                            printed_at: None,
                        },
                    );
                }
                // If the lock is poisoned, the global lookup degrades to
                // branch-local resolution until the process restarts.
                if let Ok(mut issued_by) = self.issued_by.write() {
                    for issued in &posted.issued {
                        issued_by.insert(issued.serial, branch_id);
                    }
                }
            }
            ReceiptEvent::LabelsPrinted(printed) => {
                for serial in &printed.serials {
                    if let Some(mut row) = self.store.get(branch_id, serial) {
                        row.printed = true;
                        row.printed_at = Some(printed.occurred_at);
                        self.store.upsert(branch_id, *serial, row);
                    }
                }
            }
            // Draft bookkeeping does not reach the catalog.
            ReceiptEvent::ReceiptCreated(_) | ReceiptEvent::ReceiptLineAdded(_) => {}
        }

        self.cursors.advance(branch_id, aggregate_id, seq);
        Ok(())
    }
}
