use serde_json::Value as JsonValue;
use thiserror::Error;

use stocktake_audit::{ResolutionStrategy, SessionEvent};
use stocktake_core::{BranchId, DomainError};
use stocktake_events::EventEnvelope;
use stocktake_receiving::ReceiptEvent;
use stocktake_serials::SerialNumber;
use stocktake_stock::{StatusChangeReason, StockStatus, StockUnit, StockUnitId};

use super::cursors::{CursorCheck, CursorError, StreamCursors};
use super::{AUDIT_AGGREGATE, RECEIPT_AGGREGATE};
use crate::read_model::BranchStore;

#[derive(Debug, Error)]
pub enum StockUnitsProjectionError {
    #[error("failed to deserialize event: {0}")]
    Deserialize(String),

    #[error("branch isolation violation: {0}")]
    BranchIsolation(String),

    #[error("stock transition rejected: {0}")]
    Stock(DomainError),

    #[error(transparent)]
    Cursor(#[from] CursorError),
}

/// Stock units projection: one `StockUnit` row per issued serial.
///
/// Consumes two stream types. Receipt posts materialize units in stock;
/// audit confirmations apply the resolution to every unit that went
/// unaccounted for, per the strategy carried in the event.
pub struct StockUnitsProjection<S>
where
    S: BranchStore<StockUnitId, StockUnit>,
{
    store: S,
    cursors: StreamCursors,
}

impl<S> StockUnitsProjection<S>
where
    S: BranchStore<StockUnitId, StockUnit>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: StreamCursors::new(),
        }
    }

    pub fn get(&self, branch_id: BranchId, unit_id: &StockUnitId) -> Option<StockUnit> {
        self.store.get(branch_id, unit_id)
    }

    /// All units of a branch, in serial order.
    pub fn list(&self, branch_id: BranchId) -> Vec<StockUnit> {
        let mut units = self.store.list(branch_id);
        units.sort_by_key(|u| u.serial);
        units
    }

    /// Units that should physically be on the shelf, in serial order.
    ///
    /// This is the source for an audit's expected snapshot.
    pub fn list_on_shelf(&self, branch_id: BranchId) -> Vec<StockUnit> {
        let mut units: Vec<StockUnit> = self
            .store
            .list(branch_id)
            .into_iter()
            .filter(|u| u.status.is_on_shelf())
            .collect();
        units.sort_by_key(|u| u.serial);
        units
    }

    pub fn find_by_serial(&self, branch_id: BranchId, serial: SerialNumber) -> Option<StockUnit> {
        self.store
            .list(branch_id)
            .into_iter()
            .find(|u| u.serial == serial)
    }

    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), StockUnitsProjectionError> {
        let branch_id = envelope.branch_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        let relevant = matches!(
            envelope.aggregate_type(),
            t if t == RECEIPT_AGGREGATE || t == AUDIT_AGGREGATE
        );
        if !relevant {
            return Ok(());
        }

        match self.cursors.check(branch_id, aggregate_id, seq)? {
            CursorCheck::Duplicate => return Ok(()),
            CursorCheck::Apply => {}
        }

        if envelope.aggregate_type() == RECEIPT_AGGREGATE {
            let event: ReceiptEvent = serde_json::from_value(envelope.payload().clone())
                .map_err(|e| StockUnitsProjectionError::Deserialize(e.to_string()))?;
            self.apply_receipt_event(branch_id, &event)?;
        } else {
            let event: SessionEvent = serde_json::from_value(envelope.payload().clone())
                .map_err(|e| StockUnitsProjectionError::Deserialize(e.to_string()))?;
            self.apply_session_event(branch_id, &event)?;
        }

        self.cursors.advance(branch_id, aggregate_id, seq);
        Ok(())
    }

    fn apply_receipt_event(
        &self,
        branch_id: BranchId,
        event: &ReceiptEvent,
    ) -> Result<(), StockUnitsProjectionError> {
        let ReceiptEvent::ReceiptPosted(posted) = event else {
            // Draft bookkeeping and label prints do not touch stock.
            return Ok(());
        };
        if posted.branch_id != branch_id {
            return Err(StockUnitsProjectionError::BranchIsolation(
                "event branch_id does not match envelope branch_id".to_string(),
            ));
        }

        for issued in &posted.issued {
            let unit = StockUnit::received(
                issued.unit_id,
                branch_id,
                issued.product_id,
                issued.serial,
                posted.receipt_id.0,
                posted.occurred_at,
            );
            self.store.upsert(branch_id, issued.unit_id, unit);
        }

        Ok(())
    }

    fn apply_session_event(
        &self,
        branch_id: BranchId,
        event: &SessionEvent,
    ) -> Result<(), StockUnitsProjectionError> {
        let SessionEvent::AuditConfirmed(confirmed) = event else {
            return Ok(());
        };
        if confirmed.branch_id != branch_id {
            return Err(StockUnitsProjectionError::BranchIsolation(
                "event branch_id does not match envelope branch_id".to_string(),
            ));
        }

        let target = match confirmed.strategy {
            ResolutionStrategy::MarkPending => StockStatus::PendingReview,
            ResolutionStrategy::MarkLost => StockStatus::Lost,
        };

        for missing in &confirmed.missing {
            let Some(mut unit) = self.store.get(branch_id, &missing.unit_id) else {
                continue;
            };
            unit.transition(target, StatusChangeReason::AuditResolution, confirmed.occurred_at)
                .map_err(StockUnitsProjectionError::Stock)?;
            self.store.upsert(branch_id, missing.unit_id, unit);
        }

        Ok(())
    }
}
