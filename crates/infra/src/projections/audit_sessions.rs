use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use stocktake_audit::{
    AuditSessionId, AuditStatus, ResolutionStrategy, ScanOutcome, SessionEvent,
};
use stocktake_core::BranchId;
use stocktake_events::EventEnvelope;
use stocktake_products::ProductId;
use stocktake_serials::SerialNumber;
use stocktake_stock::StockUnitId;

use super::AUDIT_AGGREGATE;
use super::cursors::{CursorCheck, CursorError, StreamCursors};
use crate::read_model::BranchStore;

/// One expected item of a session, as shown to the counting UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditItemRow {
    pub unit_id: StockUnitId,
    pub serial: SerialNumber,
    pub product_id: ProductId,
    pub product_name: String,
    pub scanned: bool,
    pub scanned_at: Option<DateTime<Utc>>,
}

/// One audit session read model row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditSessionRow {
    pub session_id: AuditSessionId,
    pub status: AuditStatus,
    pub started_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub strategy: Option<ResolutionStrategy>,
    /// The frozen snapshot, in start order. This order never changes, so
    /// pagination stays stable while counting is in progress.
    pub items: Vec<AuditItemRow>,
}

impl AuditSessionRow {
    pub fn expected_count(&self) -> usize {
        self.items.len()
    }

    pub fn scanned_count(&self) -> usize {
        self.items.iter().filter(|i| i.scanned).count()
    }

    pub fn missing_count(&self) -> usize {
        self.items.iter().filter(|i| !i.scanned).count()
    }
}

/// Item listing filter + pagination.
#[derive(Debug, Clone, Default)]
pub struct AuditItemsQuery {
    /// Keep only scanned (`true`) or only unscanned (`false`) items.
    pub scanned: Option<bool>,
    /// Case-insensitive substring match on product name or serial.
    pub q: Option<String>,
    /// 1-based page number.
    pub page: u32,
    pub page_size: u32,
}

/// One stable-ordered page of session items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditItemsPage {
    pub items: Vec<AuditItemRow>,
    /// Total matching items across all pages.
    pub total: usize,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Error)]
pub enum AuditSessionsProjectionError {
    #[error("failed to deserialize session event: {0}")]
    Deserialize(String),

    #[error("branch isolation violation: {0}")]
    BranchIsolation(String),

    #[error(transparent)]
    Cursor(#[from] CursorError),
}

/// Audit sessions projection: the reconciliation view.
///
/// Everything the counting UI reads comes from here; commands never query
/// live stock mid-session.
pub struct AuditSessionsProjection<S>
where
    S: BranchStore<AuditSessionId, AuditSessionRow>,
{
    store: S,
    cursors: StreamCursors,
}

impl<S> AuditSessionsProjection<S>
where
    S: BranchStore<AuditSessionId, AuditSessionRow>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: StreamCursors::new(),
        }
    }

    pub fn get(&self, branch_id: BranchId, session_id: &AuditSessionId) -> Option<AuditSessionRow> {
        self.store.get(branch_id, session_id)
    }

    /// Filterable, paginated item listing in snapshot order.
    ///
    /// Filtering happens before pagination, so `total` counts the matching
    /// items, not the snapshot size.
    pub fn items(
        &self,
        branch_id: BranchId,
        session_id: &AuditSessionId,
        query: &AuditItemsQuery,
    ) -> Option<AuditItemsPage> {
        let row = self.store.get(branch_id, session_id)?;

        let needle = query.q.as_deref().map(str::to_lowercase);
        let matching: Vec<AuditItemRow> = row
            .items
            .into_iter()
            .filter(|item| match query.scanned {
                Some(want) => item.scanned == want,
                None => true,
            })
            .filter(|item| match &needle {
                Some(n) => {
                    item.product_name.to_lowercase().contains(n)
                        || item.serial.as_sn().contains(n.as_str())
                }
                None => true,
            })
            .collect();

        let total = matching.len();
        let page = query.page.max(1);
        let page_size = query.page_size.max(1);
        let offset = ((page - 1) as usize).saturating_mul(page_size as usize);
        let items = matching
            .into_iter()
            .skip(offset)
            .take(page_size as usize)
            .collect();

        Some(AuditItemsPage {
            items,
            total,
            page,
            page_size,
        })
    }

    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), AuditSessionsProjectionError> {
        if envelope.aggregate_type() != AUDIT_AGGREGATE {
            return Ok(());
        }

        let branch_id = envelope.branch_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        match self.cursors.check(branch_id, aggregate_id, seq)? {
            CursorCheck::Duplicate => return Ok(()),
            CursorCheck::Apply => {}
        }

        let event: SessionEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| AuditSessionsProjectionError::Deserialize(e.to_string()))?;

        let event_branch = match &event {
            SessionEvent::AuditStarted(e) => e.branch_id,
            SessionEvent::ScanRecorded(e) => e.branch_id,
            SessionEvent::AuditConfirmed(e) => e.branch_id,
        };
        if event_branch != branch_id {
            return Err(AuditSessionsProjectionError::BranchIsolation(
                "event branch_id does not match envelope branch_id".to_string(),
            ));
        }

        match event {
            SessionEvent::AuditStarted(e) => {
                let items = e
                    .expected
                    .into_iter()
                    .map(|u| AuditItemRow {
                        unit_id: u.unit_id,
                        serial: u.serial,
                        product_id: u.product_id,
                        product_name: u.product_name,
                        scanned: false,
                        scanned_at: None,
                    })
                    .collect();
                self.store.upsert(
                    branch_id,
                    e.session_id,
                    AuditSessionRow {
                        session_id: e.session_id,
                        status: AuditStatus::Draft,
                        started_at: e.occurred_at,
                        confirmed_at: None,
                        strategy: None,
                        items,
                    },
                );
            }
            SessionEvent::ScanRecorded(e) => {
                // Only a first match moves the view; repeats and unexpected
                // scans leave it untouched.
                if e.outcome == ScanOutcome::Matched {
                    if let Some(mut row) = self.store.get(branch_id, &e.session_id) {
                        if let Some(item) = row.items.iter_mut().find(|i| i.serial == e.serial) {
                            item.scanned = true;
                            item.scanned_at = Some(e.occurred_at);
                        }
                        self.store.upsert(branch_id, e.session_id, row);
                    }
                }
            }
            SessionEvent::AuditConfirmed(e) => {
                if let Some(mut row) = self.store.get(branch_id, &e.session_id) {
                    row.status = AuditStatus::Confirmed;
                    row.confirmed_at = Some(e.occurred_at);
                    row.strategy = Some(e.strategy);
                    self.store.upsert(branch_id, e.session_id, row);
                }
            }
        }

        self.cursors.advance(branch_id, aggregate_id, seq);
        Ok(())
    }
}
