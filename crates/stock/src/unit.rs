use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stocktake_core::{AggregateId, BranchId, DomainError};
use stocktake_products::ProductId;
use stocktake_serials::SerialNumber;

/// Identifier of a tracked stock unit.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StockUnitId(pub AggregateId);

impl StockUnitId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for StockUnitId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Lifecycle status of one physical unit.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    InStock,
    Claimed,
    Sold,
    Lost,
    Damaged,
    Returned,
    /// Soft flag: unaccounted for in an audit, needs a manual check.
    PendingReview,
}

impl StockStatus {
    /// Whether a unit in this status should physically be on the shelf —
    /// the definition of "expected" for an audit snapshot.
    pub fn is_on_shelf(&self) -> bool {
        matches!(self, StockStatus::InStock)
    }

    /// Whether this status is a terminal write-off.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StockStatus::Sold | StockStatus::Lost)
    }
}

/// Why a unit changed status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusChangeReason {
    Received,
    Sale,
    /// Applied by audit confirmation to an unaccounted-for unit.
    AuditResolution,
    Manual,
}

/// One entry in a unit's append-only status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: Option<StockStatus>,
    pub to: StockStatus,
    pub reason: StatusChangeReason,
    pub occurred_at: DateTime<Utc>,
}

/// One tracked physical unit.
///
/// Status transitions go through `transition`, which preserves history.
/// Units are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockUnit {
    pub id: StockUnitId,
    pub branch_id: BranchId,
    pub product_id: ProductId,
    pub serial: SerialNumber,
    /// Receipt the unit was issued from.
    pub receipt_id: AggregateId,
    pub status: StockStatus,
    pub history: Vec<StatusChange>,
}

impl StockUnit {
    /// Bring a freshly received unit into stock.
    pub fn received(
        id: StockUnitId,
        branch_id: BranchId,
        product_id: ProductId,
        serial: SerialNumber,
        receipt_id: AggregateId,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            branch_id,
            product_id,
            serial,
            receipt_id,
            status: StockStatus::InStock,
            history: vec![StatusChange {
                from: None,
                to: StockStatus::InStock,
                reason: StatusChangeReason::Received,
                occurred_at,
            }],
        }
    }

    /// Change status, appending to the history.
    ///
    /// Rejects transitions out of a terminal write-off: a sold or lost unit
    /// does not come back via a status edit (a return is a new business
    /// event with its own reason).
    pub fn transition(
        &mut self,
        to: StockStatus,
        reason: StatusChangeReason,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if self.status == to {
            // Re-applying the same status is a no-op, not an error
            // (projections replay events at-least-once).
            return Ok(());
        }
        if self.status.is_terminal() && reason != StatusChangeReason::Manual {
            return Err(DomainError::invariant(format!(
                "unit {} is {:?} and cannot transition to {:?}",
                self.id, self.status, to
            )));
        }

        self.history.push(StatusChange {
            from: Some(self.status),
            to,
            reason,
            occurred_at,
        });
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_unit() -> StockUnit {
        StockUnit::received(
            StockUnitId::new(AggregateId::new()),
            BranchId::new(),
            ProductId::new(AggregateId::new()),
            SerialNumber::from_counter(1),
            AggregateId::new(),
            Utc::now(),
        )
    }

    #[test]
    fn received_unit_starts_in_stock_with_history() {
        let unit = test_unit();
        assert_eq!(unit.status, StockStatus::InStock);
        assert_eq!(unit.history.len(), 1);
        assert_eq!(unit.history[0].from, None);
        assert_eq!(unit.history[0].reason, StatusChangeReason::Received);
    }

    #[test]
    fn transition_appends_history() {
        let mut unit = test_unit();
        unit.transition(
            StockStatus::PendingReview,
            StatusChangeReason::AuditResolution,
            Utc::now(),
        )
        .unwrap();

        assert_eq!(unit.status, StockStatus::PendingReview);
        assert_eq!(unit.history.len(), 2);
        assert_eq!(unit.history[1].from, Some(StockStatus::InStock));
        assert_eq!(unit.history[1].to, StockStatus::PendingReview);
    }

    #[test]
    fn same_status_transition_is_a_noop() {
        let mut unit = test_unit();
        unit.transition(StockStatus::InStock, StatusChangeReason::Manual, Utc::now())
            .unwrap();
        assert_eq!(unit.history.len(), 1);
    }

    #[test]
    fn terminal_status_blocks_audit_writes() {
        let mut unit = test_unit();
        unit.transition(StockStatus::Lost, StatusChangeReason::AuditResolution, Utc::now())
            .unwrap();

        let err = unit
            .transition(
                StockStatus::InStock,
                StatusChangeReason::AuditResolution,
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));

        // A manual correction is still possible.
        unit.transition(StockStatus::InStock, StatusChangeReason::Manual, Utc::now())
            .unwrap();
        assert_eq!(unit.status, StockStatus::InStock);
        assert_eq!(unit.history.len(), 3);
    }

    #[test]
    fn only_in_stock_counts_as_on_shelf() {
        assert!(StockStatus::InStock.is_on_shelf());
        for s in [
            StockStatus::Claimed,
            StockStatus::Sold,
            StockStatus::Lost,
            StockStatus::Damaged,
            StockStatus::Returned,
            StockStatus::PendingReview,
        ] {
            assert!(!s.is_on_shelf());
        }
    }
}
