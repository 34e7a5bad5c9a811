//! Single-open-audit registry.
//!
//! At most one draft audit session may exist per branch. The registry is the
//! atomic claim point for that slot: starting an audit claims it, confirming
//! releases it. Claiming is check-and-insert under one lock, so two
//! concurrent start requests can never both create a session; the loser gets
//! the winner's session id back and the start stays idempotent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use stocktake_audit::AuditSessionId;
use stocktake_core::BranchId;

/// Outcome of a claim attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The slot was free; the caller's session id now owns it.
    Claimed,
    /// A draft session already holds the slot; reuse it.
    ExistingOpen(AuditSessionId),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("open-audit registry lock poisoned")]
    Poisoned,

    #[error("release does not match the open session for this branch")]
    NotOwner,
}

/// Port for the per-branch open-audit slot.
///
/// A durable implementation maps onto a partial unique index over draft
/// sessions; the in-memory variant gives the same atomicity under one lock.
pub trait OpenAuditRegistry: Send + Sync {
    /// Atomically claim the branch slot for `session_id`.
    fn claim(
        &self,
        branch_id: BranchId,
        session_id: AuditSessionId,
    ) -> Result<ClaimOutcome, RegistryError>;

    /// Release the slot on confirmation.
    ///
    /// Fails with `NotOwner` when `session_id` does not hold the slot, which
    /// would indicate a bookkeeping bug upstream.
    fn release(
        &self,
        branch_id: BranchId,
        session_id: AuditSessionId,
    ) -> Result<(), RegistryError>;

    /// The currently open session for a branch, if any.
    fn open_session(&self, branch_id: BranchId) -> Result<Option<AuditSessionId>, RegistryError>;
}

impl<R> OpenAuditRegistry for Arc<R>
where
    R: OpenAuditRegistry + ?Sized,
{
    fn claim(
        &self,
        branch_id: BranchId,
        session_id: AuditSessionId,
    ) -> Result<ClaimOutcome, RegistryError> {
        (**self).claim(branch_id, session_id)
    }

    fn release(
        &self,
        branch_id: BranchId,
        session_id: AuditSessionId,
    ) -> Result<(), RegistryError> {
        (**self).release(branch_id, session_id)
    }

    fn open_session(&self, branch_id: BranchId) -> Result<Option<AuditSessionId>, RegistryError> {
        (**self).open_session(branch_id)
    }
}

/// In-memory registry for tests/dev and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryOpenAuditRegistry {
    open: Mutex<HashMap<BranchId, AuditSessionId>>,
}

impl InMemoryOpenAuditRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OpenAuditRegistry for InMemoryOpenAuditRegistry {
    fn claim(
        &self,
        branch_id: BranchId,
        session_id: AuditSessionId,
    ) -> Result<ClaimOutcome, RegistryError> {
        let mut open = self.open.lock().map_err(|_| RegistryError::Poisoned)?;
        match open.get(&branch_id) {
            Some(existing) => Ok(ClaimOutcome::ExistingOpen(*existing)),
            None => {
                open.insert(branch_id, session_id);
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    fn release(
        &self,
        branch_id: BranchId,
        session_id: AuditSessionId,
    ) -> Result<(), RegistryError> {
        let mut open = self.open.lock().map_err(|_| RegistryError::Poisoned)?;
        match open.get(&branch_id) {
            Some(existing) if *existing == session_id => {
                open.remove(&branch_id);
                Ok(())
            }
            _ => Err(RegistryError::NotOwner),
        }
    }

    fn open_session(&self, branch_id: BranchId) -> Result<Option<AuditSessionId>, RegistryError> {
        let open = self.open.lock().map_err(|_| RegistryError::Poisoned)?;
        Ok(open.get(&branch_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stocktake_core::AggregateId;

    fn session() -> AuditSessionId {
        AuditSessionId::new(AggregateId::new())
    }

    #[test]
    fn second_claim_returns_the_first_session() {
        let registry = InMemoryOpenAuditRegistry::new();
        let branch = BranchId::new();
        let first = session();
        let second = session();

        assert_eq!(registry.claim(branch, first).unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            registry.claim(branch, second).unwrap(),
            ClaimOutcome::ExistingOpen(first)
        );
        assert_eq!(registry.open_session(branch).unwrap(), Some(first));
    }

    #[test]
    fn release_frees_the_slot_for_the_owner_only() {
        let registry = InMemoryOpenAuditRegistry::new();
        let branch = BranchId::new();
        let owner = session();
        let stranger = session();

        registry.claim(branch, owner).unwrap();
        assert!(matches!(
            registry.release(branch, stranger),
            Err(RegistryError::NotOwner)
        ));

        registry.release(branch, owner).unwrap();
        assert_eq!(registry.open_session(branch).unwrap(), None);

        // Slot is free again.
        assert_eq!(
            registry.claim(branch, stranger).unwrap(),
            ClaimOutcome::Claimed
        );
    }

    #[test]
    fn branches_claim_independently() {
        let registry = InMemoryOpenAuditRegistry::new();
        let (branch_a, branch_b) = (BranchId::new(), BranchId::new());
        let (session_a, session_b) = (session(), session());

        assert_eq!(
            registry.claim(branch_a, session_a).unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            registry.claim(branch_b, session_b).unwrap(),
            ClaimOutcome::Claimed
        );
    }

    #[test]
    fn concurrent_claims_produce_one_owner() {
        let registry = Arc::new(InMemoryOpenAuditRegistry::new());
        let branch = BranchId::new();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.claim(branch, session()).unwrap())
            })
            .collect();

        let outcomes: Vec<ClaimOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let claimed = outcomes
            .iter()
            .filter(|o| matches!(o, ClaimOutcome::Claimed))
            .count();
        assert_eq!(claimed, 1);

        let winner = registry.open_session(branch).unwrap().unwrap();
        for outcome in outcomes {
            if let ClaimOutcome::ExistingOpen(existing) = outcome {
                assert_eq!(existing, winner);
            }
        }
    }
}
