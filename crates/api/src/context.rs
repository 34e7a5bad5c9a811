use stocktake_core::BranchId;

/// Branch context for a request.
///
/// This is immutable and must be present for all domain routes; every read
/// and write below the router is scoped to exactly this branch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BranchContext {
    branch_id: BranchId,
}

impl BranchContext {
    pub fn new(branch_id: BranchId) -> Self {
        Self { branch_id }
    }

    pub fn branch_id(&self) -> BranchId {
        self.branch_id
    }
}
