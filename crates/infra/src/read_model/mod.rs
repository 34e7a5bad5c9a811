//! Disposable, branch-isolated read model storage.

mod branch_store;

pub use branch_store::{BranchStore, InMemoryBranchStore};
