//! Idempotency-key storage for non-idempotent endpoints.
//!
//! Posting a receipt and confirming an audit both have side effects that
//! must not run twice when a client retries. The caller records the first
//! response under `(branch, key)`; a retry with the same key replays that
//! response instead of re-executing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value as JsonValue;

use stocktake_core::BranchId;

/// Branch-scoped idempotency-key store.
pub trait IdempotencyStore: Send + Sync {
    /// The recorded response for a key, if the operation already ran.
    fn get(&self, branch_id: BranchId, key: &str) -> Option<JsonValue>;

    /// Record the response of a completed operation.
    ///
    /// First write wins; a concurrent duplicate keeps the original response.
    fn put(&self, branch_id: BranchId, key: &str, response: JsonValue);
}

impl<S> IdempotencyStore for Arc<S>
where
    S: IdempotencyStore + ?Sized,
{
    fn get(&self, branch_id: BranchId, key: &str) -> Option<JsonValue> {
        (**self).get(branch_id, key)
    }

    fn put(&self, branch_id: BranchId, key: &str, response: JsonValue) {
        (**self).put(branch_id, key, response)
    }
}

/// In-memory idempotency store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    inner: RwLock<HashMap<(BranchId, String), JsonValue>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn get(&self, branch_id: BranchId, key: &str) -> Option<JsonValue> {
        let map = self.inner.read().ok()?;
        map.get(&(branch_id, key.to_string())).cloned()
    }

    fn put(&self, branch_id: BranchId, key: &str, response: JsonValue) {
        if let Ok(mut map) = self.inner.write() {
            map.entry((branch_id, key.to_string())).or_insert(response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replays_the_first_recorded_response() {
        let store = InMemoryIdempotencyStore::new();
        let branch = BranchId::new();

        assert!(store.get(branch, "post-1").is_none());

        store.put(branch, "post-1", json!({"status": "posted"}));
        store.put(branch, "post-1", json!({"status": "other"}));

        assert_eq!(
            store.get(branch, "post-1").unwrap(),
            json!({"status": "posted"})
        );
    }

    #[test]
    fn keys_are_branch_scoped() {
        let store = InMemoryIdempotencyStore::new();
        let (a, b) = (BranchId::new(), BranchId::new());

        store.put(a, "k", json!(1));
        assert!(store.get(b, "k").is_none());
    }
}
