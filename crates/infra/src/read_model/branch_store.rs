use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use stocktake_core::BranchId;

/// Branch-isolated key/value store abstraction for disposable read models.
pub trait BranchStore<K, V>: Send + Sync {
    fn get(&self, branch_id: BranchId, key: &K) -> Option<V>;
    fn upsert(&self, branch_id: BranchId, key: K, value: V);
    fn list(&self, branch_id: BranchId) -> Vec<V>;
    /// Clear all read-model records for a branch (rebuild support).
    fn clear_branch(&self, branch_id: BranchId);
}

impl<K, V, S> BranchStore<K, V> for Arc<S>
where
    S: BranchStore<K, V> + ?Sized,
{
    fn get(&self, branch_id: BranchId, key: &K) -> Option<V> {
        (**self).get(branch_id, key)
    }

    fn upsert(&self, branch_id: BranchId, key: K, value: V) {
        (**self).upsert(branch_id, key, value)
    }

    fn list(&self, branch_id: BranchId) -> Vec<V> {
        (**self).list(branch_id)
    }

    fn clear_branch(&self, branch_id: BranchId) {
        (**self).clear_branch(branch_id)
    }
}

/// In-memory branch-isolated store for tests/dev.
#[derive(Debug)]
pub struct InMemoryBranchStore<K, V> {
    inner: RwLock<HashMap<(BranchId, K), V>>,
}

impl<K, V> InMemoryBranchStore<K, V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for InMemoryBranchStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> BranchStore<K, V> for InMemoryBranchStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, branch_id: BranchId, key: &K) -> Option<V> {
        let map = self.inner.read().ok()?;
        map.get(&(branch_id, key.clone())).cloned()
    }

    fn upsert(&self, branch_id: BranchId, key: K, value: V) {
        if let Ok(mut map) = self.inner.write() {
            map.insert((branch_id, key), value);
        }
    }

    fn list(&self, branch_id: BranchId) -> Vec<V> {
        let map = match self.inner.read() {
            Ok(m) => m,
            Err(_) => return vec![],
        };

        map.iter()
            .filter_map(|((b, _k), v)| if *b == branch_id { Some(v.clone()) } else { None })
            .collect()
    }

    fn clear_branch(&self, branch_id: BranchId) {
        if let Ok(mut map) = self.inner.write() {
            map.retain(|(b, _k), _v| *b != branch_id);
        }
    }
}
