use serde_json::Value as JsonValue;
use thiserror::Error;

use stocktake_core::BranchId;
use stocktake_events::EventEnvelope;
use stocktake_products::{ProductEvent, ProductId};

use super::PRODUCT_AGGREGATE;
use super::cursors::{CursorCheck, CursorError, StreamCursors};
use crate::read_model::BranchStore;

/// Queryable product read model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductRow {
    pub product_id: ProductId,
    pub sku: String,
    pub name: String,
}

#[derive(Debug, Error)]
pub enum ProductCatalogProjectionError {
    #[error("failed to deserialize product event: {0}")]
    Deserialize(String),

    #[error("branch isolation violation: {0}")]
    BranchIsolation(String),

    #[error(transparent)]
    Cursor(#[from] CursorError),
}

/// Product catalog projection.
pub struct ProductCatalogProjection<S>
where
    S: BranchStore<ProductId, ProductRow>,
{
    store: S,
    cursors: StreamCursors,
}

impl<S> ProductCatalogProjection<S>
where
    S: BranchStore<ProductId, ProductRow>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: StreamCursors::new(),
        }
    }

    pub fn get(&self, branch_id: BranchId, product_id: &ProductId) -> Option<ProductRow> {
        self.store.get(branch_id, product_id)
    }

    pub fn list(&self, branch_id: BranchId) -> Vec<ProductRow> {
        let mut rows = self.store.list(branch_id);
        rows.sort_by(|a, b| a.sku.cmp(&b.sku));
        rows
    }

    /// Apply a published envelope into the projection.
    ///
    /// Envelopes from other aggregate types are ignored; the bus broadcasts
    /// everything to every subscriber.
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), ProductCatalogProjectionError> {
        if envelope.aggregate_type() != PRODUCT_AGGREGATE {
            return Ok(());
        }

        let branch_id = envelope.branch_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        match self.cursors.check(branch_id, aggregate_id, seq)? {
            CursorCheck::Duplicate => return Ok(()),
            CursorCheck::Apply => {}
        }

        let event: ProductEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| ProductCatalogProjectionError::Deserialize(e.to_string()))?;

        match event {
            ProductEvent::ProductCreated(e) => {
                if e.branch_id != branch_id {
                    return Err(ProductCatalogProjectionError::BranchIsolation(
                        "event branch_id does not match envelope branch_id".to_string(),
                    ));
                }
                self.store.upsert(
                    branch_id,
                    e.product_id,
                    ProductRow {
                        product_id: e.product_id,
                        sku: e.sku,
                        name: e.name,
                    },
                );
            }
            ProductEvent::ProductRenamed(e) => {
                if let Some(mut row) = self.store.get(branch_id, &e.product_id) {
                    row.name = e.name;
                    self.store.upsert(branch_id, e.product_id, row);
                }
            }
        }

        self.cursors.advance(branch_id, aggregate_id, seq);
        Ok(())
    }
}
