//! Projection implementations (read model builders).
//!
//! Projections consume published envelopes and build query-optimized read
//! models. All projections are:
//! - **Rebuildable**: reconstructed from the event stream at any time
//! - **Branch-isolated**: data is partitioned by branch
//! - **Idempotent**: safe for at-least-once delivery (per-stream cursors)

mod cursors;

pub mod audit_sessions;
pub mod barcode_catalog;
pub mod product_catalog;
pub mod stock_units;

pub use audit_sessions::{
    AuditItemRow, AuditItemsPage, AuditItemsQuery, AuditSessionRow, AuditSessionsProjection,
    AuditSessionsProjectionError,
};
pub use barcode_catalog::{BarcodeCatalogProjection, BarcodeCatalogProjectionError, CatalogRow};
pub use cursors::{CursorCheck, CursorError, StreamCursors};
pub use product_catalog::{ProductCatalogProjection, ProductCatalogProjectionError, ProductRow};
pub use stock_units::{StockUnitsProjection, StockUnitsProjectionError};

/// Aggregate type identifiers, shared between dispatchers and projections so
/// every envelope can be routed by stream type.
pub const PRODUCT_AGGREGATE: &str = "products.product";
pub const RECEIPT_AGGREGATE: &str = "receiving.receipt";
pub const AUDIT_AGGREGATE: &str = "audit.session";
