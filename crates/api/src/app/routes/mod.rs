use axum::Router;

pub mod audits;
pub mod common;
pub mod products;
pub mod receipts;
pub mod system;

/// Router for all branch-scoped endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/products", products::router())
        .nest("/receipts", receipts::router())
        .nest("/audits", audits::router())
}
