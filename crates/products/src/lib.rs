//! Products domain module (event-sourced).
//!
//! Minimal catalog: enough product identity (SKU + display name) for receipt
//! lines to reference and for audit snapshots to denormalize. Implemented
//! purely as deterministic domain logic (no IO, no HTTP, no storage).

pub mod product;

pub use product::{
    CreateProduct, Product, ProductCommand, ProductCreated, ProductEvent, ProductId,
    ProductRenamed, RenameProduct,
};
