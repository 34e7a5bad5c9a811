//! Receiving domain module (event-sourced).
//!
//! A goods receipt collects line items in Draft, then posts once: posting is
//! the moment serials are bound to physical units. Serial block reservation
//! itself is IO and happens in the application layer; the aggregate receives
//! the already-issued units and validates them against its lines.

pub mod receipt;

pub use receipt::{
    AddReceiptLine, CreateReceipt, GoodsReceipt, GoodsReceiptId, IssuedUnit, LabelsPrinted,
    MarkLabelsPrinted, PostReceipt, ReceiptCommand, ReceiptCreated, ReceiptEvent, ReceiptLine,
    ReceiptLineAdded, ReceiptPosted, ReceiptStatus,
};
