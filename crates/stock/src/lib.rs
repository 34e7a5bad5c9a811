//! Stock unit model: one tracked physical unit per issued serial.
//!
//! Units are never deleted; every status change is appended to the unit's
//! history so audit resolutions stay traceable per unit.

pub mod unit;

pub use unit::{StatusChange, StatusChangeReason, StockStatus, StockUnit, StockUnitId};
