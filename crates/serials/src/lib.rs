//! Serial-number domain: the shared numbering space, contiguous block
//! allocation, and printable-label expansion.
//!
//! Serial values are drawn from one monotonically increasing counter shared
//! by the whole installation (never per receipt, never per branch). The
//! counter port (`SerialSequence`) is defined here; implementations live in
//! the infrastructure layer. Gaps in the numbering space are acceptable,
//! duplicates never are.

pub mod label;
pub mod sequence;
pub mod serial;

pub use label::{PrintableLabel, expand_for_printing};
pub use sequence::{SequenceError, SerialBlock, SerialSequence};
pub use serial::{ScanMode, SerialNumber};
