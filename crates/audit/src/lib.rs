//! Audit domain module (event-sourced).
//!
//! An audit session freezes a denormalized snapshot of every on-shelf unit at
//! start time, then classifies incoming scans against that snapshot. Stock
//! changes after the start do not move the goalposts mid-count. Confirmation
//! closes the session and resolves everything unaccounted for in one event.

pub mod session;

pub use session::{
    AuditConfirmed, AuditSession, AuditSessionId, AuditStarted, AuditStatus, ConfirmAudit,
    ExpectedUnit, RecordScan, ResolutionStrategy, ScanOutcome, ScanRecorded, SessionCommand,
    SessionEvent, StartAudit,
};
