//! Infrastructure layer: event store, command dispatch, projections,
//! idempotency and the single-open-audit registry.

pub mod command_dispatcher;
pub mod event_store;
pub mod idempotency;
pub mod open_audits;
pub mod projections;
pub mod read_model;
pub mod serial_sequence;

#[cfg(test)]
mod integration_tests;
