//! Append-only event store boundary.
//!
//! Defines an infrastructure-facing abstraction for storing and loading
//! branch-scoped event streams without making storage assumptions. Publishing
//! committed events to the bus is the command dispatcher's job, so the store
//! implementations stay pure persistence.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
