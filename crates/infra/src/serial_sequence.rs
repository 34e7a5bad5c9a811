//! Serial counter implementations.
//!
//! Both back the `SerialSequence` port from the serials crate with a single
//! indivisible increment, so concurrent reservations can never overlap.

use std::sync::atomic::{AtomicU64, Ordering};

use stocktake_serials::{SequenceError, SerialBlock, SerialSequence};

/// In-memory counter backed by an atomic fetch-and-add.
///
/// Suitable for tests/dev and single-process deployments. State does not
/// survive a restart; production uses the database-backed variant.
#[derive(Debug)]
pub struct AtomicSerialSequence {
    // Value of the next serial to hand out.
    next: AtomicU64,
}

impl AtomicSerialSequence {
    /// Start the counter so the first reserved serial is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for AtomicSerialSequence {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl SerialSequence for AtomicSerialSequence {
    fn reserve(&self, quantity: u32) -> Result<SerialBlock, SequenceError> {
        if quantity == 0 {
            return Err(SequenceError::ZeroQuantity);
        }

        let start = self.next.fetch_add(u64::from(quantity), Ordering::SeqCst);
        if start.checked_add(u64::from(quantity)).is_none() {
            return Err(SequenceError::Exhausted);
        }

        Ok(SerialBlock::new(start, quantity))
    }
}

/// Postgres-backed counter: one `UPDATE … RETURNING` per reservation.
///
/// The single-statement increment makes the reservation atomic at the
/// database level, so concurrent processes can never receive overlapping
/// blocks. The row is seeded once (`value = 0`) by the migrations.
#[cfg(feature = "postgres")]
pub struct PostgresSerialSequence {
    pool: sqlx::PgPool,
}

#[cfg(feature = "postgres")]
impl PostgresSerialSequence {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    async fn reserve_async(&self, quantity: u32) -> Result<SerialBlock, SequenceError> {
        use sqlx::Row;

        let row = sqlx::query(
            r#"
            UPDATE serial_sequence
            SET value = value + $1
            WHERE name = 'stock_serials'
            RETURNING value
            "#,
        )
        .bind(i64::from(quantity))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SequenceError::Store(e.to_string()))?;

        let end: i64 = row
            .try_get("value")
            .map_err(|e| SequenceError::Store(e.to_string()))?;

        let start = (end as u64) - u64::from(quantity) + 1;
        Ok(SerialBlock::new(start, quantity))
    }
}

#[cfg(feature = "postgres")]
impl SerialSequence for PostgresSerialSequence {
    fn reserve(&self, quantity: u32) -> Result<SerialBlock, SequenceError> {
        if quantity == 0 {
            return Err(SequenceError::ZeroQuantity);
        }

        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            SequenceError::Store("PostgresSerialSequence requires a tokio runtime context".into())
        })?;

        handle.block_on(self.reserve_async(quantity))
    }
}
