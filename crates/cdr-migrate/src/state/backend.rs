//! Storage abstraction for sync cursors.

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::Result;
use crate::source::DateBounds;
use crate::state::SyncState;
use crate::tables::LogicalTable;

/// Initial row written for a logical table when the cursor table is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorSeed {
    pub table: LogicalTable,
    pub bounds: DateBounds,
}

/// Persistence for per-table cursors.
///
/// Implementations only store and return rows; consistency rules and
/// monotonicity live in [`crate::state::SyncCursorStore`].
#[async_trait]
pub trait CursorBackend: Send + Sync {
    /// Whether the cursor table exists.
    async fn exists(&self) -> Result<bool>;

    /// Create the cursor table and insert one row per seed.
    async fn create(&self, seeds: &[CursorSeed]) -> Result<()>;

    /// Load every cursor row. Fails with `NotBootstrapped` if the table is absent.
    async fn load_all(&self) -> Result<Vec<SyncState>>;

    /// Persist `last_synced_at` for one table. Returns the number of rows updated.
    async fn store_last_synced(&self, table: LogicalTable, date: NaiveDate) -> Result<u64>;

    /// Persist new source date bounds for one table. Returns the number of rows updated.
    async fn store_bounds(&self, table: LogicalTable, bounds: DateBounds) -> Result<u64>;

    /// Get the backend type for logging.
    fn backend_type(&self) -> &'static str;
}
