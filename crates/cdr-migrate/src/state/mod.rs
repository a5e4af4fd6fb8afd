//! Per-table sync cursors, the sole record of migration progress.

mod backend;
mod mssql_db;

pub use backend::{CursorBackend, CursorSeed};
pub use mssql_db::MssqlCursorBackend;

use crate::error::{MigrateError, Result};
use crate::source::SourceStore;
use crate::tables::LogicalTable;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Persisted cursor for one logical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub id: i32,
    pub table: LogicalTable,
    /// Last fully migrated day. `None` until the first window completes.
    pub last_synced_at: Option<NaiveDate>,
    /// Earliest source day, `None` if the source table was empty at bootstrap.
    pub min_date: Option<NaiveDate>,
    /// Latest source day at bootstrap.
    pub max_date: Option<NaiveDate>,
}

impl SyncState {
    pub fn related_table(&self) -> &'static str {
        self.table.related_table()
    }

    /// `max_date - (last_synced_at ?? min_date)` in whole days, never negative.
    pub fn days_pending(&self) -> i64 {
        match (self.last_synced_at.or(self.min_date), self.max_date) {
            (Some(from), Some(max)) => (max - from).num_days().max(0),
            _ => 0,
        }
    }

    /// First day not yet migrated, or `None` for an empty table.
    pub fn next_window_start(&self) -> Option<NaiveDate> {
        match self.last_synced_at {
            Some(last) => Some(last + Duration::days(1)),
            None => self.min_date,
        }
    }

    /// True when the table has source rows but no window has completed.
    pub fn is_first_sync(&self) -> bool {
        self.last_synced_at.is_none() && self.min_date.is_some()
    }
}

/// Result of [`SyncCursorStore::bootstrap`].
#[derive(Debug, Clone)]
pub struct BootstrapOutcome {
    /// True when this call created the cursor table.
    pub created: bool,
    pub states: Vec<SyncState>,
}

/// Validated access to the cursor backend.
///
/// Reads always go to the backend, never to a cached copy.
#[derive(Clone)]
pub struct SyncCursorStore {
    backend: Arc<dyn CursorBackend>,
}

impl SyncCursorStore {
    pub fn new(backend: Arc<dyn CursorBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_type(&self) -> &'static str {
        self.backend.backend_type()
    }

    /// Create and seed the cursor table if absent, scanning date bounds from
    /// `source`. A no-op when it already exists.
    pub async fn bootstrap(&self, source: &dyn SourceStore) -> Result<BootstrapOutcome> {
        let created = if self.backend.exists().await? {
            debug!("Cursor table already present ({})", self.backend_type());
            false
        } else {
            let mut seeds = Vec::with_capacity(LogicalTable::ALL.len());
            for table in LogicalTable::ALL {
                let bounds = source.date_bounds(table).await?;
                seeds.push(CursorSeed { table, bounds });
            }
            self.backend.create(&seeds).await?;
            info!("Created sync cursor table ({})", self.backend_type());
            true
        };

        let states = self.list_cursors().await?;
        Ok(BootstrapOutcome { created, states })
    }

    /// All cursors, in [`LogicalTable::ALL`] order.
    ///
    /// Fails with `BootstrapInconsistent` unless there is exactly one row per
    /// logical table.
    pub async fn list_cursors(&self) -> Result<Vec<SyncState>> {
        let mut rows = self.backend.load_all().await?;
        let mut ordered = Vec::with_capacity(LogicalTable::ALL.len());

        for table in LogicalTable::ALL {
            let matching = rows.iter().filter(|s| s.table == table).count();
            if matching != 1 {
                return Err(MigrateError::BootstrapInconsistent(format!(
                    "expected one row for {}, found {}",
                    table, matching
                )));
            }
            if let Some(pos) = rows.iter().position(|s| s.table == table) {
                ordered.push(rows.swap_remove(pos));
            }
        }

        if !rows.is_empty() {
            return Err(MigrateError::BootstrapInconsistent(format!(
                "{} unexpected cursor rows",
                rows.len()
            )));
        }

        Ok(ordered)
    }

    /// Persisted cursor for `table`.
    pub async fn get_cursor(&self, table: LogicalTable) -> Result<SyncState> {
        self.list_cursors()
            .await?
            .into_iter()
            .find(|s| s.table == table)
            .ok_or_else(|| {
                MigrateError::BootstrapInconsistent(format!("no cursor row for {}", table))
            })
    }

    /// True while any table with source rows has never completed a window.
    pub async fn is_first_time_sync(&self) -> Result<bool> {
        Ok(self.list_cursors().await?.iter().any(SyncState::is_first_sync))
    }

    /// Re-read source date bounds and persist any that moved.
    ///
    /// The source keeps receiving rows after bootstrap, so the bounds stored
    /// at creation go stale. Returns the refreshed cursors.
    pub async fn refresh_bounds(&self, source: &dyn SourceStore) -> Result<Vec<SyncState>> {
        for state in self.list_cursors().await? {
            let bounds = source.date_bounds(state.table).await?;
            if bounds.min_date == state.min_date && bounds.max_date == state.max_date {
                continue;
            }

            let updated = self.backend.store_bounds(state.table, bounds).await?;
            if updated != 1 {
                return Err(MigrateError::BootstrapInconsistent(format!(
                    "refreshing {} bounds updated {} rows",
                    state.table, updated
                )));
            }
            info!(
                "{} source range now {:?} .. {:?} (was {:?} .. {:?})",
                state.table, bounds.min_date, bounds.max_date, state.min_date, state.max_date
            );
        }

        self.list_cursors().await
    }

    /// Move `table`'s cursor to `date`. Rejects any move backwards.
    pub async fn advance_cursor(&self, table: LogicalTable, date: NaiveDate) -> Result<()> {
        let current = self.get_cursor(table).await?;
        if let Some(last) = current.last_synced_at {
            if date < last {
                return Err(MigrateError::CursorRegression {
                    table: table.to_string(),
                    current: last,
                    requested: date,
                });
            }
        }

        let updated = self.backend.store_last_synced(table, date).await?;
        if updated != 1 {
            return Err(MigrateError::BootstrapInconsistent(format!(
                "advancing {} updated {} rows",
                table, updated
            )));
        }

        debug!("Cursor {} advanced to {}", table, date);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryCursorBackend, MemorySource};
    use crate::source::DateBounds;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2013, 1, day).unwrap()
    }

    fn state(last: Option<NaiveDate>, min: Option<NaiveDate>, max: Option<NaiveDate>) -> SyncState {
        SyncState {
            id: 1,
            table: LogicalTable::Calls,
            last_synced_at: last,
            min_date: min,
            max_date: max,
        }
    }

    #[test]
    fn test_days_pending() {
        assert_eq!(state(None, Some(d(1)), Some(d(5))).days_pending(), 4);
        assert_eq!(state(Some(d(3)), Some(d(1)), Some(d(5))).days_pending(), 2);
        assert_eq!(state(Some(d(7)), Some(d(1)), Some(d(5))).days_pending(), 0);
        assert_eq!(state(None, None, None).days_pending(), 0);
    }

    #[test]
    fn test_next_window_start() {
        assert_eq!(state(None, Some(d(1)), Some(d(5))).next_window_start(), Some(d(1)));
        assert_eq!(state(Some(d(3)), Some(d(1)), Some(d(5))).next_window_start(), Some(d(4)));
        assert_eq!(state(None, None, None).next_window_start(), None);
    }

    #[tokio::test]
    async fn test_get_cursor_before_bootstrap() {
        let store = SyncCursorStore::new(Arc::new(MemoryCursorBackend::new()));
        let err = store.get_cursor(LogicalTable::Calls).await.unwrap_err();
        assert!(matches!(err, MigrateError::NotBootstrapped));
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let source = MemorySource::new();
        source.set_bounds(LogicalTable::Calls, DateBounds::new(d(1), d(5)));
        let backend = Arc::new(MemoryCursorBackend::new());
        let store = SyncCursorStore::new(backend.clone());

        let first = store.bootstrap(&source).await.unwrap();
        assert!(first.created);
        assert_eq!(first.states.len(), 3);
        assert_eq!(first.states[0].min_date, Some(d(1)));
        assert_eq!(first.states[1].min_date, None);

        store.advance_cursor(LogicalTable::Calls, d(2)).await.unwrap();

        // Source bounds moved, but an existing table is left untouched
        source.set_bounds(LogicalTable::Calls, DateBounds::new(d(1), d(9)));
        let second = store.bootstrap(&source).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.states[0].max_date, Some(d(5)));
        assert_eq!(second.states[0].last_synced_at, Some(d(2)));
    }

    #[tokio::test]
    async fn test_refresh_bounds_picks_up_new_source_days() {
        let source = MemorySource::new();
        source.set_bounds(LogicalTable::Calls, DateBounds::new(d(1), d(3)));
        let store = SyncCursorStore::new(Arc::new(MemoryCursorBackend::new()));
        store.bootstrap(&source).await.unwrap();
        store.advance_cursor(LogicalTable::Calls, d(3)).await.unwrap();

        source.set_bounds(LogicalTable::Calls, DateBounds::new(d(1), d(5)));
        source.set_bounds(LogicalTable::VoxStubs, DateBounds::new(d(4), d(4)));
        let states = store.refresh_bounds(&source).await.unwrap();

        assert_eq!(states[0].max_date, Some(d(5)));
        assert_eq!(states[0].last_synced_at, Some(d(3)));
        assert_eq!(states[0].days_pending(), 2);
        assert_eq!(states[1].min_date, None);
        assert_eq!(states[2].min_date, Some(d(4)));
        assert_eq!(states[2].next_window_start(), Some(d(4)));
    }

    #[tokio::test]
    async fn test_advance_rejects_regression() {
        let source = MemorySource::new();
        source.set_bounds(LogicalTable::Calls, DateBounds::new(d(1), d(5)));
        let store = SyncCursorStore::new(Arc::new(MemoryCursorBackend::new()));
        store.bootstrap(&source).await.unwrap();

        store.advance_cursor(LogicalTable::Calls, d(3)).await.unwrap();
        store.advance_cursor(LogicalTable::Calls, d(3)).await.unwrap();
        let err = store
            .advance_cursor(LogicalTable::Calls, d(2))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::CursorRegression { .. }));
        assert_eq!(
            store.get_cursor(LogicalTable::Calls).await.unwrap().last_synced_at,
            Some(d(3))
        );
    }

    #[tokio::test]
    async fn test_advance_touches_one_table() {
        let source = MemorySource::new();
        source.set_bounds(LogicalTable::MediaStubs, DateBounds::new(d(1), d(5)));
        let store = SyncCursorStore::new(Arc::new(MemoryCursorBackend::new()));
        store.bootstrap(&source).await.unwrap();
        assert!(store.is_first_time_sync().await.unwrap());

        store
            .advance_cursor(LogicalTable::MediaStubs, d(4))
            .await
            .unwrap();
        let cursors = store.list_cursors().await.unwrap();
        assert_eq!(cursors[0].last_synced_at, None);
        assert_eq!(cursors[1].last_synced_at, Some(d(4)));
        assert_eq!(cursors[2].last_synced_at, None);
        // Only the empty tables are left unsynced
        assert!(!store.is_first_time_sync().await.unwrap());
    }

    #[tokio::test]
    async fn test_inconsistent_rows_rejected() {
        let backend = Arc::new(MemoryCursorBackend::new());
        backend.insert_raw(state(None, Some(d(1)), Some(d(5))));
        let store = SyncCursorStore::new(backend);
        let err = store.list_cursors().await.unwrap_err();
        assert!(matches!(err, MigrateError::BootstrapInconsistent(_)));

        let source = MemorySource::new();
        let err = store.bootstrap(&source).await.unwrap_err();
        assert!(matches!(err, MigrateError::BootstrapInconsistent(_)));
    }
}
