//! Source database operations.

mod mssql;
mod records;

pub use mssql::MssqlSource;
pub use records::{CallRecord, MediaStubRecord, SourceRecord, VoxStubRecord};

use crate::error::Result;
use crate::tables::{DayWindow, LogicalTable};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Calendar-day bounds of a table's primary timestamp, in UTC.
///
/// Both are `None` when the table is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateBounds {
    pub min_date: Option<NaiveDate>,
    pub max_date: Option<NaiveDate>,
}

impl DateBounds {
    pub fn new(min_date: NaiveDate, max_date: NaiveDate) -> Self {
        Self {
            min_date: Some(min_date),
            max_date: Some(max_date),
        }
    }

    /// Whole days between min and max.
    pub fn span_days(&self) -> i64 {
        match (self.min_date, self.max_date) {
            (Some(min), Some(max)) => (max - min).num_days().max(0),
            _ => 0,
        }
    }
}

/// Trait for source database operations.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Get the row count for a table.
    async fn row_count(&self, table: LogicalTable) -> Result<i64>;

    /// Scan the min and max primary timestamp, truncated to UTC days.
    async fn date_bounds(&self, table: LogicalTable) -> Result<DateBounds>;

    /// All rows whose primary timestamp falls in `window`.
    async fn read_window(&self, table: LogicalTable, window: DayWindow)
        -> Result<Vec<SourceRecord>>;

    /// Day of the `rows`-th row at or after `from`, ordered by primary timestamp.
    ///
    /// Returns the day of the last row when fewer remain, `None` when none do.
    async fn lookahead_date(
        &self,
        table: LogicalTable,
        from: NaiveDate,
        rows: u64,
    ) -> Result<Option<NaiveDate>>;

    /// Execute a raw statement.
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Get the store type.
    fn store_type(&self) -> &'static str;
}
