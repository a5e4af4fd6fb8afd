//! MSSQL cursor table in the source database.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use tiberius::{Row, ToSql};

use crate::error::{MigrateError, Result};
use crate::pool::{qualify, MssqlPool};
use crate::source::DateBounds;
use crate::state::backend::{CursorBackend, CursorSeed};
use crate::state::SyncState;
use crate::tables::LogicalTable;

const CURSOR_SCHEMA: &str = "dbo";
const CURSOR_TABLE: &str = "SyncedTableInfo";

/// Cursor rows stored in `[dbo].[SyncedTableInfo]`.
pub struct MssqlCursorBackend {
    pool: Arc<MssqlPool>,
    table: String,
}

impl MssqlCursorBackend {
    pub fn new(pool: Arc<MssqlPool>) -> Self {
        Self {
            pool,
            table: qualify(CURSOR_SCHEMA, CURSOR_TABLE),
        }
    }

    fn row_to_state(row: &Row) -> Result<SyncState> {
        let related: &str = row.try_get("RelatedTable")?.unwrap_or_default();
        let table = LogicalTable::from_related_table(related).ok_or_else(|| {
            MigrateError::BootstrapInconsistent(format!("unknown related table '{}'", related))
        })?;

        Ok(SyncState {
            id: row.try_get::<i32, _>("Id")?.unwrap_or_default(),
            table,
            last_synced_at: row.try_get::<NaiveDate, _>("LastSyncedAt")?,
            min_date: row.try_get::<NaiveDate, _>("MinDate")?,
            max_date: row.try_get::<NaiveDate, _>("MaxDate")?,
        })
    }
}

#[async_trait]
impl CursorBackend for MssqlCursorBackend {
    async fn exists(&self) -> Result<bool> {
        let sql = format!(
            "SELECT CAST(CASE WHEN OBJECT_ID('{}', 'U') IS NULL THEN 0 ELSE 1 END AS INT)",
            self.table
        );
        let mut conn = self.pool.get_conn().await?;
        let row = self
            .pool
            .timed("checking cursor table", async {
                conn.simple_query(sql).await?.into_row().await
            })
            .await?;
        Ok(row.and_then(|r| r.get::<i32, _>(0)).unwrap_or(0) == 1)
    }

    async fn create(&self, seeds: &[CursorSeed]) -> Result<()> {
        let sql = create_and_seed_sql(&self.table, seeds.len());
        let values: Vec<(&str, Option<NaiveDate>, Option<NaiveDate>)> = seeds
            .iter()
            .map(|seed| {
                (
                    seed.table.related_table(),
                    seed.bounds.min_date,
                    seed.bounds.max_date,
                )
            })
            .collect();
        let params: Vec<&dyn ToSql> = values
            .iter()
            .flat_map(|(related, min, max)| {
                [related as &dyn ToSql, min as &dyn ToSql, max as &dyn ToSql]
            })
            .collect();

        let mut conn = self.pool.get_conn().await?;
        self.pool
            .timed(
                "creating cursor table",
                conn.execute(sql.as_str(), &params),
            )
            .await?;

        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<SyncState>> {
        if !self.exists().await? {
            return Err(MigrateError::NotBootstrapped);
        }

        let sql = format!(
            "SELECT [Id], [LastSyncedAt], [RelatedTable], [MinDate], [MaxDate] FROM {} ORDER BY [Id]",
            self.table
        );
        let mut conn = self.pool.get_conn().await?;
        let rows = self
            .pool
            .timed("loading cursors", async {
                conn.simple_query(sql).await?.into_first_result().await
            })
            .await?;

        rows.iter().map(Self::row_to_state).collect()
    }

    async fn store_last_synced(&self, table: LogicalTable, date: NaiveDate) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET [LastSyncedAt] = @P1 WHERE [RelatedTable] = @P2",
            self.table
        );
        let related = table.related_table();
        let mut conn = self.pool.get_conn().await?;
        let result = self
            .pool
            .timed(
                "advancing cursor",
                conn.execute(sql.as_str(), &[&date, &related]),
            )
            .await?;
        Ok(result.total())
    }

    async fn store_bounds(&self, table: LogicalTable, bounds: DateBounds) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET [MinDate] = @P1, [MaxDate] = @P2 WHERE [RelatedTable] = @P3",
            self.table
        );
        let related = table.related_table();
        let mut conn = self.pool.get_conn().await?;
        let result = self
            .pool
            .timed(
                "refreshing cursor bounds",
                conn.execute(
                    sql.as_str(),
                    &[&bounds.min_date, &bounds.max_date, &related],
                ),
            )
            .await?;
        Ok(result.total())
    }

    fn backend_type(&self) -> &'static str {
        "mssql"
    }
}

/// Create and seed the cursor table in one batch.
///
/// `XACT_ABORT` rolls the whole batch back on any error, so the table never
/// exists without its seed rows.
fn create_and_seed_sql(table: &str, seed_count: usize) -> String {
    let values = (0..seed_count)
        .map(|i| format!("(NULL, @P{}, @P{}, @P{})", i * 3 + 1, i * 3 + 2, i * 3 + 3))
        .collect::<Vec<_>>()
        .join(", ");
    let seed = if seed_count == 0 {
        String::new()
    } else {
        format!(
            "INSERT INTO {table} ([LastSyncedAt], [RelatedTable], [MinDate], [MaxDate]) \
             VALUES {values};",
            table = table,
            values = values
        )
    };

    format!(
        "SET XACT_ABORT ON;
         BEGIN TRANSACTION;
         IF OBJECT_ID('{table}', 'U') IS NULL
         BEGIN
             CREATE TABLE {table} (
                 [Id] INT IDENTITY(1,1) NOT NULL PRIMARY KEY,
                 [LastSyncedAt] DATE NULL,
                 [RelatedTable] VARCHAR(15) NOT NULL,
                 [MinDate] DATE NULL,
                 [MaxDate] DATE NULL,
                 [DaysPending] AS DATEDIFF(DAY, COALESCE([LastSyncedAt], [MinDate]), [MaxDate])
             );
             {seed}
         END
         COMMIT TRANSACTION;",
        table = table,
        seed = seed
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_seed_is_one_transaction() {
        let sql = create_and_seed_sql("[dbo].[SyncedTableInfo]", 3);

        assert!(sql.starts_with("SET XACT_ABORT ON;"));
        let begin = sql.find("BEGIN TRANSACTION").unwrap();
        let create = sql.find("CREATE TABLE").unwrap();
        let insert = sql.find("INSERT INTO").unwrap();
        let commit = sql.find("COMMIT TRANSACTION").unwrap();
        assert!(begin < create && create < insert && insert < commit);
        assert_eq!(sql.matches("INSERT INTO").count(), 1);
    }

    #[test]
    fn test_seed_rows_are_parameterized() {
        let sql = create_and_seed_sql("[dbo].[SyncedTableInfo]", 3);

        assert!(sql.contains(
            "(NULL, @P1, @P2, @P3), (NULL, @P4, @P5, @P6), (NULL, @P7, @P8, @P9)"
        ));
        assert!(!sql.contains("@P10"));
    }

    #[test]
    fn test_seeds_only_written_with_new_table() {
        let sql = create_and_seed_sql("[dbo].[SyncedTableInfo]", 3);

        // Both statements sit inside the OBJECT_ID guard
        let guard = sql.find("IS NULL").unwrap();
        let end = sql.rfind("END").unwrap();
        let insert = sql.find("INSERT INTO").unwrap();
        assert!(guard < insert && insert < end);
    }
}
