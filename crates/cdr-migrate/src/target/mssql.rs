//! SQL Server target store.

use super::{SqlNullType, SqlValue, TargetStore};
use crate::constraints::TableIndexDescriptor;
use crate::error::{MigrateError, Result};
use crate::pool::{qualify, quote_ident, MssqlConnection, MssqlPool};
use crate::source::SourceRecord;
use crate::tables::LogicalTable;
use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use std::borrow::Cow;
use std::sync::Arc;
use tiberius::{ColumnData, ToSql, TokenRow};
use tracing::{debug, warn};
use uuid::Uuid;

/// Maximum string length (in bytes) for TDS bulk insert.
/// Tiberius bulk insert has a hard limit of 65535 bytes for UTF-16 encoded strings.
const BULK_INSERT_STRING_LIMIT: usize = 65535;

/// SQL Server rejects statements with more than 2100 parameters.
const MAX_PARAMS: usize = 2100;

/// Id lists are chunked below the parameter limit.
const ID_CHUNK: usize = 2000;

/// Writes migrated records into the target database.
pub struct MssqlTarget {
    pool: Arc<MssqlPool>,
    schema: String,
}

impl MssqlTarget {
    pub fn new(pool: Arc<MssqlPool>, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    fn qualified(&self, table: LogicalTable) -> String {
        qualify(&self.schema, table.table_name())
    }

    /// Check if a row contains any string values that exceed the bulk insert limit.
    fn row_has_oversized_strings(row: &[SqlValue]) -> bool {
        row.iter().any(|value| match value {
            // len_utf16() counts code units, so surrogate pairs count twice
            SqlValue::String(s) => {
                s.chars().map(|c| c.len_utf16() * 2).sum::<usize>() > BULK_INSERT_STRING_LIMIT
            }
            _ => false,
        })
    }

    /// Bulk load one batch, sending oversized rows through parameterized INSERTs.
    ///
    /// A batch that mixes both kinds runs in one transaction so a failed
    /// fallback does not leave the bulk half committed.
    async fn write_batch(
        conn: &mut MssqlConnection<'_>,
        table: LogicalTable,
        qualified_table: &str,
        rows: Vec<Vec<SqlValue>>,
    ) -> Result<u64> {
        let (oversized_rows, bulk_rows): (Vec<_>, Vec<_>) = rows
            .into_iter()
            .partition(|row| Self::row_has_oversized_strings(row));

        let use_transaction = needs_transaction(bulk_rows.len(), oversized_rows.len());
        if use_transaction {
            conn.execute("BEGIN TRANSACTION", &[]).await.map_err(|e| {
                MigrateError::transfer(qualified_table, format!("begin transaction: {}", e))
            })?;
        }

        let result =
            Self::load_rows(conn, table, qualified_table, bulk_rows, &oversized_rows).await;

        if use_transaction {
            match &result {
                Ok(_) => {
                    conn.execute("COMMIT TRANSACTION", &[]).await.map_err(|e| {
                        MigrateError::transfer(
                            qualified_table,
                            format!("commit transaction: {}", e),
                        )
                    })?;
                }
                Err(_) => {
                    if let Err(e) = conn.execute("ROLLBACK TRANSACTION", &[]).await {
                        warn!("Rollback of {} batch failed: {}", qualified_table, e);
                    }
                }
            }
        }

        result
    }

    async fn load_rows(
        conn: &mut MssqlConnection<'_>,
        table: LogicalTable,
        qualified_table: &str,
        bulk_rows: Vec<Vec<SqlValue>>,
        oversized_rows: &[Vec<SqlValue>],
    ) -> Result<u64> {
        let mut total_inserted = 0u64;

        if !bulk_rows.is_empty() {
            let bulk_count = bulk_rows.len() as u64;

            // Tiberius reads column metadata from the target table
            let mut bulk_load = conn
                .bulk_insert(qualified_table)
                .await
                .map_err(|e| MigrateError::from_insert(table.related_table(), e))?;

            for row in bulk_rows {
                let mut token_row = TokenRow::new();
                for value in &row {
                    token_row.push(sql_value_to_column_data(value));
                }
                bulk_load
                    .send(token_row)
                    .await
                    .map_err(|e| MigrateError::from_insert(table.related_table(), e))?;
            }

            let result = bulk_load
                .finalize()
                .await
                .map_err(|e| MigrateError::from_insert(table.related_table(), e))?;

            debug!(
                "Bulk inserted {} rows into {} (reported: {})",
                bulk_count,
                qualified_table,
                result.total()
            );
            total_inserted += bulk_count;
        }

        if !oversized_rows.is_empty() {
            debug!(
                "Falling back to INSERT for {} rows with oversized strings in {}",
                oversized_rows.len(),
                qualified_table
            );
            total_inserted +=
                Self::insert_rows_fallback(conn, table, qualified_table, oversized_rows).await?;
        }

        Ok(total_inserted)
    }

    /// Insert rows using multi-row parameterized INSERT statements.
    async fn insert_rows_fallback(
        conn: &mut MssqlConnection<'_>,
        table: LogicalTable,
        qualified_table: &str,
        rows: &[Vec<SqlValue>],
    ) -> Result<u64> {
        let cols = table.columns();
        let col_str = cols
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let rows_per_batch = (MAX_PARAMS / cols.len()).max(1);

        let mut total_inserted = 0u64;

        for batch in rows.chunks(rows_per_batch) {
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                qualified_table,
                col_str,
                values_clause(batch.len(), cols.len())
            );

            let params: Vec<Box<dyn ToSql>> = batch
                .iter()
                .flat_map(|row| row.iter().map(sql_value_to_sql_param))
                .collect();
            let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();

            conn.execute(sql.as_str(), &param_refs)
                .await
                .map_err(|e| MigrateError::from_insert(table.related_table(), e))?;

            total_inserted += batch.len() as u64;
        }

        Ok(total_inserted)
    }
}

#[async_trait]
impl TargetStore for MssqlTarget {
    async fn insert_records(
        &self,
        table: LogicalTable,
        records: &[SourceRecord],
        batch_size: usize,
    ) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let qualified_table = self.qualified(table);
        let mut conn = self.pool.get_conn().await?;
        let mut total = 0u64;

        for chunk in records.chunks(batch_size.max(1)) {
            let rows: Vec<Vec<SqlValue>> = chunk.iter().map(SourceRecord::to_values).collect();
            total += self
                .pool
                .timed(
                    "bulk insert",
                    Self::write_batch(&mut conn, table, &qualified_table, rows),
                )
                .await?;
        }

        Ok(total)
    }

    async fn existing_ids(&self, table: LogicalTable, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let qualified_table = self.qualified(table);
        let mut conn = self.pool.get_conn().await?;
        let mut existing = Vec::new();

        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!(
                "SELECT [id] FROM {} WHERE [id] IN ({})",
                qualified_table,
                placeholders(1, chunk.len())
            );
            let params: Vec<&dyn ToSql> = chunk.iter().map(|id| id as &dyn ToSql).collect();
            let rows = self
                .pool
                .timed("looking up existing ids", async {
                    conn.query(sql.as_str(), &params).await?.into_first_result().await
                })
                .await?;
            existing.extend(rows.iter().filter_map(|r| r.get::<Uuid, _>(0)));
        }

        Ok(existing)
    }

    async fn delete_ids(&self, table: LogicalTable, ids: &[Uuid]) -> Result<u64> {
        let qualified_table = self.qualified(table);
        let mut conn = self.pool.get_conn().await?;
        let mut deleted = 0u64;

        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!(
                "DELETE FROM {} WHERE [id] IN ({})",
                qualified_table,
                placeholders(1, chunk.len())
            );
            let params: Vec<&dyn ToSql> = chunk.iter().map(|id| id as &dyn ToSql).collect();
            let result = self
                .pool
                .timed("deleting conflicting ids", conn.execute(sql.as_str(), &params))
                .await?;
            deleted += result.total();
        }

        Ok(deleted)
    }

    async fn row_count(&self, table: LogicalTable) -> Result<i64> {
        let sql = format!(
            "SELECT CAST(COUNT_BIG(*) AS BIGINT) FROM {}",
            self.qualified(table)
        );
        let mut conn = self.pool.get_conn().await?;
        let row = self
            .pool
            .timed("counting target rows", async {
                conn.simple_query(sql.as_str()).await?.into_row().await
            })
            .await?;
        Ok(row.and_then(|r| r.get::<i64, _>(0)).unwrap_or(0))
    }

    async fn index_descriptors(&self, query: &str) -> Result<Vec<TableIndexDescriptor>> {
        let mut conn = self.pool.get_conn().await?;
        let rows = self
            .pool
            .timed("reading index status", async {
                conn.simple_query(query).await?.into_first_result().await
            })
            .await?;

        rows.iter()
            .map(|row| {
                let text = |col: &str| -> Result<String> {
                    row.try_get::<&str, _>(col)?
                        .map(str::to_owned)
                        .ok_or_else(|| {
                            MigrateError::Config(format!(
                                "index status query returned NULL {}",
                                col
                            ))
                        })
                };
                Ok(TableIndexDescriptor {
                    table_name: text("TableName")?,
                    index_name: text("IndexName")?,
                    enable_statement: text("EnableQuery")?,
                    disable_statement: text("DisableQuery")?,
                    is_disabled: row.try_get::<bool, _>("IsDisabled")?.unwrap_or(false),
                })
            })
            .collect()
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        self.pool
            .timed("target statement", conn.execute(sql, &[]))
            .await?;
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "mssql"
    }
}

/// A batch split across bulk load and fallback INSERTs runs in one transaction.
fn needs_transaction(bulk_rows: usize, oversized_rows: usize) -> bool {
    bulk_rows > 0 && oversized_rows > 0
}

/// `@P{first}, @P{first+1}, ...` for `count` parameters.
fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("@P{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `(@P1, @P2), (@P3, @P4), ...` for `rows` rows of `cols` columns.
fn values_clause(rows: usize, cols: usize) -> String {
    (0..rows)
        .map(|r| format!("({})", placeholders(r * cols + 1, cols)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Convert SqlValue to a boxed ToSql trait object for parameterized queries.
fn sql_value_to_sql_param(value: &SqlValue) -> Box<dyn ToSql> {
    match value {
        SqlValue::Null(null_type) => match null_type {
            SqlNullType::I16 => Box::new(Option::<i16>::None),
            SqlNullType::I32 => Box::new(Option::<i32>::None),
            SqlNullType::String => Box::new(Option::<String>::None),
            SqlNullType::Uuid => Box::new(Option::<Uuid>::None),
            SqlNullType::DateTimeOffset => {
                Box::new(Option::<chrono::DateTime<chrono::FixedOffset>>::None)
            }
        },
        SqlValue::I16(i) => Box::new(*i),
        SqlValue::I32(i) => Box::new(*i),
        SqlValue::String(s) => Box::new(s.clone()),
        SqlValue::Uuid(u) => Box::new(*u),
        SqlValue::DateTimeOffset(dto) => Box::new(*dto),
    }
}

/// Convert SqlValue to Tiberius ColumnData for bulk insert.
fn sql_value_to_column_data(value: &SqlValue) -> ColumnData<'static> {
    match value {
        SqlValue::Null(null_type) => match null_type {
            SqlNullType::I16 => ColumnData::I16(None),
            SqlNullType::I32 => ColumnData::I32(None),
            SqlNullType::String => ColumnData::String(None),
            SqlNullType::Uuid => ColumnData::Guid(None),
            SqlNullType::DateTimeOffset => ColumnData::DateTimeOffset(None),
        },
        SqlValue::I16(i) => ColumnData::I16(Some(*i)),
        SqlValue::I32(i) => ColumnData::I32(Some(*i)),
        SqlValue::String(s) => ColumnData::String(Some(Cow::Owned(s.clone()))),
        SqlValue::Uuid(u) => ColumnData::Guid(Some(*u)),
        SqlValue::DateTimeOffset(dto) => {
            // DateTimeOffset is a UTC DateTime2 plus the offset in minutes
            let naive = dto.naive_utc();
            let days = naive.date().num_days_from_ce() - 1;
            if days < 0 {
                warn!("DateTimeOffset before year 1 ({}), converting to NULL", dto);
                return ColumnData::DateTimeOffset(None);
            }
            let date = tiberius::time::Date::new(days as u32);
            let time_val = naive.time();
            let nanos = time_val.num_seconds_from_midnight() as u64 * 1_000_000_000
                + time_val.nanosecond() as u64;
            // Scale 7 = 100 nanosecond increments
            let time = tiberius::time::Time::new(nanos / 100, 7);
            let datetime2 = tiberius::time::DateTime2::new(date, time);
            let offset_minutes = (dto.offset().local_minus_utc() / 60) as i16;
            ColumnData::DateTimeOffset(Some(tiberius::time::DateTimeOffset::new(
                datetime2,
                offset_minutes,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    #[test]
    fn test_row_has_oversized_strings() {
        assert!(!MssqlTarget::row_has_oversized_strings(&[]));
        assert!(!MssqlTarget::row_has_oversized_strings(&[
            SqlValue::String("short".into()),
            SqlValue::I32(1),
        ]));

        // 32767 BMP chars = 65534 bytes, at the limit
        let at_limit = "a".repeat(32_767);
        assert!(!MssqlTarget::row_has_oversized_strings(&[SqlValue::String(at_limit)]));

        let over_limit = "a".repeat(32_768);
        assert!(MssqlTarget::row_has_oversized_strings(&[
            SqlValue::Null(SqlNullType::String),
            SqlValue::String(over_limit),
        ]));
    }

    #[test]
    fn test_surrogate_pairs_count_four_bytes() {
        // 16384 emoji = 65536 bytes in UTF-16
        let emoji = "\u{1F600}".repeat(16_384);
        assert!(MssqlTarget::row_has_oversized_strings(&[SqlValue::String(emoji)]));
    }

    #[test]
    fn test_mixed_batch_runs_in_transaction() {
        assert!(needs_transaction(10, 1));
        assert!(!needs_transaction(10, 0));
        assert!(!needs_transaction(0, 3));
        assert!(!needs_transaction(0, 0));
    }

    #[test]
    fn test_placeholders_and_values_clause() {
        assert_eq!(placeholders(1, 3), "@P1, @P2, @P3");
        assert_eq!(values_clause(2, 2), "(@P1, @P2), (@P3, @P4)");
    }

    #[test]
    fn test_fallback_batch_respects_param_limit() {
        let cols = LogicalTable::Calls.columns().len();
        let rows_per_batch = (MAX_PARAMS / cols).max(1);
        assert!(rows_per_batch * cols <= MAX_PARAMS);
    }

    #[test]
    fn test_null_types_map_to_typed_column_data() {
        assert!(matches!(
            sql_value_to_column_data(&SqlValue::Null(SqlNullType::Uuid)),
            ColumnData::Guid(None)
        ));
        assert!(matches!(
            sql_value_to_column_data(&SqlValue::Null(SqlNullType::DateTimeOffset)),
            ColumnData::DateTimeOffset(None)
        ));
        assert!(matches!(
            sql_value_to_column_data(&SqlValue::Null(SqlNullType::I16)),
            ColumnData::I16(None)
        ));
    }

    #[test]
    fn test_datetimeoffset_keeps_offset_minutes() {
        let offset = FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap();
        let dto = offset.with_ymd_and_hms(2013, 1, 1, 12, 0, 0).unwrap();
        match sql_value_to_column_data(&SqlValue::DateTimeOffset(dto)) {
            ColumnData::DateTimeOffset(Some(value)) => {
                assert_eq!(value.offset(), 330);
            }
            other => panic!("unexpected column data: {:?}", other),
        }
    }

    #[test]
    fn test_basic_values() {
        let id = Uuid::new_v4();
        assert!(matches!(
            sql_value_to_column_data(&SqlValue::Uuid(id)),
            ColumnData::Guid(Some(g)) if g == id
        ));
        assert!(matches!(
            sql_value_to_column_data(&SqlValue::I16(4)),
            ColumnData::I16(Some(4))
        ));
    }
}
