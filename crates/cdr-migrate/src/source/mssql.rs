//! SQL Server source store.

use super::{DateBounds, SourceRecord, SourceStore};
use crate::error::Result;
use crate::pool::{qualify, quote_ident, MssqlPool};
use crate::tables::{DayWindow, LogicalTable};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use tiberius::Row;
use tracing::debug;

/// Reads record tables from the live source database.
pub struct MssqlSource {
    pool: Arc<MssqlPool>,
    schema: String,
    page_size: usize,
}

impl MssqlSource {
    pub fn new(pool: Arc<MssqlPool>, schema: impl Into<String>, page_size: usize) -> Self {
        Self {
            pool,
            schema: schema.into(),
            page_size: page_size.max(1),
        }
    }

    fn qualified(&self, table: LogicalTable) -> String {
        qualify(&self.schema, table.table_name())
    }

    fn window_page_sql(&self, table: LogicalTable) -> String {
        let cols: Vec<String> = table.columns().iter().map(|c| quote_ident(c)).collect();
        let ts = quote_ident(table.timestamp_column());
        format!(
            "SELECT {} FROM {} WHERE {ts} >= @P1 AND {ts} < @P2 \
             ORDER BY [id] OFFSET @P3 ROWS FETCH NEXT @P4 ROWS ONLY",
            cols.join(", "),
            self.qualified(table),
        )
    }

    async fn single_row(&self, context: &str, sql: &str) -> Result<Option<Row>> {
        let mut conn = self.pool.get_conn().await?;
        self.pool
            .timed(context, async {
                conn.simple_query(sql).await?.into_row().await
            })
            .await
    }
}

#[async_trait]
impl SourceStore for MssqlSource {
    async fn row_count(&self, table: LogicalTable) -> Result<i64> {
        let sql = format!(
            "SELECT CAST(COUNT_BIG(*) AS BIGINT) FROM {}",
            self.qualified(table)
        );
        let row = self.single_row("counting source rows", &sql).await?;
        Ok(row.and_then(|r| r.get::<i64, _>(0)).unwrap_or(0))
    }

    async fn date_bounds(&self, table: LogicalTable) -> Result<DateBounds> {
        let ts = quote_ident(table.timestamp_column());
        let sql = format!(
            "SELECT CAST(SWITCHOFFSET(MIN({ts}), '+00:00') AS DATE), \
                    CAST(SWITCHOFFSET(MAX({ts}), '+00:00') AS DATE) \
             FROM {}",
            self.qualified(table)
        );
        let row = self.single_row("scanning source date bounds", &sql).await?;
        let bounds = match row {
            Some(row) => DateBounds {
                min_date: row.try_get::<NaiveDate, _>(0)?,
                max_date: row.try_get::<NaiveDate, _>(1)?,
            },
            None => DateBounds::default(),
        };
        debug!("{} bounds: {:?}", table, bounds);
        Ok(bounds)
    }

    async fn read_window(
        &self,
        table: LogicalTable,
        window: DayWindow,
    ) -> Result<Vec<SourceRecord>> {
        let sql = self.window_page_sql(table);
        let start = window.start_utc();
        let end = window.end_utc();
        let fetch = self.page_size as i64;
        let mut offset = 0i64;
        let mut records = Vec::new();
        let mut conn = self.pool.get_conn().await?;

        loop {
            let rows = self
                .pool
                .timed("reading source window", async {
                    conn.query(sql.as_str(), &[&start, &end, &offset, &fetch])
                        .await?
                        .into_first_result()
                        .await
                })
                .await?;

            let fetched = rows.len();
            for row in &rows {
                records.push(SourceRecord::from_row(table, row)?);
            }

            debug!(
                "{}: fetched {} rows at offset {} for {}",
                table, fetched, offset, window
            );

            if fetched < self.page_size {
                break;
            }
            offset += fetched as i64;
        }

        Ok(records)
    }

    async fn lookahead_date(
        &self,
        table: LogicalTable,
        from: NaiveDate,
        rows: u64,
    ) -> Result<Option<NaiveDate>> {
        let ts = quote_ident(table.timestamp_column());
        let sql = format!(
            "SELECT CAST(SWITCHOFFSET(MAX(head.ts), '+00:00') AS DATE) FROM \
             (SELECT TOP (@P1) {ts} AS ts FROM {} WHERE {ts} >= @P2 ORDER BY {ts}) AS head",
            self.qualified(table)
        );
        let top = rows as i64;
        let from = DayWindow::new(from).start_utc();
        let mut conn = self.pool.get_conn().await?;
        let row = self
            .pool
            .timed("row cap lookahead", async {
                conn.query(sql.as_str(), &[&top, &from]).await?.into_row().await
            })
            .await?;

        match row {
            Some(row) => Ok(row.try_get::<NaiveDate, _>(0)?),
            None => Ok(None),
        }
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        self.pool
            .timed("source statement", conn.execute(sql, &[]))
            .await?;
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "mssql"
    }
}
