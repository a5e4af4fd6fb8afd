//! Target database operations.

mod mssql;

pub use mssql::MssqlTarget;

use crate::constraints::TableIndexDescriptor;
use crate::error::Result;
use crate::source::SourceRecord;
use crate::tables::LogicalTable;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use uuid::Uuid;

/// Trait for target database operations.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Insert records in batches of `batch_size`.
    ///
    /// A duplicate id surfaces as [`crate::MigrateError::PrimaryKeyConflict`].
    async fn insert_records(
        &self,
        table: LogicalTable,
        records: &[SourceRecord],
        batch_size: usize,
    ) -> Result<u64>;

    /// Return the subset of `ids` already present in the target table.
    async fn existing_ids(&self, table: LogicalTable, ids: &[Uuid]) -> Result<Vec<Uuid>>;

    /// Delete rows by id, returning the number removed.
    async fn delete_ids(&self, table: LogicalTable, ids: &[Uuid]) -> Result<u64>;

    /// Get the row count for a table.
    async fn row_count(&self, table: LogicalTable) -> Result<i64>;

    /// Run the non-clustered index status query.
    async fn index_descriptors(&self, query: &str) -> Result<Vec<TableIndexDescriptor>>;

    /// Execute a raw statement.
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Get the store type.
    fn store_type(&self) -> &'static str;
}

/// SQL value enum for type-safe row handling.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null(SqlNullType),
    I16(i16),
    I32(i32),
    String(String),
    Uuid(Uuid),
    DateTimeOffset(DateTime<FixedOffset>),
}

/// Type hint for NULL values so bulk load encodes the right column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlNullType {
    I16,
    I32,
    String,
    Uuid,
    DateTimeOffset,
}

impl From<i16> for SqlValue {
    fn from(v: i16) -> Self {
        SqlValue::I16(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::I32(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl From<DateTime<FixedOffset>> for SqlValue {
    fn from(v: DateTime<FixedOffset>) -> Self {
        SqlValue::DateTimeOffset(v)
    }
}

impl From<&Option<String>> for SqlValue {
    fn from(v: &Option<String>) -> Self {
        match v {
            Some(s) => SqlValue::String(s.clone()),
            None => SqlValue::Null(SqlNullType::String),
        }
    }
}

impl From<Option<Uuid>> for SqlValue {
    fn from(v: Option<Uuid>) -> Self {
        v.map_or(SqlValue::Null(SqlNullType::Uuid), SqlValue::Uuid)
    }
}

impl From<Option<DateTime<FixedOffset>>> for SqlValue {
    fn from(v: Option<DateTime<FixedOffset>>) -> Self {
        v.map_or(
            SqlValue::Null(SqlNullType::DateTimeOffset),
            SqlValue::DateTimeOffset,
        )
    }
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_values_carry_null_type() {
        assert_eq!(
            SqlValue::from(None::<Uuid>),
            SqlValue::Null(SqlNullType::Uuid)
        );
        assert_eq!(
            SqlValue::from(&None::<String>),
            SqlValue::Null(SqlNullType::String)
        );
        assert_eq!(
            SqlValue::from(None::<DateTime<FixedOffset>>),
            SqlValue::Null(SqlNullType::DateTimeOffset)
        );
        assert!(SqlValue::from(None::<Uuid>).is_null());
    }

    #[test]
    fn test_present_values() {
        let id = Uuid::new_v4();
        assert_eq!(SqlValue::from(Some(id)), SqlValue::Uuid(id));
        assert_eq!(
            SqlValue::from(&Some("inbound".to_string())),
            SqlValue::String("inbound".into())
        );
        assert_eq!(SqlValue::from(3i16), SqlValue::I16(3));
    }
}
