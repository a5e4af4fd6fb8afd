//! Immutable snapshots of source rows.

use crate::error::{MigrateError, Result};
use crate::tables::LogicalTable;
use crate::target::SqlValue;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tiberius::Row;
use uuid::Uuid;

/// A row of `ww.calls`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: Uuid,
    pub originating_device_id: Option<Uuid>,
    pub terminating_device_id: Option<Uuid>,
    pub caller: Option<String>,
    pub called: Option<String>,
    pub direction: Option<String>,
    pub user_id: Option<Uuid>,
    pub created: DateTime<FixedOffset>,
    pub modified: Option<DateTime<FixedOffset>>,
    pub start_datetime: DateTime<FixedOffset>,
    pub stop_datetime: DateTime<FixedOffset>,
    pub bookmarks_count: i32,
    pub comments_count: i32,
    pub retention_expiry: Option<DateTime<FixedOffset>>,
    pub availability_status: Option<String>,
    pub additional_data: Option<String>,
    pub association_id: Option<Uuid>,
    pub channel_key: Option<String>,
    pub call_type: i16,
}

/// A row of `ww.media_stubs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaStubRecord {
    pub id: Uuid,
    pub call_id: Uuid,
    pub stub_type: Option<String>,
    pub created: DateTime<FixedOffset>,
    pub modified: Option<DateTime<FixedOffset>>,
    pub location_id: Uuid,
    pub file_id: Option<String>,
    pub retention_expiry: Option<DateTime<FixedOffset>>,
}

/// A row of `ww.vox_stubs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoxStubRecord {
    pub id: Uuid,
    pub created: DateTime<FixedOffset>,
    pub modified: Option<DateTime<FixedOffset>>,
    pub location_id: Uuid,
    pub file_id: Option<String>,
    pub retention_expiry: DateTime<FixedOffset>,
    pub availability_status: Option<String>,
    pub additional_data: Option<String>,
    pub channel_key: Option<String>,
    pub start_datetime: DateTime<FixedOffset>,
    pub stop_datetime: DateTime<FixedOffset>,
}

/// A row of any logical table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum SourceRecord {
    Call(CallRecord),
    MediaStub(MediaStubRecord),
    VoxStub(VoxStubRecord),
}

impl SourceRecord {
    pub fn table(&self) -> LogicalTable {
        match self {
            SourceRecord::Call(_) => LogicalTable::Calls,
            SourceRecord::MediaStub(_) => LogicalTable::MediaStubs,
            SourceRecord::VoxStub(_) => LogicalTable::VoxStubs,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            SourceRecord::Call(r) => r.id,
            SourceRecord::MediaStub(r) => r.id,
            SourceRecord::VoxStub(r) => r.id,
        }
    }

    /// The timestamp day windows are evaluated against.
    pub fn primary_timestamp(&self) -> DateTime<FixedOffset> {
        match self {
            SourceRecord::Call(r) => r.start_datetime,
            SourceRecord::MediaStub(r) => r.created,
            SourceRecord::VoxStub(r) => r.start_datetime,
        }
    }

    /// Column values in [`LogicalTable::columns`] order.
    pub fn to_values(&self) -> Vec<SqlValue> {
        match self {
            SourceRecord::Call(r) => vec![
                r.id.into(),
                r.originating_device_id.into(),
                r.terminating_device_id.into(),
                (&r.caller).into(),
                (&r.called).into(),
                (&r.direction).into(),
                r.user_id.into(),
                r.created.into(),
                r.modified.into(),
                r.start_datetime.into(),
                r.stop_datetime.into(),
                r.bookmarks_count.into(),
                r.comments_count.into(),
                r.retention_expiry.into(),
                (&r.availability_status).into(),
                (&r.additional_data).into(),
                r.association_id.into(),
                (&r.channel_key).into(),
                r.call_type.into(),
            ],
            SourceRecord::MediaStub(r) => vec![
                r.id.into(),
                r.call_id.into(),
                (&r.stub_type).into(),
                r.created.into(),
                r.modified.into(),
                r.location_id.into(),
                (&r.file_id).into(),
                r.retention_expiry.into(),
            ],
            SourceRecord::VoxStub(r) => vec![
                r.id.into(),
                r.created.into(),
                r.modified.into(),
                r.location_id.into(),
                (&r.file_id).into(),
                r.retention_expiry.into(),
                (&r.availability_status).into(),
                (&r.additional_data).into(),
                (&r.channel_key).into(),
                r.start_datetime.into(),
                r.stop_datetime.into(),
            ],
        }
    }

    /// Decode a row selected with [`LogicalTable::columns`].
    pub fn from_row(table: LogicalTable, row: &Row) -> Result<Self> {
        let record = match table {
            LogicalTable::Calls => SourceRecord::Call(CallRecord {
                id: required(row, "id")?,
                originating_device_id: row.try_get("originating_device_id")?,
                terminating_device_id: row.try_get("terminating_device_id")?,
                caller: text(row, "caller")?,
                called: text(row, "called")?,
                direction: text(row, "direction")?,
                user_id: row.try_get("user_id")?,
                created: required(row, "created")?,
                modified: row.try_get("modified")?,
                start_datetime: required(row, "start_datetime")?,
                stop_datetime: required(row, "stop_datetime")?,
                bookmarks_count: required(row, "bookmarks_count")?,
                comments_count: required(row, "comments_count")?,
                retention_expiry: row.try_get("retention_expiry")?,
                availability_status: text(row, "availability_status")?,
                additional_data: text(row, "additional_data")?,
                association_id: row.try_get("association_id")?,
                channel_key: text(row, "channel_key")?,
                call_type: required(row, "call_type")?,
            }),
            LogicalTable::MediaStubs => SourceRecord::MediaStub(MediaStubRecord {
                id: required(row, "id")?,
                call_id: required(row, "call_id")?,
                stub_type: text(row, "stub_type")?,
                created: required(row, "created")?,
                modified: row.try_get("modified")?,
                location_id: required(row, "location_id")?,
                file_id: text(row, "file_id")?,
                retention_expiry: row.try_get("retention_expiry")?,
            }),
            LogicalTable::VoxStubs => SourceRecord::VoxStub(VoxStubRecord {
                id: required(row, "id")?,
                created: required(row, "created")?,
                modified: row.try_get("modified")?,
                location_id: required(row, "location_id")?,
                file_id: text(row, "file_id")?,
                retention_expiry: required(row, "retention_expiry")?,
                availability_status: text(row, "availability_status")?,
                additional_data: text(row, "additional_data")?,
                channel_key: text(row, "channel_key")?,
                start_datetime: required(row, "start_datetime")?,
                stop_datetime: required(row, "stop_datetime")?,
            }),
        };
        Ok(record)
    }
}

fn required<'a, T>(row: &'a Row, col: &str) -> Result<T>
where
    T: tiberius::FromSql<'a>,
{
    row.try_get::<T, _>(col)?
        .ok_or_else(|| MigrateError::transfer("source row", format!("{} is NULL", col)))
}

fn text(row: &Row, col: &str) -> Result<Option<String>> {
    Ok(row.try_get::<&str, _>(col)?.map(str::to_owned))
}
