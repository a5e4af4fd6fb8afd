//! The fixed set of logical tables and the day window they are synced in.

use crate::progress::ProgressField;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the three record kinds migrated, each with its own cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalTable {
    Calls,
    MediaStubs,
    VoxStubs,
}

const CALL_COLUMNS: &[&str] = &[
    "id",
    "originating_device_id",
    "terminating_device_id",
    "caller",
    "called",
    "direction",
    "user_id",
    "created",
    "modified",
    "start_datetime",
    "stop_datetime",
    "bookmarks_count",
    "comments_count",
    "retention_expiry",
    "availability_status",
    "additional_data",
    "association_id",
    "channel_key",
    "call_type",
];

const MEDIA_STUB_COLUMNS: &[&str] = &[
    "id",
    "call_id",
    "stub_type",
    "created",
    "modified",
    "location_id",
    "file_id",
    "retention_expiry",
];

const VOX_STUB_COLUMNS: &[&str] = &[
    "id",
    "created",
    "modified",
    "location_id",
    "file_id",
    "retention_expiry",
    "availability_status",
    "additional_data",
    "channel_key",
    "start_datetime",
    "stop_datetime",
];

impl LogicalTable {
    /// All logical tables, calls first.
    pub const ALL: [LogicalTable; 3] = [
        LogicalTable::Calls,
        LogicalTable::MediaStubs,
        LogicalTable::VoxStubs,
    ];

    /// Name stored in the cursor table's `RelatedTable` column.
    pub fn related_table(&self) -> &'static str {
        match self {
            LogicalTable::Calls => "ww.calls",
            LogicalTable::MediaStubs => "ww.media_stubs",
            LogicalTable::VoxStubs => "ww.vox_stubs",
        }
    }

    /// Resolve a `RelatedTable` value back to its logical table.
    pub fn from_related_table(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.related_table().eq_ignore_ascii_case(name.trim()))
    }

    /// Unqualified table name.
    pub fn table_name(&self) -> &'static str {
        match self {
            LogicalTable::Calls => "calls",
            LogicalTable::MediaStubs => "media_stubs",
            LogicalTable::VoxStubs => "vox_stubs",
        }
    }

    /// Column holding the primary timestamp used for day windows.
    pub fn timestamp_column(&self) -> &'static str {
        match self {
            LogicalTable::Calls | LogicalTable::VoxStubs => "start_datetime",
            LogicalTable::MediaStubs => "created",
        }
    }

    /// Columns copied verbatim, in target column order.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            LogicalTable::Calls => CALL_COLUMNS,
            LogicalTable::MediaStubs => MEDIA_STUB_COLUMNS,
            LogicalTable::VoxStubs => VOX_STUB_COLUMNS,
        }
    }

    /// Human readable name used in progress messages.
    pub fn label(&self) -> &'static str {
        match self {
            LogicalTable::Calls => "calls",
            LogicalTable::MediaStubs => "media stubs",
            LogicalTable::VoxStubs => "vox stubs",
        }
    }

    /// Calls are always synced; stub tables only when the source has rows.
    pub fn is_mandatory(&self) -> bool {
        matches!(self, LogicalTable::Calls)
    }

    pub fn source_count_field(&self) -> ProgressField {
        match self {
            LogicalTable::Calls => ProgressField::SourceCallCount,
            LogicalTable::MediaStubs => ProgressField::SourceMediaStubCount,
            LogicalTable::VoxStubs => ProgressField::SourceVoxStubCount,
        }
    }

    pub fn ingested_field(&self) -> ProgressField {
        match self {
            LogicalTable::Calls => ProgressField::TargetIngestedCallCount,
            LogicalTable::MediaStubs => ProgressField::TargetIngestedMediaStubCount,
            LogicalTable::VoxStubs => ProgressField::TargetIngestedVoxStubCount,
        }
    }

    pub fn last_synced_field(&self) -> ProgressField {
        match self {
            LogicalTable::Calls => ProgressField::CallLastSyncedAt,
            LogicalTable::MediaStubs => ProgressField::MediaStubsLastSyncedAt,
            LogicalTable::VoxStubs => ProgressField::VoxStubsLastSyncedAt,
        }
    }
}

impl fmt::Display for LogicalTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.related_table())
    }
}

/// Half-open `[start, start + 1 day)` range evaluated at UTC midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayWindow {
    pub start: NaiveDate,
}

impl DayWindow {
    pub fn new(start: NaiveDate) -> Self {
        Self { start }
    }

    /// Exclusive upper bound.
    pub fn end(&self) -> NaiveDate {
        self.start + Duration::days(1)
    }

    pub fn start_utc(&self) -> DateTime<Utc> {
        midnight_utc(self.start)
    }

    pub fn end_utc(&self) -> DateTime<Utc> {
        midnight_utc(self.end())
    }

    /// True when `ts` falls inside the window.
    pub fn contains<Tz: chrono::TimeZone>(&self, ts: &DateTime<Tz>) -> bool {
        let ts = ts.with_timezone(&Utc);
        ts >= self.start_utc() && ts < self.end_utc()
    }
}

impl fmt::Display for DayWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.start, self.end())
    }
}

fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(date.and_time(chrono::NaiveTime::MIN), Utc)
}
