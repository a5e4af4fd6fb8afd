//! In-memory source, target and cursor stores.
//!
//! These back the engine tests and behave like the SQL Server stores where
//! it matters to the engine: UTC day windows, per-batch primary-key checks,
//! and index state driven by the executed statements.

use crate::constraints::TableIndexDescriptor;
use crate::error::{MigrateError, Result};
use crate::source::{
    CallRecord, DateBounds, MediaStubRecord, SourceRecord, SourceStore, VoxStubRecord,
};
use crate::state::{CursorBackend, CursorSeed, SyncState};
use crate::tables::{DayWindow, LogicalTable};
use crate::target::TargetStore;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

type ReadHook = Box<dyn Fn(LogicalTable, DayWindow) + Send + Sync>;

/// Source rows held in memory.
#[derive(Default)]
pub struct MemorySource {
    records: Mutex<BTreeMap<LogicalTable, Vec<SourceRecord>>>,
    bounds: Mutex<HashMap<LogicalTable, DateBounds>>,
    executed: Mutex<Vec<String>>,
    on_read: Mutex<Option<ReadHook>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, record: SourceRecord) {
        lock(&self.records)
            .entry(record.table())
            .or_default()
            .push(record);
    }

    /// Override the bounds reported for `table` instead of deriving them
    /// from the stored rows.
    pub fn set_bounds(&self, table: LogicalTable, bounds: DateBounds) {
        lock(&self.bounds).insert(table, bounds);
    }

    /// Run `hook` at the start of every window read.
    pub fn on_read(&self, hook: impl Fn(LogicalTable, DayWindow) + Send + Sync + 'static) {
        *lock(&self.on_read) = Some(Box::new(hook));
    }

    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }

    fn derived_bounds(&self, table: LogicalTable) -> DateBounds {
        let records = lock(&self.records);
        let days = records
            .get(&table)
            .into_iter()
            .flatten()
            .map(|r| r.primary_timestamp().with_timezone(&Utc).date_naive());
        let mut bounds = DateBounds::default();
        for day in days {
            bounds.min_date = Some(bounds.min_date.map_or(day, |m| m.min(day)));
            bounds.max_date = Some(bounds.max_date.map_or(day, |m| m.max(day)));
        }
        bounds
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn row_count(&self, table: LogicalTable) -> Result<i64> {
        Ok(lock(&self.records).get(&table).map_or(0, Vec::len) as i64)
    }

    async fn date_bounds(&self, table: LogicalTable) -> Result<DateBounds> {
        if let Some(bounds) = lock(&self.bounds).get(&table) {
            return Ok(*bounds);
        }
        Ok(self.derived_bounds(table))
    }

    async fn read_window(&self, table: LogicalTable, window: DayWindow) -> Result<Vec<SourceRecord>> {
        if let Some(hook) = lock(&self.on_read).as_ref() {
            hook(table, window);
        }

        let mut rows: Vec<SourceRecord> = lock(&self.records)
            .get(&table)
            .into_iter()
            .flatten()
            .filter(|r| window.contains(&r.primary_timestamp()))
            .cloned()
            .collect();
        rows.sort_by_key(SourceRecord::id);
        Ok(rows)
    }

    async fn lookahead_date(
        &self,
        table: LogicalTable,
        from: NaiveDate,
        rows: u64,
    ) -> Result<Option<NaiveDate>> {
        let start = DayWindow::new(from).start_utc();
        let mut stamps: Vec<DateTime<Utc>> = lock(&self.records)
            .get(&table)
            .into_iter()
            .flatten()
            .map(|r| r.primary_timestamp().with_timezone(&Utc))
            .filter(|ts| *ts >= start)
            .collect();
        stamps.sort();
        stamps.truncate(rows as usize);
        Ok(stamps.last().map(|ts| ts.date_naive()))
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        lock(&self.executed).push(sql.to_string());
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}

/// Target rows held in memory, with failure injection.
#[derive(Default)]
pub struct MemoryTarget {
    rows: Mutex<BTreeMap<LogicalTable, BTreeMap<Uuid, SourceRecord>>>,
    indexes: Mutex<Vec<TableIndexDescriptor>>,
    executed: Mutex<Vec<String>>,
    deleted: Mutex<Vec<Uuid>>,
    conflict_failures: AtomicU32,
    forced_error: Mutex<Option<String>>,
    insert_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row directly, as if left behind by an earlier run.
    pub fn preload(&self, record: SourceRecord) {
        lock(&self.rows)
            .entry(record.table())
            .or_default()
            .insert(record.id(), record);
    }

    pub fn add_index(&self, descriptor: TableIndexDescriptor) {
        lock(&self.indexes).push(descriptor);
    }

    /// Fail the next `n` insert calls with a primary-key conflict.
    pub fn fail_inserts_with_conflict(&self, n: u32) {
        self.conflict_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every insert call with a non-conflict error.
    pub fn fail_inserts_with(&self, message: impl Into<String>) {
        *lock(&self.forced_error) = Some(message.into());
    }

    pub fn clear_failures(&self) {
        self.conflict_failures.store(0, Ordering::SeqCst);
        *lock(&self.forced_error) = None;
    }

    pub fn count(&self, table: LogicalTable) -> usize {
        lock(&self.rows).get(&table).map_or(0, BTreeMap::len)
    }

    pub fn contains(&self, table: LogicalTable, id: Uuid) -> bool {
        lock(&self.rows)
            .get(&table)
            .is_some_and(|rows| rows.contains_key(&id))
    }

    pub fn disabled_index_count(&self) -> usize {
        lock(&self.indexes).iter().filter(|i| i.is_disabled).count()
    }

    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }

    pub fn deleted_ids(&self) -> Vec<Uuid> {
        lock(&self.deleted).clone()
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn take_injected_conflict(&self) -> bool {
        self.conflict_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl TargetStore for MemoryTarget {
    async fn insert_records(
        &self,
        table: LogicalTable,
        records: &[SourceRecord],
        batch_size: usize,
    ) -> Result<u64> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = lock(&self.forced_error).clone() {
            return Err(MigrateError::transfer(table.to_string(), message));
        }
        if self.take_injected_conflict() {
            return Err(MigrateError::PrimaryKeyConflict {
                table: table.to_string(),
                message: "injected conflict".into(),
            });
        }

        let mut rows = lock(&self.rows);
        let stored = rows.entry(table).or_default();
        let mut inserted = 0u64;

        // Each batch is all-or-nothing, earlier batches stay committed
        for batch in records.chunks(batch_size.max(1)) {
            let mut seen = HashSet::new();
            if let Some(dup) = batch
                .iter()
                .map(SourceRecord::id)
                .find(|id| stored.contains_key(id) || !seen.insert(*id))
            {
                return Err(MigrateError::PrimaryKeyConflict {
                    table: table.to_string(),
                    message: format!("duplicate key value ({})", dup),
                });
            }
            for record in batch {
                stored.insert(record.id(), record.clone());
            }
            inserted += batch.len() as u64;
        }

        Ok(inserted)
    }

    async fn existing_ids(&self, table: LogicalTable, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let rows = lock(&self.rows);
        let Some(stored) = rows.get(&table) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter(|id| stored.contains_key(id))
            .copied()
            .collect())
    }

    async fn delete_ids(&self, table: LogicalTable, ids: &[Uuid]) -> Result<u64> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut rows = lock(&self.rows);
        let stored = rows.entry(table).or_default();
        let mut removed = 0;
        for id in ids {
            if stored.remove(id).is_some() {
                lock(&self.deleted).push(*id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn row_count(&self, table: LogicalTable) -> Result<i64> {
        Ok(self.count(table) as i64)
    }

    async fn index_descriptors(&self, _query: &str) -> Result<Vec<TableIndexDescriptor>> {
        Ok(lock(&self.indexes).clone())
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        for index in lock(&self.indexes).iter_mut() {
            if index.disable_statement == sql {
                index.is_disabled = true;
            } else if index.enable_statement == sql {
                index.is_disabled = false;
            }
        }
        lock(&self.executed).push(sql.to_string());
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}

/// Cursor rows held in memory. `None` until the table is created.
#[derive(Default)]
pub struct MemoryCursorBackend {
    rows: Mutex<Option<Vec<SyncState>>>,
}

impl MemoryCursorBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row as-is, creating the table if needed.
    pub fn insert_raw(&self, state: SyncState) {
        lock(&self.rows).get_or_insert_with(Vec::new).push(state);
    }
}

#[async_trait]
impl CursorBackend for MemoryCursorBackend {
    async fn exists(&self) -> Result<bool> {
        Ok(lock(&self.rows).is_some())
    }

    async fn create(&self, seeds: &[CursorSeed]) -> Result<()> {
        let mut rows = lock(&self.rows);
        let table = rows.get_or_insert_with(Vec::new);
        for seed in seeds {
            table.push(SyncState {
                id: table.len() as i32 + 1,
                table: seed.table,
                last_synced_at: None,
                min_date: seed.bounds.min_date,
                max_date: seed.bounds.max_date,
            });
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<SyncState>> {
        lock(&self.rows).clone().ok_or(MigrateError::NotBootstrapped)
    }

    async fn store_last_synced(&self, table: LogicalTable, date: NaiveDate) -> Result<u64> {
        let mut rows = lock(&self.rows);
        let Some(rows) = rows.as_mut() else {
            return Err(MigrateError::NotBootstrapped);
        };
        let mut updated = 0;
        for row in rows.iter_mut().filter(|r| r.table == table) {
            row.last_synced_at = Some(date);
            updated += 1;
        }
        Ok(updated)
    }

    async fn store_bounds(&self, table: LogicalTable, bounds: DateBounds) -> Result<u64> {
        let mut rows = lock(&self.rows);
        let Some(rows) = rows.as_mut() else {
            return Err(MigrateError::NotBootstrapped);
        };
        let mut updated = 0;
        for row in rows.iter_mut().filter(|r| r.table == table) {
            row.min_date = bounds.min_date;
            row.max_date = bounds.max_date;
            updated += 1;
        }
        Ok(updated)
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

/// A call starting at `start` and lasting five minutes.
pub fn call_record(start: DateTime<Utc>) -> SourceRecord {
    let start = start.fixed_offset();
    SourceRecord::Call(CallRecord {
        id: Uuid::new_v4(),
        originating_device_id: Some(Uuid::new_v4()),
        terminating_device_id: None,
        caller: Some("1001".into()),
        called: Some("2002".into()),
        direction: Some("outbound".into()),
        user_id: Some(Uuid::new_v4()),
        created: start,
        modified: None,
        start_datetime: start,
        stop_datetime: start + chrono::Duration::minutes(5),
        bookmarks_count: 0,
        comments_count: 0,
        retention_expiry: None,
        availability_status: Some("available".into()),
        additional_data: None,
        association_id: None,
        channel_key: Some("ch-1".into()),
        call_type: 1,
    })
}

/// A media stub created at `created`.
pub fn media_stub_record(created: DateTime<Utc>) -> SourceRecord {
    SourceRecord::MediaStub(MediaStubRecord {
        id: Uuid::new_v4(),
        call_id: Uuid::new_v4(),
        stub_type: Some("audio".into()),
        created: created.fixed_offset(),
        modified: None,
        location_id: Uuid::new_v4(),
        file_id: Some("file-1".into()),
        retention_expiry: None,
    })
}

/// A vox stub starting at `start`.
pub fn vox_stub_record(start: DateTime<Utc>) -> SourceRecord {
    let start = start.fixed_offset();
    SourceRecord::VoxStub(VoxStubRecord {
        id: Uuid::new_v4(),
        created: start,
        modified: None,
        location_id: Uuid::new_v4(),
        file_id: Some("vox-1".into()),
        retention_expiry: start + chrono::Duration::days(365),
        availability_status: Some("available".into()),
        additional_data: None,
        channel_key: Some("ch-1".into()),
        start_datetime: start,
        stop_datetime: start + chrono::Duration::minutes(5),
    })
}
