//! Migrates one day window of one logical table.

use crate::error::{MigrateError, Result};
use crate::progress::{FieldValue, MessageAction, ProgressNotification, ProgressSender};
use crate::source::{SourceRecord, SourceStore};
use crate::state::SyncCursorStore;
use crate::tables::{DayWindow, LogicalTable};
use crate::target::TargetStore;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum WindowOutcome {
    /// Rows were inserted into the target.
    Migrated { rows: u64 },
    /// The window had no source rows.
    Empty,
    /// The table had no rows at bootstrap; nothing to do.
    SourceEmpty,
}

/// What a worker did for one table in one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowResult {
    pub table: LogicalTable,
    pub window: Option<DayWindow>,
    pub outcome: WindowOutcome,
}

impl WindowResult {
    pub fn rows(&self) -> u64 {
        match self.outcome {
            WindowOutcome::Migrated { rows } => rows,
            _ => 0,
        }
    }

    /// Date the cursor moves to once this result is accepted.
    pub fn cursor_date(&self) -> Option<NaiveDate> {
        match self.outcome {
            WindowOutcome::SourceEmpty => None,
            _ => self.window.map(|w| w.start),
        }
    }
}

/// Extracts a window from source and bulk-inserts it into target.
///
/// The worker never advances cursors itself; the caller does so after
/// accepting the [`WindowResult`].
#[derive(Clone)]
pub struct TableSyncWorker {
    source: Arc<dyn SourceStore>,
    target: Arc<dyn TargetStore>,
    cursors: SyncCursorStore,
    progress: ProgressSender,
    ingest_batch_size: usize,
    cancel: CancellationToken,
}

impl TableSyncWorker {
    pub fn new(
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetStore>,
        cursors: SyncCursorStore,
        progress: ProgressSender,
        ingest_batch_size: usize,
    ) -> Self {
        Self {
            source,
            target,
            cursors,
            progress,
            ingest_batch_size: ingest_batch_size.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Abort in-flight database calls when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn guard<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(MigrateError::Cancelled),
            result = fut => result,
        }
    }

    /// Migrate the first day after `table`'s cursor.
    pub async fn sync_next_window(&self, table: LogicalTable) -> Result<WindowResult> {
        let cursor = self.guard(self.cursors.get_cursor(table)).await?;
        self.progress.field(
            table.last_synced_field(),
            cursor.last_synced_at.map(FieldValue::Date),
        );

        let Some(start) = cursor.next_window_start() else {
            debug!("{}: no source rows at bootstrap, skipping", table);
            return Ok(WindowResult {
                table,
                window: None,
                outcome: WindowOutcome::SourceEmpty,
            });
        };
        let window = DayWindow::new(start);

        self.progress.message(format!(
            "{} - source {} {}",
            MessageAction::Reading,
            table.label(),
            window
        ));
        let records = self.guard(self.source.read_window(table, window)).await?;

        if records.is_empty() {
            self.progress
                .message(format!("No {} to insert.", table.label()));
            return Ok(WindowResult {
                table,
                window: Some(window),
                outcome: WindowOutcome::Empty,
            });
        }

        self.progress.message(format!(
            "{} - {} to target.",
            MessageAction::Migrating,
            table.label()
        ));
        let rows = self.insert_with_retry(table, &records).await?;

        info!("{}: migrated {} rows for {}", table, rows, window);
        self.progress.notify(ProgressNotification::with_field(
            format!("{} - {} {} rows.", MessageAction::Migrated, rows, table.label()),
            table.ingested_field(),
            FieldValue::Count(rows as i64),
        ));

        Ok(WindowResult {
            table,
            window: Some(window),
            outcome: WindowOutcome::Migrated { rows },
        })
    }

    /// Insert `records`, clearing ids left behind by an earlier attempt on a
    /// primary-key conflict and retrying exactly once.
    async fn insert_with_retry(&self, table: LogicalTable, records: &[SourceRecord]) -> Result<u64> {
        let first = self
            .guard(
                self.target
                    .insert_records(table, records, self.ingest_batch_size),
            )
            .await;

        match first {
            Ok(rows) => Ok(rows),
            Err(e) if e.is_primary_key_conflict() => {
                warn!("{}: {}; removing existing ids and retrying", table, e);

                let ids: Vec<Uuid> = records.iter().map(SourceRecord::id).collect();
                let existing = self.guard(self.target.existing_ids(table, &ids)).await?;
                let deleted = self.guard(self.target.delete_ids(table, &existing)).await?;
                info!("{}: deleted {} conflicting rows", table, deleted);

                self.guard(
                    self.target
                        .insert_records(table, records, self.ingest_batch_size),
                )
                .await
                .map_err(|e| match e {
                    MigrateError::PrimaryKeyConflict { message, .. } => MigrateError::transfer(
                        table.to_string(),
                        format!("insert failed again after conflict cleanup: {}", message),
                    ),
                    other => other,
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{call_record, media_stub_record, MemoryCursorBackend, MemorySource, MemoryTarget};
    use crate::progress::ProgressEvent;
    use crate::source::DateBounds;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2013, 1, day).unwrap()
    }

    async fn setup(
        source: Arc<MemorySource>,
        target: Arc<MemoryTarget>,
    ) -> (TableSyncWorker, SyncCursorStore) {
        setup_with_batch(source, target, 2).await
    }

    async fn setup_with_batch(
        source: Arc<MemorySource>,
        target: Arc<MemoryTarget>,
        batch: usize,
    ) -> (TableSyncWorker, SyncCursorStore) {
        let cursors = SyncCursorStore::new(Arc::new(MemoryCursorBackend::new()));
        cursors.bootstrap(source.as_ref()).await.unwrap();
        let worker = TableSyncWorker::new(
            source,
            target,
            cursors.clone(),
            ProgressSender::default(),
            batch,
        );
        (worker, cursors)
    }

    fn messages(rx: &mut tokio::sync::broadcast::Receiver<ProgressEvent>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::Notification(n) = event {
                out.extend(n.message);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_first_window_starts_at_min_date() {
        let source = Arc::new(MemorySource::new());
        source.add(call_record(Utc.with_ymd_and_hms(2013, 1, 1, 23, 59, 59).unwrap()));
        source.add(call_record(Utc.with_ymd_and_hms(2013, 1, 2, 0, 0, 0).unwrap()));
        source.add(call_record(Utc.with_ymd_and_hms(2013, 1, 1, 0, 0, 0).unwrap()));
        let target = Arc::new(MemoryTarget::new());
        let (worker, cursors) = setup(source, target.clone()).await;

        let result = worker.sync_next_window(LogicalTable::Calls).await.unwrap();
        assert_eq!(result.window, Some(DayWindow::new(d(1))));
        assert_eq!(result.outcome, WindowOutcome::Migrated { rows: 2 });
        assert_eq!(result.cursor_date(), Some(d(1)));
        assert_eq!(target.count(LogicalTable::Calls), 2);

        // Worker leaves the cursor to the caller
        let cursor = cursors.get_cursor(LogicalTable::Calls).await.unwrap();
        assert_eq!(cursor.last_synced_at, None);
    }

    #[tokio::test]
    async fn test_empty_window_reports_no_rows() {
        let source = Arc::new(MemorySource::new());
        source.add(call_record(Utc.with_ymd_and_hms(2013, 1, 1, 8, 0, 0).unwrap()));
        source.add(call_record(Utc.with_ymd_and_hms(2013, 1, 3, 8, 0, 0).unwrap()));
        let target = Arc::new(MemoryTarget::new());
        let (worker, cursors) = setup(source, target).await;
        cursors.advance_cursor(LogicalTable::Calls, d(1)).await.unwrap();
        let mut rx = worker.progress.subscribe();

        let result = worker.sync_next_window(LogicalTable::Calls).await.unwrap();
        assert_eq!(result.outcome, WindowOutcome::Empty);
        assert_eq!(result.cursor_date(), Some(d(2)));
        let msgs = messages(&mut rx);
        assert!(msgs.contains(&"No calls to insert.".to_string()));
        assert!(!msgs.iter().any(|m| m.starts_with("Migrating")));
    }

    #[tokio::test]
    async fn test_source_empty_table() {
        let source = Arc::new(MemorySource::new());
        let (worker, _) = setup(source, Arc::new(MemoryTarget::new())).await;
        let result = worker.sync_next_window(LogicalTable::VoxStubs).await.unwrap();
        assert_eq!(result.outcome, WindowOutcome::SourceEmpty);
        assert_eq!(result.cursor_date(), None);
    }

    #[tokio::test]
    async fn test_conflict_deletes_only_existing_ids_and_retries() {
        let source = Arc::new(MemorySource::new());
        let a = media_stub_record(Utc.with_ymd_and_hms(2013, 1, 1, 1, 0, 0).unwrap());
        let b = media_stub_record(Utc.with_ymd_and_hms(2013, 1, 1, 2, 0, 0).unwrap());
        let c = media_stub_record(Utc.with_ymd_and_hms(2013, 1, 1, 3, 0, 0).unwrap());
        for r in [&a, &b, &c] {
            source.add(r.clone());
        }
        let target = Arc::new(MemoryTarget::new());
        target.preload(b.clone());
        let (worker, _) = setup_with_batch(source, target.clone(), 10).await;

        let result = worker
            .sync_next_window(LogicalTable::MediaStubs)
            .await
            .unwrap();
        assert_eq!(result.outcome, WindowOutcome::Migrated { rows: 3 });
        assert_eq!(target.deleted_ids(), vec![b.id()]);
        assert_eq!(target.delete_calls(), 1);
        assert_eq!(target.count(LogicalTable::MediaStubs), 3);
    }

    #[tokio::test]
    async fn test_second_conflict_is_fatal() {
        let source = Arc::new(MemorySource::new());
        source.add(call_record(Utc.with_ymd_and_hms(2013, 1, 1, 1, 0, 0).unwrap()));
        let target = Arc::new(MemoryTarget::new());
        target.fail_inserts_with_conflict(2);
        let (worker, _) = setup(source, target.clone()).await;

        let err = worker
            .sync_next_window(LogicalTable::Calls)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Transfer { .. }));
        assert_eq!(target.insert_calls(), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let source = Arc::new(MemorySource::new());
        source.add(call_record(Utc.with_ymd_and_hms(2013, 1, 1, 1, 0, 0).unwrap()));
        let target = Arc::new(MemoryTarget::new());
        target.fail_inserts_with("connection reset");
        let (worker, _) = setup(source, target.clone()).await;

        let err = worker
            .sync_next_window(LogicalTable::Calls)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Transfer { .. }));
        assert_eq!(target.insert_calls(), 1);
        assert_eq!(target.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_worker() {
        let source = Arc::new(MemorySource::new());
        source.set_bounds(LogicalTable::Calls, DateBounds::new(d(1), d(2)));
        let (worker, _) = setup(source, Arc::new(MemoryTarget::new())).await;
        let token = CancellationToken::new();
        let worker = worker.with_cancellation(token.clone());
        token.cancel();

        let err = worker
            .sync_next_window(LogicalTable::Calls)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Cancelled));
    }
}
