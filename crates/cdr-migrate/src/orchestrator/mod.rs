//! Migration orchestrator - main workflow coordinator.
//!
//! Owns the status machine, plans the number of day windows from the calls
//! cursor, fans each iteration out to one [`TableSyncWorker`] per table and
//! advances cursors once the workers have joined.

mod status;

pub use status::{MigrationRun, MigrationStatus};

use crate::config::{Config, MigrationConfig, StatementConfig};
use crate::constraints::{ConstraintIndexManager, IndexToggle};
use crate::error::{MigrateError, Result};
use crate::pool::MssqlPool;
use crate::progress::{
    FieldValue, MessageAction, ProgressEvent, ProgressField, ProgressNotification, ProgressSender,
};
use crate::source::{DateBounds, MssqlSource, SourceStore};
use crate::state::{CursorBackend, MssqlCursorBackend, SyncCursorStore, SyncState};
use crate::tables::LogicalTable;
use crate::target::{MssqlTarget, TargetStore};
use crate::worker::{TableSyncWorker, WindowResult};
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError};
use std::time::Instant;
use tokio::sync::{broadcast, watch, Mutex, MutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Result of a `start` or `resume` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Status when the call returned.
    pub status: MigrationStatus,

    /// When the loop started.
    pub started_at: DateTime<Utc>,

    /// Wall time of the call in seconds.
    pub duration_seconds: f64,

    /// Iterations completed by this call.
    pub iterations_run: u64,

    /// Iterations planned when the loop started.
    pub total_iterations: u64,

    /// Rows inserted per table by this call.
    pub rows_migrated: BTreeMap<LogicalTable, u64>,
}

impl RunReport {
    fn new(status: MigrationStatus) -> Self {
        Self {
            status,
            started_at: Utc::now(),
            duration_seconds: 0.0,
            iterations_run: 0,
            total_iterations: 0,
            rows_migrated: BTreeMap::new(),
        }
    }

    pub fn total_rows(&self) -> u64 {
        self.rows_migrated.values().sum()
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Drives the resumable day-window migration.
///
/// All commands take `&self`, so one instance can be shared between the
/// task running the loop and whoever issues pause or stop.
pub struct MigrationOrchestrator {
    migration: MigrationConfig,
    source: Arc<dyn SourceStore>,
    target: Arc<dyn TargetStore>,
    cursors: SyncCursorStore,
    constraints: ConstraintIndexManager,
    worker: TableSyncWorker,
    progress: ProgressSender,
    status: watch::Sender<MigrationStatus>,
    run: RwLock<Option<MigrationRun>>,
    source_counts: RwLock<HashMap<LogicalTable, i64>>,
    run_lock: Mutex<()>,
    cancel: CancellationToken,
    run_cancel: std::sync::Mutex<CancellationToken>,
}

impl MigrationOrchestrator {
    pub fn new(
        migration: MigrationConfig,
        statements: StatementConfig,
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetStore>,
        cursor_backend: Arc<dyn CursorBackend>,
    ) -> Self {
        let progress = ProgressSender::default();
        let cursors = SyncCursorStore::new(cursor_backend);
        let constraints = ConstraintIndexManager::new(
            source.clone(),
            target.clone(),
            statements,
            progress.clone(),
        );
        let cancel = CancellationToken::new();
        let worker = TableSyncWorker::new(
            source.clone(),
            target.clone(),
            cursors.clone(),
            progress.clone(),
            migration.ingest_batch_size,
        );
        let (status, _) = watch::channel(MigrationStatus::Pending);

        Self {
            migration,
            source,
            target,
            cursors,
            constraints,
            worker,
            progress,
            status,
            run: RwLock::new(None),
            source_counts: RwLock::new(HashMap::new()),
            run_lock: Mutex::new(()),
            run_cancel: std::sync::Mutex::new(cancel.child_token()),
            cancel,
        }
    }

    /// Connect to the configured source and target servers.
    ///
    /// The cursor table lives in the source database.
    pub async fn connect(config: &Config) -> Result<Self> {
        let m = &config.migration;

        info!("Connecting to source: {}", config.source.summary());
        let source_pool = Arc::new(
            MssqlPool::connect(
                &config.source,
                "source",
                m.max_connections,
                m.command_timeout(),
            )
            .await?,
        );

        info!("Connecting to target: {}", config.target.summary());
        let target_pool = Arc::new(
            MssqlPool::connect(
                &config.target,
                "target",
                m.max_connections,
                m.command_timeout(),
            )
            .await?,
        );

        let source = Arc::new(MssqlSource::new(
            source_pool.clone(),
            config.source.schema.clone(),
            m.query_batch_size,
        ));
        let target = Arc::new(MssqlTarget::new(target_pool, config.target.schema.clone()));
        let cursors = Arc::new(MssqlCursorBackend::new(source_pool));

        Ok(Self::new(
            m.clone(),
            config.statements.clone(),
            source,
            target,
            cursors,
        ))
    }

    /// Use `cancel` as the parent of every run's token.
    ///
    /// Cancelling it aborts the current run and every later one.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.run_cancel = std::sync::Mutex::new(cancel.child_token());
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Subscribe to progress notifications and status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> &ProgressSender {
        &self.progress
    }

    pub fn status(&self) -> MigrationStatus {
        *self.status.borrow()
    }

    pub fn status_receiver(&self) -> watch::Receiver<MigrationStatus> {
        self.status.subscribe()
    }

    pub fn cursor_store(&self) -> &SyncCursorStore {
        &self.cursors
    }

    /// Counters of the loop in progress, or of the last one.
    pub async fn current_run(&self) -> Option<MigrationRun> {
        *self.run.read().await
    }

    /// Move to `to` if the current status is in `allowed`.
    ///
    /// Returns `Ok(false)` when already at `to`.
    fn transition(
        &self,
        allowed: &[MigrationStatus],
        to: MigrationStatus,
        command: &str,
    ) -> Result<bool> {
        let mut rejected = None;
        let mut changed_from = None;

        self.status.send_if_modified(|current| {
            if *current == to {
                false
            } else if allowed.contains(current) {
                changed_from = Some(*current);
                *current = to;
                true
            } else {
                rejected = Some(MigrateError::invalid_transition(*current, command));
                false
            }
        });

        if let Some(err) = rejected {
            return Err(err);
        }
        match changed_from {
            Some(from) => {
                info!("Migration status: {} -> {}", from, to);
                self.progress.status_changed(from, to);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn report_error(&self, err: &MigrateError) {
        error!("Migration failed: {}", err);
        self.progress.message(format!("{} - {}", MessageAction::Error, err));
    }

    /// Pending → Ready: load counts, bootstrap cursors, optional source
    /// index build. A no-op once Ready.
    pub async fn init(&self) -> Result<()> {
        match self.status() {
            MigrationStatus::Pending => {}
            MigrationStatus::Ready => return Ok(()),
            other => return Err(MigrateError::invalid_transition(other, "init")),
        }

        if let Err(e) = self.initialize().await {
            self.report_error(&e);
            return Err(e);
        }

        self.transition(&[MigrationStatus::Pending], MigrationStatus::Ready, "init")?;
        Ok(())
    }

    async fn initialize(&self) -> Result<()> {
        info!(
            "Initializing migration (source: {}, target: {}, cursors: {})",
            self.source.store_type(),
            self.target.store_type(),
            self.cursors.backend_type()
        );

        let mut counts = HashMap::new();
        for table in LogicalTable::ALL {
            let source_rows = self.source.row_count(table).await?;
            let target_rows = self.target.row_count(table).await?;
            info!(
                "{}: {} source rows, {} target rows",
                table, source_rows, target_rows
            );
            self.progress
                .field(table.source_count_field(), Some(FieldValue::Count(source_rows)));
            self.progress
                .field(table.ingested_field(), Some(FieldValue::Count(target_rows)));
            counts.insert(table, source_rows);
        }

        let outcome = self.cursors.bootstrap(self.source.as_ref()).await?;
        for state in &outcome.states {
            self.progress.field(
                state.table.last_synced_field(),
                state.last_synced_at.map(FieldValue::Date),
            );
            if state.table == LogicalTable::Calls {
                self.publish_call_bounds(state);
            }
            debug!(
                "{}: last synced {:?}, {} days pending",
                state.table,
                state.last_synced_at,
                state.days_pending()
            );
        }

        let first_time = outcome.states.iter().any(SyncState::is_first_sync);
        if first_time && self.migration.source_index_build_required {
            self.constraints.rebuild_source_indexes().await?;
        }

        *self.source_counts.write().await = counts;
        Ok(())
    }

    fn publish_call_bounds(&self, calls: &SyncState) {
        let bounds = DateBounds {
            min_date: calls.min_date,
            max_date: calls.max_date,
        };
        self.progress
            .field(ProgressField::CallsMinDate, calls.min_date.map(FieldValue::Date));
        self.progress
            .field(ProgressField::CallsMaxDate, calls.max_date.map(FieldValue::Date));
        self.progress.field(
            ProgressField::SourceCallDistribution,
            Some(FieldValue::Days(bounds.span_days())),
        );
    }

    /// Ready → Started and run the loop until it completes, pauses or stops.
    ///
    /// Also accepted while Started with no loop running, which picks up
    /// after a failed iteration. While a loop is running this is a no-op.
    pub async fn start(&self) -> Result<RunReport> {
        match self.status() {
            MigrationStatus::Ready | MigrationStatus::Started => {}
            other => return Err(MigrateError::invalid_transition(other, "start")),
        }

        let Ok(guard) = self.run_lock.try_lock() else {
            debug!("Start ignored, the migration loop is already running");
            return Ok(self.idle_report().await);
        };

        self.transition(&[MigrationStatus::Ready], MigrationStatus::Started, "start")?;
        self.run_loop(guard).await
    }

    /// Paused → Started. Waits for a loop that is still finishing its last
    /// iteration, then continues from the persisted cursors.
    pub async fn resume(&self) -> Result<RunReport> {
        match self.status() {
            MigrationStatus::Paused => {}
            MigrationStatus::Started => return self.start().await,
            other => return Err(MigrateError::invalid_transition(other, "resume")),
        }

        let guard = self.run_lock.lock().await;
        self.transition(&[MigrationStatus::Paused], MigrationStatus::Started, "resume")?;
        self.run_loop(guard).await
    }

    /// Started → Paused, effective at the next iteration boundary.
    pub fn pause(&self) -> Result<()> {
        if self.transition(&[MigrationStatus::Started], MigrationStatus::Paused, "pause")? {
            self.progress
                .message("Pausing after the current iteration.");
        }
        Ok(())
    }

    /// Ready, Started or Paused → Stopped, then teardown → Finished.
    ///
    /// Returns once any running loop has reached its iteration boundary and
    /// constraints have been re-enabled.
    pub async fn stop(&self) -> Result<()> {
        if matches!(
            self.status(),
            MigrationStatus::Completed | MigrationStatus::Finished
        ) {
            return Ok(());
        }

        self.transition(
            &[
                MigrationStatus::Ready,
                MigrationStatus::Started,
                MigrationStatus::Paused,
            ],
            MigrationStatus::Stopped,
            "stop",
        )?;

        let _guard = self.run_lock.lock().await;
        if self.status() == MigrationStatus::Stopped {
            if let Err(e) = self.finish().await {
                self.report_error(&e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Abort the in-flight database calls of the current run. Cursors are
    /// left where they are and a later `start` or `resume` runs with a fresh
    /// token.
    pub fn cancel(&self) {
        self.run_token().cancel();
    }

    fn run_token(&self) -> CancellationToken {
        self.run_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn renew_run_token(&self) {
        *self
            .run_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = self.cancel.child_token();
    }

    async fn idle_report(&self) -> RunReport {
        let mut report = RunReport::new(self.status());
        if let Some(run) = self.current_run().await {
            report.total_iterations = run.total_iterations;
        }
        report
    }

    async fn run_loop(&self, _guard: MutexGuard<'_, ()>) -> Result<RunReport> {
        let timer = Instant::now();
        self.renew_run_token();
        let mut report = RunReport::new(MigrationStatus::Started);

        let result = self.drive(&mut report).await;

        report.duration_seconds = timer.elapsed().as_secs_f64();
        report.status = self.status();
        self.publish_run(|run| run.status = report.status).await;

        match result {
            Ok(()) => {
                info!(
                    "Migration {} after {} of {} iterations ({} rows in {:.1}s)",
                    report.status,
                    report.iterations_run,
                    report.total_iterations,
                    report.total_rows(),
                    report.duration_seconds
                );
                Ok(report)
            }
            Err(e) => {
                self.report_error(&e);
                Err(e)
            }
        }
    }

    async fn drive(&self, report: &mut RunReport) -> Result<()> {
        let first_time = self.cursors.is_first_time_sync().await?;
        self.refresh_source().await?;
        self.prepare_target(first_time).await?;

        let mut run = MigrationRun::new(self.plan_iterations().await?);
        report.total_iterations = run.total_iterations;
        *self.run.write().await = Some(run);
        info!("Planned {} day windows", run.total_iterations);

        loop {
            let status = self.status();
            if status != MigrationStatus::Started {
                info!(
                    "Migration {} before iteration {}",
                    status,
                    run.iteration_index + 1
                );
                break;
            }
            if run.is_exhausted() {
                break;
            }

            let interval = u64::from(self.migration.index_rebuild_interval);
            if interval > 0 && run.iteration_index > 0 && run.iteration_index % interval == 0 {
                self.checkpoint().await?;
            }

            let results = self.run_iteration().await?;
            for result in &results {
                *report.rows_migrated.entry(result.table).or_default() += result.rows();
            }

            run.iteration_index += 1;
            report.iterations_run += 1;
            self.publish_run(|r| r.iteration_index = run.iteration_index)
                .await;
            debug!(
                "Iteration {}/{} done",
                run.iteration_index, run.total_iterations
            );
        }

        if run.is_exhausted() {
            // A stop during the last window wins; teardown below still runs
            match self.transition(
                &[MigrationStatus::Started, MigrationStatus::Paused],
                MigrationStatus::Completed,
                "complete",
            ) {
                Ok(_) => {}
                Err(MigrateError::InvalidTransition { .. })
                    if self.status() == MigrationStatus::Stopped => {}
                Err(e) => return Err(e),
            }
        }

        if self.status().needs_teardown() {
            self.finish().await?;
        }
        Ok(())
    }

    /// Pick up source days and stub rows that arrived since `init`.
    async fn refresh_source(&self) -> Result<()> {
        let before = self.cursors.get_cursor(LogicalTable::Calls).await?;
        let states = self.cursors.refresh_bounds(self.source.as_ref()).await?;
        if let Some(calls) = states.iter().find(|s| s.table == LogicalTable::Calls) {
            if *calls != before {
                self.publish_call_bounds(calls);
            }
        }

        let mut counts = self.source_counts.write().await;
        for table in LogicalTable::ALL {
            if counts.get(&table).copied().unwrap_or(0) == 0 {
                let rows = self.source.row_count(table).await?;
                if rows > 0 {
                    info!("{}: {} source rows arrived since init", table, rows);
                    self.progress
                        .field(table.source_count_field(), Some(FieldValue::Count(rows)));
                }
                counts.insert(table, rows);
            }
        }
        Ok(())
    }

    async fn publish_run(&self, update: impl FnOnce(&mut MigrationRun)) {
        if let Some(run) = self.run.write().await.as_mut() {
            update(run);
        }
    }

    /// Number of day windows left for calls: from the next window start to
    /// the stored max date inclusive, limited by `max_rows_to_sync`.
    ///
    /// The max date is refreshed from the source each time the loop starts.
    pub async fn plan_iterations(&self) -> Result<u64> {
        let calls = self.cursors.get_cursor(LogicalTable::Calls).await?;
        let (Some(start), Some(max)) = (calls.next_window_start(), calls.max_date) else {
            return Ok(0);
        };

        let uncapped = inclusive_days(start, max);
        let Some(cap) = self.migration.row_cap() else {
            return Ok(uncapped);
        };
        if uncapped == 0 {
            return Ok(0);
        }

        match self
            .source
            .lookahead_date(LogicalTable::Calls, start, cap)
            .await?
        {
            Some(last) => {
                let capped = inclusive_days(start, last);
                info!(
                    "Row cap {} reached by {}, limiting to {} of {} days",
                    cap,
                    last,
                    capped.min(uncapped),
                    uncapped
                );
                Ok(capped.min(uncapped))
            }
            None => Ok(uncapped),
        }
    }

    async fn prepare_target(&self, first_time: bool) -> Result<()> {
        if first_time {
            self.constraints.apply_default_constraints().await?;
        }
        if !first_time && self.migration.target_index_build_required {
            self.constraints.rebuild_target_indexes().await?;
        }
        if self.migration.disable_constraints {
            self.constraints
                .toggle_target_foreign_keys(IndexToggle::Disable)
                .await?;
            self.constraints
                .toggle_target_non_clustered_indexes(IndexToggle::Disable)
                .await?;
        }
        Ok(())
    }

    /// Re-enable constraints and move Completed or Stopped to Finished.
    async fn finish(&self) -> Result<()> {
        let from = self.status();
        self.constraints
            .toggle_target_foreign_keys(IndexToggle::Enable)
            .await?;
        self.constraints
            .toggle_target_non_clustered_indexes(IndexToggle::Enable)
            .await?;

        self.transition(
            &[MigrationStatus::Completed, MigrationStatus::Stopped],
            MigrationStatus::Finished,
            "finish",
        )?;

        let message = format!("Data Migrations successfully {}!", from);
        info!("{}", message);
        self.progress.message(message);
        Ok(())
    }

    async fn checkpoint(&self) -> Result<()> {
        self.constraints.rebuild_target_indexes().await?;

        let calls = self.target.row_count(LogicalTable::Calls).await?;
        let media = self.target.row_count(LogicalTable::MediaStubs).await?;
        let vox = self.target.row_count(LogicalTable::VoxStubs).await?;
        let summary = format!(
            "Calls: {}, Media Stubs: {}, Vox Stubs: {}",
            calls, media, vox
        );
        info!("Checkpoint - {}", summary);
        self.progress.notify(ProgressNotification::message(summary));
        Ok(())
    }

    async fn active_tables(&self) -> Vec<LogicalTable> {
        let counts = self.source_counts.read().await;
        LogicalTable::ALL
            .into_iter()
            .filter(|t| t.is_mandatory() || counts.get(t).copied().unwrap_or(0) > 0)
            .collect()
    }

    /// One worker per active table, joined before any cursor moves.
    ///
    /// Cursors of the workers that succeeded are advanced even when another
    /// worker failed; the first failure is then returned.
    async fn run_iteration(&self) -> Result<Vec<WindowResult>> {
        let tables = self.active_tables().await;
        let cancel = self.run_token();
        let handles: Vec<_> = tables
            .iter()
            .map(|&table| {
                let worker = self.worker.clone().with_cancellation(cancel.clone());
                tokio::spawn(async move { worker.sync_next_window(table).await })
            })
            .collect();
        let joined = join_all(handles).await;

        let mut results = Vec::with_capacity(tables.len());
        let mut first_error = None;
        for (table, outcome) in tables.into_iter().zip(joined) {
            match outcome {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(e)) => {
                    error!("{}: failed - {}", table, e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!("{}: worker task panicked - {}", table, e);
                    first_error.get_or_insert_with(|| {
                        MigrateError::transfer(table.to_string(), format!("worker task panicked: {}", e))
                    });
                }
            }
        }

        for result in &results {
            if let Some(date) = result.cursor_date() {
                self.cursors.advance_cursor(result.table, date).await?;
                self.progress.field(
                    result.table.last_synced_field(),
                    Some(FieldValue::Date(date)),
                );
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }
}

/// Days from `from` to `to`, both included. Zero when `to < from`.
fn inclusive_days(from: NaiveDate, to: NaiveDate) -> u64 {
    ((to - from).num_days() + 1).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{call_record, MemoryCursorBackend, MemorySource, MemoryTarget};
    use chrono::TimeZone;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2013, 1, day).unwrap()
    }

    fn calls_on(source: &MemorySource, days: &[u32]) {
        for &day in days {
            source.add(call_record(Utc.with_ymd_and_hms(2013, 1, day, 12, 0, 0).unwrap()));
        }
    }

    fn orchestrator(source: Arc<MemorySource>, migration: MigrationConfig) -> MigrationOrchestrator {
        MigrationOrchestrator::new(
            migration,
            StatementConfig::default(),
            source,
            Arc::new(MemoryTarget::new()),
            Arc::new(MemoryCursorBackend::new()),
        )
    }

    #[test]
    fn test_inclusive_days() {
        assert_eq!(inclusive_days(d(1), d(5)), 5);
        assert_eq!(inclusive_days(d(5), d(5)), 1);
        assert_eq!(inclusive_days(d(6), d(5)), 0);
        assert_eq!(inclusive_days(d(9), d(5)), 0);
    }

    #[tokio::test]
    async fn test_plan_iterations_counts_max_day() {
        let source = Arc::new(MemorySource::new());
        calls_on(&source, &[1, 3, 5]);
        let orch = orchestrator(source, MigrationConfig::default());
        orch.init().await.unwrap();
        assert_eq!(orch.plan_iterations().await.unwrap(), 5);

        orch.cursor_store()
            .advance_cursor(LogicalTable::Calls, d(4))
            .await
            .unwrap();
        assert_eq!(orch.plan_iterations().await.unwrap(), 1);

        orch.cursor_store()
            .advance_cursor(LogicalTable::Calls, d(5))
            .await
            .unwrap();
        assert_eq!(orch.plan_iterations().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_plan_iterations_with_row_cap() {
        let source = Arc::new(MemorySource::new());
        calls_on(&source, &[1, 1, 2, 2, 3, 4, 5]);
        let migration = MigrationConfig {
            max_rows_to_sync: 4,
            ..Default::default()
        };
        let orch = orchestrator(source, migration);
        orch.init().await.unwrap();
        // Fourth row falls on the 2nd
        assert_eq!(orch.plan_iterations().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_source_plans_nothing() {
        let orch = orchestrator(Arc::new(MemorySource::new()), MigrationConfig::default());
        orch.init().await.unwrap();
        assert_eq!(orch.plan_iterations().await.unwrap(), 0);

        let report = orch.start().await.unwrap();
        assert_eq!(report.iterations_run, 0);
        assert_eq!(report.status, MigrationStatus::Finished);
    }

    #[tokio::test]
    async fn test_init_transitions_and_noops() {
        let orch = orchestrator(Arc::new(MemorySource::new()), MigrationConfig::default());
        let mut rx = orch.subscribe();
        assert_eq!(orch.status(), MigrationStatus::Pending);

        orch.init().await.unwrap();
        assert_eq!(orch.status(), MigrationStatus::Ready);
        orch.init().await.unwrap();

        let mut changes = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::StatusChanged { from, to } = event {
                changes.push((from, to));
            }
        }
        assert_eq!(changes, vec![(MigrationStatus::Pending, MigrationStatus::Ready)]);
    }

    #[tokio::test]
    async fn test_illegal_commands() {
        let orch = orchestrator(Arc::new(MemorySource::new()), MigrationConfig::default());

        assert!(matches!(
            orch.start().await.unwrap_err(),
            MigrateError::InvalidTransition { .. }
        ));
        assert!(matches!(
            orch.stop().await.unwrap_err(),
            MigrateError::InvalidTransition { .. }
        ));
        assert!(matches!(
            orch.resume().await.unwrap_err(),
            MigrateError::InvalidTransition { .. }
        ));

        orch.init().await.unwrap();
        let err = orch.pause().unwrap_err();
        assert_eq!(err.to_string(), "Cannot pause while migration is ready");
    }

    #[tokio::test]
    async fn test_stop_from_ready_runs_teardown() {
        let orch = orchestrator(Arc::new(MemorySource::new()), MigrationConfig::default());
        let mut status = orch.status_receiver();
        orch.init().await.unwrap();

        orch.stop().await.unwrap();
        assert_eq!(orch.status(), MigrationStatus::Finished);
        assert_eq!(*status.borrow_and_update(), MigrationStatus::Finished);

        // Already finished
        orch.stop().await.unwrap();
        assert!(matches!(
            orch.init().await.unwrap_err(),
            MigrateError::InvalidTransition { .. }
        ));
    }

    #[tokio::test]
    async fn test_init_failure_stays_pending() {
        let backend = Arc::new(MemoryCursorBackend::new());
        backend.insert_raw(SyncState {
            id: 1,
            table: LogicalTable::Calls,
            last_synced_at: None,
            min_date: None,
            max_date: None,
        });
        let orch = MigrationOrchestrator::new(
            MigrationConfig::default(),
            StatementConfig::default(),
            Arc::new(MemorySource::new()),
            Arc::new(MemoryTarget::new()),
            backend,
        );

        let err = orch.init().await.unwrap_err();
        assert!(matches!(err, MigrateError::BootstrapInconsistent(_)));
        assert_eq!(orch.status(), MigrationStatus::Pending);
    }

    #[test]
    fn test_report_json() {
        let mut report = RunReport::new(MigrationStatus::Finished);
        report.rows_migrated.insert(LogicalTable::Calls, 10);
        report.rows_migrated.insert(LogicalTable::VoxStubs, 2);
        assert_eq!(report.total_rows(), 12);

        let json = report.to_json().unwrap();
        assert!(json.contains("\"status\": \"finished\""));
        assert!(json.contains("\"calls\": 10"));
    }
}
