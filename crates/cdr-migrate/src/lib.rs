//! # cdr-migrate
//!
//! Resumable, day-windowed migration of call detail records between two
//! SQL Server databases.
//!
//! Three logical tables are migrated (`ww.calls`, `ww.media_stubs` and
//! `ww.vox_stubs`), one UTC calendar day per iteration:
//!
//! - **Per-table cursors** persisted in the source database, the only
//!   record of progress
//! - **Concurrent workers**, one per table and iteration
//! - **Conflict-safe inserts** that clear ids left by an interrupted window
//!   and retry once
//! - **Index and constraint toggling** around the bulk load
//! - **Pause, resume and stop** at iteration boundaries
//!
//! ## Example
//!
//! ```rust,no_run
//! use cdr_migrate::{Config, MigrationOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> cdr_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = MigrationOrchestrator::connect(&config).await?;
//!     orchestrator.init().await?;
//!     let report = orchestrator.start().await?;
//!     println!("Migrated {} rows", report.total_rows());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constraints;
pub mod error;
pub mod memory;
pub mod orchestrator;
pub mod pool;
pub mod progress;
pub mod source;
pub mod state;
pub mod tables;
pub mod target;
pub mod worker;

// Re-exports for convenient access
pub use config::{Config, ConnectionConfig, MigrationConfig, StatementConfig};
pub use constraints::{ConstraintIndexManager, IndexToggle, TableIndexDescriptor};
pub use error::{MigrateError, Result};
pub use orchestrator::{MigrationOrchestrator, MigrationRun, MigrationStatus, RunReport};
pub use progress::{
    FieldValue, MessageAction, ProgressEvent, ProgressField, ProgressNotification,
    ProgressSender, ProgressTracker,
};
pub use source::{DateBounds, SourceRecord, SourceStore};
pub use state::{CursorBackend, SyncCursorStore, SyncState};
pub use tables::{DayWindow, LogicalTable};
pub use target::{SqlValue, TargetStore};
pub use worker::{TableSyncWorker, WindowOutcome, WindowResult};
