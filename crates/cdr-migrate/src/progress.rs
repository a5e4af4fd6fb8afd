//! Structured progress notifications published by the engine.
//!
//! The orchestrator owns a [`ProgressSender`] backed by a
//! `tokio::sync::broadcast` channel. Consumers call `subscribe()` and never
//! block the engine: a lagging or absent receiver only loses notifications.

use crate::orchestrator::MigrationStatus;
use crate::tables::LogicalTable;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

/// Display fields a progress consumer may track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressField {
    SourceCallDistribution,
    SourceCallCount,
    TargetIngestedCallCount,
    SourceMediaStubCount,
    TargetIngestedMediaStubCount,
    SourceVoxStubCount,
    TargetIngestedVoxStubCount,
    CallLastSyncedAt,
    MediaStubsLastSyncedAt,
    VoxStubsLastSyncedAt,
    CallsMinDate,
    CallsMaxDate,
}

/// Value attached to a [`ProgressField`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Count(i64),
    Date(NaiveDate),
    Days(i64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Count(n) => write!(f, "{}", n),
            FieldValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            FieldValue::Days(n) => write!(f, "{} days", n),
        }
    }
}

/// Message prefixes used at phase boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageAction {
    Started,
    Completed,
    Error,
    Reading,
    Migrated,
    Migrating,
}

impl fmt::Display for MessageAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageAction::Started => "Started",
            MessageAction::Completed => "Completed",
            MessageAction::Error => "Error",
            MessageAction::Reading => "Reading",
            MessageAction::Migrated => "Migrated",
            MessageAction::Migrating => "Migrating",
        };
        f.write_str(s)
    }
}

/// One progress update. Any part may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressNotification {
    pub message: Option<String>,
    pub field: Option<ProgressField>,
    pub value: Option<FieldValue>,
}

impl ProgressNotification {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// A field update; `value: None` clears the field (e.g. a null cursor).
    pub fn field(field: ProgressField, value: Option<FieldValue>) -> Self {
        Self {
            message: None,
            field: Some(field),
            value,
        }
    }

    pub fn with_field(message: impl Into<String>, field: ProgressField, value: FieldValue) -> Self {
        Self {
            message: Some(message.into()),
            field: Some(field),
            value: Some(value),
        }
    }
}

/// Everything published on the progress channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Notification(ProgressNotification),
    StatusChanged {
        from: MigrationStatus,
        to: MigrationStatus,
    },
}

/// Publishing half of the progress channel. Cheap to clone.
#[derive(Clone)]
pub struct ProgressSender {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressSender {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn notify(&self, notification: ProgressNotification) {
        if let Some(message) = &notification.message {
            debug!(progress = %message);
        }
        // No receivers is not an error
        let _ = self.tx.send(ProgressEvent::Notification(notification));
    }

    pub fn message(&self, message: impl Into<String>) {
        self.notify(ProgressNotification::message(message));
    }

    pub fn field(&self, field: ProgressField, value: Option<FieldValue>) {
        self.notify(ProgressNotification::field(field, value));
    }

    pub fn status_changed(&self, from: MigrationStatus, to: MigrationStatus) {
        let _ = self.tx.send(ProgressEvent::StatusChanged { from, to });
    }
}

impl Default for ProgressSender {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Folds notifications into a running migration summary.
///
/// Ingested counts accumulate; every other field keeps its latest value.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    counts: HashMap<ProgressField, i64>,
    dates: HashMap<ProgressField, NaiveDate>,
    distribution_days: i64,
    last_message: Option<String>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_event(&mut self, event: &ProgressEvent) {
        if let ProgressEvent::Notification(n) = event {
            self.apply(n);
        }
    }

    pub fn apply(&mut self, notification: &ProgressNotification) {
        if let Some(message) = &notification.message {
            self.last_message = Some(message.clone());
        }

        let Some(field) = notification.field else {
            return;
        };

        match (field, &notification.value) {
            (
                ProgressField::TargetIngestedCallCount
                | ProgressField::TargetIngestedMediaStubCount
                | ProgressField::TargetIngestedVoxStubCount,
                Some(FieldValue::Count(n)),
            ) => {
                *self.counts.entry(field).or_insert(0) += n;
            }
            (
                ProgressField::SourceCallDistribution,
                Some(FieldValue::Days(n) | FieldValue::Count(n)),
            ) => {
                self.distribution_days = *n;
            }
            (_, Some(FieldValue::Count(n))) => {
                self.counts.insert(field, *n);
            }
            (_, Some(FieldValue::Date(d))) => {
                self.dates.insert(field, *d);
            }
            (_, None) => {
                self.dates.remove(&field);
            }
            (_, Some(FieldValue::Days(_))) => {}
        }
    }

    pub fn source_count(&self, table: LogicalTable) -> i64 {
        self.counts
            .get(&table.source_count_field())
            .copied()
            .unwrap_or(0)
    }

    pub fn ingested_count(&self, table: LogicalTable) -> i64 {
        self.counts.get(&table.ingested_field()).copied().unwrap_or(0)
    }

    pub fn last_synced(&self, table: LogicalTable) -> Option<NaiveDate> {
        self.dates.get(&table.last_synced_field()).copied()
    }

    pub fn last_message(&self) -> Option<&str> {
        self.last_message.as_deref()
    }

    pub fn calls_remaining(&self) -> i64 {
        self.source_count(LogicalTable::Calls) - self.ingested_count(LogicalTable::Calls)
    }

    /// Ingested calls as a rounded percentage of source calls.
    pub fn completion_percent(&self) -> u8 {
        let source = self.source_count(LogicalTable::Calls);
        if source <= 0 {
            return 0;
        }
        let ingested = self.ingested_count(LogicalTable::Calls) as f64;
        let pct = (ingested / source as f64 * 100.0).round();
        pct.clamp(0.0, 100.0) as u8
    }

    /// Multi-line summary of the source side.
    pub fn source_summary(&self) -> String {
        let date = |f: ProgressField| {
            self.dates
                .get(&f)
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default()
        };
        format!(
            "Calls: {}\nMediaStubs: {}\nVoxStubs: {}\nDate Range: {} - {} ({})",
            self.source_count(LogicalTable::Calls),
            self.source_count(LogicalTable::MediaStubs),
            self.source_count(LogicalTable::VoxStubs),
            date(ProgressField::CallsMinDate),
            date(ProgressField::CallsMaxDate),
            self.distribution_days,
        )
    }

    /// Multi-line summary of the target side.
    pub fn target_summary(&self) -> String {
        let mut out = String::new();
        for table in LogicalTable::ALL {
            let synced = self
                .last_synced(table)
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "-".into());
            out.push_str(&format!(
                "{}: {}, Last Synced: {}\n",
                table.label(),
                self.ingested_count(table),
                synced
            ));
        }
        out.push_str(&format!("Calls Remaining: {}", self.calls_remaining()));
        out
    }
}
