//! Migration status and the transient run counters.

use serde::{Deserialize, Serialize};
use std::fmt;

/// `Pending → Ready → Started ⇄ Paused → {Completed | Stopped} → Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Ready,
    Started,
    Paused,
    Completed,
    Stopped,
    Finished,
}

impl MigrationStatus {
    /// Completed and Stopped both lead to teardown.
    pub fn needs_teardown(self) -> bool {
        matches!(self, MigrationStatus::Completed | MigrationStatus::Stopped)
    }

    pub fn is_finished(self) -> bool {
        self == MigrationStatus::Finished
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Ready => "ready",
            MigrationStatus::Started => "started",
            MigrationStatus::Paused => "paused",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Stopped => "stopped",
            MigrationStatus::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// Counters for the loop in progress. Never persisted: a restart derives
/// `total_iterations` again from the calls cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRun {
    pub status: MigrationStatus,
    pub iteration_index: u64,
    pub total_iterations: u64,
}

impl MigrationRun {
    pub fn new(total_iterations: u64) -> Self {
        Self {
            status: MigrationStatus::Started,
            iteration_index: 0,
            total_iterations,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.iteration_index >= self.total_iterations
    }

    pub fn remaining(&self) -> u64 {
        self.total_iterations.saturating_sub(self.iteration_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_serde() {
        for status in [
            MigrationStatus::Pending,
            MigrationStatus::Ready,
            MigrationStatus::Started,
            MigrationStatus::Paused,
            MigrationStatus::Completed,
            MigrationStatus::Stopped,
            MigrationStatus::Finished,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
        }
    }

    #[test]
    fn test_run_counters() {
        let mut run = MigrationRun::new(2);
        assert!(!run.is_exhausted());
        run.iteration_index = 2;
        assert!(run.is_exhausted());
        assert_eq!(run.remaining(), 0);
        assert!(MigrationRun::new(0).is_exhausted());
    }
}
