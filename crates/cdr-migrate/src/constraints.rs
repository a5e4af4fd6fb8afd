//! Index and constraint toggling around the bulk load.

use crate::config::StatementConfig;
use crate::error::Result;
use crate::progress::ProgressSender;
use crate::source::SourceStore;
use crate::target::TargetStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// One non-clustered index as reported by the status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableIndexDescriptor {
    pub table_name: String,
    pub index_name: String,
    pub enable_statement: String,
    pub disable_statement: String,
    pub is_disabled: bool,
}

impl TableIndexDescriptor {
    /// Statement that moves this index into `toggle`'s state, or `None` if
    /// it is already there.
    pub fn statement_for(&self, toggle: IndexToggle) -> Option<&str> {
        match toggle {
            IndexToggle::Enable if self.is_disabled => Some(&self.enable_statement),
            IndexToggle::Disable if !self.is_disabled => Some(&self.disable_statement),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexToggle {
    Enable,
    Disable,
}

impl fmt::Display for IndexToggle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexToggle::Enable => f.write_str("Enabling"),
            IndexToggle::Disable => f.write_str("Disabling"),
        }
    }
}

#[derive(Clone, Copy)]
enum Side {
    Source,
    Target,
}

/// Runs the configured raw statements against source or target.
///
/// Every statement is bracketed by an "<action>" and a
/// "Completed - <action>" notification.
#[derive(Clone)]
pub struct ConstraintIndexManager {
    source: Arc<dyn SourceStore>,
    target: Arc<dyn TargetStore>,
    statements: StatementConfig,
    progress: ProgressSender,
}

impl ConstraintIndexManager {
    pub fn new(
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetStore>,
        statements: StatementConfig,
        progress: ProgressSender,
    ) -> Self {
        Self {
            source,
            target,
            statements,
            progress,
        }
    }

    async fn run(&self, side: Side, action: &str, sql: &str) -> Result<()> {
        self.progress.message(action);
        debug!("{}: {}", action, sql);
        match side {
            Side::Source => self.source.execute(sql).await?,
            Side::Target => self.target.execute(sql).await?,
        }
        self.progress.message(format!("Completed - {}", action));
        Ok(())
    }

    async fn run_all(&self, side: Side, verb: &str, statements: &[String]) -> Result<usize> {
        for (i, sql) in statements.iter().enumerate() {
            let action = format!("{} ({}/{})", verb, i + 1, statements.len());
            self.run(side, &action, sql).await?;
        }
        Ok(statements.len())
    }

    /// Build the source indexes the extraction queries rely on.
    pub async fn rebuild_source_indexes(&self) -> Result<usize> {
        let n = self
            .run_all(
                Side::Source,
                "Rebuilding source indexes",
                &self.statements.source_index_rebuild,
            )
            .await?;
        info!("Rebuilt source indexes ({} statements)", n);
        Ok(n)
    }

    pub async fn rebuild_target_indexes(&self) -> Result<usize> {
        let n = self
            .run_all(
                Side::Target,
                "Rebuilding target indexes",
                &self.statements.target_index_rebuild,
            )
            .await?;
        info!("Rebuilt target indexes ({} statements)", n);
        Ok(n)
    }

    /// Enable or disable the target's non-clustered indexes.
    ///
    /// Indexes already in the requested state are skipped, so repeated calls
    /// issue nothing. Returns the number of statements run.
    pub async fn toggle_target_non_clustered_indexes(&self, toggle: IndexToggle) -> Result<usize> {
        let descriptors = self
            .target
            .index_descriptors(&self.statements.non_clustered_index_status_query)
            .await?;

        let mut issued = 0;
        for descriptor in &descriptors {
            if let Some(sql) = descriptor.statement_for(toggle) {
                let action = format!(
                    "{} index {} on {}",
                    toggle, descriptor.index_name, descriptor.table_name
                );
                self.run(Side::Target, &action, sql).await?;
                issued += 1;
            }
        }

        info!(
            "{} non-clustered indexes: {} of {} changed",
            toggle,
            issued,
            descriptors.len()
        );
        Ok(issued)
    }

    pub async fn toggle_target_foreign_keys(&self, toggle: IndexToggle) -> Result<usize> {
        let (verb, statements) = match toggle {
            IndexToggle::Enable => ("Enabling foreign keys", &self.statements.fk_enable),
            IndexToggle::Disable => ("Disabling foreign keys", &self.statements.fk_disable),
        };
        self.run_all(Side::Target, verb, statements).await
    }

    /// One-time defaults applied before the first window of a fresh sync.
    pub async fn apply_default_constraints(&self) -> Result<usize> {
        self.run_all(
            Side::Target,
            "Applying default constraints",
            &self.statements.target_default_constraints,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemorySource, MemoryTarget};
    use crate::progress::ProgressEvent;

    fn descriptor(name: &str, disabled: bool) -> TableIndexDescriptor {
        TableIndexDescriptor {
            table_name: "calls".into(),
            index_name: name.into(),
            enable_statement: format!("ALTER INDEX {} ON ww.calls REBUILD", name),
            disable_statement: format!("ALTER INDEX {} ON ww.calls DISABLE", name),
            is_disabled: disabled,
        }
    }

    fn manager(target: Arc<MemoryTarget>, statements: StatementConfig) -> ConstraintIndexManager {
        ConstraintIndexManager::new(
            Arc::new(MemorySource::new()),
            target,
            statements,
            ProgressSender::default(),
        )
    }

    #[test]
    fn test_statement_for() {
        let on = descriptor("IX_a", false);
        let off = descriptor("IX_b", true);
        assert_eq!(
            on.statement_for(IndexToggle::Disable),
            Some("ALTER INDEX IX_a ON ww.calls DISABLE")
        );
        assert_eq!(on.statement_for(IndexToggle::Enable), None);
        assert_eq!(
            off.statement_for(IndexToggle::Enable),
            Some("ALTER INDEX IX_b ON ww.calls REBUILD")
        );
        assert_eq!(off.statement_for(IndexToggle::Disable), None);
    }

    #[tokio::test]
    async fn test_toggle_indexes_is_idempotent() {
        let target = Arc::new(MemoryTarget::new());
        target.add_index(descriptor("IX_a", false));
        target.add_index(descriptor("IX_b", true));
        let mgr = manager(target.clone(), StatementConfig::default());

        assert_eq!(
            mgr.toggle_target_non_clustered_indexes(IndexToggle::Disable)
                .await
                .unwrap(),
            1
        );
        assert_eq!(target.disabled_index_count(), 2);
        assert_eq!(
            mgr.toggle_target_non_clustered_indexes(IndexToggle::Disable)
                .await
                .unwrap(),
            0
        );

        assert_eq!(
            mgr.toggle_target_non_clustered_indexes(IndexToggle::Enable)
                .await
                .unwrap(),
            2
        );
        assert_eq!(target.disabled_index_count(), 0);
    }

    #[tokio::test]
    async fn test_statements_bracketed_by_notifications() {
        let target = Arc::new(MemoryTarget::new());
        let statements = StatementConfig {
            fk_disable: vec!["ALTER TABLE ww.media_stubs NOCHECK CONSTRAINT ALL".into()],
            ..Default::default()
        };
        let mgr = manager(target.clone(), statements);
        let mut rx = mgr.progress.subscribe();

        mgr.toggle_target_foreign_keys(IndexToggle::Disable)
            .await
            .unwrap();

        let mut messages = Vec::new();
        while let Ok(ProgressEvent::Notification(n)) = rx.try_recv() {
            messages.extend(n.message);
        }
        assert_eq!(
            messages,
            vec![
                "Disabling foreign keys (1/1)".to_string(),
                "Completed - Disabling foreign keys (1/1)".to_string(),
            ]
        );
        assert_eq!(
            target.executed(),
            vec!["ALTER TABLE ww.media_stubs NOCHECK CONSTRAINT ALL".to_string()]
        );
    }

    #[tokio::test]
    async fn test_empty_lists_are_noops() {
        let target = Arc::new(MemoryTarget::new());
        let mgr = manager(target.clone(), StatementConfig::default());
        assert_eq!(mgr.rebuild_target_indexes().await.unwrap(), 0);
        assert_eq!(mgr.apply_default_constraints().await.unwrap(), 0);
        assert!(target.executed().is_empty());
    }
}
