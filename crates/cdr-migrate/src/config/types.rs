//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Live source database (SQL Server). Also holds the sync cursor table.
    pub source: ConnectionConfig,

    /// Target database (SQL Server).
    pub target: ConnectionConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Raw statements used for index and constraint management.
    #[serde(default)]
    pub statements: StatementConfig,
}

/// SQL Server connection endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Schema holding the record tables (default: "ww").
    #[serde(default = "default_ww_schema")]
    pub schema: String,

    /// Encrypt connection (default: "true").
    #[serde(default = "default_true_string")]
    pub encrypt: String,

    /// Trust server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .finish()
    }
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Rows per bulk-insert batch (default: 1000).
    #[serde(default = "default_ingest_batch_size")]
    pub ingest_batch_size: usize,

    /// Rows fetched per source page (default: 10000).
    #[serde(default = "default_query_batch_size")]
    pub query_batch_size: usize,

    /// Rebuild target indexes every N iterations. 0 disables.
    #[serde(default)]
    pub index_rebuild_interval: u32,

    /// Cap on calls migrated by one start. 0 means no cap.
    #[serde(default)]
    pub max_rows_to_sync: u64,

    /// Timeout applied to every database call, in seconds (default: 600).
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Disable target FKs and non-clustered indexes while loading (default: true).
    #[serde(default = "default_true")]
    pub disable_constraints: bool,

    /// Rebuild source indexes on a first-time init (default: false).
    #[serde(default)]
    pub source_index_build_required: bool,

    /// Rebuild target indexes when resuming a previous sync (default: false).
    #[serde(default)]
    pub target_index_build_required: bool,

    /// Maximum pooled connections per database (default: 8).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            ingest_batch_size: default_ingest_batch_size(),
            query_batch_size: default_query_batch_size(),
            index_rebuild_interval: 0,
            max_rows_to_sync: 0,
            command_timeout_secs: default_command_timeout(),
            disable_constraints: true,
            source_index_build_required: false,
            target_index_build_required: false,
            max_connections: default_max_connections(),
        }
    }
}

impl MigrationConfig {
    /// The configured row cap, if any.
    pub fn row_cap(&self) -> Option<u64> {
        (self.max_rows_to_sync > 0).then_some(self.max_rows_to_sync)
    }

    /// Command timeout as a Duration.
    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.command_timeout_secs)
    }
}

/// Raw SQL executed by the constraint and index manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementConfig {
    /// Index builds run against the source on a first-time init.
    #[serde(default)]
    pub source_index_rebuild: Vec<String>,

    /// Index rebuilds run against the target periodically.
    #[serde(default)]
    pub target_index_rebuild: Vec<String>,

    /// Query returning `TableName, IndexName, EnableQuery, DisableQuery, IsDisabled`
    /// for the target's non-clustered indexes.
    #[serde(default = "default_non_clustered_index_status_query")]
    pub non_clustered_index_status_query: String,

    /// Statements disabling target foreign keys.
    #[serde(default)]
    pub fk_disable: Vec<String>,

    /// Statements re-enabling target foreign keys.
    #[serde(default)]
    pub fk_enable: Vec<String>,

    /// One-time default constraints applied on a first-time sync.
    #[serde(default)]
    pub target_default_constraints: Vec<String>,
}

impl Default for StatementConfig {
    fn default() -> Self {
        Self {
            source_index_rebuild: Vec::new(),
            target_index_rebuild: Vec::new(),
            non_clustered_index_status_query: default_non_clustered_index_status_query(),
            fk_disable: Vec::new(),
            fk_enable: Vec::new(),
            target_default_constraints: Vec::new(),
        }
    }
}

// Default value functions for serde
fn default_mssql_port() -> u16 {
    1433
}

fn default_ww_schema() -> String {
    "ww".to_string()
}

fn default_true_string() -> String {
    "true".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ingest_batch_size() -> usize {
    1_000
}

fn default_query_batch_size() -> usize {
    10_000
}

fn default_command_timeout() -> u64 {
    600
}

fn default_max_connections() -> u32 {
    8
}

fn default_non_clustered_index_status_query() -> String {
    "SELECT t.name AS TableName, i.name AS IndexName, \
     'ALTER INDEX [' + i.name + '] ON [ww].[' + t.name + '] REBUILD' AS EnableQuery, \
     'ALTER INDEX [' + i.name + '] ON [ww].[' + t.name + '] DISABLE' AS DisableQuery, \
     CAST(i.is_disabled AS BIT) AS IsDisabled \
     FROM sys.indexes i \
     JOIN sys.tables t ON i.object_id = t.object_id \
     JOIN sys.schemas s ON t.schema_id = s.schema_id \
     WHERE i.type_desc = 'NONCLUSTERED' AND s.name = 'ww' \
     AND t.name IN ('calls', 'media_stubs', 'vox_stubs')"
        .to_string()
}
