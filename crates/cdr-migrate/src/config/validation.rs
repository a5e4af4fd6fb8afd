//! Configuration validation.

use super::{Config, ConnectionConfig};
use crate::error::{MigrateError, Result};

fn validate_endpoint(name: &str, conn: &ConnectionConfig) -> Result<()> {
    if conn.host.is_empty() {
        return Err(MigrateError::Config(format!("{}.host is required", name)));
    }
    if conn.database.is_empty() {
        return Err(MigrateError::Config(format!("{}.database is required", name)));
    }
    if conn.user.is_empty() {
        return Err(MigrateError::Config(format!("{}.user is required", name)));
    }
    if conn.schema.is_empty() {
        return Err(MigrateError::Config(format!("{}.schema is required", name)));
    }
    Ok(())
}

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_endpoint("source", &config.source)?;
    validate_endpoint("target", &config.target)?;

    // Cannot migrate into the database being read
    if config.source.host == config.target.host
        && config.source.port == config.target.port
        && config.source.database == config.target.database
    {
        return Err(MigrateError::Config(
            "source and target cannot be the same database".into(),
        ));
    }

    let migration = &config.migration;
    if migration.ingest_batch_size == 0 {
        return Err(MigrateError::Config(
            "migration.ingest_batch_size must be at least 1".into(),
        ));
    }
    if migration.query_batch_size < migration.ingest_batch_size {
        return Err(MigrateError::Config(format!(
            "migration.query_batch_size ({}) must not be smaller than migration.ingest_batch_size ({})",
            migration.query_batch_size, migration.ingest_batch_size
        )));
    }
    if migration.command_timeout_secs == 0 {
        return Err(MigrateError::Config(
            "migration.command_timeout_secs must be at least 1".into(),
        ));
    }
    if migration.max_connections < 2 {
        return Err(MigrateError::Config(
            "migration.max_connections must be at least 2".into(),
        ));
    }

    if config.statements.non_clustered_index_status_query.trim().is_empty() {
        return Err(MigrateError::Config(
            "statements.non_clustered_index_status_query is required".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MigrationConfig, StatementConfig};

    fn endpoint(host: &str) -> ConnectionConfig {
        ConnectionConfig {
            host: host.to_string(),
            port: 1433,
            database: "wordwatch".to_string(),
            user: "sa".to_string(),
            password: "password".to_string(),
            schema: "ww".to_string(),
            encrypt: "false".to_string(),
            trust_server_cert: true,
        }
    }

    fn valid_config() -> Config {
        Config {
            source: endpoint("legacy-sql"),
            target: endpoint("new-sql"),
            migration: MigrationConfig::default(),
            statements: StatementConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_source_host() {
        let mut config = valid_config();
        config.source.host = "".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("source.host"));
    }

    #[test]
    fn test_missing_target_user() {
        let mut config = valid_config();
        config.target.user = "".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("target.user"));
    }

    #[test]
    fn test_same_database_rejected() {
        let mut config = valid_config();
        config.target.host = config.source.host.clone();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = valid_config();
        config.migration.ingest_batch_size = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_query_batch_smaller_than_ingest_rejected() {
        let mut config = valid_config();
        config.migration.query_batch_size = 10;
        config.migration.ingest_batch_size = 100;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = valid_config();
        config.migration.command_timeout_secs = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_connection_config_debug_redacts_password() {
        let mut config = valid_config();
        config.source.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.source);
        assert!(
            debug_output.contains("[REDACTED]"),
            "Debug output should contain [REDACTED]"
        );
        assert!(
            !debug_output.contains("super_secret_password_123"),
            "Debug output should not contain actual password value"
        );
    }

    #[test]
    fn test_root_config_debug_redacts_password() {
        let mut config = valid_config();
        config.target.password = "super_secret_password_456".to_string();
        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("super_secret_password_456"));
    }
}
