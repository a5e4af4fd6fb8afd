//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

impl ConnectionConfig {
    /// Whether the connection should negotiate TLS.
    pub fn encryption_enabled(&self) -> bool {
        !matches!(
            self.encrypt.to_lowercase().as_str(),
            "false" | "no" | "0" | "disable"
        )
    }

    /// Host, port and database for log lines. Never includes credentials.
    pub fn summary(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
source:
  host: src.example.local
  database: wordwatch
  user: migrator
  password: secret
target:
  host: dst.example.local
  database: wordwatch
  user: migrator
  password: secret
"#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.source.port, 1433);
        assert_eq!(config.source.schema, "ww");
        assert_eq!(config.migration.ingest_batch_size, 1000);
        assert_eq!(config.migration.index_rebuild_interval, 0);
        assert_eq!(config.migration.row_cap(), None);
        assert!(config.migration.disable_constraints);
        assert!(config
            .statements
            .non_clustered_index_status_query
            .contains("NONCLUSTERED"));
        assert!(config.statements.fk_disable.is_empty());
    }

    #[test]
    fn test_statements_and_cap_parsed() {
        let yaml = format!(
            "{}migration:\n  max_rows_to_sync: 5000\n  index_rebuild_interval: 7\nstatements:\n  fk_disable:\n    - ALTER TABLE ww.media_stubs NOCHECK CONSTRAINT ALL\n  fk_enable:\n    - ALTER TABLE ww.media_stubs WITH CHECK CHECK CONSTRAINT ALL\n",
            MINIMAL
        );
        let config = Config::from_yaml(&yaml).unwrap();
        assert_eq!(config.migration.row_cap(), Some(5000));
        assert_eq!(config.migration.index_rebuild_interval, 7);
        assert_eq!(config.statements.fk_disable.len(), 1);
        assert_eq!(config.statements.fk_enable.len(), 1);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.target.summary(), "dst.example.local:1433/wordwatch");
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = Config::load("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, crate::MigrateError::Io(_)));
    }

    #[test]
    fn test_encryption_flag() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        assert!(config.source.encryption_enabled());
        config.source.encrypt = "disable".into();
        assert!(!config.source.encryption_enabled());
    }
}
