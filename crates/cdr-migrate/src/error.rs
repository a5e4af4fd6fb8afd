//! Error types for the migration library.

use thiserror::Error;

/// SQL Server error number for a PRIMARY KEY constraint violation.
pub const SQL_PK_VIOLATION: u32 = 2627;

/// SQL Server error number for a duplicate key in a unique index.
pub const SQL_UNIQUE_INDEX_VIOLATION: u32 = 2601;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection or query error
    #[error("Database error: {0}")]
    Database(#[from] tiberius::error::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A database call exceeded the configured command timeout
    #[error("Command timed out after {seconds}s: {context}")]
    Timeout { context: String, seconds: u64 },

    /// The cursor table has not been created yet
    #[error("Sync cursor table does not exist - run init first")]
    NotBootstrapped,

    /// The cursor table exists but does not describe the logical tables
    #[error("Sync cursor table is inconsistent: {0}")]
    BootstrapInconsistent(String),

    /// An attempt to move a cursor backwards
    #[error("Cursor for {table} cannot move from {current} back to {requested}")]
    CursorRegression {
        table: String,
        current: chrono::NaiveDate,
        requested: chrono::NaiveDate,
    },

    /// A command that is not legal in the current migration status
    #[error("Cannot {command} while migration is {from}")]
    InvalidTransition { from: String, command: String },

    /// Target rejected an insert because some ids already exist
    #[error("Primary key conflict in {table}: {message}")]
    PrimaryKeyConflict { table: String, message: String },

    /// Data transfer failed for a specific table
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was aborted (second SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create an InvalidTransition error
    pub fn invalid_transition(from: impl ToString, command: impl Into<String>) -> Self {
        MigrateError::InvalidTransition {
            from: from.to_string(),
            command: command.into(),
        }
    }

    /// Map a tiberius error raised while writing to `table`, classifying
    /// duplicate-key failures as [`MigrateError::PrimaryKeyConflict`].
    pub fn from_insert(table: &str, err: tiberius::error::Error) -> Self {
        if is_primary_key_violation(&err) {
            MigrateError::PrimaryKeyConflict {
                table: table.to_string(),
                message: err.to_string(),
            }
        } else {
            MigrateError::transfer(table, err.to_string())
        }
    }

    /// True for the recoverable duplicate-id failure.
    pub fn is_primary_key_conflict(&self) -> bool {
        match self {
            MigrateError::PrimaryKeyConflict { .. } => true,
            MigrateError::Database(e) => is_primary_key_violation(e),
            _ => false,
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => 2,
            MigrateError::NotBootstrapped | MigrateError::BootstrapInconsistent(_) => 3,
            MigrateError::InvalidTransition { .. } => 4,
            MigrateError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Check whether a tiberius error is a duplicate-key violation (2627 or 2601).
pub fn is_primary_key_violation(err: &tiberius::error::Error) -> bool {
    match err {
        tiberius::error::Error::Server(token) => {
            matches!(token.code(), SQL_PK_VIOLATION | SQL_UNIQUE_INDEX_VIOLATION)
        }
        _ => false,
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_server_errors_are_not_conflicts() {
        let io_error = tiberius::error::Error::Io {
            kind: std::io::ErrorKind::ConnectionRefused,
            message: "connection refused".to_string(),
        };
        assert!(!is_primary_key_violation(&io_error));

        let protocol_error = tiberius::error::Error::Protocol("protocol error".into());
        assert!(!is_primary_key_violation(&protocol_error));
        assert!(!MigrateError::from(protocol_error).is_primary_key_conflict());
    }

    #[test]
    fn test_from_insert_non_conflict_is_transfer() {
        let err = tiberius::error::Error::Protocol("bad token".into());
        let mapped = MigrateError::from_insert("ww.calls", err);
        assert!(matches!(mapped, MigrateError::Transfer { ref table, .. } if table == "ww.calls"));
        assert!(!mapped.is_primary_key_conflict());
    }

    #[test]
    fn test_primary_key_conflict_flag() {
        let err = MigrateError::PrimaryKeyConflict {
            table: "ww.calls".into(),
            message: "duplicate".into(),
        };
        assert!(err.is_primary_key_conflict());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("x".into()).exit_code(), 2);
        assert_eq!(MigrateError::NotBootstrapped.exit_code(), 3);
        assert_eq!(
            MigrateError::invalid_transition("pending", "start").exit_code(),
            4
        );
        assert_eq!(MigrateError::Cancelled.exit_code(), 130);
        assert_eq!(MigrateError::transfer("t", "m").exit_code(), 1);
    }

    #[test]
    fn test_format_detailed_includes_message() {
        let err = MigrateError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "config.yaml missing",
        ));
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error"));
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = MigrateError::invalid_transition("finished", "resume");
        assert_eq!(err.to_string(), "Cannot resume while migration is finished");
    }
}
