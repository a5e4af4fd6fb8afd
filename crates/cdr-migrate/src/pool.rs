//! Pooled tiberius connections shared by the source, target and cursor stores.

use crate::config::ConnectionConfig;
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use std::future::Future;
use std::time::Duration;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::info;

pub type MssqlClient = Client<Compat<TcpStream>>;
pub type MssqlConnection<'a> = PooledConnection<'a, TiberiusConnectionManager>;

/// Connection manager for bb8 pool with tiberius.
#[derive(Clone)]
pub struct TiberiusConnectionManager {
    config: ConnectionConfig,
}

impl TiberiusConnectionManager {
    fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(
            &self.config.user,
            &self.config.password,
        ));

        if self.config.encryption_enabled() {
            if self.config.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = MssqlClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr()).await.map_err(|e| {
            tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            }
        })?;

        tcp.set_nodelay(true).ok();

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// A bb8 pool of SQL Server connections with a per-command timeout.
pub struct MssqlPool {
    pool: Pool<TiberiusConnectionManager>,
    role: &'static str,
    command_timeout: Duration,
}

impl MssqlPool {
    /// Connect to `config`, verifying one connection before returning.
    ///
    /// `role` names the endpoint ("source" or "target") in logs and errors.
    pub async fn connect(
        config: &ConnectionConfig,
        role: &'static str,
        max_size: u32,
        command_timeout: Duration,
    ) -> Result<Self> {
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(1))
            .connection_timeout(command_timeout)
            .build(manager)
            .await
            .map_err(|e| MigrateError::pool(e, format!("creating {} pool", role)))?;

        let this = Self {
            pool,
            role,
            command_timeout,
        };

        // Test connection
        {
            let mut conn = this.get_conn().await?;
            this.timed("connection check", async {
                conn.simple_query("SELECT 1").await?.into_row().await
            })
            .await?;
        }

        info!("Connected to {}: {}", role, config.summary());

        Ok(this)
    }

    /// Get a connection from the pool.
    pub async fn get_conn(&self) -> Result<MssqlConnection<'_>> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, format!("getting {} connection", self.role)))
    }

    pub fn role(&self) -> &'static str {
        self.role
    }

    /// Await a database future, failing with [`MigrateError::Timeout`] once
    /// the configured command timeout elapses.
    pub async fn timed<T, E, F>(&self, context: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        MigrateError: From<E>,
    {
        with_timeout(self.command_timeout, context, fut).await
    }
}

/// Bound `fut` by `limit`.
pub async fn with_timeout<T, E, F>(limit: Duration, context: &str, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    MigrateError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(MigrateError::from),
        Err(_) => Err(MigrateError::Timeout {
            context: context.to_string(),
            seconds: limit.as_secs(),
        }),
    }
}

/// Quote an MSSQL identifier with brackets.
pub fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// `[schema].[table]`.
pub fn qualify(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_brackets() {
        assert_eq!(quote_ident("calls"), "[calls]");
        assert_eq!(quote_ident("odd]name"), "[odd]]name]");
        assert_eq!(qualify("ww", "vox_stubs"), "[ww].[vox_stubs]");
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_elapses() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, MigrateError>(())
        };
        let err = with_timeout(Duration::from_secs(5), "reading calls", slow)
            .await
            .unwrap_err();
        match err {
            MigrateError::Timeout { context, seconds } => {
                assert_eq!(context, "reading calls");
                assert_eq!(seconds, 5);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_with_timeout_passes_through_errors() {
        let failing = async { Err::<(), _>(MigrateError::NotBootstrapped) };
        let err = with_timeout(Duration::from_secs(5), "load", failing)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::NotBootstrapped));
    }
}
