//! Connection settings for the local and master datastores.

use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbBackend};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TenancyError};

/// One datastore connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DbConnConfig {
    /// `sqlite::memory:`, `sqlite://path.db`, `postgres://...` or `mysql://...`.
    pub dsn: String,
    pub max_conns: Option<u32>,
    pub min_conns: Option<u32>,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
}

impl DbConnConfig {
    #[must_use]
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            ..Self::default()
        }
    }

    /// Single-connection configuration, required for `sqlite::memory:`.
    #[must_use]
    pub fn single(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            max_conns: Some(1),
            min_conns: Some(1),
            ..Self::default()
        }
    }
}

/// Backend implied by a DSN scheme.
///
/// # Errors
/// `Configuration` for an empty DSN or an unsupported scheme.
pub fn backend_from_dsn(dsn: &str) -> Result<DbBackend> {
    let scheme = dsn.split(':').next().unwrap_or_default();
    match scheme {
        "sqlite" => Ok(DbBackend::Sqlite),
        "postgres" | "postgresql" => Ok(DbBackend::Postgres),
        "mysql" | "mariadb" => Ok(DbBackend::MySql),
        "" => Err(TenancyError::Configuration("database dsn is empty".to_owned())),
        other => Err(TenancyError::Configuration(format!(
            "unsupported database scheme '{other}'"
        ))),
    }
}

/// # Errors
/// `Configuration` when the DSN is invalid.
pub fn connect_options(cfg: &DbConnConfig) -> Result<ConnectOptions> {
    backend_from_dsn(&cfg.dsn)?;

    let mut opts = ConnectOptions::new(cfg.dsn.clone());
    opts.sqlx_logging(false);
    if let Some(max) = cfg.max_conns {
        opts.max_connections(max);
    }
    if let Some(min) = cfg.min_conns {
        opts.min_connections(min);
    }
    if let Some(timeout) = cfg.acquire_timeout {
        opts.acquire_timeout(timeout);
    }
    if let Some(idle) = cfg.idle_timeout {
        opts.idle_timeout(idle);
    }
    Ok(opts)
}

/// Open a pooled connection.
///
/// # Errors
/// `Configuration` for a bad DSN, `Db` when the pool cannot be established.
pub async fn connect(cfg: &DbConnConfig) -> Result<DatabaseConnection> {
    let opts = connect_options(cfg)?;
    let conn = Database::connect(opts).await?;
    tracing::info!(dsn = %redact_credentials_in_dsn(&cfg.dsn), "database connected");
    Ok(conn)
}

/// Redact credentials from DSN for logging.
#[must_use]
pub fn redact_credentials_in_dsn(dsn: &str) -> String {
    if !dsn.contains('@') {
        return dsn.to_owned();
    }
    match url::Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() && parsed.set_password(Some("***")).is_err() {
                return "***".to_owned();
            }
            parsed.to_string()
        }
        Err(_) => "***".to_owned(),
    }
}
