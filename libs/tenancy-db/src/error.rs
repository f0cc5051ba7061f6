//! Error taxonomy for workspace tenancy.
//!
//! [`TenancyError`] is what callers of the write paths see. [`SchemaLookupError`]
//! and [`NotificationDeliveryError`] are recoverable by construction: the query
//! rewriter falls back to a conservative column list, and event publishing only
//! logs.

/// Library-local result type.
pub type Result<T> = std::result::Result<T, TenancyError>;

/// Errors surfaced by the tenancy pipeline.
#[derive(thiserror::Error, Debug)]
pub enum TenancyError {
    /// Required mapping or model registration is missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A tenant-scoped write could not be attributed to any workspace.
    #[error("workspace required for writes to '{table}'")]
    WorkspaceRequired { table: String },

    #[error(transparent)]
    SchemaLookup(#[from] SchemaLookupError),

    /// Master and local workspace records disagree in a way the tie-break rules
    /// could not settle.
    #[error("workspace sync conflict: {0}")]
    SyncConflict(String),

    /// A commit or rollback on one of the datastores failed.
    #[error("transaction failure: {0}")]
    Transaction(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Row exists but is not visible to the current request.
    #[error("access denied: {0}")]
    Denied(String),

    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),
}

/// Schema introspection failures.
#[derive(thiserror::Error, Debug)]
pub enum SchemaLookupError {
    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("schema lookup failed for '{table}': {source}")]
    Db {
        table: String,
        #[source]
        source: sea_orm::DbErr,
    },
}

/// Outbound event delivery failures. Never propagated to write callers.
#[derive(thiserror::Error, Debug)]
pub enum NotificationDeliveryError {
    #[error("event endpoint unreachable: {0}")]
    Http(#[from] reqwest::Error),

    #[error("event endpoint answered with status {0}")]
    Status(u16),

    #[error("event sink is not configured")]
    NotConfigured,
}
