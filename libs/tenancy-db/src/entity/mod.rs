//! Storage entities for workspaces, membership and link tables.
//!
//! `master_workspace` lives on the master connection; everything else lives on
//! the local application database.

pub mod master_workspace;
pub mod user_model;
pub mod workspace;
pub mod workspace_model;
pub mod workspace_user;

use sea_orm::DatabaseConnection;
use sea_orm_migration::MigratorTrait;

use crate::error::Result;
use crate::migrations::{LocalMigrator, MasterMigrator};

/// Create the local workspace, membership and link tables if absent.
///
/// # Errors
/// `Db` when a migration fails.
pub async fn install_local(conn: &DatabaseConnection) -> Result<()> {
    LocalMigrator::up(conn, None).await?;
    tracing::debug!("local tenancy tables installed");
    Ok(())
}

/// Create the master workspace table if absent.
///
/// # Errors
/// `Db` when a migration fails.
pub async fn install_master(conn: &DatabaseConnection) -> Result<()> {
    MasterMigrator::up(conn, None).await?;
    tracing::debug!("master workspace table installed");
    Ok(())
}
