//! Schema for the local application database and for the master datastore.

use sea_orm_migration::prelude::*;

mod local_001;
mod master_001;

/// Workspaces, membership and link tables on the local database.
pub struct LocalMigrator;

#[async_trait::async_trait]
impl MigratorTrait for LocalMigrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(local_001::Migration)]
    }
}

/// Canonical workspace table on the master datastore.
pub struct MasterMigrator;

#[async_trait::async_trait]
impl MigratorTrait for MasterMigrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(master_001::Migration)]
    }

    fn migration_table_name() -> sea_orm::sea_query::DynIden {
        Alias::new("seaql_master_migrations").into_iden()
    }
}
