#![allow(clippy::unwrap_used, clippy::expect_used)]
#![allow(dead_code)]

use std::sync::Arc;

use sea_orm::{ConnectionTrait, DatabaseConnection, JsonValue};
use tenancy_db::options::{DbConnConfig, connect};
use tenancy_db::{FilteredModule, SchemaRegistry, SeaOrmCatalog, TenantConn};
use tenancy_security::{ExemptionPolicy, RequestContext};

pub const POSTS_DDL: &str = "CREATE TABLE posts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    status INTEGER NOT NULL DEFAULT 1,
    author_id BIGINT NULL,
    workspace_id BIGINT NULL
)";

pub const AUTHORS_DDL: &str = "CREATE TABLE authors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    status INTEGER NOT NULL DEFAULT 1
)";

/// In-memory `SQLite` database behind a single pooled connection.
pub async fn memory_db() -> DatabaseConnection {
    connect(&DbConnConfig::single("sqlite::memory:")).await.unwrap()
}

pub async fn local_db() -> DatabaseConnection {
    let db = memory_db().await;
    tenancy_db::entity::install_local(&db).await.unwrap();
    db
}

pub async fn master_db() -> DatabaseConnection {
    let db = memory_db().await;
    tenancy_db::entity::install_master(&db).await.unwrap();
    db
}

pub async fn exec(db: &DatabaseConnection, sql: &str) {
    db.execute_unprepared(sql).await.unwrap();
}

pub fn posts() -> FilteredModule {
    FilteredModule::new("posts", "post")
}

/// Local database with `posts` and `authors`, `posts` registered for filtering.
pub async fn tenant_db(exemptions: ExemptionPolicy) -> TenantConn {
    let db = local_db().await;
    exec(&db, POSTS_DDL).await;
    exec(&db, AUTHORS_DDL).await;

    let registry = Arc::new(SchemaRegistry::new(
        [posts()],
        Arc::new(SeaOrmCatalog::new(db.clone())),
    ));
    TenantConn::new(db, registry, exemptions)
}

pub fn ctx(user: i64, workspace: Option<i64>) -> RequestContext {
    let builder = RequestContext::builder().user_id(user);
    match workspace {
        Some(ws) => builder.active_workspace_id(ws).build(),
        None => builder.build(),
    }
}

pub fn titles(rows: &[JsonValue]) -> Vec<String> {
    let mut titles: Vec<String> = rows
        .iter()
        .map(|r| r["title"].as_str().unwrap().to_owned())
        .collect();
    titles.sort();
    titles
}
