//! Column introspection for the tables that take part in rewritten queries.

use std::collections::HashMap;

use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, Statement};

use crate::error::SchemaLookupError;

/// Source of table column lists.
#[async_trait]
pub trait SchemaCatalog: Send + Sync {
    /// Ordered column names of `table`.
    ///
    /// # Errors
    /// `UnknownTable` when the table does not exist, `Db` when introspection fails.
    async fn list_columns(&self, table: &str) -> Result<Vec<String>, SchemaLookupError>;
}

/// Catalog backed by the live database's metadata.
#[derive(Clone)]
pub struct SeaOrmCatalog {
    conn: DatabaseConnection,
}

impl SeaOrmCatalog {
    #[must_use]
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    fn statement(backend: DbBackend, table: &str) -> Statement {
        let (schema, name) = match table.split_once('.') {
            Some((schema, name)) => (Some(schema), name),
            None => (None, table),
        };
        match backend {
            DbBackend::Sqlite => Statement::from_sql_and_values(
                backend,
                "SELECT name AS column_name FROM pragma_table_info(?) ORDER BY cid",
                [name.into()],
            ),
            DbBackend::Postgres => Statement::from_sql_and_values(
                backend,
                "SELECT column_name::text AS column_name FROM information_schema.columns \
                 WHERE table_name = $1 AND table_schema = COALESCE($2, current_schema()) \
                 ORDER BY ordinal_position",
                [name.into(), schema.map(str::to_owned).into()],
            ),
            DbBackend::MySql => Statement::from_sql_and_values(
                backend,
                "SELECT column_name AS column_name FROM information_schema.columns \
                 WHERE table_name = ? AND table_schema = COALESCE(?, DATABASE()) \
                 ORDER BY ordinal_position",
                [name.into(), schema.map(str::to_owned).into()],
            ),
        }
    }
}

#[async_trait]
impl SchemaCatalog for SeaOrmCatalog {
    async fn list_columns(&self, table: &str) -> Result<Vec<String>, SchemaLookupError> {
        let stmt = Self::statement(self.conn.get_database_backend(), table);
        let rows = self
            .conn
            .query_all(stmt)
            .await
            .map_err(|source| SchemaLookupError::Db {
                table: table.to_owned(),
                source,
            })?;

        let columns = rows
            .iter()
            .map(|row| row.try_get::<String>("", "column_name"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| SchemaLookupError::Db {
                table: table.to_owned(),
                source,
            })?;

        if columns.is_empty() {
            return Err(SchemaLookupError::UnknownTable(table.to_owned()));
        }
        Ok(columns)
    }
}

/// Fixed in-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    tables: HashMap<String, Vec<String>>,
}

impl StaticCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_table<I, S>(mut self, table: &str, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables
            .insert(table.to_owned(), columns.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl SchemaCatalog for StaticCatalog {
    async fn list_columns(&self, table: &str) -> Result<Vec<String>, SchemaLookupError> {
        self.tables
            .get(table)
            .cloned()
            .ok_or_else(|| SchemaLookupError::UnknownTable(table.to_owned()))
    }
}
