//! Tenant-aware access to the local database.
//!
//! `TenantConn` runs every read on a filtered table through the visibility
//! scope and the column rewriter, and every write through the before-save
//! workspace check and the link refresh. Requests matched by the exemption
//! policy skip the scope but are still rewritten.
//!
//! ```ignore
//! let rows = db
//!     .fetch_all(&ctx, Query::table("posts").filter(Predicate::eq("status", 1)))
//!     .await?;
//! ```

use std::sync::Arc;

use sea_orm::sea_query::{Alias, Expr, Query as SeaQuery, SimpleExpr};
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, FromQueryResult, JsonValue,
    TransactionTrait,
};
use serde_json::Map;
use tenancy_security::{ExemptionPolicy, RequestContext};
use tracing::debug;

use crate::error::{Result, TenancyError};
use crate::linkage::{ModelLinker, WORKSPACE_COLUMN};
use crate::query::render::sea_value;
use crate::query::{Predicate, Query, Value, is_identifier};
use crate::registry::{FilteredModule, SchemaRegistry};
use crate::rewrite::QueryRewriter;
use crate::scope::TenantScope;

/// Local database handle that applies workspace isolation.
#[derive(Debug, Clone)]
pub struct TenantConn {
    conn: DatabaseConnection,
    registry: Arc<SchemaRegistry>,
    rewriter: QueryRewriter,
    exemptions: ExemptionPolicy,
    linker: ModelLinker,
}

impl TenantConn {
    #[must_use]
    pub fn new(
        conn: DatabaseConnection,
        registry: Arc<SchemaRegistry>,
        exemptions: ExemptionPolicy,
    ) -> Self {
        Self {
            conn,
            rewriter: QueryRewriter::new(Arc::clone(&registry)),
            linker: ModelLinker::new(exemptions.clone()),
            registry,
            exemptions,
        }
    }

    /// Underlying connection. Queries issued on it are not scoped.
    #[must_use]
    pub fn conn(&self) -> &DatabaseConnection {
        &self.conn
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn linker(&self) -> &ModelLinker {
        &self.linker
    }

    /// Scope and rewrite `query` for `ctx` without executing it.
    pub async fn prepare(&self, ctx: &RequestContext, mut query: Query) -> Query {
        if let Some(module) = self.registry.module(&query.from.name) {
            if self.exemptions.is_exempt(ctx) {
                debug!(table = %module.table, "visibility scope bypassed");
            } else {
                TenantScope::apply(&mut query, module, ctx);
            }
        }
        self.rewriter.rewrite(query).await
    }

    /// # Errors
    /// `Db` when the statement fails.
    pub async fn fetch_all(&self, ctx: &RequestContext, query: Query) -> Result<Vec<JsonValue>> {
        let query = self.prepare(ctx, query).await;
        let stmt = query.build(self.conn.get_database_backend());
        Ok(JsonValue::find_by_statement(stmt).all(&self.conn).await?)
    }

    /// # Errors
    /// `Db` when the statement fails.
    pub async fn fetch_one(&self, ctx: &RequestContext, query: Query) -> Result<Option<JsonValue>> {
        let query = self.prepare(ctx, query.limit(1)).await;
        let stmt = query.build(self.conn.get_database_backend());
        Ok(JsonValue::find_by_statement(stmt).one(&self.conn).await?)
    }

    /// Insert (`key = None`) or update one row of a filtered table and refresh its
    /// workspace link. Returns the row's primary key.
    ///
    /// # Errors
    /// - `Configuration` for an unregistered table or a malformed column name
    /// - `WorkspaceRequired` when the write cannot be attributed to a workspace
    /// - `Denied` / `NotFound` when the row to update is invisible or missing
    pub async fn save(
        &self,
        ctx: &RequestContext,
        table: &str,
        key: Option<i64>,
        mut attrs: Map<String, JsonValue>,
    ) -> Result<i64> {
        let module = self.filtered(table)?;
        let current = match key {
            Some(id) => {
                let row = self.visible_row(ctx, module, id).await?;
                row.get(WORKSPACE_COLUMN).and_then(JsonValue::as_i64)
            }
            None => attrs.get(WORKSPACE_COLUMN).and_then(JsonValue::as_i64),
        };

        let workspace = self.linker.before_save(ctx, module, current)?;
        attrs.insert(WORKSPACE_COLUMN.to_owned(), workspace.into());

        let tx = self.conn.begin().await?;
        let id = match key {
            Some(id) => {
                update_row(&tx, module, id, &attrs).await?;
                id
            }
            None => insert_row(&tx, module, &attrs).await?,
        };
        self.linker.after_save(&tx, module, Some(id), workspace).await?;
        tx.commit().await?;

        debug!(table, id, workspace_id = ?workspace, "filtered row saved");
        Ok(id)
    }

    /// Delete one visible row of a filtered table together with its links.
    ///
    /// # Errors
    /// `Denied` when the row exists but is invisible to `ctx`, `NotFound` when it
    /// does not exist.
    pub async fn delete(&self, ctx: &RequestContext, table: &str, id: i64) -> Result<()> {
        let module = self.filtered(table)?;
        self.visible_row(ctx, module, id).await?;

        let stmt = SeaQuery::delete()
            .from_table(Alias::new(module.table.as_str()))
            .and_where(Expr::col(Alias::new(module.primary_key.as_str())).eq(id))
            .to_owned();

        let tx = self.conn.begin().await?;
        tx.execute(tx.get_database_backend().build(&stmt)).await?;
        self.linker.unlink(&tx, module, id).await?;
        tx.commit().await?;

        debug!(table, id, "filtered row deleted");
        Ok(())
    }

    fn filtered(&self, table: &str) -> Result<&FilteredModule> {
        self.registry.module(table).ok_or_else(|| {
            TenancyError::Configuration(format!("table '{table}' is not registered for filtering"))
        })
    }

    /// The row as seen through the scope; distinguishes hidden from missing rows.
    async fn visible_row(
        &self,
        ctx: &RequestContext,
        module: &FilteredModule,
        id: i64,
    ) -> Result<JsonValue> {
        let by_key = Query::table(&module.table).filter(Predicate::eq(
            format!("{}.{}", module.table, module.primary_key),
            id,
        ));

        if let Some(row) = self.fetch_one(ctx, by_key.clone()).await? {
            return Ok(row);
        }

        let stmt = by_key.limit(1).build(self.conn.get_database_backend());
        let exists = JsonValue::find_by_statement(stmt)
            .one(&self.conn)
            .await?
            .is_some();
        if exists {
            Err(TenancyError::Denied(format!("{} {id}", module.table)))
        } else {
            Err(TenancyError::NotFound(format!("{} {id}", module.table)))
        }
    }
}

fn assignments(attrs: &Map<String, JsonValue>) -> Result<Vec<(Alias, SimpleExpr)>> {
    attrs
        .iter()
        .map(|(column, value)| {
            if !is_identifier(column) {
                return Err(TenancyError::Configuration(format!(
                    "invalid column name '{column}'"
                )));
            }
            Ok((
                Alias::new(column.as_str()),
                SimpleExpr::Value(sea_value(&Value::from(value))),
            ))
        })
        .collect()
}

async fn update_row(
    tx: &DatabaseTransaction,
    module: &FilteredModule,
    id: i64,
    attrs: &Map<String, JsonValue>,
) -> Result<()> {
    let stmt = SeaQuery::update()
        .table(Alias::new(module.table.as_str()))
        .values(assignments(attrs)?)
        .and_where(Expr::col(Alias::new(module.primary_key.as_str())).eq(id))
        .to_owned();
    tx.execute(tx.get_database_backend().build(&stmt)).await?;
    Ok(())
}

async fn insert_row(
    tx: &DatabaseTransaction,
    module: &FilteredModule,
    attrs: &Map<String, JsonValue>,
) -> Result<i64> {
    let (columns, values): (Vec<Alias>, Vec<SimpleExpr>) = assignments(attrs)?.into_iter().unzip();
    let mut stmt = SeaQuery::insert();
    stmt.into_table(Alias::new(module.table.as_str()))
        .columns(columns)
        .values(values)
        .map_err(|e| TenancyError::Configuration(format!("invalid insert: {e}")))?;

    if let Some(id) = attrs.get(&module.primary_key).and_then(JsonValue::as_i64) {
        tx.execute(tx.get_database_backend().build(&stmt)).await?;
        return Ok(id);
    }

    let backend = tx.get_database_backend();
    if backend.support_returning() {
        stmt.returning_col(Alias::new(module.primary_key.as_str()));
        let row = tx
            .query_one(backend.build(&stmt))
            .await?
            .ok_or_else(|| TenancyError::NotFound(format!("inserted {} row", module.table)))?;
        return Ok(row.try_get::<i64>("", &module.primary_key)?);
    }

    let res = tx.execute(backend.build(&stmt)).await?;
    i64::try_from(res.last_insert_id()).map_err(|_| {
        TenancyError::Configuration(format!("{} key out of range", module.table))
    })
}
