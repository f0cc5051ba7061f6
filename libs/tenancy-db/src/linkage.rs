//! Link tables tying filtered rows to workspaces and users, and workspace membership.

use std::collections::BTreeSet;

use chrono::Utc;
use sea_orm::sea_query::{Alias, ColumnDef, Table};
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, TransactionTrait,
};
use tenancy_security::{ExemptionPolicy, RequestContext};
use tracing::{debug, info, warn};

use crate::entity::{user_model, workspace_model, workspace_user};
use crate::error::{Result, SchemaLookupError, TenancyError};
use crate::registry::{FilteredModule, SchemaRegistry};

/// Column every filtered table carries.
pub const WORKSPACE_COLUMN: &str = "workspace_id";

/// Maintains `workspace_models` and `user_models` rows for filtered rows.
#[derive(Debug, Clone)]
pub struct ModelLinker {
    exemptions: ExemptionPolicy,
}

impl ModelLinker {
    #[must_use]
    pub fn new(exemptions: ExemptionPolicy) -> Self {
        Self { exemptions }
    }

    /// Workspace a write to `module` is attributed to.
    ///
    /// The active workspace wins over the row's current `workspace_id`.
    /// Exempt requests may write rows without a workspace.
    ///
    /// # Errors
    /// `WorkspaceRequired` when neither is present and the request is not exempt.
    pub fn before_save(
        &self,
        ctx: &RequestContext,
        module: &FilteredModule,
        current: Option<i64>,
    ) -> Result<Option<i64>> {
        if let Some(ws) = ctx.active_workspace_id().or(current) {
            return Ok(Some(ws));
        }
        if self.exemptions.is_exempt(ctx) {
            debug!(table = %module.table, "exempt write without workspace");
            return Ok(None);
        }
        Err(TenancyError::WorkspaceRequired {
            table: module.table.clone(),
        })
    }

    /// Replace the workspace link of one row with a link to `workspace_id`.
    ///
    /// Delete and insert run in one transaction, so concurrent saves never
    /// leave two links behind. `None` for `model_id` skips the refresh.
    ///
    /// # Errors
    /// `Db` on any datastore failure; the transaction is rolled back.
    pub async fn after_save<C>(
        &self,
        conn: &C,
        module: &FilteredModule,
        model_id: Option<i64>,
        workspace_id: Option<i64>,
    ) -> Result<()>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let Some(model_id) = model_id else {
            warn!(table = %module.table, "saved row has no key; link refresh skipped");
            return Ok(());
        };

        let tx = conn.begin().await?;
        workspace_model::Entity::delete_many()
            .filter(workspace_model::Column::ModelType.eq(module.entity_type.as_str()))
            .filter(workspace_model::Column::ModelId.eq(model_id))
            .exec(&tx)
            .await?;
        if let Some(workspace_id) = workspace_id {
            workspace_model::ActiveModel {
                workspace_id: ActiveValue::Set(workspace_id),
                model_type: ActiveValue::Set(module.entity_type.clone()),
                model_id: ActiveValue::Set(model_id),
                ..Default::default()
            }
            .insert(&tx)
            .await?;
        }
        tx.commit().await?;
        debug!(table = %module.table, model_id, workspace_id, "workspace link refreshed");
        Ok(())
    }

    /// Make `user_ids` the complete set of users granted access to one row.
    ///
    /// # Errors
    /// `Db` on any datastore failure; the transaction is rolled back.
    pub async fn grant_user<C>(
        &self,
        conn: &C,
        module: &FilteredModule,
        model_id: i64,
        user_ids: &[i64],
    ) -> Result<()>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let users: BTreeSet<i64> = user_ids.iter().copied().collect();

        let tx = conn.begin().await?;
        user_model::Entity::delete_many()
            .filter(user_model::Column::ModelType.eq(module.entity_type.as_str()))
            .filter(user_model::Column::ModelId.eq(model_id))
            .exec(&tx)
            .await?;
        for user_id in &users {
            user_model::ActiveModel {
                user_id: ActiveValue::Set(*user_id),
                model_type: ActiveValue::Set(module.entity_type.clone()),
                model_id: ActiveValue::Set(model_id),
                ..Default::default()
            }
            .insert(&tx)
            .await?;
        }
        tx.commit().await?;
        debug!(table = %module.table, model_id, users = users.len(), "user grants replaced");
        Ok(())
    }

    /// Remove one user's grant; returns the number of rows deleted.
    ///
    /// # Errors
    /// `Db` on any datastore failure.
    pub async fn revoke_user<C: ConnectionTrait>(
        &self,
        conn: &C,
        module: &FilteredModule,
        model_id: i64,
        user_id: i64,
    ) -> Result<u64> {
        let res = user_model::Entity::delete_many()
            .filter(user_model::Column::ModelType.eq(module.entity_type.as_str()))
            .filter(user_model::Column::ModelId.eq(model_id))
            .filter(user_model::Column::UserId.eq(user_id))
            .exec(conn)
            .await?;
        Ok(res.rows_affected)
    }

    /// Drop every workspace link and user grant of one row.
    ///
    /// # Errors
    /// `Db` on any datastore failure.
    pub async fn unlink<C: ConnectionTrait>(
        &self,
        conn: &C,
        module: &FilteredModule,
        model_id: i64,
    ) -> Result<()> {
        workspace_model::Entity::delete_many()
            .filter(workspace_model::Column::ModelType.eq(module.entity_type.as_str()))
            .filter(workspace_model::Column::ModelId.eq(model_id))
            .exec(conn)
            .await?;
        user_model::Entity::delete_many()
            .filter(user_model::Column::ModelType.eq(module.entity_type.as_str()))
            .filter(user_model::Column::ModelId.eq(model_id))
            .exec(conn)
            .await?;
        Ok(())
    }

    /// # Errors
    /// `Db` on any datastore failure.
    pub async fn workspace_links<C: ConnectionTrait>(
        &self,
        conn: &C,
        module: &FilteredModule,
        model_id: i64,
    ) -> Result<Vec<workspace_model::Model>> {
        Ok(workspace_model::Entity::find()
            .filter(workspace_model::Column::ModelType.eq(module.entity_type.as_str()))
            .filter(workspace_model::Column::ModelId.eq(model_id))
            .order_by_asc(workspace_model::Column::Id)
            .all(conn)
            .await?)
    }
}

/// Workspace membership (`workspace_users`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Membership;

impl Membership {
    /// Add `user_id` to `workspace_id`; inviting twice keeps a single row.
    ///
    /// # Errors
    /// `Db` on any datastore failure.
    pub async fn invite<C: ConnectionTrait>(
        conn: &C,
        workspace_id: i64,
        user_id: i64,
    ) -> Result<workspace_user::Model> {
        let now = Utc::now();
        let existing = workspace_user::Entity::find()
            .filter(workspace_user::Column::WorkspaceId.eq(workspace_id))
            .filter(workspace_user::Column::UserId.eq(user_id))
            .one(conn)
            .await?;

        let model = match existing {
            Some(found) => {
                let mut am: workspace_user::ActiveModel = found.into();
                am.updated_at = ActiveValue::Set(now);
                am.update(conn).await?
            }
            None => {
                let created = workspace_user::ActiveModel {
                    workspace_id: ActiveValue::Set(workspace_id),
                    user_id: ActiveValue::Set(user_id),
                    created_at: ActiveValue::Set(now),
                    updated_at: ActiveValue::Set(now),
                    ..Default::default()
                }
                .insert(conn)
                .await?;
                info!(workspace_id, user_id, "user added to workspace");
                created
            }
        };
        Ok(model)
    }

    /// # Errors
    /// `Db` on any datastore failure.
    pub async fn remove<C: ConnectionTrait>(conn: &C, workspace_id: i64, user_id: i64) -> Result<u64> {
        let res = workspace_user::Entity::delete_many()
            .filter(workspace_user::Column::WorkspaceId.eq(workspace_id))
            .filter(workspace_user::Column::UserId.eq(user_id))
            .exec(conn)
            .await?;
        if res.rows_affected > 0 {
            info!(workspace_id, user_id, "user removed from workspace");
        }
        Ok(res.rows_affected)
    }

    /// User ids of every member, ascending.
    ///
    /// # Errors
    /// `Db` on any datastore failure.
    pub async fn members<C: ConnectionTrait>(conn: &C, workspace_id: i64) -> Result<Vec<i64>> {
        let rows = workspace_user::Entity::find()
            .filter(workspace_user::Column::WorkspaceId.eq(workspace_id))
            .order_by_asc(workspace_user::Column::UserId)
            .all(conn)
            .await?;
        let mut ids: Vec<i64> = rows.into_iter().map(|r| r.user_id).collect();
        ids.dedup();
        Ok(ids)
    }
}

/// Add a nullable `workspace_id` column to every registered table lacking one.
///
/// Tables that do not exist yet are skipped. Returns the tables altered.
///
/// # Errors
/// `SchemaLookup` when a table cannot be inspected, `Db` when the alter fails.
pub async fn ensure_workspace_column(
    conn: &DatabaseConnection,
    registry: &SchemaRegistry,
) -> Result<Vec<String>> {
    let mut tables: Vec<&FilteredModule> = registry.modules().collect();
    tables.sort_by(|a, b| a.table.cmp(&b.table));

    let backend = conn.get_database_backend();
    let mut altered = Vec::new();
    for module in tables {
        let columns = match registry.columns(&module.table).await {
            Ok(columns) => columns,
            Err(SchemaLookupError::UnknownTable(_)) => {
                debug!(table = %module.table, "table missing; workspace column skipped");
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        if columns.iter().any(|c| c == WORKSPACE_COLUMN) {
            continue;
        }

        let stmt = Table::alter()
            .table(Alias::new(module.table.as_str()))
            .add_column(ColumnDef::new(Alias::new(WORKSPACE_COLUMN)).big_integer().null())
            .to_owned();
        conn.execute(backend.build(&stmt)).await?;
        registry.invalidate(&module.table);
        info!(table = %module.table, "added workspace_id column");
        altered.push(module.table.clone());
    }
    Ok(altered)
}
