//! Workspace synchronization between the local database and the master datastore.
//!
//! Saving a workspace goes through [`WorkspaceSynchronizer::save`], which
//! opens one transaction on each datastore, reconciles the record against
//! master (matching by slug, then by the stored slug, then by id), writes
//! master, copies the master id back, persists locally and commits master
//! first, then local.
//!
//! The two commits are independent. If the local commit fails after the
//! master commit succeeded, master is ahead of local until the next save or
//! [`WorkspaceSynchronizer::ensure_local`] repairs it; this is logged at
//! `error` level.

pub mod context;
pub mod mapping;

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectionTrait, DatabaseConnection,
    DatabaseTransaction, EntityTrait, IntoActiveModel, QueryFilter, QuerySelect, SqlErr,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tenancy_security::RequestContext;
use tracing::{debug, error, info, warn};

pub use context::{Claim, SyncContext, SyncState};
pub use mapping::{Attributes, Builtin, ColumnMap, ColumnMapEntry, ColumnMapping, slugify};

use crate::entity::{master_workspace, workspace};
use crate::error::{Result, TenancyError};
use crate::events::{EventSink, NoopEventSink, WORKSPACE_UPSERTED, publish_best_effort};
use crate::query::Value;

const DEFAULT_SLUG_RETRY_LIMIT: u32 = 100;
/// Master inserts retried after losing a slug race.
const INSERT_ATTEMPTS: u32 = 3;

/// Workspace as handed to the synchronizer by application code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Option<i64>,
    pub name: String,
    pub slug: Option<String>,
    pub status: Option<i32>,
    pub owner_user_id: Option<i64>,
    pub parent_id: Option<i64>,
}

impl Workspace {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self
    }

    #[must_use]
    pub fn with_owner(mut self, user_id: i64) -> Self {
        self.owner_user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: i32) -> Self {
        self.status = Some(status);
        self
    }

    /// Deduplication key within a unit of work: slug, else name.
    #[must_use]
    pub fn sync_key(&self) -> String {
        self.slug
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.name)
            .to_owned()
    }
}

impl From<workspace::Model> for Workspace {
    fn from(m: workspace::Model) -> Self {
        Self {
            id: Some(m.id),
            name: m.name,
            slug: m.slug,
            status: Some(m.status),
            owner_user_id: m.owner_user_id,
            parent_id: m.parent_id,
        }
    }
}

impl Attributes for Workspace {
    fn get(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(self.id.into()),
            "name" => Some(Value::Text(self.name.clone())),
            "slug" => Some(self.slug.clone().into()),
            "status" => Some(self.status.into()),
            "owner_user_id" => Some(self.owner_user_id.into()),
            "parent_id" => Some(self.parent_id.into()),
            _ => None,
        }
    }

    fn set(&mut self, name: &str, value: Value) -> bool {
        match name {
            "id" => self.id = value.as_i64(),
            "name" => self.name = value.as_text().unwrap_or_default(),
            "slug" => self.slug = value.as_text(),
            "status" => self.status = value.as_i64().and_then(|v| i32::try_from(v).ok()),
            "owner_user_id" => self.owner_user_id = value.as_i64(),
            "parent_id" => self.parent_id = value.as_i64(),
            _ => return false,
        }
        true
    }
}

pub struct WorkspaceSynchronizer {
    local: DatabaseConnection,
    master: DatabaseConnection,
    workspace_map: ColumnMap,
    target_map: ColumnMap,
    events: Arc<dyn EventSink>,
    slug_retry_limit: u32,
}

impl fmt::Debug for WorkspaceSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkspaceSynchronizer")
            .field("workspace_map", &self.workspace_map)
            .field("target_map", &self.target_map)
            .field("slug_retry_limit", &self.slug_retry_limit)
            .finish_non_exhaustive()
    }
}

impl WorkspaceSynchronizer {
    /// Synchronizer with the default column maps and no event sink.
    #[must_use]
    pub fn new(local: DatabaseConnection, master: DatabaseConnection) -> Self {
        Self {
            local,
            master,
            workspace_map: ColumnMap::default_workspace_map(),
            target_map: ColumnMap::default_target_map(),
            events: Arc::new(NoopEventSink),
            slug_retry_limit: DEFAULT_SLUG_RETRY_LIMIT,
        }
    }

    #[must_use]
    pub fn with_workspace_map(mut self, map: ColumnMap) -> Self {
        self.workspace_map = map;
        self
    }

    #[must_use]
    pub fn with_target_map(mut self, map: ColumnMap) -> Self {
        self.target_map = map;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn with_slug_retry_limit(mut self, limit: u32) -> Self {
        self.slug_retry_limit = limit;
        self
    }

    #[must_use]
    pub fn local(&self) -> &DatabaseConnection {
        &self.local
    }

    #[must_use]
    pub fn master(&self) -> &DatabaseConnection {
        &self.master
    }

    /// Create or update `ws` in master and locally.
    ///
    /// On success `ws.id` equals the master id and `ws.slug` holds the final slug.
    /// A workspace already synchronized in `sync` is only saved locally.
    ///
    /// # Errors
    /// - `SyncConflict` when the same key is already in flight in `sync`, or no
    ///   free slug is found
    /// - `Configuration` when the column map is unusable
    /// - `Transaction` when a commit fails
    /// - `Db` for any other datastore failure; both transactions are rolled back
    pub async fn save(
        &self,
        ctx: &RequestContext,
        sync: &SyncContext,
        ws: &mut Workspace,
    ) -> Result<workspace::Model> {
        let key = ws.sync_key();
        match sync.claim(&key) {
            Claim::InFlight => {
                return Err(TenancyError::SyncConflict(format!(
                    "workspace '{key}' is already being synchronized"
                )));
            }
            Claim::Resolved(id) => {
                debug!(key = %key, id, "workspace already synchronized in this unit of work");
                return self.save_resolved(ws, id).await;
            }
            Claim::Claimed => {}
        }

        match self.save_claimed(ctx, ws).await {
            Ok((model, master)) => {
                sync.commit(&key, model.id);
                let payload = json!({ "type": "Workspace", "workspace": master });
                publish_best_effort(self.events.as_ref(), WORKSPACE_UPSERTED, &payload).await;
                Ok(model)
            }
            Err(err) => {
                sync.release(&key);
                Err(err)
            }
        }
    }

    /// Local-only save of a workspace already written to master in this unit of work.
    ///
    /// The slug always comes from master; fields the caller left empty keep their
    /// stored values.
    async fn save_resolved(&self, ws: &mut Workspace, id: i64) -> Result<workspace::Model> {
        let master_slug = master_workspace::Entity::find_by_id(id)
            .one(&self.master)
            .await?
            .map(|m| m.slug);

        let tx = self.local.begin().await?;
        let existing = match workspace::Entity::find_by_id(id).one(&tx).await {
            Ok(found) => found,
            Err(err) => {
                rollback_quietly(tx, "local").await;
                return Err(err.into());
            }
        };

        ws.id = Some(id);
        let stored_slug = existing.as_ref().and_then(|row| row.slug.clone());
        ws.slug = master_slug.or(stored_slug).or(ws.slug.take());
        if let Some(row) = &existing {
            ws.status = ws.status.or(Some(row.status));
            ws.owner_user_id = ws.owner_user_id.or(row.owner_user_id);
            ws.parent_id = ws.parent_id.or(row.parent_id);
        }

        let model = match persist_local(&tx, existing, ws).await {
            Ok(model) => model,
            Err(err) => {
                rollback_quietly(tx, "local").await;
                return Err(err);
            }
        };
        tx.commit()
            .await
            .map_err(|e| TenancyError::Transaction(format!("local commit failed: {e}")))?;
        ws.id = Some(model.id);
        Ok(model)
    }

    async fn save_claimed(
        &self,
        ctx: &RequestContext,
        ws: &mut Workspace,
    ) -> Result<(workspace::Model, master_workspace::Model)> {
        let local_tx = self.local.begin().await?;
        let master_tx = match self.master.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                rollback_quietly(local_tx, "local").await;
                return Err(err.into());
            }
        };

        let (model, master) = match self.reconcile(ctx, ws, &local_tx, &master_tx).await {
            Ok(done) => done,
            Err(err) => {
                rollback_quietly(master_tx, "master").await;
                rollback_quietly(local_tx, "local").await;
                return Err(err);
            }
        };

        if let Err(err) = master_tx.commit().await {
            rollback_quietly(local_tx, "local").await;
            return Err(TenancyError::Transaction(format!("master commit failed: {err}")));
        }
        if let Err(err) = local_tx.commit().await {
            error!(
                master_id = master.id,
                slug = %master.slug,
                error = %err,
                "local commit failed after master commit; master is ahead of local"
            );
            return Err(TenancyError::Transaction(format!("local commit failed: {err}")));
        }

        info!(id = master.id, slug = %master.slug, "workspace synchronized");
        Ok((model, master))
    }

    async fn reconcile(
        &self,
        ctx: &RequestContext,
        ws: &mut Workspace,
        local: &DatabaseTransaction,
        master: &DatabaseTransaction,
    ) -> Result<(workspace::Model, master_workspace::Model)> {
        let existing = match ws.id {
            Some(id) => workspace::Entity::find_by_id(id).one(local).await?,
            None => None,
        };
        let stored_slug = existing.as_ref().and_then(|m| m.slug.clone());

        let mut attrs = self.workspace_map.evaluate(ws, ctx);
        let base_slug = mapped_slug(&attrs)?;
        let owner = attr(&attrs, "owner_user_id")
            .and_then(Value::as_i64)
            .or(ws.owner_user_id)
            .or(ctx.current_user_id());

        let mut slug = base_slug.clone();
        if existing.is_none() {
            slug = self.unique_slug(local, master, &base_slug, owner).await?;
        }
        set_attr(&mut attrs, "slug", Value::Text(slug.clone()));
        ws.slug = Some(slug.clone());

        let matched = find_master(
            master,
            &slug,
            stored_slug.as_deref(),
            existing.as_ref().map(|m| m.id),
        )
        .await?;

        let master_model = if let Some(found) = matched {
            update_master(master, found, &attrs).await?
        } else {
            let mut attempt = 1;
            loop {
                if let Some(created) = insert_master(master, &attrs).await? {
                    break created;
                }
                if existing.is_some() || attempt >= INSERT_ATTEMPTS {
                    return Err(TenancyError::SyncConflict(format!(
                        "slug '{slug}' was claimed concurrently"
                    )));
                }
                warn!(slug = %slug, attempt, "slug claimed concurrently, choosing another");
                slug = self.unique_slug(local, master, &base_slug, owner).await?;
                set_attr(&mut attrs, "slug", Value::Text(slug.clone()));
                ws.slug = Some(slug.clone());
                attempt += 1;
            }
        };

        assign_master_id(local, ws, &master_model, &slug).await?;
        let model = persist_local(local, existing, ws).await?;
        ws.id = Some(model.id);
        Ok((model, master_model))
    }

    /// First free slug among `base`, `base-{owner}`, `base-1` … `base-{limit}`.
    async fn unique_slug(
        &self,
        local: &DatabaseTransaction,
        master: &DatabaseTransaction,
        base: &str,
        owner: Option<i64>,
    ) -> Result<String> {
        let candidates = std::iter::once(base.to_owned())
            .chain(owner.map(|o| format!("{base}-{o}")))
            .chain((1..=self.slug_retry_limit).map(|n| format!("{base}-{n}")));

        for candidate in candidates {
            if !slug_taken(local, master, &candidate).await? {
                return Ok(candidate);
            }
            debug!(slug = %candidate, "slug taken");
        }
        Err(TenancyError::SyncConflict(format!(
            "no free slug for '{base}' after {} attempts",
            self.slug_retry_limit
        )))
    }

    /// Create the local copy of a master workspace if it is missing.
    ///
    /// # Errors
    /// `NotFound` when master has no such workspace, `Configuration` when
    /// the target map names an unknown local column.
    pub async fn ensure_local(&self, workspace_id: i64) -> Result<workspace::Model> {
        if let Some(found) = workspace::Entity::find_by_id(workspace_id)
            .one(&self.local)
            .await?
        {
            return Ok(found);
        }

        let master = master_workspace::Entity::find_by_id(workspace_id)
            .one(&self.master)
            .await?
            .ok_or_else(|| TenancyError::NotFound(format!("master workspace {workspace_id}")))?;

        let mut source = match serde_json::to_value(&master) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(_) => serde_json::Map::new(),
            Err(err) => {
                return Err(TenancyError::Configuration(format!(
                    "cannot read master workspace {workspace_id}: {err}"
                )));
            }
        };

        let mut ws = Workspace::default();
        for (column, value) in self
            .target_map
            .evaluate(&mut source, &RequestContext::anonymous())
        {
            if !ws.set(&column, value) {
                return Err(TenancyError::Configuration(format!(
                    "target_column_map names unknown workspace column '{column}'"
                )));
            }
        }
        ws.id = Some(master.id);

        let model = persist_local(&self.local, None, &ws).await?;
        info!(id = model.id, slug = ?model.slug, "workspace pulled from master");
        Ok(model)
    }

    /// Handle an inbound `{ "type": "Workspace", "workspace": { "id": .. } }` message.
    ///
    /// Other message types are ignored and yield `Ok(None)`.
    ///
    /// # Errors
    /// `Configuration` for a workspace message without an id, otherwise as
    /// [`WorkspaceSynchronizer::ensure_local`].
    pub async fn apply_remote_event(
        &self,
        message: &serde_json::Value,
    ) -> Result<Option<workspace::Model>> {
        if message.get("type").and_then(serde_json::Value::as_str) != Some("Workspace") {
            debug!("ignoring non-workspace message");
            return Ok(None);
        }
        let id = message
            .pointer("/workspace/id")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| {
                TenancyError::Configuration("workspace message without workspace.id".to_owned())
            })?;
        self.ensure_local(id).await.map(Some)
    }
}

/// Copy the master id onto `ws` unless another local workspace already owns it.
async fn assign_master_id(
    local: &DatabaseTransaction,
    ws: &mut Workspace,
    master: &master_workspace::Model,
    slug: &str,
) -> Result<()> {
    if ws.id == Some(master.id) {
        return Ok(());
    }
    let holder = workspace::Entity::find_by_id(master.id).one(local).await?;
    match holder {
        Some(other) if other.slug.as_deref() != Some(slug) => {
            warn!(
                master_id = master.id,
                local_slug = ?other.slug,
                slug,
                "local id already used by a different workspace; keeping local id"
            );
        }
        _ => ws.id = Some(master.id),
    }
    Ok(())
}

async fn rollback_quietly(tx: DatabaseTransaction, side: &'static str) {
    if let Err(err) = tx.rollback().await {
        warn!(side, error = %err, "rollback failed");
    }
}

fn attr<'a>(attrs: &'a [(String, Value)], name: &str) -> Option<&'a Value> {
    attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v)
}

fn set_attr(attrs: &mut Vec<(String, Value)>, name: &str, value: Value) {
    match attrs.iter_mut().find(|(k, _)| k == name) {
        Some(slot) => slot.1 = value,
        None => attrs.push((name.to_owned(), value)),
    }
}

fn mapped_slug(attrs: &[(String, Value)]) -> Result<String> {
    attr(attrs, "slug")
        .and_then(Value::as_text)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            TenancyError::Configuration("workspace_column_map must produce a non-empty 'slug'".to_owned())
        })
}

async fn slug_taken(
    local: &DatabaseTransaction,
    master: &DatabaseTransaction,
    slug: &str,
) -> Result<bool> {
    let in_master = master_workspace::Entity::find()
        .filter(master_workspace::Column::Slug.eq(slug))
        .lock_exclusive()
        .one(master)
        .await?
        .is_some();
    if in_master {
        return Ok(true);
    }
    Ok(workspace::Entity::find()
        .filter(workspace::Column::Slug.eq(slug))
        .one(local)
        .await?
        .is_some())
}

/// Master record for this save: by slug, then by the stored slug, then by id.
async fn find_master(
    master: &DatabaseTransaction,
    slug: &str,
    stored_slug: Option<&str>,
    existing_id: Option<i64>,
) -> Result<Option<master_workspace::Model>> {
    let by_slug = |s: &str| {
        master_workspace::Entity::find()
            .filter(master_workspace::Column::Slug.eq(s))
            .lock_exclusive()
    };

    if let Some(found) = by_slug(slug).one(master).await? {
        return Ok(Some(found));
    }
    if let Some(stored) = stored_slug.filter(|s| *s != slug) {
        if let Some(found) = by_slug(stored).one(master).await? {
            return Ok(Some(found));
        }
    }
    if let Some(id) = existing_id {
        let found = master_workspace::Entity::find_by_id(id)
            .lock_exclusive()
            .one(master)
            .await?;
        if let Some(found) = found {
            if found.slug == slug {
                return Ok(Some(found));
            }
            warn!(
                id,
                master_slug = %found.slug,
                slug,
                "master record with this id has a different slug; not linking"
            );
        }
    }
    Ok(None)
}

async fn update_master(
    master: &DatabaseTransaction,
    found: master_workspace::Model,
    attrs: &[(String, Value)],
) -> Result<master_workspace::Model> {
    let id = found.id;
    let mut am = found.into_active_model();
    for (column, value) in attrs {
        set_master_column(&mut am, column, value)?;
    }
    am.updated_at = ActiveValue::Set(Utc::now());
    let updated = am.update(master).await?;
    info!(id, slug = %updated.slug, "master workspace updated");
    Ok(updated)
}

/// Insert inside a savepoint; `None` when the slug was taken meanwhile.
async fn insert_master(
    master: &DatabaseTransaction,
    attrs: &[(String, Value)],
) -> Result<Option<master_workspace::Model>> {
    let now = Utc::now();
    let mut am = master_workspace::ActiveModel {
        status: ActiveValue::Set(1),
        created_at: ActiveValue::Set(now),
        updated_at: ActiveValue::Set(now),
        ..Default::default()
    };
    for (column, value) in attrs {
        set_master_column(&mut am, column, value)?;
    }
    if am.name.is_not_set() {
        return Err(TenancyError::Configuration(
            "workspace_column_map must map 'name'".to_owned(),
        ));
    }

    let savepoint = master.begin().await?;
    match am.insert(&savepoint).await {
        Ok(created) => {
            savepoint.commit().await?;
            info!(id = created.id, slug = %created.slug, "master workspace created");
            Ok(Some(created))
        }
        Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
            rollback_quietly(savepoint, "master savepoint").await;
            Ok(None)
        }
        Err(err) => {
            rollback_quietly(savepoint, "master savepoint").await;
            Err(err.into())
        }
    }
}

fn set_master_column(
    am: &mut master_workspace::ActiveModel,
    column: &str,
    value: &Value,
) -> Result<()> {
    match column {
        "name" => am.name = ActiveValue::Set(value.as_text().unwrap_or_default()),
        "slug" => am.slug = ActiveValue::Set(value.as_text().unwrap_or_default()),
        "status" => am.status = ActiveValue::Set(to_i32(column, value)?.unwrap_or(1)),
        "owner_user_id" => am.owner_user_id = ActiveValue::Set(value.as_i64()),
        // identity and timestamps belong to the synchronizer
        "id" | "created_at" | "updated_at" => {}
        other => {
            return Err(TenancyError::Configuration(format!(
                "workspace_column_map names unknown master column '{other}'"
            )));
        }
    }
    Ok(())
}

fn to_i32(column: &str, value: &Value) -> Result<Option<i32>> {
    value
        .as_i64()
        .map(|v| {
            i32::try_from(v).map_err(|_| {
                TenancyError::Configuration(format!("'{column}' value {v} is out of range"))
            })
        })
        .transpose()
}

/// Insert or update the local row for `ws`, re-keying it when its id changed.
async fn persist_local<C: ConnectionTrait>(
    conn: &C,
    existing: Option<workspace::Model>,
    ws: &Workspace,
) -> Result<workspace::Model> {
    let now = Utc::now();
    let existing = match (existing, ws.id) {
        (Some(row), _) => Some(row),
        (None, Some(id)) => workspace::Entity::find_by_id(id).one(conn).await?,
        (None, None) => None,
    };

    let Some(row) = existing else {
        let am = workspace::ActiveModel {
            id: ws.id.map_or(ActiveValue::NotSet, ActiveValue::Set),
            name: ActiveValue::Set(ws.name.clone()),
            slug: ActiveValue::Set(ws.slug.clone()),
            status: ActiveValue::Set(ws.status.unwrap_or(1)),
            owner_user_id: ActiveValue::Set(ws.owner_user_id),
            parent_id: ActiveValue::Set(ws.parent_id),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };
        return Ok(am.insert(conn).await?);
    };

    let id = ws.id.unwrap_or(row.id);
    if id != row.id {
        workspace::Entity::update_many()
            .col_expr(workspace::Column::Id, Expr::value(id))
            .filter(workspace::Column::Id.eq(row.id))
            .exec(conn)
            .await?;
        debug!(from = row.id, to = id, "local workspace re-keyed to master id");
    }

    let am = workspace::ActiveModel {
        id: ActiveValue::Unchanged(id),
        name: ActiveValue::Set(ws.name.clone()),
        slug: ActiveValue::Set(ws.slug.clone()),
        status: ActiveValue::Set(ws.status.unwrap_or(row.status)),
        owner_user_id: ActiveValue::Set(ws.owner_user_id),
        parent_id: ActiveValue::Set(ws.parent_id),
        created_at: ActiveValue::Unchanged(row.created_at),
        updated_at: ActiveValue::Set(now),
    };
    Ok(am.update(conn).await?)
}
