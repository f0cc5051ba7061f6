//! Row visibility for filtered tables.
//!
//! A row is visible when it belongs to the active workspace, is public
//! (`workspace_id IS NULL`), is linked to the active workspace through
//! `workspace_models`, belongs to a workspace the current user is a member
//! of, or is granted to the current user through `user_models`.
//!
//! The three link tables are left-joined and the visibility terms are added
//! as a single OR group AND-ed to whatever the caller already filtered on.

use sea_orm::EntityName;
use tenancy_security::RequestContext;

use crate::entity::{user_model, workspace_model, workspace_user};
use crate::query::{Boolean, Clause, Join, JoinCondition, Predicate, Query, TableRef};
use crate::registry::FilteredModule;

/// Marker recorded on a query once the scope has been applied.
pub const SCOPE_MARKER: &str = "workspace_visibility";

pub const WORKSPACE_USERS_ALIAS: &str = "scope_wu";
pub const WORKSPACE_MODELS_ALIAS: &str = "scope_wm";
pub const USER_MODELS_ALIAS: &str = "scope_um";

/// Applies the visibility predicate to queries on a filtered table.
#[derive(Debug, Clone, Copy, Default)]
pub struct TenantScope;

impl TenantScope {
    /// Add visibility joins and predicates to `query`.
    ///
    /// Applying the scope twice leaves the query unchanged the second time.
    pub fn apply(query: &mut Query, module: &FilteredModule, ctx: &RequestContext) {
        if query.has_marker(SCOPE_MARKER) || query.has_join(WORKSPACE_USERS_ALIAS) {
            return;
        }
        query.mark(SCOPE_MARKER);

        let base = query.base_reference().to_owned();
        if query.columns.is_empty() {
            query.columns.push(format!("{base}.*"));
        }

        let active = ctx.active_workspace_id();
        let user = ctx.current_user_id();
        let pk = format!("{base}.{}", module.primary_key);

        query.joins.push(Join::left(
            TableRef::aliased(workspace_user::Entity.table_name(), WORKSPACE_USERS_ALIAS),
            vec![
                JoinCondition::columns(
                    format!("{WORKSPACE_USERS_ALIAS}.workspace_id"),
                    format!("{base}.workspace_id"),
                ),
                user_condition(WORKSPACE_USERS_ALIAS, user),
            ],
        ));
        query.joins.push(Join::left(
            TableRef::aliased(workspace_model::Entity.table_name(), WORKSPACE_MODELS_ALIAS),
            vec![
                JoinCondition::columns(format!("{WORKSPACE_MODELS_ALIAS}.model_id"), pk.clone()),
                JoinCondition::value(
                    format!("{WORKSPACE_MODELS_ALIAS}.model_type"),
                    module.entity_type.as_str(),
                ),
            ],
        ));
        query.joins.push(Join::left(
            TableRef::aliased(user_model::Entity.table_name(), USER_MODELS_ALIAS),
            vec![
                JoinCondition::columns(format!("{USER_MODELS_ALIAS}.model_id"), pk),
                JoinCondition::value(
                    format!("{USER_MODELS_ALIAS}.model_type"),
                    module.entity_type.as_str(),
                ),
                user_condition(USER_MODELS_ALIAS, user),
            ],
        ));

        let mut terms = Vec::with_capacity(5);
        if let Some(ws) = active {
            terms.push(Predicate::eq(format!("{base}.workspace_id"), ws));
        }
        terms.push(Predicate::is_null(format!("{base}.workspace_id")));
        if let Some(ws) = active {
            terms.push(Predicate::eq(format!("{WORKSPACE_MODELS_ALIAS}.workspace_id"), ws));
        }
        if let Some(user) = user {
            terms.push(Predicate::eq(format!("{WORKSPACE_USERS_ALIAS}.user_id"), user));
            terms.push(Predicate::eq(format!("{USER_MODELS_ALIAS}.user_id"), user));
        }

        // isolate caller OR chains from the visibility group
        if query.wheres.iter().any(|c| c.boolean == Boolean::Or) {
            let existing = std::mem::take(&mut query.wheres);
            query.wheres.push(Clause::and(Predicate::Group(existing)));
        }
        query.wheres.push(Clause::and(Predicate::any(terms)));
    }
}

/// Restrict a link join to the current user; anonymous requests match nothing.
fn user_condition(alias: &str, user: Option<i64>) -> JoinCondition {
    match user {
        Some(user) => JoinCondition::value(format!("{alias}.user_id"), user),
        None => JoinCondition::Raw("1 = 0".to_owned()),
    }
}
