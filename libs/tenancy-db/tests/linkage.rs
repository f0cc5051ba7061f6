#![allow(clippy::unwrap_used, clippy::expect_used)]
#![cfg(feature = "sqlite")]

mod common;

use std::sync::Arc;

use common::{exec, local_db, posts};
use sea_orm::{EntityTrait, PaginatorTrait};
use tenancy_db::entity::{user_model, workspace_user};
use tenancy_db::{
    FilteredModule, Membership, ModelLinker, SchemaRegistry, SeaOrmCatalog,
    ensure_workspace_column,
};
use tenancy_security::ExemptionPolicy;

#[tokio::test]
async fn invite_is_idempotent() {
    let db = local_db().await;

    let first = Membership::invite(&db, 7, 5).await.unwrap();
    let again = Membership::invite(&db, 7, 5).await.unwrap();
    Membership::invite(&db, 7, 3).await.unwrap();

    assert_eq!(first.id, again.id);
    assert_eq!(workspace_user::Entity::find().count(&db).await.unwrap(), 2);
    assert_eq!(Membership::members(&db, 7).await.unwrap(), [3, 5]);

    assert_eq!(Membership::remove(&db, 7, 5).await.unwrap(), 1);
    assert_eq!(Membership::remove(&db, 7, 5).await.unwrap(), 0);
    assert_eq!(Membership::members(&db, 7).await.unwrap(), [3]);
}

#[tokio::test]
async fn grants_replace_previous_set() {
    let db = local_db().await;
    let linker = ModelLinker::new(ExemptionPolicy::none());

    linker.grant_user(&db, &posts(), 1, &[4, 5, 5]).await.unwrap();
    assert_eq!(user_model::Entity::find().count(&db).await.unwrap(), 2);

    linker.grant_user(&db, &posts(), 1, &[6]).await.unwrap();
    let grants = user_model::Entity::find().all(&db).await.unwrap();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].user_id, 6);
    assert_eq!(grants[0].model_type, "post");

    assert_eq!(linker.revoke_user(&db, &posts(), 1, 6).await.unwrap(), 1);
    assert_eq!(user_model::Entity::find().count(&db).await.unwrap(), 0);
}

#[tokio::test]
async fn link_refresh_keeps_a_single_row() {
    let db = local_db().await;
    let linker = ModelLinker::new(ExemptionPolicy::none());

    for ws in [7, 8, 9] {
        linker.after_save(&db, &posts(), Some(1), Some(ws)).await.unwrap();
    }
    let links = linker.workspace_links(&db, &posts(), 1).await.unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].workspace_id, 9);

    linker.after_save(&db, &posts(), Some(1), None).await.unwrap();
    assert!(linker.workspace_links(&db, &posts(), 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn workspace_column_is_added_where_missing() {
    let db = local_db().await;
    exec(&db, "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)").await;
    exec(&db, common::POSTS_DDL).await;

    let registry = SchemaRegistry::new(
        [
            FilteredModule::new("notes", "note"),
            posts(),
            FilteredModule::new("missing", "ghost"),
        ],
        Arc::new(SeaOrmCatalog::new(db.clone())),
    );

    let altered = ensure_workspace_column(&db, &registry).await.unwrap();
    assert_eq!(altered, ["notes"]);
    assert!(
        registry
            .columns("notes")
            .await
            .unwrap()
            .iter()
            .any(|c| c == "workspace_id")
    );

    assert!(ensure_workspace_column(&db, &registry).await.unwrap().is_empty());
}
