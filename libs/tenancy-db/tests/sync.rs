#![allow(clippy::unwrap_used, clippy::expect_used)]
#![cfg(feature = "sqlite")]

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{ctx, exec, local_db, master_db};
use httpmock::prelude::*;
use sea_orm::{ActiveModelTrait, ActiveValue, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::{Value, json};
use tenancy_db::entity::{master_workspace, workspace};
use tenancy_db::sync::{ColumnMap, ColumnMapping, SyncState};
use tenancy_db::{
    EventSink, HttpEventSink, NotificationDeliveryError, SyncContext, TenancyError,
    WORKSPACE_UPSERTED, Workspace, WorkspaceSynchronizer,
};
use tracing_test::traced_test;

/// Keeps every published event in memory.
#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: &str, payload: &Value) -> Result<(), NotificationDeliveryError> {
        self.events
            .lock()
            .unwrap()
            .push((event.to_owned(), payload.clone()));
        Ok(())
    }
}

async fn synchronizer() -> WorkspaceSynchronizer {
    WorkspaceSynchronizer::new(local_db().await, master_db().await)
}

async fn master_slugs(sync: &WorkspaceSynchronizer) -> Vec<String> {
    let mut slugs: Vec<String> = master_workspace::Entity::find()
        .all(sync.master())
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.slug)
        .collect();
    slugs.sort();
    slugs
}

async fn seed_master(sync: &WorkspaceSynchronizer, id: i64, name: &str, slug: &str) {
    let now = Utc::now();
    master_workspace::ActiveModel {
        id: ActiveValue::Set(id),
        name: ActiveValue::Set(name.to_owned()),
        slug: ActiveValue::Set(slug.to_owned()),
        status: ActiveValue::Set(1),
        owner_user_id: ActiveValue::Set(None),
        created_at: ActiveValue::Set(now),
        updated_at: ActiveValue::Set(now),
    }
    .insert(sync.master())
    .await
    .unwrap();
}

#[tokio::test]
async fn new_workspace_gets_master_id() {
    let sync = synchronizer().await;
    let mut ws = Workspace::new("Acme");

    let saved = sync
        .save(&ctx(5, None), &SyncContext::new(), &mut ws)
        .await
        .unwrap();

    let master = master_workspace::Entity::find()
        .filter(master_workspace::Column::Slug.eq("acme"))
        .one(sync.master())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(master_slugs(&sync).await, ["acme"]);
    assert_eq!(saved.id, master.id);
    assert_eq!(ws.id, Some(master.id));
    assert_eq!(saved.slug.as_deref(), Some("acme"));
    assert_eq!(saved.status, 1);
    assert_eq!(master.owner_user_id, Some(5));
}

#[tokio::test]
async fn rename_updates_the_matched_master_row() {
    let sync = synchronizer().await;
    let mut ws = Workspace::new("Acme");
    sync.save(&ctx(5, None), &SyncContext::new(), &mut ws)
        .await
        .unwrap();

    ws.name = "Acme Corp".to_owned();
    let saved = sync
        .save(&ctx(5, None), &SyncContext::new(), &mut ws)
        .await
        .unwrap();

    assert_eq!(master_slugs(&sync).await, ["acme-corp"]);
    assert_eq!(saved.slug.as_deref(), Some("acme-corp"));
    assert_eq!(workspace::Entity::find().count(sync.local()).await.unwrap(), 1);
}

#[tokio::test]
async fn repeat_save_in_one_unit_of_work_reuses_id() {
    let sync = synchronizer().await;
    let unit = SyncContext::new();

    let mut first = Workspace::new("Acme").with_slug("acme");
    let saved = sync.save(&ctx(5, None), &unit, &mut first).await.unwrap();
    assert_eq!(unit.state("acme"), Some(SyncState::Committed(saved.id)));

    let mut again = Workspace::new("Acme").with_slug("acme");
    let resaved = sync.save(&ctx(5, None), &unit, &mut again).await.unwrap();
    assert_eq!(resaved.id, saved.id);
    assert_eq!(master_slugs(&sync).await, ["acme"]);
}

#[tokio::test]
async fn colliding_slugs_are_suffixed() {
    let sync = synchronizer().await;

    let mut first = Workspace::new("Acme");
    sync.save(&ctx(41, None), &SyncContext::new(), &mut first)
        .await
        .unwrap();
    let mut second = Workspace::new("Acme");
    sync.save(&ctx(42, None), &SyncContext::new(), &mut second)
        .await
        .unwrap();
    let mut third = Workspace::new("Acme");
    sync.save(&ctx(42, None), &SyncContext::new(), &mut third)
        .await
        .unwrap();

    assert_eq!(master_slugs(&sync).await, ["acme", "acme-1", "acme-42"]);
    assert_eq!(third.slug.as_deref(), Some("acme-1"));
}

#[tokio::test]
async fn concurrent_saves_produce_one_acme() {
    let sync = synchronizer().await;
    let (ctx_a, ctx_b) = (ctx(41, None), ctx(42, None));
    let (unit_a, unit_b) = (SyncContext::new(), SyncContext::new());
    let mut a = Workspace::new("Acme");
    let mut b = Workspace::new("Acme");

    let (ra, rb) = tokio::join!(
        sync.save(&ctx_a, &unit_a, &mut a),
        sync.save(&ctx_b, &unit_b, &mut b),
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert_ne!(ra.id, rb.id);

    let slugs = master_slugs(&sync).await;
    assert_eq!(slugs.len(), 2);
    assert_eq!(slugs.iter().filter(|s| *s == "acme").count(), 1);
    assert!(slugs.iter().any(|s| s == "acme-41" || s == "acme-42"));
}

#[tokio::test]
async fn local_row_is_rekeyed_to_master_id() {
    let sync = synchronizer().await;
    seed_master(&sync, 20, "Other", "other").await;
    exec(
        sync.local(),
        "INSERT INTO workspaces (id, name, slug, status, created_at, updated_at)
         VALUES (3, 'Gamma', NULL, 1, '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
    )
    .await;

    let mut ws = Workspace::new("Gamma");
    ws.id = Some(3);
    let saved = sync
        .save(&ctx(5, None), &SyncContext::new(), &mut ws)
        .await
        .unwrap();

    assert_eq!(saved.id, 21);
    assert_eq!(ws.id, Some(21));
    assert!(workspace::Entity::find_by_id(3).one(sync.local()).await.unwrap().is_none());
    assert_eq!(master_slugs(&sync).await, ["gamma", "other"]);
}

#[tokio::test]
async fn custom_map_with_unknown_master_column_fails_and_rolls_back() {
    let sync = synchronizer().await.with_workspace_map(
        ColumnMap::default_workspace_map().with("color", ColumnMapping::Copy("name".to_owned())),
    );
    let unit = SyncContext::new();
    let mut ws = Workspace::new("Acme");

    let err = sync.save(&ctx(5, None), &unit, &mut ws).await.unwrap_err();
    assert!(matches!(err, TenancyError::Configuration(m) if m.contains("color")));
    assert!(master_slugs(&sync).await.is_empty());
    assert_eq!(workspace::Entity::find().count(sync.local()).await.unwrap(), 0);
    assert_eq!(unit.state("Acme"), None);
}

#[tokio::test]
async fn missing_local_copy_is_pulled_from_master() {
    let sync = synchronizer().await;
    seed_master(&sync, 50, "Beta", "beta").await;

    let pulled = sync.ensure_local(50).await.unwrap();
    assert_eq!(pulled.id, 50);
    assert_eq!(pulled.name, "Beta");
    assert_eq!(pulled.slug.as_deref(), Some("beta"));

    // second call finds the local row
    assert_eq!(sync.ensure_local(50).await.unwrap(), pulled);

    let err = sync.ensure_local(999).await.unwrap_err();
    assert!(matches!(err, TenancyError::NotFound(_)));
}

#[tokio::test]
async fn remote_workspace_events_pull_from_master() {
    let sync = synchronizer().await;
    seed_master(&sync, 60, "Delta", "delta").await;

    let applied = sync
        .apply_remote_event(&json!({ "type": "Workspace", "workspace": { "id": 60 } }))
        .await
        .unwrap();
    assert_eq!(applied.map(|w| w.id), Some(60));

    let ignored = sync
        .apply_remote_event(&json!({ "type": "Invoice", "invoice": { "id": 1 } }))
        .await
        .unwrap();
    assert!(ignored.is_none());

    let err = sync
        .apply_remote_event(&json!({ "type": "Workspace", "workspace": {} }))
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::Configuration(_)));
}

#[tokio::test]
async fn resave_without_slug_keeps_master_slug() {
    let sync = synchronizer().await;
    let unit = SyncContext::new();

    let mut first = Workspace::new("Acme").with_owner(5);
    let saved = sync.save(&ctx(5, None), &unit, &mut first).await.unwrap();
    assert_eq!(saved.slug.as_deref(), Some("acme"));

    // no slug, so the unit of work matches it by name
    let mut again = Workspace::new("Acme");
    let resaved = sync.save(&ctx(5, None), &unit, &mut again).await.unwrap();

    let local = workspace::Entity::find_by_id(saved.id)
        .one(sync.local())
        .await
        .unwrap()
        .unwrap();
    let master = master_workspace::Entity::find_by_id(saved.id)
        .one(sync.master())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resaved.id, saved.id);
    assert_eq!(resaved.slug.as_deref(), Some("acme"));
    assert_eq!(again.slug.as_deref(), Some("acme"));
    assert_eq!(local.slug.as_deref(), Some(master.slug.as_str()));
    assert_eq!(local.owner_user_id, Some(5));
    assert_eq!(master_slugs(&sync).await, ["acme"]);
}

#[tokio::test]
async fn in_flight_key_in_the_same_unit_is_a_conflict() {
    let sync = synchronizer().await;
    let unit = SyncContext::new();
    let mut a = Workspace::new("Acme");
    let mut b = Workspace::new("Acme");

    let (ctx_a, ctx_b) = (ctx(5, None), ctx(5, None));
    let (ra, rb) = tokio::join!(
        sync.save(&ctx_a, &unit, &mut a),
        sync.save(&ctx_b, &unit, &mut b),
    );

    let saved = ra.unwrap();
    assert!(matches!(rb, Err(TenancyError::SyncConflict(m)) if m.contains("Acme")));
    assert_eq!(unit.state("Acme"), Some(SyncState::Committed(saved.id)));
    assert_eq!(master_slugs(&sync).await, ["acme"]);
}

#[tokio::test]
async fn save_publishes_one_upserted_event() {
    let events = Arc::new(RecordingSink::default());
    let sync = synchronizer().await.with_events(events.clone());
    let mut ws = Workspace::new("Acme");

    let saved = sync
        .save(&ctx(5, None), &SyncContext::new(), &mut ws)
        .await
        .unwrap();

    let published = events.events.lock().unwrap().clone();
    assert_eq!(published.len(), 1);
    let (event, payload) = &published[0];
    assert_eq!(event, WORKSPACE_UPSERTED);
    assert_eq!(payload["type"], json!("Workspace"));
    assert_eq!(payload["workspace"]["id"], json!(saved.id));
    assert_eq!(payload["workspace"]["slug"], json!("acme"));
    assert_eq!(payload["workspace"]["owner_user_id"], json!(5));
}

#[tokio::test]
async fn save_posts_event_to_http_sink() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/events")
                .header("X-Api-Key", "secret");
            then.status(202);
        })
        .await;
    let sink = HttpEventSink::new(
        server.url("/events"),
        Some("secret".to_owned()),
        Duration::from_secs(2),
    )
    .unwrap();
    let sync = synchronizer().await.with_events(Arc::new(sink));

    let mut ws = Workspace::new("Acme");
    sync.save(&ctx(5, None), &SyncContext::new(), &mut ws)
        .await
        .unwrap();

    mock.assert_async().await;
}

#[tokio::test]
#[traced_test]
async fn failing_event_sink_does_not_fail_the_save() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/events");
            then.status(503);
        })
        .await;
    let sink = HttpEventSink::new(server.url("/events"), None, Duration::from_secs(2)).unwrap();
    let sync = synchronizer().await.with_events(Arc::new(sink));

    let mut ws = Workspace::new("Acme");
    let saved = sync
        .save(&ctx(5, None), &SyncContext::new(), &mut ws)
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(ws.id, Some(saved.id));
    assert_eq!(master_slugs(&sync).await, ["acme"]);
    assert!(logs_contain("event delivery failed"));
}
