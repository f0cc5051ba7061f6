#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Workspace tenancy for relational databases.
//!
//! Rows of registered tables ([`FilteredModule`]) carry a nullable
//! `workspace_id`. Reads through [`TenantConn`] only return rows visible to the
//! request (active workspace, public rows, workspace links, memberships and
//! per-user grants) and have ambiguous columns qualified after the visibility
//! joins are added. Writes are attributed to a workspace and keep the
//! `workspace_models` link table current.
//!
//! Workspaces themselves are mirrored from a master datastore shared by
//! several applications; [`WorkspaceSynchronizer`] keeps the local id equal to
//! the master id and resolves conflicts by slug.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use tenancy_db::{
//!     FilteredModule, Predicate, Query, SchemaRegistry, SeaOrmCatalog, TenantConn,
//!     options::{DbConnConfig, connect},
//! };
//! use tenancy_security::{ExemptionPolicy, RequestContext};
//!
//! # async fn run() -> tenancy_db::Result<()> {
//! let conn = connect(&DbConnConfig::new("sqlite://app.db")).await?;
//! tenancy_db::entity::install_local(&conn).await?;
//!
//! let registry = Arc::new(SchemaRegistry::new(
//!     [FilteredModule::new("posts", "post")],
//!     Arc::new(SeaOrmCatalog::new(conn.clone())),
//! ));
//! let db = TenantConn::new(conn, registry, ExemptionPolicy::none());
//!
//! let ctx = RequestContext::builder().user_id(5).active_workspace_id(7).build();
//! let rows = db
//!     .fetch_all(&ctx, Query::table("posts").filter(Predicate::eq("status", 1)))
//!     .await?;
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod conn;
pub mod entity;
pub mod error;
pub mod events;
pub mod linkage;
pub mod migrations;
pub mod options;
pub mod query;
pub mod registry;
pub mod rewrite;
pub mod scope;
pub mod sync;

pub use catalog::{SchemaCatalog, SeaOrmCatalog, StaticCatalog};
pub use config::{ConfigError, EventsConfig, TenancyConfig};
pub use conn::TenantConn;
pub use error::{NotificationDeliveryError, Result, SchemaLookupError, TenancyError};
pub use events::{EventSink, HttpEventSink, NoopEventSink, WORKSPACE_UPSERTED, sink_from_config};
pub use linkage::{Membership, ModelLinker, ensure_workspace_column};
pub use query::{Join, JoinCondition, Op, Order, Predicate, Query, TableRef, Value};
pub use registry::{FilteredModule, SchemaRegistry};
pub use rewrite::QueryRewriter;
pub use scope::TenantScope;
pub use sync::{SyncContext, Workspace, WorkspaceSynchronizer};
