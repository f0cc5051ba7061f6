//! Column disambiguation for joined queries on filtered tables.
//!
//! Once visibility joins are added, bare references such as `id` or `status`
//! may resolve to more than one table. The rewriter finds the columns that are
//! really shared between the base table and the joined tables, qualifies
//! those references with the base table, fixes qualifications that name a
//! table lacking the column, and makes wildcard selects collision-free.
//!
//! Rewriting is best effort. Schema lookup failures degrade to a conservative
//! column list; any other failure leaves the query exactly as it was.

mod raw;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

pub use raw::{RawScanError, qualify_raw};

use crate::query::{Predicate, Query, SelectItem, TableRef, is_identifier, split_qualified};
use crate::registry::SchemaRegistry;
use crate::scope::{USER_MODELS_ALIAS, WORKSPACE_MODELS_ALIAS, WORKSPACE_USERS_ALIAS};

const VISIBILITY_ALIASES: [&str; 3] = [WORKSPACE_USERS_ALIAS, WORKSPACE_MODELS_ALIAS, USER_MODELS_ALIAS];

/// Columns treated as ambiguous when the schema cannot be read.
pub const FALLBACK_AMBIGUOUS_COLUMNS: &[&str] = &[
    "id",
    "created_at",
    "updated_at",
    "deleted_at",
    "status",
    "workspace_id",
    "user_id",
    "model_id",
    "workspace",
];

/// Separator between a joined table reference and its column in expanded aliases.
pub const EXPANDED_ALIAS_SEPARATOR: &str = "__";

#[derive(Debug, Clone)]
pub struct QueryRewriter {
    registry: Arc<SchemaRegistry>,
}

impl QueryRewriter {
    #[must_use]
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    /// Qualify ambiguous columns of `query`.
    ///
    /// Queries on unregistered tables, and queries without joins, are returned
    /// unchanged.
    pub async fn rewrite(&self, query: Query) -> Query {
        if !self.registry.is_filtered(&query.from.name) || query.joins.is_empty() {
            return query;
        }

        let plan = self.plan(&query).await;
        match plan.apply(&query) {
            Ok(rewritten) => rewritten,
            Err(err) => {
                warn!(table = %query.from.name, error = %err, "column qualification skipped");
                query
            }
        }
    }

    async fn plan(&self, query: &Query) -> Plan {
        let mut tables = Vec::with_capacity(query.joins.len() + 1);
        for table in std::iter::once(&query.from).chain(query.joins.iter().map(|j| &j.table)) {
            let columns = match self.registry.columns(&table.name).await {
                Ok(columns) => Some(columns),
                Err(err) => {
                    warn!(table = %table.name, error = %err, "schema lookup failed");
                    None
                }
            };
            tables.push(PlanTable {
                table: table.clone(),
                columns,
            });
        }

        let complete = tables.iter().all(|t| t.columns.is_some());
        let ambiguous = if complete {
            shared_columns(&tables)
        } else {
            let pk = self.registry.primary_key(&query.from.name);
            FALLBACK_AMBIGUOUS_COLUMNS
                .iter()
                .copied()
                .chain(std::iter::once(pk))
                .map(str::to_owned)
                .collect()
        };

        Plan {
            base_ref: query.base_reference().to_owned(),
            ambiguous,
            join_claimed: join_claimed_columns(query),
            tables,
            complete,
        }
    }
}

struct PlanTable {
    table: TableRef,
    columns: Option<Arc<Vec<String>>>,
}

impl PlanTable {
    fn has(&self, column: &str) -> bool {
        self.columns
            .as_ref()
            .is_some_and(|cols| cols.iter().any(|c| c == column))
    }
}

/// Columns of the base table that also exist in at least one joined table.
fn shared_columns(tables: &[PlanTable]) -> HashSet<String> {
    let Some((base, joined)) = tables.split_first() else {
        return HashSet::new();
    };
    base.columns
        .iter()
        .flat_map(|cols| cols.iter())
        .filter(|c| joined.iter().any(|t| t.has(c)))
        .cloned()
        .collect()
}

/// Column names referenced as `joined.col` in a caller join condition.
/// Visibility joins are ignored.
fn join_claimed_columns(query: &Query) -> HashSet<String> {
    let base = &query.from;
    query
        .joins
        .iter()
        .filter(|j| !VISIBILITY_ALIASES.contains(&j.table.reference()))
        .flat_map(|j| j.conditions.iter())
        .flat_map(|c| c.column_refs())
        .filter_map(|r| match split_qualified(r) {
            (Some(q), name) if !base.answers_to(q) && query.table_for(q).is_some() => {
                Some(name.to_owned())
            }
            _ => None,
        })
        .collect()
}

struct Plan {
    base_ref: String,
    ambiguous: HashSet<String>,
    join_claimed: HashSet<String>,
    tables: Vec<PlanTable>,
    /// Every participating table's columns are known.
    complete: bool,
}

impl Plan {
    fn apply(&self, query: &Query) -> Result<Query, RawScanError> {
        let mut out = query.clone();
        for clause in &mut out.wheres {
            self.qualify_predicate(&mut clause.predicate)?;
        }
        for (column, _) in &mut out.orders {
            self.qualify_column(column);
        }
        out.columns = self.rewrite_select(query);
        debug!(table = %query.from.name, ambiguous = self.ambiguous.len(), "qualified joined query");
        Ok(out)
    }

    fn qualify_predicate(&self, predicate: &mut Predicate) -> Result<(), RawScanError> {
        match predicate {
            Predicate::Group(clauses) => {
                for clause in clauses {
                    self.qualify_predicate(&mut clause.predicate)?;
                }
            }
            Predicate::Raw { sql, .. } => {
                *sql = qualify_raw(sql, &self.base_ref, &self.ambiguous)?;
            }
            other => {
                if let Some(column) = other.column_mut() {
                    self.qualify_column(column);
                }
            }
        }
        Ok(())
    }

    fn qualify_column(&self, column: &mut String) {
        let replacement = match split_qualified(column) {
            (None, name) if is_identifier(name) && self.ambiguous.contains(name) => {
                Some(format!("{}.{name}", self.base_ref))
            }
            (Some(q), name) => self.correct(q, name),
            _ => None,
        };
        if let Some(replacement) = replacement {
            *column = replacement;
        }
    }

    /// Re-qualify `q.name` when table `q` does not have `name`.
    fn correct(&self, qualifier: &str, name: &str) -> Option<String> {
        if !self.complete || !is_identifier(name) {
            return None;
        }
        let named = self.tables.iter().find(|t| t.table.answers_to(qualifier))?;
        if named.has(name) {
            return None;
        }
        let owner = self.tables.iter().find(|t| t.has(name))?;
        debug!(
            column = name,
            from = qualifier,
            to = owner.table.reference(),
            "corrected column qualifier"
        );
        Some(format!("{}.{name}", owner.table.reference()))
    }

    fn base_wildcard(&self) -> String {
        format!("{}.*", self.base_ref)
    }

    fn rewrite_select(&self, query: &Query) -> Vec<String> {
        if query.columns.is_empty() {
            return vec![self.base_wildcard()];
        }

        let mut out = Vec::with_capacity(query.columns.len());
        for raw in &query.columns {
            match SelectItem::parse(raw) {
                SelectItem::Wildcard => out.push(self.base_wildcard()),
                SelectItem::QualifiedWildcard(q) if query.from.answers_to(q) => {
                    out.push(self.base_wildcard());
                }
                SelectItem::QualifiedWildcard(q) => self.expand_joined(q, raw, &mut out),
                SelectItem::Column {
                    qualifier: None,
                    name,
                    alias,
                } if self.ambiguous.contains(name) && !self.join_claimed.contains(name) => {
                    out.push(with_alias(format!("{}.{name}", self.base_ref), alias));
                }
                SelectItem::Column {
                    qualifier: Some(q),
                    name,
                    alias,
                } => match self.correct(q, name) {
                    Some(fixed) => out.push(with_alias(fixed, alias)),
                    None => out.push(raw.clone()),
                },
                SelectItem::Column { .. } | SelectItem::Expression => out.push(raw.clone()),
            }
        }
        if out.is_empty() {
            out.push(self.base_wildcard());
        }
        out
    }

    /// `j.*` becomes `j.col AS j__col` for every column of the joined table.
    /// Without column metadata the wildcard is dropped.
    fn expand_joined(&self, qualifier: &str, raw: &str, out: &mut Vec<String>) {
        let target = self
            .tables
            .iter()
            .skip(1)
            .find(|t| t.table.answers_to(qualifier));
        match target.and_then(|t| t.columns.as_ref().map(|c| (t.table.reference(), c))) {
            Some((reference, columns)) => {
                out.extend(columns.iter().map(|c| {
                    format!("{reference}.{c} AS {reference}{EXPANDED_ALIAS_SEPARATOR}{c}")
                }));
            }
            None => {
                warn!(wildcard = raw, "dropping joined wildcard without column metadata");
            }
        }
    }
}

fn with_alias(expr: String, alias: Option<&str>) -> String {
    match alias {
        Some(alias) => format!("{expr} AS {alias}"),
        None => expr,
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::query::{Join, JoinCondition, Value};
    use crate::registry::FilteredModule;

    fn rewriter(catalog: StaticCatalog) -> QueryRewriter {
        let registry = SchemaRegistry::new([FilteredModule::new("posts", "post")], Arc::new(catalog));
        QueryRewriter::new(Arc::new(registry))
    }

    fn catalog() -> StaticCatalog {
        StaticCatalog::new()
            .with_table("posts", ["id", "title", "status", "workspace_id", "author_id"])
            .with_table("authors", ["id", "name", "status"])
    }

    fn joined() -> Query {
        Query::table("posts").join(Join::left(
            TableRef::new("authors"),
            vec![JoinCondition::columns("authors.id", "posts.author_id")],
        ))
    }

    #[tokio::test]
    async fn test_unfiltered_or_unjoined_queries_pass_through() {
        let rw = rewriter(catalog());
        let plain = Query::table("posts").filter(Predicate::eq("id", 1));
        assert_eq!(rw.rewrite(plain.clone()).await, plain);

        let other = Query::table("authors")
            .join(Join::left(TableRef::new("posts"), vec![]))
            .filter(Predicate::eq("id", 1));
        assert_eq!(rw.rewrite(other.clone()).await, other);
    }

    #[tokio::test]
    async fn test_only_shared_columns_are_qualified() {
        let rw = rewriter(catalog());
        let q = joined()
            .filter(Predicate::eq("status", 1))
            .filter(Predicate::eq("title", "x"))
            .filter(Predicate::any(vec![Predicate::is_null("id"), Predicate::eq("name", "bob")]));

        let out = rw.rewrite(q).await;
        assert_eq!(out.wheres[0].predicate.column(), Some("posts.status"));
        assert_eq!(out.wheres[1].predicate.column(), Some("title"));
        let Predicate::Group(group) = &out.wheres[2].predicate else {
            panic!("group expected");
        };
        assert_eq!(group[0].predicate.column(), Some("posts.id"));
        assert_eq!(group[1].predicate.column(), Some("name"));
    }

    #[tokio::test]
    async fn test_raw_fragments_are_qualified() {
        let rw = rewriter(catalog());
        let q = joined().filter(Predicate::raw("status in (1, 2) and title <> 'status'", vec![]));
        let out = rw.rewrite(q).await;
        assert_eq!(
            out.wheres[0].predicate,
            Predicate::raw("posts.status in (1, 2) and title <> 'status'", vec![])
        );
    }

    #[tokio::test]
    async fn test_aliased_base_uses_alias() {
        let rw = rewriter(catalog());
        let q = Query::table("posts as p")
            .join(Join::left(
                TableRef::aliased("authors", "a"),
                vec![JoinCondition::columns("a.id", "p.author_id")],
            ))
            .filter(Predicate::eq("status", 1));
        let out = rw.rewrite(q).await;
        assert_eq!(out.wheres[0].predicate.column(), Some("p.status"));
        assert_eq!(out.columns, vec!["p.*".to_owned()]);
    }

    #[tokio::test]
    async fn test_select_list_rules() {
        let rw = rewriter(catalog());
        let q = joined().select([
            "status",
            "id",
            "title",
            "count(status) as n",
            "authors.title",
            "name as author",
        ]);
        let out = rw.rewrite(q).await;
        assert_eq!(
            out.columns,
            vec![
                "posts.status".to_owned(),
                // claimed by the join condition `authors.id`
                "id".to_owned(),
                "title".to_owned(),
                "count(status) as n".to_owned(),
                // authors has no title
                "posts.title".to_owned(),
                "name as author".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn test_visibility_joins_do_not_claim_columns() {
        let catalog = catalog()
            .with_table("workspace_users", ["id", "workspace_id", "user_id"])
            .with_table("workspace_models", ["id", "workspace_id", "model_type", "model_id"])
            .with_table("user_models", ["id", "user_id", "model_type", "model_id"]);
        let rw = rewriter(catalog);

        let mut q = Query::table("posts").select(["workspace_id", "title"]);
        let ctx = tenancy_security::RequestContext::builder().user_id(5).build();
        crate::scope::TenantScope::apply(&mut q, &FilteredModule::new("posts", "post"), &ctx);

        let out = rw.rewrite(q).await;
        assert_eq!(
            out.columns,
            vec!["posts.workspace_id".to_owned(), "title".to_owned()]
        );
    }

    #[tokio::test]
    async fn test_wrong_qualifier_goes_to_first_owner() {
        let catalog = catalog().with_table("tags", ["id", "label"]);
        let rw = rewriter(catalog);
        let q = joined()
            .join(Join::left(TableRef::new("tags"), vec![]))
            .filter(Predicate::eq("tags.status", 1))
            .filter(Predicate::eq("authors.label", "x"));
        let out = rw.rewrite(q).await;
        assert_eq!(out.wheres[0].predicate.column(), Some("posts.status"));
        assert_eq!(out.wheres[1].predicate.column(), Some("tags.label"));
    }

    #[tokio::test]
    async fn test_wildcards() {
        let rw = rewriter(catalog());
        let out = rw.rewrite(joined().select(["*", "authors.*"])).await;
        assert_eq!(
            out.columns,
            vec![
                "posts.*".to_owned(),
                "authors.id AS authors__id".to_owned(),
                "authors.name AS authors__name".to_owned(),
                "authors.status AS authors__status".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn test_schema_failure_falls_back_to_static_list() {
        // authors is unknown to the catalog
        let catalog = StaticCatalog::new().with_table("posts", ["id", "title"]);
        let rw = rewriter(catalog);
        let q = joined()
            .select(["authors.*"])
            .filter(Predicate::eq("workspace_id", 3))
            .filter(Predicate::eq("title", "x"))
            .filter(Predicate::eq("authors.title", "y"));
        let out = rw.rewrite(q).await;
        assert_eq!(out.wheres[0].predicate.column(), Some("posts.workspace_id"));
        assert_eq!(out.wheres[1].predicate.column(), Some("title"));
        // no correction without complete metadata
        assert_eq!(out.wheres[2].predicate.column(), Some("authors.title"));
        assert_eq!(out.columns, vec!["posts.*".to_owned()]);
    }

    #[tokio::test]
    async fn test_unknown_joined_wildcard_is_dropped() {
        let catalog = StaticCatalog::new().with_table("posts", ["id", "title", "status"]);
        let rw = rewriter(catalog);
        let out = rw.rewrite(joined().select(["*", "authors.*", "authors.name"])).await;
        assert_eq!(
            out.columns,
            vec!["posts.*".to_owned(), "authors.name".to_owned()]
        );
    }

    #[tokio::test]
    async fn test_malformed_raw_fragment_keeps_original_query() {
        let rw = rewriter(catalog());
        let q = joined()
            .filter(Predicate::eq("status", 1))
            .filter(Predicate::raw("status = 'open", vec![Value::Int(1)]));
        let out = rw.rewrite(q.clone()).await;
        assert_eq!(out, q);
    }
}
