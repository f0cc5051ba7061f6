//! Structured query description consumed by the visibility scope and the rewriter.
//!
//! A [`Query`] mirrors what a host query builder accumulates before execution:
//! a base table (optionally aliased), join clauses, a select list and a
//! predicate tree. Columns are kept as strings (`id`, `posts.id`, `count(id)`)
//! so that the rewriter can reason about qualification the same way the SQL
//! text will. Rendering to `sea_query` lives in [`render`].

use std::collections::BTreeSet;

pub mod render;

/// Scalar bound into a predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view; numeric text is parsed, booleans map to 0/1.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Null => None,
        }
    }

    /// Text view; integers and booleans are formatted.
    #[must_use]
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Text(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Null => None,
        }
    }
}

impl From<&serde_json::Value> for Value {
    fn from(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Value::Text(n.to_string()), Value::Int),
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Comparison operators supported in predicates and join conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
}

/// How a clause is chained to the clauses before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boolean {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// A physical table with an optional alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
        }
    }

    #[must_use]
    pub fn aliased(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: Some(alias.into()),
        }
    }

    /// Parse `"posts"` or `"posts as p"` (case-insensitive `as`).
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match split_alias(raw) {
            (name, Some(alias)) => Self::aliased(name, alias),
            (name, None) => Self::new(name),
        }
    }

    /// Name used to qualify columns of this table inside the query.
    #[must_use]
    pub fn reference(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// True when `qualifier` designates this table (by alias or by name).
    #[must_use]
    pub fn answers_to(&self, qualifier: &str) -> bool {
        self.reference() == qualifier || self.name == qualifier
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

/// One `ON` term; all terms of a join are combined with `AND`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinCondition {
    Columns { left: String, op: Op, right: String },
    Value { column: String, op: Op, value: Value },
    Raw(String),
}

impl JoinCondition {
    #[must_use]
    pub fn columns(left: impl Into<String>, right: impl Into<String>) -> Self {
        JoinCondition::Columns {
            left: left.into(),
            op: Op::Eq,
            right: right.into(),
        }
    }

    #[must_use]
    pub fn value(column: impl Into<String>, value: impl Into<Value>) -> Self {
        JoinCondition::Value {
            column: column.into(),
            op: Op::Eq,
            value: value.into(),
        }
    }

    /// Column references appearing in this condition.
    #[must_use]
    pub fn column_refs(&self) -> Vec<&str> {
        match self {
            JoinCondition::Columns { left, right, .. } => vec![left.as_str(), right.as_str()],
            JoinCondition::Value { column, .. } => vec![column.as_str()],
            JoinCondition::Raw(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: TableRef,
    pub conditions: Vec<JoinCondition>,
}

impl Join {
    #[must_use]
    pub fn left(table: TableRef, conditions: Vec<JoinCondition>) -> Self {
        Self {
            kind: JoinKind::Left,
            table,
            conditions,
        }
    }

    #[must_use]
    pub fn inner(table: TableRef, conditions: Vec<JoinCondition>) -> Self {
        Self {
            kind: JoinKind::Inner,
            table,
            conditions,
        }
    }
}

/// Node of the predicate tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Compare { column: String, op: Op, value: Value },
    Null { column: String, negated: bool },
    In { column: String, values: Vec<Value>, negated: bool },
    /// Free-form SQL with `?` placeholders.
    Raw { sql: String, bindings: Vec<Value> },
    Group(Vec<Clause>),
}

impl Predicate {
    #[must_use]
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(column, Op::Eq, value)
    }

    #[must_use]
    pub fn cmp(column: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    #[must_use]
    pub fn is_null(column: impl Into<String>) -> Self {
        Predicate::Null {
            column: column.into(),
            negated: false,
        }
    }

    #[must_use]
    pub fn not_null(column: impl Into<String>) -> Self {
        Predicate::Null {
            column: column.into(),
            negated: true,
        }
    }

    #[must_use]
    pub fn in_list<V: Into<Value>>(column: impl Into<String>, values: Vec<V>) -> Self {
        Predicate::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    #[must_use]
    pub fn raw(sql: impl Into<String>, bindings: Vec<Value>) -> Self {
        Predicate::Raw {
            sql: sql.into(),
            bindings,
        }
    }

    /// Nested group whose members are OR-ed together.
    #[must_use]
    pub fn any(predicates: Vec<Predicate>) -> Self {
        Predicate::Group(predicates.into_iter().map(Clause::or).collect())
    }

    /// Nested group whose members are AND-ed together.
    #[must_use]
    pub fn all(predicates: Vec<Predicate>) -> Self {
        Predicate::Group(predicates.into_iter().map(Clause::and).collect())
    }

    /// Column this node compares, if it is a simple column node.
    #[must_use]
    pub fn column(&self) -> Option<&str> {
        match self {
            Predicate::Compare { column, .. }
            | Predicate::Null { column, .. }
            | Predicate::In { column, .. } => Some(column),
            Predicate::Raw { .. } | Predicate::Group(_) => None,
        }
    }

    pub(crate) fn column_mut(&mut self) -> Option<&mut String> {
        match self {
            Predicate::Compare { column, .. }
            | Predicate::Null { column, .. }
            | Predicate::In { column, .. } => Some(column),
            Predicate::Raw { .. } | Predicate::Group(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub boolean: Boolean,
    pub predicate: Predicate,
}

impl Clause {
    #[must_use]
    pub fn and(predicate: Predicate) -> Self {
        Self {
            boolean: Boolean::And,
            predicate,
        }
    }

    #[must_use]
    pub fn or(predicate: Predicate) -> Self {
        Self {
            boolean: Boolean::Or,
            predicate,
        }
    }
}

/// Query against one base table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub from: TableRef,
    pub joins: Vec<Join>,
    /// Select list; empty means an implicit `*`.
    pub columns: Vec<String>,
    pub wheres: Vec<Clause>,
    pub orders: Vec<(String, Order)>,
    pub limit: Option<u64>,
    markers: BTreeSet<String>,
}

impl Query {
    #[must_use]
    pub fn table(raw: &str) -> Self {
        Self::from_ref(TableRef::parse(raw))
    }

    #[must_use]
    pub fn from_ref(from: TableRef) -> Self {
        Self {
            from,
            joins: Vec::new(),
            columns: Vec::new(),
            wheres: Vec::new(),
            orders: Vec::new(),
            limit: None,
            markers: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns.extend(columns.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    #[must_use]
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.wheres.push(Clause::and(predicate));
        self
    }

    #[must_use]
    pub fn or_filter(mut self, predicate: Predicate) -> Self {
        self.wheres.push(Clause::or(predicate));
        self
    }

    #[must_use]
    pub fn order_by(mut self, column: impl Into<String>, order: Order) -> Self {
        self.orders.push((column.into(), order));
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Reference name of the base table (alias if present).
    #[must_use]
    pub fn base_reference(&self) -> &str {
        self.from.reference()
    }

    #[must_use]
    pub fn has_join(&self, reference: &str) -> bool {
        self.joins.iter().any(|j| j.table.reference() == reference)
    }

    #[must_use]
    pub fn has_marker(&self, marker: &str) -> bool {
        self.markers.contains(marker)
    }

    pub fn mark(&mut self, marker: &str) {
        self.markers.insert(marker.to_owned());
    }

    /// Find the table (base or joined) a qualifier refers to.
    #[must_use]
    pub fn table_for(&self, qualifier: &str) -> Option<&TableRef> {
        std::iter::once(&self.from)
            .chain(self.joins.iter().map(|j| &j.table))
            .find(|t| t.answers_to(qualifier))
    }
}

/// Split `"t.col"` into `(Some("t"), "col")`; unqualified columns yield `None`.
#[must_use]
pub fn split_qualified(column: &str) -> (Option<&str>, &str) {
    match column.rsplit_once('.') {
        Some((qualifier, name)) => (Some(qualifier.trim()), name.trim()),
        None => (None, column.trim()),
    }
}

/// Split a trailing `AS alias` off an expression.
#[must_use]
pub fn split_alias(raw: &str) -> (&str, Option<&str>) {
    let lower = raw.to_ascii_lowercase();
    match lower.rfind(" as ") {
        Some(pos) => {
            let alias = raw[pos + 4..].trim();
            if is_identifier(alias) {
                (raw[..pos].trim(), Some(alias))
            } else {
                (raw.trim(), None)
            }
        }
        None => (raw.trim(), None),
    }
}

/// Plain SQL identifier: letters, digits and `_`, not starting with a digit.
#[must_use]
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Classified select-list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectItem<'a> {
    /// `*`
    Wildcard,
    /// `t.*`
    QualifiedWildcard(&'a str),
    /// `col`, `t.col`, optionally `AS alias`
    Column {
        qualifier: Option<&'a str>,
        name: &'a str,
        alias: Option<&'a str>,
    },
    /// Anything else: function calls, arithmetic, literals.
    Expression,
}

impl<'a> SelectItem<'a> {
    #[must_use]
    pub fn parse(raw: &'a str) -> Self {
        let (expr, alias) = split_alias(raw);
        if expr == "*" {
            return SelectItem::Wildcard;
        }
        match split_qualified(expr) {
            (Some(q), "*") if is_qualifier(q) => SelectItem::QualifiedWildcard(q),
            (Some(q), name) if is_qualifier(q) && is_identifier(name) => SelectItem::Column {
                qualifier: Some(q),
                name,
                alias,
            },
            (None, name) if is_identifier(name) => SelectItem::Column {
                qualifier: None,
                name,
                alias,
            },
            _ => SelectItem::Expression,
        }
    }
}

/// Qualifiers may themselves be schema-qualified (`db.table`).
fn is_qualifier(q: &str) -> bool {
    q.split('.').all(is_identifier)
}
