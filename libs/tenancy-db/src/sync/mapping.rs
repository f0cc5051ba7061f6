//! Column maps between local and master workspace records.
//!
//! Each target column is produced by a [`ColumnMapping`]: a copy of a source
//! attribute, a literal, a copy with a default that is written back to the
//! source when missing, or a computed function. Configuration uses the
//! serializable [`ColumnMapEntry`] form, which supports the `"column"` and
//! `"column,default"` shorthands.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tenancy_security::RequestContext;

use crate::query::Value;

/// Named attribute access on a record being mapped.
pub trait Attributes {
    /// `None` when the record has no such attribute.
    fn get(&self, name: &str) -> Option<Value>;

    /// Returns `false` when the record has no such attribute.
    fn set(&mut self, name: &str, value: Value) -> bool;
}

impl Attributes for serde_json::Map<String, serde_json::Value> {
    fn get(&self, name: &str) -> Option<Value> {
        serde_json::Map::get(self, name).map(Value::from)
    }

    fn set(&mut self, name: &str, value: Value) -> bool {
        self.insert(name.to_owned(), serde_json::Value::from(&value));
        true
    }
}

pub type ComputeFn = Arc<dyn Fn(&dyn Attributes, &RequestContext) -> Value + Send + Sync>;

#[derive(Clone)]
pub enum ColumnMapping {
    Copy(String),
    Literal(Value),
    WithDefault { source: String, default: Value },
    Computed(ComputeFn),
}

impl fmt::Debug for ColumnMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Copy(source) => f.debug_tuple("Copy").field(source).finish(),
            Self::Literal(v) => f.debug_tuple("Literal").field(v).finish(),
            Self::WithDefault { source, default } => f
                .debug_struct("WithDefault")
                .field("source", source)
                .field("default", default)
                .finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

impl ColumnMapping {
    #[must_use]
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&dyn Attributes, &RequestContext) -> Value + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(f))
    }

    /// Produce the value for `target`, writing defaults and computed values
    /// back onto `record`.
    pub fn evaluate(&self, target: &str, record: &mut dyn Attributes, ctx: &RequestContext) -> Value {
        match self {
            Self::Copy(source) => record.get(source).unwrap_or(Value::Null),
            Self::Literal(v) => v.clone(),
            Self::WithDefault { source, default } => match record.get(source) {
                Some(v) if !v.is_null() => v,
                _ => {
                    record.set(source, default.clone());
                    default.clone()
                }
            },
            Self::Computed(f) => {
                let v = f(&*record, ctx);
                if record.get(target).is_some() {
                    record.set(target, v.clone());
                }
                v
            }
        }
    }
}

/// Ordered set of target-column mappings.
#[derive(Debug, Clone, Default)]
pub struct ColumnMap {
    entries: Vec<(String, ColumnMapping)>,
}

impl ColumnMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, target: impl Into<String>, mapping: ColumnMapping) -> Self {
        let target = target.into();
        self.entries.retain(|(t, _)| *t != target);
        self.entries.push((target, mapping));
        self
    }

    #[must_use]
    pub fn contains(&self, target: &str) -> bool {
        self.entries.iter().any(|(t, _)| t == target)
    }

    /// Evaluate every mapping in order.
    pub fn evaluate(&self, record: &mut dyn Attributes, ctx: &RequestContext) -> Vec<(String, Value)> {
        self.entries
            .iter()
            .map(|(target, mapping)| (target.clone(), mapping.evaluate(target, record, ctx)))
            .collect()
    }

    /// Local → master map used when saving workspaces.
    #[must_use]
    pub fn default_workspace_map() -> Self {
        Self::from_entries(&default_workspace_entries())
    }

    /// Master → local map used when pulling workspaces.
    #[must_use]
    pub fn default_target_map() -> Self {
        Self::from_entries(&default_target_entries())
    }

    #[must_use]
    pub fn from_entries(entries: &BTreeMap<String, ColumnMapEntry>) -> Self {
        entries
            .iter()
            .fold(Self::new(), |map, (target, entry)| map.with(target.clone(), entry.to_mapping()))
    }
}

/// Built-in computations available from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Builtin {
    /// Slug of the source attribute (`name` by default).
    Slugify,
    /// Authenticated user id, falling back to the source attribute.
    CurrentUser,
}

/// Configuration form of a [`ColumnMapping`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnMapEntry {
    /// `"column"` or `"column,default"`.
    Source(String),
    WithDefault {
        key: String,
        default: serde_json::Value,
    },
    Literal {
        literal: serde_json::Value,
    },
    Computed {
        computed: Builtin,
        #[serde(default)]
        source: Option<String>,
    },
}

impl ColumnMapEntry {
    #[must_use]
    pub fn to_mapping(&self) -> ColumnMapping {
        match self {
            Self::Source(raw) => match raw.split_once(',') {
                Some((source, default)) => ColumnMapping::WithDefault {
                    source: source.trim().to_owned(),
                    default: parse_default(default.trim()),
                },
                None => ColumnMapping::Copy(raw.trim().to_owned()),
            },
            Self::WithDefault { key, default } => ColumnMapping::WithDefault {
                source: key.clone(),
                default: Value::from(default),
            },
            Self::Literal { literal } => ColumnMapping::Literal(Value::from(literal)),
            Self::Computed {
                computed: Builtin::Slugify,
                source,
            } => {
                let source = source.clone().unwrap_or_else(|| "name".to_owned());
                ColumnMapping::computed(move |record, _| {
                    record
                        .get(&source)
                        .and_then(|v| v.as_text())
                        .map_or(Value::Null, |s| Value::Text(slugify(&s)))
                })
            }
            Self::Computed {
                computed: Builtin::CurrentUser,
                source,
            } => {
                let source = source.clone();
                ColumnMapping::computed(move |record, ctx| match ctx.current_user_id() {
                    Some(id) => Value::Int(id),
                    None => source
                        .as_deref()
                        .and_then(|s| record.get(s))
                        .unwrap_or(Value::Null),
                })
            }
        }
    }
}

fn parse_default(raw: &str) -> Value {
    raw.parse::<i64>()
        .map_or_else(|_| Value::Text(raw.to_owned()), Value::Int)
}

#[must_use]
pub fn default_workspace_entries() -> BTreeMap<String, ColumnMapEntry> {
    BTreeMap::from([
        ("name".to_owned(), ColumnMapEntry::Source("name".to_owned())),
        (
            "slug".to_owned(),
            ColumnMapEntry::Computed {
                computed: Builtin::Slugify,
                source: Some("name".to_owned()),
            },
        ),
        ("status".to_owned(), ColumnMapEntry::Source("status,1".to_owned())),
        (
            "owner_user_id".to_owned(),
            ColumnMapEntry::Computed {
                computed: Builtin::CurrentUser,
                source: Some("owner_user_id".to_owned()),
            },
        ),
    ])
}

#[must_use]
pub fn default_target_entries() -> BTreeMap<String, ColumnMapEntry> {
    BTreeMap::from([
        ("name".to_owned(), ColumnMapEntry::Source("name".to_owned())),
        ("slug".to_owned(), ColumnMapEntry::Source("slug".to_owned())),
        ("status".to_owned(), ColumnMapEntry::Source("status,1".to_owned())),
        (
            "owner_user_id".to_owned(),
            ColumnMapEntry::Source("owner_user_id".to_owned()),
        ),
    ])
}

/// Lowercase ASCII slug: runs of anything else collapse into one `-`.
#[must_use]
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}
