//! Typed configuration.
//!
//! Loaded with `figment`: built-in defaults, then a YAML file, then
//! `TENANCY__`-prefixed environment variables (`TENANCY__LOCAL__DSN` sets
//! `local.dsn`). Column-map sections merge key by key with the defaults.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use tenancy_security::{ExemptionConfig, ExemptionError, ExemptionPolicy};

use crate::options::DbConnConfig;
use crate::registry::FilteredModule;
use crate::sync::mapping::{
    ColumnMap, ColumnMapEntry, default_target_entries, default_workspace_entries,
};

pub const ENV_PREFIX: &str = "TENANCY__";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error(transparent)]
    Exemption(#[from] ExemptionError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventsConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            api_key: None,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TenancyConfig {
    /// Application database holding workspaces, links and filtered tables.
    pub local: DbConnConfig,
    /// Datastore holding the canonical workspace records.
    pub master: DbConnConfig,
    pub exemptions: ExemptionConfig,
    /// Master column → local source.
    pub workspace_column_map: BTreeMap<String, ColumnMapEntry>,
    /// Local column → master source.
    pub target_column_map: BTreeMap<String, ColumnMapEntry>,
    pub filtered_modules: Vec<FilteredModule>,
    pub events: EventsConfig,
    /// Numeric suffixes tried when making a new slug unique.
    pub slug_retry_limit: u32,
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            local: DbConnConfig::default(),
            master: DbConnConfig::default(),
            exemptions: ExemptionConfig::default(),
            workspace_column_map: default_workspace_entries(),
            target_column_map: default_target_entries(),
            filtered_modules: Vec::new(),
            events: EventsConfig::default(),
            slug_retry_limit: 100,
        }
    }
}

impl TenancyConfig {
    /// Defaults layered under `figment`, then validated.
    ///
    /// # Errors
    /// `Load` on extraction failure, `Invalid` when validation fails.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let cfg: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(figment)
            .extract()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load `path` (YAML) and the `TENANCY__*` environment.
    ///
    /// # Errors
    /// See [`TenancyConfig::from_figment`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::new()
                .merge(Yaml::file(path.as_ref()))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// # Errors
    /// `Invalid` for a map without a `slug` target, an empty retry limit or
    /// a malformed module list.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.workspace_column_map.contains_key("slug") {
            return Err(ConfigError::Invalid(
                "workspace_column_map must map 'slug'".to_owned(),
            ));
        }
        if self.slug_retry_limit == 0 {
            return Err(ConfigError::Invalid(
                "slug_retry_limit must be positive".to_owned(),
            ));
        }

        let mut seen = HashSet::new();
        for module in &self.filtered_modules {
            if module.table.is_empty() || module.entity_type.is_empty() {
                return Err(ConfigError::Invalid(
                    "filtered module needs a table and an entity_type".to_owned(),
                ));
            }
            if !seen.insert(module.table.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "filtered module '{}' registered twice",
                    module.table
                )));
            }
        }
        Ok(())
    }

    /// # Errors
    /// `Exemption` when a route glob does not parse.
    pub fn exemption_policy(&self) -> Result<ExemptionPolicy, ConfigError> {
        Ok(ExemptionPolicy::from_config(&self.exemptions)?)
    }

    #[must_use]
    pub fn workspace_map(&self) -> ColumnMap {
        ColumnMap::from_entries(&self.workspace_column_map)
    }

    #[must_use]
    pub fn target_map(&self) -> ColumnMap {
        ColumnMap::from_entries(&self.target_column_map)
    }
}
