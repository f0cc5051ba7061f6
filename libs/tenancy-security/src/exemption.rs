//! Requests that bypass workspace isolation.
//!
//! An exemption is granted when the request path matches one of the configured
//! route globs, or when the current user carries one of the configured roles.
//! Exempt requests skip both the visibility scope on reads and the
//! "workspace required" check on writes.

use glob::Pattern;
use serde::Deserialize;
use thiserror::Error;

use crate::RequestContext;

#[derive(Debug, Error)]
pub enum ExemptionError {
    #[error("invalid route pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

/// Raw exemption settings as they appear in configuration.
#[derive(Debug, Clone, Default, Deserialize, serde::Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExemptionConfig {
    /// Route globs such as `api/admin/*`, matched without the leading `/`.
    pub routes: Vec<String>,

    /// Role names that bypass workspace filtering.
    pub roles: Vec<String>,
}

/// Compiled exemption rules.
#[derive(Debug, Clone, Default)]
pub struct ExemptionPolicy {
    routes: Vec<Pattern>,
    roles: Vec<String>,
}

impl ExemptionPolicy {
    /// Compile route patterns and role names into a policy.
    ///
    /// # Errors
    /// Returns `ExemptionError::InvalidPattern` if a route glob does not parse.
    pub fn new<R, S>(routes: R, roles: Vec<String>) -> Result<Self, ExemptionError>
    where
        R: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let routes = routes
            .into_iter()
            .map(|raw| {
                let raw = raw.as_ref();
                Pattern::new(raw.trim_start_matches('/')).map_err(|source| {
                    ExemptionError::InvalidPattern {
                        pattern: raw.to_owned(),
                        source,
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { routes, roles })
    }

    /// A policy that never exempts anything.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns `ExemptionError::InvalidPattern` if a route glob does not parse.
    pub fn from_config(cfg: &ExemptionConfig) -> Result<Self, ExemptionError> {
        Self::new(&cfg.routes, cfg.roles.clone())
    }

    #[must_use]
    pub fn is_exempt(&self, ctx: &RequestContext) -> bool {
        self.route_exempt(ctx) || self.role_exempt(ctx)
    }

    fn route_exempt(&self, ctx: &RequestContext) -> bool {
        if self.routes.is_empty() {
            return false;
        }
        let Some(path) = ctx.request_path() else {
            return false;
        };
        let path = path.trim_start_matches('/');
        self.routes.iter().any(|p| p.matches(path))
    }

    fn role_exempt(&self, ctx: &RequestContext) -> bool {
        // anonymous requests are never exempt by role
        if ctx.current_user_id().is_none() || self.roles.is_empty() {
            return false;
        }
        ctx.current_user_roles()
            .iter()
            .any(|role| self.roles.contains(role))
    }
}
