/// Header carrying the active workspace identifier of a request.
pub const ACTIVE_WORKSPACE_HEADER: &str = "ACTIVE-WORKSPACE";

/// `RequestContext` carries the identity and workspace signal of one unit of work
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RequestContext {
    user_id: Option<i64>,
    roles: Vec<String>,
    active_workspace_id: Option<i64>,
    path: Option<String>,
}

impl RequestContext {
    /// Create a new `RequestContext` builder
    #[must_use]
    pub fn builder() -> RequestContextBuilder {
        RequestContextBuilder::default()
    }

    /// Create an anonymous `RequestContext` with no user, roles or workspace
    #[must_use]
    pub fn anonymous() -> Self {
        RequestContextBuilder::default().build()
    }

    /// Build a context from raw request header pairs.
    ///
    /// Only the [`ACTIVE_WORKSPACE_HEADER`] is read here; identity comes from the
    /// auth layer. Header names compare case-insensitively and `_` matches `-`.
    #[must_use]
    pub fn from_headers<'a, I>(headers: I) -> RequestContextBuilder
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let active = headers
            .into_iter()
            .find(|(name, _)| {
                name.replace('_', "-")
                    .eq_ignore_ascii_case(ACTIVE_WORKSPACE_HEADER)
            })
            .and_then(|(_, value)| parse_workspace_id(value));

        let builder = RequestContextBuilder::default();
        match active {
            Some(id) => builder.active_workspace_id(id),
            None => builder,
        }
    }

    /// Identifier of the authenticated user, if any
    #[must_use]
    pub fn current_user_id(&self) -> Option<i64> {
        self.user_id
    }

    /// Roles of the authenticated user
    #[must_use]
    pub fn current_user_roles(&self) -> &[String] {
        &self.roles
    }

    /// Workspace selected by the request, if any
    #[must_use]
    pub fn active_workspace_id(&self) -> Option<i64> {
        self.active_workspace_id
    }

    /// Path of the inbound request (used for route exemptions)
    #[must_use]
    pub fn request_path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Zero, negative and non-numeric values all mean "no workspace".
fn parse_workspace_id(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok().filter(|id| *id > 0)
}

#[derive(Default)]
pub struct RequestContextBuilder {
    user_id: Option<i64>,
    roles: Vec<String>,
    active_workspace_id: Option<i64>,
    path: Option<String>,
}

impl RequestContextBuilder {
    #[must_use]
    pub fn user_id(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn add_role(mut self, role: &str) -> Self {
        self.roles.push(role.to_owned());
        self
    }

    #[must_use]
    pub fn active_workspace_id(mut self, workspace_id: i64) -> Self {
        self.active_workspace_id = Some(workspace_id);
        self
    }

    #[must_use]
    pub fn path(mut self, path: &str) -> Self {
        self.path = Some(path.to_owned());
        self
    }

    #[must_use]
    pub fn build(self) -> RequestContext {
        RequestContext {
            user_id: self.user_id,
            roles: self.roles,
            active_workspace_id: self.active_workspace_id,
            path: self.path,
        }
    }
}
