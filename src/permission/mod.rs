pub mod role;
pub mod scheme;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::auth::Token;

pub use role::{Role, RoleEvent, RoleInstance};
pub use scheme::{is_parent, registry, PermissionRegistry, PermissionScheme};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PermissionError {
    #[error("You don't have permission to do this action")]
    Unauthorized,

    #[error("You must provide a team to execute this action.")]
    TooManyTeams,

    #[error("role not found")]
    RoleNotFound,

    #[error("invalid role name")]
    InvalidRoleName,

    #[error("role already exists")]
    RoleAlreadyExists,

    #[error("permission named {0:?} not found")]
    PermissionNotFound(String),

    #[error("permission {permission:?} not allowed with context of type {context:?}")]
    PermissionNotAllowed { permission: String, context: String },

    #[error("invalid context type {0:?}")]
    InvalidContextType(String),

    #[error("invalid role event {0:?}")]
    InvalidRoleEvent(String),

    #[error("role event {event:?} is not valid for role with context {context:?}")]
    RoleEventContextMismatch { event: String, context: String },

    #[error("role has users assigned")]
    RemoveRoleWithUsers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextType {
    Global,
    Team,
    User,
    Pool,
    App,
    Job,
    Service,
    ServiceInstance,
    Volume,
    NodeContainer,
    Cluster,
    Webhook,
    Role,
}

impl ContextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextType::Global => "global",
            ContextType::Team => "team",
            ContextType::User => "user",
            ContextType::Pool => "pool",
            ContextType::App => "app",
            ContextType::Job => "job",
            ContextType::Service => "service",
            ContextType::ServiceInstance => "service-instance",
            ContextType::Volume => "volume",
            ContextType::NodeContainer => "node-container",
            ContextType::Cluster => "cluster",
            ContextType::Webhook => "webhook",
            ContextType::Role => "role",
        }
    }
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextType {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ctx = match s {
            "global" => ContextType::Global,
            "team" => ContextType::Team,
            "user" => ContextType::User,
            "pool" => ContextType::Pool,
            "app" => ContextType::App,
            "job" => ContextType::Job,
            "service" => ContextType::Service,
            "service-instance" => ContextType::ServiceInstance,
            "volume" => ContextType::Volume,
            "node-container" => ContextType::NodeContainer,
            "cluster" => ContextType::Cluster,
            "webhook" => ContextType::Webhook,
            "role" => ContextType::Role,
            other => return Err(PermissionError::InvalidContextType(other.to_string())),
        };
        Ok(ctx)
    }
}

/// Scope of a permission: the global wildcard or a typed value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum Context {
    Global,
    Typed(ContextType, String),
}

impl Context {
    pub fn new(ctx_type: ContextType, value: impl Into<String>) -> Self {
        match ctx_type {
            ContextType::Global => Context::Global,
            other => Context::Typed(other, value.into()),
        }
    }

    pub fn team(value: impl Into<String>) -> Self {
        Context::Typed(ContextType::Team, value.into())
    }

    pub fn app(value: impl Into<String>) -> Self {
        Context::Typed(ContextType::App, value.into())
    }

    pub fn pool(value: impl Into<String>) -> Self {
        Context::Typed(ContextType::Pool, value.into())
    }

    pub fn job(value: impl Into<String>) -> Self {
        Context::Typed(ContextType::Job, value.into())
    }

    pub fn service(value: impl Into<String>) -> Self {
        Context::Typed(ContextType::Service, value.into())
    }

    pub fn service_instance(value: impl Into<String>) -> Self {
        Context::Typed(ContextType::ServiceInstance, value.into())
    }

    pub fn user(value: impl Into<String>) -> Self {
        Context::Typed(ContextType::User, value.into())
    }

    /// One team context per name.
    pub fn teams<I, S>(names: I) -> Vec<Context>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names.into_iter().map(Context::team).collect()
    }

    pub fn context_type(&self) -> ContextType {
        match self {
            Context::Global => ContextType::Global,
            Context::Typed(t, _) => *t,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Context::Global => "",
            Context::Typed(_, v) => v,
        }
    }

    /// Whether a held context satisfies a required one.
    pub fn matches(&self, required: &Context) -> bool {
        match (self, required) {
            (Context::Global, _) => true,
            (Context::Typed(held_type, held), Context::Typed(req_type, req)) => {
                held_type == req_type && held == req
            }
            (Context::Typed(..), Context::Global) => false,
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Context::Global => f.write_str("global"),
            Context::Typed(t, v) => write!(f, "{} {}", t, v),
        }
    }
}

/// A scheme held on a context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub scheme: String,
    pub context: Context,
}

impl Permission {
    pub fn new(scheme: impl Into<String>, context: Context) -> Self {
        Self {
            scheme: scheme.into(),
            context,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.scheme, self.context)
    }
}

pub fn check(token: &Token, scheme: &str, contexts: &[Context]) -> bool {
    check_from_perm_list(token.permissions(), scheme, contexts)
}

/// Like [`check`], over an already materialized permission list.
pub fn check_from_perm_list(perms: &[Permission], scheme: &str, contexts: &[Context]) -> bool {
    perms.iter().any(|held| {
        is_parent(&held.scheme, scheme)
            && (held.context == Context::Global
                || contexts.iter().any(|required| held.context.matches(required)))
    })
}

/// Contexts on which the token holds `scheme` or an ancestor of it.
///
/// With `filter` empty every context type is returned; otherwise only the
/// listed types plus global.
pub fn contexts_for_permission(
    token: &Token,
    scheme: &str,
    filter: &[ContextType],
) -> Vec<Context> {
    let mut contexts: Vec<Context> = Vec::new();
    for held in token.permissions() {
        if !is_parent(&held.scheme, scheme) {
            continue;
        }
        let ctx_type = held.context.context_type();
        if !filter.is_empty() && ctx_type != ContextType::Global && !filter.contains(&ctx_type) {
            continue;
        }
        if !contexts.contains(&held.context) {
            contexts.push(held.context.clone());
        }
    }
    contexts
}

/// The single team on which the token holds `scheme`.
pub fn team_for_permission(token: &Token, scheme: &str) -> Result<String, PermissionError> {
    let contexts = contexts_for_permission(token, scheme, &[ContextType::Team]);
    match contexts.as_slice() {
        [] => Err(PermissionError::Unauthorized),
        [Context::Typed(ContextType::Team, team)] => Ok(team.clone()),
        _ => Err(PermissionError::TooManyTeams),
    }
}

/// Values of the given type a token may access, or `None` for unrestricted.
pub fn filter_values(contexts: &[Context], ctx_type: ContextType) -> Option<Vec<String>> {
    if contexts.iter().any(|c| *c == Context::Global) {
        return None;
    }
    Some(
        contexts
            .iter()
            .filter(|c| c.context_type() == ctx_type)
            .map(|c| c.value().to_string())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perms(list: &[(&str, Context)]) -> Vec<Permission> {
        list.iter()
            .map(|(s, c)| Permission::new(*s, c.clone()))
            .collect()
    }

    #[test]
    fn test_global_context_matches_everything() {
        let held = perms(&[(scheme::APP, Context::Global)]);
        assert!(check_from_perm_list(&held, scheme::APP_UPDATE, &[]));
        assert!(check_from_perm_list(&held, scheme::APP_UPDATE, &[Context::app("myapp")]));
    }

    #[test]
    fn test_typed_context_requires_matching_value() {
        let held = perms(&[(scheme::APP_UPDATE, Context::team("acme"))]);
        assert!(check_from_perm_list(
            &held,
            scheme::APP_UPDATE_UNIT_AUTOSCALE_ADD,
            &[Context::app("myapp"), Context::team("acme")]
        ));
        assert!(!check_from_perm_list(
            &held,
            scheme::APP_UPDATE,
            &[Context::team("other")]
        ));
        assert!(!check_from_perm_list(&held, scheme::APP_UPDATE, &[]));
        assert!(!check_from_perm_list(&held, scheme::APP_READ, &[Context::team("acme")]));
    }

    #[test]
    fn test_team_context_does_not_match_other_types() {
        let held = perms(&[(scheme::APP, Context::team("acme"))]);
        assert!(!check_from_perm_list(
            &held,
            scheme::APP_READ,
            &[Context::app("acme")]
        ));
    }

    #[test]
    fn test_adding_permissions_never_removes_access() {
        let base = perms(&[(scheme::APP_READ, Context::team("acme"))]);
        let mut extended = base.clone();
        extended.push(Permission::new(scheme::SERVICE, Context::Global));
        let cases = [
            (scheme::APP_READ, vec![Context::team("acme")]),
            (scheme::APP_READ, vec![Context::team("x")]),
            (scheme::APP_UPDATE, vec![Context::team("acme")]),
        ];
        for (s, ctxs) in cases.iter() {
            if check_from_perm_list(&base, s, ctxs) {
                assert!(check_from_perm_list(&extended, s, ctxs));
            }
        }
    }

    #[test]
    fn test_filter_values_global_means_unrestricted() {
        let ctxs = vec![Context::team("a"), Context::Global];
        assert_eq!(filter_values(&ctxs, ContextType::Team), None);
        let ctxs = vec![Context::team("a"), Context::pool("p")];
        assert_eq!(
            filter_values(&ctxs, ContextType::Team),
            Some(vec!["a".to_string()])
        );
    }

    #[test]
    fn test_context_type_round_trip() {
        for name in ["global", "team", "service-instance", "node-container"] {
            let parsed: ContextType = name.parse().unwrap();
            assert_eq!(parsed.as_str(), name);
        }
        assert!("bogus".parse::<ContextType>().is_err());
    }
}
