use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{require, start_event, Audit};
use crate::auth::Token;
use crate::error::ApiError;
use crate::event::{finish, AllowedPermission, Target, TargetType};
use crate::input::RequestInput;
use crate::middleware::{ApiResponse, Caller};
use crate::permission::scheme::{
    registry, ROLE_CREATE, ROLE_DEFAULT_CREATE, ROLE_DEFAULT_DELETE, ROLE_DELETE, ROLE_READ_EVENTS,
    ROLE_UPDATE, ROLE_UPDATE_ASSIGN, ROLE_UPDATE_DISSOCIATE, ROLE_UPDATE_PERMISSION_ADD,
    ROLE_UPDATE_PERMISSION_REMOVE,
};
use crate::permission::{check, check_from_perm_list, PermissionError, Role, RoleEvent};
use crate::services::ServiceError;
use crate::state::AppState;

fn role_target(name: &str) -> Target {
    Target::new(TargetType::Role, name)
}

fn role_allowed() -> AllowedPermission {
    AllowedPermission::new(ROLE_READ_EVENTS, vec![])
}

fn require_any(token: &Token, schemes: &[&str]) -> Result<(), ApiError> {
    if schemes.iter().any(|s| check(token, s, &[])) {
        Ok(())
    } else {
        Err(ApiError::permission_denied())
    }
}

/// Missing roles referenced from a request body are the caller's mistake.
fn role_as_input(err: ServiceError) -> ApiError {
    match err {
        ServiceError::Permission(PermissionError::RoleNotFound) => {
            ApiError::bad_request(PermissionError::RoleNotFound.to_string())
        }
        other => other.into(),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct NewRole {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub description: String,
}

/// POST /roles - define a role
pub async fn create(
    State(state): State<AppState>,
    caller: Caller,
    input: RequestInput,
) -> Result<Response, ApiError> {
    require(&caller.token, ROLE_CREATE, &[])?;
    let role: NewRole = input.parse()?;
    if role.name.trim().is_empty() {
        return Err(PermissionError::InvalidRoleName.into());
    }
    let evt = start_event(
        &state,
        &caller,
        Audit::new(role_target(&role.name), ROLE_CREATE, role_allowed()).input(&input),
    )
    .await?;
    finish(&evt, async {
        state
            .roles()
            .create(&role.name, &role.context, &role.description)
            .await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::CREATED.into_response())
}

/// DELETE /roles/:name - remove a role nobody holds
pub async fn remove(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, ROLE_DELETE, &[])?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(role_target(&name), ROLE_DELETE, role_allowed()).input(&input),
    )
    .await?;
    finish(&evt, async {
        state.roles().remove(&name).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

const ROLE_ADMIN: [&str; 5] = [
    ROLE_UPDATE,
    ROLE_UPDATE_ASSIGN,
    ROLE_UPDATE_DISSOCIATE,
    ROLE_CREATE,
    ROLE_DELETE,
];

/// GET /roles - every role definition
pub async fn list(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<ApiResponse<Vec<Role>>, ApiError> {
    require_any(&caller.token, &ROLE_ADMIN)?;
    Ok(ApiResponse::success(state.roles().list().await?))
}

/// GET /roles/:name - one role definition
pub async fn info(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
) -> Result<ApiResponse<Role>, ApiError> {
    require_any(&caller.token, &ROLE_ADMIN)?;
    Ok(ApiResponse::success(state.roles().get(&name).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct RoleChange {
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "newName")]
    pub new_name: String,
    #[serde(default, alias = "contextType")]
    pub context_type: String,
    #[serde(default)]
    pub description: String,
}

/// PUT /roles - rename a role or change its context type or description
pub async fn update(
    State(state): State<AppState>,
    caller: Caller,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, ROLE_UPDATE, &[])?;
    let change: RoleChange = input.parse()?;
    if change.new_name.is_empty() && change.context_type.is_empty() && change.description.is_empty()
    {
        return Err(ApiError::bad_request(
            "Neither the description, context or new name were set. You must define at least one.",
        ));
    }
    let evt = start_event(
        &state,
        &caller,
        Audit::new(role_target(&change.name), ROLE_UPDATE, role_allowed()).input(&input),
    )
    .await?;
    let non_empty = |s: &str| Some(s.to_string()).filter(|s| !s.is_empty());
    finish(&evt, async {
        state
            .roles()
            .update(
                &change.name,
                non_empty(&change.new_name).as_deref(),
                non_empty(&change.context_type).as_deref(),
                non_empty(&change.description).as_deref(),
            )
            .await
            .map_err(|e| match e {
                ServiceError::Permission(PermissionError::RoleNotFound) => {
                    ApiError::not_found(e.to_string())
                }
                other => ApiError::bad_request(other.to_string()),
            })
    })
    .await?;
    Ok(StatusCode::OK)
}

/// POST /roles/:name/permissions - add permission schemes to a role
pub async fn add_permissions(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, ROLE_UPDATE_PERMISSION_ADD, &[])?;
    let schemes = input.input_values("permission");
    let evt = start_event(
        &state,
        &caller,
        Audit::new(role_target(&name), ROLE_UPDATE_PERMISSION_ADD, role_allowed()).input(&input),
    )
    .await?;
    finish(&evt, async {
        state.roles().add_permissions(&name, &schemes).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// DELETE /roles/:name/permissions/:permission - drop a scheme from a role
pub async fn remove_permission(
    State(state): State<AppState>,
    caller: Caller,
    Path((name, permission)): Path<(String, String)>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, ROLE_UPDATE_PERMISSION_REMOVE, &[])?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(role_target(&name), ROLE_UPDATE_PERMISSION_REMOVE, role_allowed())
            .input(&input),
    )
    .await?;
    finish(&evt, async {
        state.roles().remove_permission(&name, &permission).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// A caller may only hand out a role whose every permission it holds itself
/// on the same context.
fn can_use_role(token: &Token, role: &Role, context_value: &str) -> Result<(), ApiError> {
    for perm in role.permissions_for(context_value) {
        if !check_from_perm_list(token.permissions(), &perm.scheme, &[perm.context.clone()]) {
            return Err(ApiError::forbidden(format!(
                "User not authorized to use permission {}",
                perm
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
pub struct RoleAssignment {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub context: String,
}

/// POST /roles/:name/user - assign a role to a user on a context value
pub async fn assign(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, ROLE_UPDATE_ASSIGN, &[])?;
    let RoleAssignment { email, context } = input.parse()?;
    let roles = state.roles();
    let role = roles.get(&name).await?;
    roles
        .validate_context_value(&role, &context)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    can_use_role(&caller.token, &role, &context)?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(role_target(&name), ROLE_UPDATE_ASSIGN, role_allowed()).input(&input),
    )
    .await?;
    finish(&evt, async {
        roles.assign(&email, &role.name, &context).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Default, Deserialize)]
pub struct ContextQuery {
    #[serde(default)]
    pub context: String,
}

/// DELETE /roles/:name/user/:email - take a role away from a user
pub async fn dissociate(
    State(state): State<AppState>,
    caller: Caller,
    Path((name, email)): Path<(String, String)>,
    Query(query): Query<ContextQuery>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, ROLE_UPDATE_DISSOCIATE, &[])?;
    let roles = state.roles();
    let role = roles.get(&name).await?;
    can_use_role(&caller.token, &role, &query.context)?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(role_target(&name), ROLE_UPDATE_DISSOCIATE, role_allowed()).input(&input),
    )
    .await?;
    finish(&evt, async {
        roles.dissociate(&email, &role.name, &query.context).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PermissionSchemeData {
    pub name: String,
    pub contexts: Vec<String>,
}

/// GET /permissions - every known permission scheme with its allowed contexts
pub async fn list_permissions(
    caller: Caller,
) -> Result<ApiResponse<Vec<PermissionSchemeData>>, ApiError> {
    require(&caller.token, ROLE_UPDATE, &[])?;
    let registry = registry();
    let schemes = registry
        .all()
        .into_iter()
        .map(|s| PermissionSchemeData {
            name: s.full_name().to_string(),
            contexts: registry
                .allowed_contexts(s.full_name())
                .iter()
                .map(ToString::to_string)
                .collect(),
        })
        .collect();
    Ok(ApiResponse::success(schemes))
}

/// Role names given per role event, e.g. `team-create=deployer`.
fn event_roles(input: &RequestInput) -> Vec<(RoleEvent, String)> {
    RoleEvent::all()
        .into_iter()
        .flat_map(|event| {
            input
                .input_values(event.as_str())
                .into_iter()
                .filter(|r| !r.is_empty())
                .map(move |r| (event, r))
        })
        .collect()
}

/// POST /role/default - bind roles to role events
pub async fn add_default(
    State(state): State<AppState>,
    caller: Caller,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, ROLE_DEFAULT_CREATE, &[])?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            Target::new(TargetType::Role, ""),
            ROLE_DEFAULT_CREATE,
            role_allowed(),
        )
        .input(&input),
    )
    .await?;
    finish(&evt, async {
        let roles = state.roles();
        for (event, role) in event_roles(&input) {
            roles.add_event(&role, event).await.map_err(role_as_input)?;
        }
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// DELETE /role/default - unbind roles from role events
pub async fn remove_default(
    State(state): State<AppState>,
    caller: Caller,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, ROLE_DEFAULT_DELETE, &[])?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            Target::new(TargetType::Role, ""),
            ROLE_DEFAULT_DELETE,
            role_allowed(),
        )
        .input(&input),
    )
    .await?;
    finish(&evt, async {
        let roles = state.roles();
        for (event, role) in event_roles(&input) {
            roles.remove_event(&role, event).await.map_err(role_as_input)?;
        }
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// GET /role/default - roles bound to role events, grouped by event
pub async fn list_default(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<ApiResponse<HashMap<String, Vec<String>>>, ApiError> {
    require_any(&caller.token, &[ROLE_DEFAULT_CREATE, ROLE_DEFAULT_DELETE])?;
    let mut grouped: HashMap<String, Vec<String>> = RoleEvent::all()
        .into_iter()
        .map(|e| (e.as_str().to_string(), Vec::new()))
        .collect();
    for role in state.roles().defaults().await? {
        for event in &role.events {
            grouped
                .entry(event.as_str().to_string())
                .or_default()
                .push(role.name.clone());
        }
    }
    Ok(ApiResponse::success(grouped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::scheme::{APP_BUILD, APP_UPDATE};
    use crate::permission::{Context, Permission};
    use crate::storage::models::User;

    fn token_with(perms: Vec<Permission>) -> Token {
        let user = User {
            email: "admin@example.com".into(),
            password: String::new(),
            api_key: None,
            roles: vec![],
        };
        Token::for_user("t0k3n", user, perms)
    }

    fn deployer() -> Role {
        let mut role = Role::new("deployer", "team", "").unwrap();
        role.add_permissions(registry(), &[APP_UPDATE.to_string(), APP_BUILD.to_string()])
            .unwrap();
        role
    }

    #[test]
    fn test_can_use_role_needs_every_permission() {
        let role = deployer();
        let holder = token_with(vec![Permission::new(APP_UPDATE, Context::team("acme"))]);
        let err = can_use_role(&holder, &role, "acme").unwrap_err();
        assert_eq!(err.status_code(), 403);
        assert_eq!(
            err.to_string(),
            "User not authorized to use permission app.build(team acme)"
        );

        let parent = token_with(vec![Permission::new("app", Context::team("acme"))]);
        assert!(can_use_role(&parent, &role, "acme").is_ok());
        assert!(can_use_role(&parent, &role, "other").is_err());
    }
}
