use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

use super::{require, start_event, Audit};
use crate::auth::password::generate_secret;
use crate::auth::{AuthError, Token};
use crate::error::ApiError;
use crate::event::{finish, AllowedPermission, Event, Opts, Owner, OwnerType, Target, TargetType};
use crate::input::RequestInput;
use crate::middleware::{ApiResponse, Caller, ClientAddr, MaybeToken};
use crate::permission::scheme::{
    USER_CREATE, USER_DELETE, USER_READ_EVENTS, USER_UPDATE, USER_UPDATE_PASSWORD,
    USER_UPDATE_RESET, USER_UPDATE_TOKEN,
};
use crate::permission::{check, check_from_perm_list, Context, ContextType, Permission, RoleEvent};
use crate::services::teams::assign_event_roles;
use crate::state::AppState;
use crate::storage::models::User;
use crate::storage::Storage;

fn user_target(email: &str) -> Target {
    Target::new(TargetType::User, email)
}

fn user_allowed(email: &str) -> AllowedPermission {
    AllowedPermission::new(USER_READ_EVENTS, vec![Context::user(email)])
}

/// Event for actions performed on behalf of a user who is not logged in.
async fn anonymous_event(
    state: &AppState,
    email: &str,
    kind: &str,
    remote_addr: Option<String>,
    input: &RequestInput,
    sensitive: &[&str],
) -> Result<Event, ApiError> {
    let custom_data = serde_json::to_value(input.fields(sensitive)).ok();
    let opts = Opts {
        target: Some(user_target(email)),
        kind: Some(kind.to_string()),
        owner: Some(Owner {
            owner_type: OwnerType::User,
            name: email.to_string(),
        }),
        remote_addr,
        custom_data,
        allowed: user_allowed(email),
        ..Default::default()
    };
    Ok(state.journal.new_event(opts).await?)
}

async fn find_user(storage: &Storage, email: &str) -> Result<User, ApiError> {
    storage
        .users
        .find(email)
        .await?
        .ok_or_else(|| AuthError::UserNotFound.into())
}

#[derive(Debug, Deserialize)]
pub struct NewUser {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

/// POST /users - register a user
///
/// With registration disabled only a caller holding `user.create` may
/// register new users.
pub async fn create(
    State(state): State<AppState>,
    MaybeToken(token): MaybeToken,
    ClientAddr(remote_addr): ClientAddr,
    input: RequestInput,
) -> Result<Response, ApiError> {
    if !state.config.auth.user_registration {
        let allowed = token
            .as_ref()
            .map(|t| check(t, USER_CREATE, &[]))
            .unwrap_or(false);
        if !allowed {
            return Err(AuthError::RegistrationDisabled.into());
        }
    }
    let user: NewUser = input.parse()?;
    let evt = anonymous_event(&state, &user.email, USER_CREATE, remote_addr, &input, &[]).await?;
    finish(&evt, async {
        let created = state
            .auth
            .scheme()
            .create(&user.email, &user.password)
            .await?;
        assign_event_roles(&state.storage, &created.email, RoleEvent::UserCreate, "").await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::CREATED.into_response())
}

#[derive(Debug, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub password: String,
}

/// POST /users/:email/tokens - exchange credentials for a token
pub async fn login(
    State(state): State<AppState>,
    Path(email): Path<String>,
    input: RequestInput,
) -> Result<ApiResponse<Value>, ApiError> {
    let credentials: Credentials = input.parse()?;
    let token = state
        .auth
        .scheme()
        .login(&email, &credentials.password)
        .await?;
    Ok(ApiResponse::success(json!({ "token": token })))
}

/// DELETE /users/tokens - invalidate the caller's token
pub async fn logout(State(state): State<AppState>, caller: Caller) -> Result<StatusCode, ApiError> {
    state.auth.scheme().logout(caller.token.value()).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct PasswordChange {
    #[serde(default)]
    pub old: String,
    #[serde(default)]
    pub new: String,
    #[serde(default)]
    pub confirm: String,
}

/// PUT /users/password - change the caller's password
pub async fn change_password(
    State(state): State<AppState>,
    caller: Caller,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let scheme = state.auth.scheme().clone();
    let managed = scheme.managed().ok_or(AuthError::NotManaged)?;
    let email = caller.token.user_name().to_string();
    let evt = start_event(
        &state,
        &caller,
        Audit::new(user_target(&email), USER_UPDATE_PASSWORD, user_allowed(&email)),
    )
    .await?;
    finish(&evt, async {
        let change: PasswordChange = input.parse()?;
        if change.old.is_empty() || change.new.is_empty() {
            return Err(ApiError::bad_request(
                "Both the old and the new passwords are required.",
            ));
        }
        if change.new != change.confirm {
            return Err(ApiError::bad_request(
                "New password and password confirmation didn't match.",
            ));
        }
        let user = caller
            .token
            .user()
            .ok_or_else(ApiError::permission_denied)?;
        managed
            .change_password(user, &change.old, &change.new)
            .await?;
        Ok(())
    })
    .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Default, Deserialize)]
pub struct ResetRequest {
    #[serde(default)]
    pub token: String,
}

/// POST /users/:email/password - start a reset, or finish it when a token is given
pub async fn reset_password(
    State(state): State<AppState>,
    Path(email): Path<String>,
    ClientAddr(remote_addr): ClientAddr,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let scheme = state.auth.scheme().clone();
    let managed = scheme.managed().ok_or(AuthError::NotManaged)?;
    let request: ResetRequest = input.parse()?;
    let evt = anonymous_event(&state, &email, USER_UPDATE_RESET, remote_addr, &input, &[]).await?;
    finish(&evt, async {
        let user = find_user(&state.storage, &email).await?;
        if request.token.is_empty() {
            managed.start_password_reset(&user).await?;
        } else {
            managed.reset_password(&user, &request.token).await?;
        }
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Default, Deserialize)]
pub struct UserQuery {
    pub user: Option<String>,
}

/// GET /users/api-key - show the API key of the caller, or of `?user=`
pub async fn show_api_key(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<UserQuery>,
) -> Result<ApiResponse<String>, ApiError> {
    let email = match query.user.filter(|u| !u.is_empty()) {
        Some(email) => {
            require(&caller.token, USER_UPDATE_TOKEN, &[Context::user(&email)])?;
            email
        }
        None => caller.token.user_name().to_string(),
    };
    let mut user = find_user(&state.storage, &email).await?;
    let key = match &user.api_key {
        Some(key) => key.clone(),
        None => {
            let key = generate_secret(20);
            user.api_key = Some(key.clone());
            state.storage.users.update(user).await?;
            key
        }
    };
    Ok(ApiResponse::success(key))
}

/// POST /users/api-key - regenerate the API key of the caller, or of `?user=`
pub async fn regenerate_api_key(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<UserQuery>,
    input: RequestInput,
) -> Result<ApiResponse<String>, ApiError> {
    let email = query
        .user
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| caller.token.user_name().to_string());
    require(&caller.token, USER_UPDATE_TOKEN, &[Context::user(&email)])?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(user_target(&email), USER_UPDATE_TOKEN, user_allowed(&email)).input(&input),
    )
    .await?;
    let key = finish(&evt, async {
        let mut user = find_user(&state.storage, &email).await?;
        let key = generate_secret(20);
        user.api_key = Some(key.clone());
        state.storage.users.update(user).await?;
        Ok::<_, ApiError>(key)
    })
    .await?;
    Ok(ApiResponse::success(key))
}

/// DELETE /users - remove the caller, or `?user=`
pub async fn remove(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<UserQuery>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let email = query
        .user
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| caller.token.user_name().to_string());
    require(&caller.token, USER_DELETE, &[Context::user(&email)])?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(user_target(&email), USER_DELETE, user_allowed(&email)).input(&input),
    )
    .await?;
    finish(&evt, async {
        let user = find_user(&state.storage, &email).await?;
        state.auth.scheme().remove(&user).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RolePermissionData {
    pub name: String,
    pub context_type: String,
    pub context_value: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ApiUser {
    pub email: String,
    pub roles: Vec<RolePermissionData>,
    pub permissions: Vec<RolePermissionData>,
    pub groups: Vec<String>,
}

/// Describe `user` as seen by a reader holding `reader_perms`.
///
/// A role is shown only when the reader holds every permission it grants.
/// Unless `include_all`, users whose visible roles are all global are
/// hidden.
pub(crate) async fn api_user(
    storage: &Storage,
    reader_perms: Option<&[Permission]>,
    user: &User,
    include_all: bool,
) -> Result<Option<ApiUser>, ApiError> {
    let mut out = ApiUser {
        email: user.email.clone(),
        roles: Vec::new(),
        permissions: Vec::new(),
        groups: Vec::new(),
    };
    let mut all_global = true;
    for assignment in &user.roles {
        let Some(role) = storage.roles.find(&assignment.name).await? else {
            continue;
        };
        let permissions = role.permissions_for(&assignment.context_value);
        if permissions.is_empty() && !include_all {
            continue;
        }
        let visible = reader_perms
            .map(|held| {
                permissions
                    .iter()
                    .all(|p| check_from_perm_list(held, &p.scheme, &[p.context.clone()]))
            })
            .unwrap_or(true);
        if !visible {
            continue;
        }
        out.roles.push(RolePermissionData {
            name: role.name.clone(),
            context_type: role.context_type.to_string(),
            context_value: assignment.context_value.clone(),
        });
        out.permissions.extend(permissions.iter().map(|p| RolePermissionData {
            name: p.scheme.clone(),
            context_type: p.context.context_type().to_string(),
            context_value: p.context.value().to_string(),
        }));
        if role.context_type != ContextType::Global {
            all_global = false;
        }
    }
    if !include_all && all_global {
        return Ok(None);
    }
    Ok(Some(out))
}

async fn self_info(state: &AppState, token: &Token) -> Result<ApiUser, ApiError> {
    let user = token.user().ok_or_else(ApiError::permission_denied)?;
    let user = find_user(&state.storage, &user.email).await?;
    api_user(&state.storage, Some(token.permissions()), &user, true)
        .await?
        .ok_or_else(|| ApiError::internal_server_error("unable to describe user"))
}

/// GET /users/info - the caller with its roles and permissions
pub async fn info(State(state): State<AppState>, caller: Caller) -> Result<ApiResponse<ApiUser>, ApiError> {
    Ok(ApiResponse::success(self_info(&state, &caller.token).await?))
}

/// GET /users - users visible to the caller, filtered by `userEmail`, `role` and `context`
pub async fn list(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<HashMap<String, String>>,
) -> Result<ApiResponse<Vec<ApiUser>>, ApiError> {
    let email = query.get("userEmail").map(String::as_str).unwrap_or("");
    let role = query.get("role").map(String::as_str).unwrap_or("");
    let context = query.get("context").map(String::as_str).unwrap_or("");

    let include_all = check(&caller.token, USER_UPDATE, &[]);
    let mut users = Vec::new();
    for user in state.storage.users.list().await? {
        let Some(data) =
            api_user(&state.storage, Some(caller.token.permissions()), &user, include_all).await?
        else {
            continue;
        };
        let selected = if email.is_empty() && role.is_empty() {
            true
        } else if !email.is_empty() && data.email == email {
            true
        } else {
            !role.is_empty()
                && data
                    .roles
                    .iter()
                    .any(|r| r.name == role && (context.is_empty() || r.context_value == context))
        };
        if selected {
            users.push(data);
        }
    }
    if users.is_empty() {
        if !context.is_empty() {
            return Err(ApiError::not_found("Wrong context being passed."));
        }
        users.push(self_info(&state, &caller.token).await?);
    }
    Ok(ApiResponse::success(users))
}

/// GET /auth/scheme - active authentication scheme
pub async fn auth_scheme(State(state): State<AppState>) -> ApiResponse<Value> {
    let scheme = state.auth.scheme();
    ApiResponse::success(json!({ "name": scheme.name(), "data": scheme.info() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::scheme::{registry, APP_CREATE, APP_DELETE};
    use crate::permission::{Role, RoleInstance};

    async fn storage_with_roles() -> Storage {
        let storage = Storage::memory();
        let mut creator = Role::new("creator", "team", "").unwrap();
        creator
            .add_permissions(registry(), &[APP_CREATE.to_string()])
            .unwrap();
        storage.roles.insert(creator).await.unwrap();
        let mut destroyer = Role::new("destroyer", "team", "").unwrap();
        destroyer
            .add_permissions(registry(), &[APP_DELETE.to_string()])
            .unwrap();
        storage.roles.insert(destroyer).await.unwrap();
        storage
    }

    fn user(roles: Vec<RoleInstance>) -> User {
        User {
            email: "a@example.com".into(),
            password: String::new(),
            api_key: None,
            roles,
        }
    }

    #[tokio::test]
    async fn test_api_user_hides_roles_the_reader_cannot_grant() {
        let storage = storage_with_roles().await;
        let target = user(vec![
            RoleInstance::new("creator", "acme"),
            RoleInstance::new("destroyer", "acme"),
        ]);
        let reader = vec![Permission::new(APP_CREATE, Context::team("acme"))];

        let data = api_user(&storage, Some(&reader), &target, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.roles.len(), 1);
        assert_eq!(data.roles[0].name, "creator");
        assert_eq!(data.roles[0].context_type, "team");
        assert_eq!(data.permissions[0].name, APP_CREATE);
    }

    #[tokio::test]
    async fn test_api_user_without_visible_roles_is_hidden() {
        let storage = storage_with_roles().await;
        let target = user(vec![RoleInstance::new("destroyer", "acme")]);
        let reader = vec![Permission::new(APP_CREATE, Context::team("acme"))];

        assert!(api_user(&storage, Some(&reader), &target, false)
            .await
            .unwrap()
            .is_none());
        let all = api_user(&storage, Some(&reader), &target, true)
            .await
            .unwrap()
            .unwrap();
        assert!(all.roles.is_empty());
    }
}
