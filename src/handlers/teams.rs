use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use super::users::{api_user, ApiUser};
use super::{require, require_visible, start_event, Audit};
use crate::error::ApiError;
use crate::event::{finish, AllowedPermission, Target, TargetType};
use crate::input::RequestInput;
use crate::middleware::{list_or_no_content, ApiResponse, Caller};
use crate::permission::scheme::{
    registry, TEAM, TEAM_CREATE, TEAM_DELETE, TEAM_READ, TEAM_READ_EVENTS, TEAM_UPDATE,
};
use crate::permission::{check, check_from_perm_list, is_parent, Context, ContextType};
use crate::services::ServiceError;
use crate::state::AppState;
use crate::storage::models::{App, Pool, Team};

fn team_target(name: &str) -> Target {
    Target::new(TargetType::Team, name)
}

fn team_allowed(name: &str) -> AllowedPermission {
    AllowedPermission::new(TEAM_READ_EVENTS, vec![Context::team(name)])
}

#[derive(Debug, Serialize)]
pub struct TeamEntry {
    pub name: String,
    pub tags: Vec<String>,
    pub permissions: Vec<String>,
}

/// GET /teams - teams the caller holds any team-scoped permission on
///
/// Each entry lists the held schemes, collapsed so that a held parent hides
/// its children.
pub async fn list(State(state): State<AppState>, caller: Caller) -> Result<Response, ApiError> {
    let schemes = registry().permissions_with_context_type(ContextType::Team);
    let held = caller.token.permissions();
    let mut entries = Vec::new();
    for team in state.teams().list().await? {
        let ctx = [Context::team(&team.name)];
        let mut parent: Option<&str> = None;
        let mut permissions = Vec::new();
        for scheme in &schemes {
            let name = scheme.full_name();
            if parent.map(|p| is_parent(p, name)).unwrap_or(false) {
                continue;
            }
            if check_from_perm_list(held, name, &ctx) {
                parent = Some(name);
                permissions.push(name.to_string());
            }
        }
        if !permissions.is_empty() {
            entries.push(TeamEntry {
                name: team.name,
                tags: team.tags,
                permissions,
            });
        }
    }
    Ok(list_or_no_content(entries))
}

#[derive(Debug, Default, Deserialize)]
pub struct NewTeam {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tag: Vec<String>,
}

/// POST /teams - create a team owned by the caller
pub async fn create(
    State(state): State<AppState>,
    caller: Caller,
    input: RequestInput,
) -> Result<Response, ApiError> {
    require(&caller.token, TEAM_CREATE, &[])?;
    let NewTeam { name, mut tags, tag } = input.parse()?;
    tags.extend(tag);
    let evt = start_event(
        &state,
        &caller,
        Audit::new(team_target(&name), TEAM_CREATE, team_allowed(&name)).input(&input),
    )
    .await?;
    finish(&evt, async {
        let team = Team {
            name: name.clone(),
            tags,
            created_by: caller.token.user_name().to_string(),
        };
        state.teams().create(team, caller.token.user()).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::CREATED.into_response())
}

#[derive(Debug, Serialize)]
pub struct TeamInfo {
    pub name: String,
    pub tags: Vec<String>,
    pub users: Vec<ApiUser>,
    pub pools: Vec<Pool>,
    pub apps: Vec<App>,
}

/// GET /teams/:name - team with its members, pools and apps
pub async fn info(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
) -> Result<ApiResponse<TeamInfo>, ApiError> {
    let team = state.teams().get(&name).await?;
    let ctx = [Context::team(&team.name)];
    require_visible(&caller.token, TEAM_READ, &ctx, "Team not found")?;

    let apps = state
        .apps()
        .list()
        .await?
        .into_iter()
        .filter(|a| a.team_owner == team.name || a.teams.contains(&team.name))
        .collect();
    let pools = state
        .pools()
        .list()
        .await?
        .into_iter()
        .filter(|p| p.teams.contains(&team.name))
        .collect();

    let mut users = Vec::new();
    if check(&caller.token, TEAM, &ctx) {
        for user in state.storage.users.list().await? {
            let mut member = false;
            for assignment in &user.roles {
                if let Some(role) = state.storage.roles.find(&assignment.name).await? {
                    member = role.context_type == ContextType::Global
                        || (role.context_type == ContextType::Team
                            && assignment.context_value == team.name);
                }
                if member {
                    break;
                }
            }
            if !member {
                continue;
            }
            if let Some(data) =
                api_user(&state.storage, Some(caller.token.permissions()), &user, true).await?
            {
                users.push(data);
            }
        }
    }

    Ok(ApiResponse::success(TeamInfo {
        name: team.name,
        tags: team.tags,
        users,
        pools,
        apps,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct TeamChange {
    #[serde(default, alias = "NewName")]
    pub new_name: String,
    #[serde(default, alias = "Tags")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tag: Vec<String>,
}

/// PUT /teams/:name - rename a team and/or replace its tags
pub async fn update(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let TeamChange {
        new_name,
        mut tags,
        tag,
    } = input.parse()?;
    tags.extend(tag);
    require(&caller.token, TEAM_UPDATE, &[Context::team(&name)])?;
    state.teams().get(&name).await?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(team_target(&name), TEAM_UPDATE, team_allowed(&name)).input(&input),
    )
    .await?;
    finish(&evt, async {
        let new_name = Some(new_name).filter(|n| !n.is_empty());
        state.teams().update(&name, new_name, Some(tags)).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// DELETE /teams/:name - remove a team nothing references
pub async fn remove(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let not_found = format!("Team {:?} not found.", name);
    require_visible(&caller.token, TEAM_DELETE, &[Context::team(&name)], &not_found)?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(team_target(&name), TEAM_DELETE, team_allowed(&name)).input(&input),
    )
    .await?;
    finish(&evt, async {
        state.teams().remove(&name).await.map_err(|e| match e {
            ServiceError::NotFound(_) => ApiError::not_found(not_found.clone()),
            other => other.into(),
        })
    })
    .await?;
    Ok(StatusCode::OK)
}
