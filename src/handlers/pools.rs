use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;
use std::collections::BTreeMap;

use super::{require, require_visible, start_event, Audit};
use crate::error::ApiError;
use crate::event::{finish, AllowedPermission, Target, TargetType};
use crate::input::RequestInput;
use crate::middleware::{list_or_no_content, ApiResponse, Caller};
use crate::permission::scheme::{
    POOL_CREATE, POOL_DELETE, POOL_READ, POOL_READ_EVENTS, POOL_UPDATE, POOL_UPDATE_TEAM_ADD,
    POOL_UPDATE_TEAM_REMOVE,
};
use crate::permission::{check, Context};
use crate::state::AppState;
use crate::storage::models::Pool;

fn pool_contexts(pool: &Pool) -> Vec<Context> {
    let mut contexts = vec![Context::pool(&pool.name)];
    contexts.extend(Context::teams(&pool.teams));
    contexts
}

fn pool_target(name: &str) -> Target {
    Target::new(TargetType::Pool, name)
}

fn pool_allowed(name: &str) -> AllowedPermission {
    AllowedPermission::new(POOL_READ_EVENTS, vec![Context::pool(name)])
}

/// A flag that is only applied when the request carries it.
fn optional_bool(input: &RequestInput, name: &str) -> Result<Option<bool>, ApiError> {
    match input.input_value(name) {
        None => Ok(None),
        Some(_) => Ok(Some(input.input_bool(name)?)),
    }
}

/// GET /pools - public and default pools plus those the caller can read
pub async fn list(State(state): State<AppState>, caller: Caller) -> Result<Response, ApiError> {
    let pools: Vec<Pool> = state
        .pools()
        .list()
        .await?
        .into_iter()
        .filter(|p| p.public || p.default || check(&caller.token, POOL_READ, &pool_contexts(p)))
        .collect();
    Ok(list_or_no_content(pools))
}

#[derive(Debug, Default, Deserialize)]
pub struct PoolForm {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub provisioner: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// POST /pools - `default`, `public` and `force` are read as flags
pub async fn create(
    State(state): State<AppState>,
    caller: Caller,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, POOL_CREATE, &[])?;
    let form: PoolForm = input.parse()?;
    let pool = Pool {
        name: form.name,
        provisioner: form.provisioner,
        labels: form.labels,
        default: input.input_bool("default")?,
        public: input.input_bool("public")?,
        teams: Vec::new(),
    };
    let force = input.input_bool("force")?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(pool_target(&pool.name), POOL_CREATE, pool_allowed(&pool.name)).input(&input),
    )
    .await?;
    finish(&evt, async {
        state.pools().create(pool, force).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::CREATED)
}

/// GET /pools/:name
pub async fn info(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
) -> Result<ApiResponse<Pool>, ApiError> {
    let pool = state.pools().get(&name).await?;
    require_visible(
        &caller.token,
        POOL_READ,
        &pool_contexts(&pool),
        "Pool does not exist.",
    )?;
    Ok(ApiResponse::success(pool))
}

/// PUT /pools/:name - toggle the default and public flags
pub async fn update(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, POOL_UPDATE, &[Context::pool(&name)])?;
    let default = optional_bool(&input, "default")?;
    let public = optional_bool(&input, "public")?;
    let force = input.input_bool("force")?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(pool_target(&name), POOL_UPDATE, pool_allowed(&name)).input(&input),
    )
    .await?;
    finish(&evt, async {
        state.pools().update(&name, default, public, force).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// DELETE /pools/:name - only pools without apps
pub async fn remove(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, POOL_DELETE, &[Context::pool(&name)])?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(pool_target(&name), POOL_DELETE, pool_allowed(&name)).input(&input),
    )
    .await?;
    finish(&evt, async {
        state.pools().remove(&name).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// POST /pools/:name/team - allow teams to use a pool
pub async fn add_teams(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, POOL_UPDATE_TEAM_ADD, &[Context::pool(&name)])?;
    let teams = input.input_values("team");
    if teams.is_empty() {
        return Err(ApiError::bad_request("You must provide the team."));
    }
    let evt = start_event(
        &state,
        &caller,
        Audit::new(pool_target(&name), POOL_UPDATE_TEAM_ADD, pool_allowed(&name)).input(&input),
    )
    .await?;
    finish(&evt, async {
        state.pools().add_teams(&name, &teams).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// DELETE /pools/:name/team?team=a&team=b
pub async fn remove_teams(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, POOL_UPDATE_TEAM_REMOVE, &[Context::pool(&name)])?;
    let teams = input.input_values("team");
    if teams.is_empty() {
        return Err(ApiError::bad_request("You must provide the team."));
    }
    let evt = start_event(
        &state,
        &caller,
        Audit::new(pool_target(&name), POOL_UPDATE_TEAM_REMOVE, pool_allowed(&name))
            .input(&input),
    )
    .await?;
    finish(&evt, async {
        state.pools().remove_teams(&name, &teams).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}
