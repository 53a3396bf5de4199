use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};

use super::{require, require_visible, start_event, Audit};
use crate::error::ApiError;
use crate::event::{finish, AllowedPermission, Target, TargetType};
use crate::input::RequestInput;
use crate::middleware::{list_or_no_content, ApiResponse, Caller};
use crate::permission::scheme::{
    VOLUME_CREATE, VOLUME_DELETE, VOLUME_READ, VOLUME_READ_EVENTS, VOLUME_UPDATE,
};
use crate::permission::{check, team_for_permission, Context, ContextType};
use crate::services::{valid_name, ServiceError};
use crate::state::AppState;
use crate::storage::models::{Volume, VolumePlan};
use crate::storage::StorageError;

const VOLUME_NOT_FOUND: &str = "volume not found";

fn volume_contexts(volume: &Volume) -> Vec<Context> {
    vec![
        Context::new(ContextType::Volume, &volume.name),
        Context::team(&volume.team_owner),
        Context::pool(&volume.pool),
    ]
}

fn volume_target(name: &str) -> Target {
    Target::new(TargetType::Volume, name)
}

fn volume_allowed(volume: &Volume) -> AllowedPermission {
    AllowedPermission::new(VOLUME_READ_EVENTS, volume_contexts(volume))
}

async fn load(state: &AppState, name: &str) -> Result<Volume, ApiError> {
    state
        .storage
        .volumes
        .find(name)
        .await?
        .ok_or_else(|| ApiError::not_found(VOLUME_NOT_FOUND))
}

/// Name, pool and plan must all be known before a volume is stored.
async fn validate(state: &AppState, volume: &Volume) -> Result<(), ServiceError> {
    if !valid_name(&volume.name) {
        return Err(ServiceError::Validation(
            "Invalid volume name, volume name should have at most 40 characters, containing only lower case letters, numbers or dashes, starting with a letter.".into(),
        ));
    }
    if state.storage.pools.find(&volume.pool).await?.is_none() {
        return Err(ServiceError::NotFound("Pool does not exist.".into()));
    }
    if state.storage.teams.find(&volume.team_owner).await?.is_none() {
        return Err(ServiceError::NotFound("Team not found".into()));
    }
    if state.storage.volume_plans.find(&volume.plan).await?.is_none() {
        return Err(ServiceError::NotFound("volume plan not found".into()));
    }
    Ok(())
}

/// GET /volumes
pub async fn list(State(state): State<AppState>, caller: Caller) -> Result<Response, ApiError> {
    let volumes: Vec<Volume> = state
        .storage
        .volumes
        .list()
        .await?
        .into_iter()
        .filter(|v| check(&caller.token, VOLUME_READ, &volume_contexts(v)))
        .collect();
    Ok(list_or_no_content(volumes))
}

/// GET /volumes/:name
pub async fn info(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
) -> Result<ApiResponse<Volume>, ApiError> {
    let volume = load(&state, &name).await?;
    require_visible(
        &caller.token,
        VOLUME_READ,
        &volume_contexts(&volume),
        VOLUME_NOT_FOUND,
    )?;
    Ok(ApiResponse::success(volume))
}

/// POST /volumes
pub async fn create(
    State(state): State<AppState>,
    caller: Caller,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let mut volume: Volume = input.parse()?;
    volume.binds.clear();
    if volume.team_owner.is_empty() {
        volume.team_owner = team_for_permission(&caller.token, VOLUME_CREATE)?;
    }
    require(
        &caller.token,
        VOLUME_CREATE,
        &[Context::team(&volume.team_owner), Context::pool(&volume.pool)],
    )?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(volume_target(&volume.name), VOLUME_CREATE, volume_allowed(&volume))
            .input(&input),
    )
    .await?;
    finish(&evt, async {
        validate(&state, &volume).await?;
        match state.storage.volumes.insert(volume).await {
            Ok(()) => Ok::<_, ApiError>(()),
            Err(StorageError::AlreadyExists { .. }) => {
                Err(ApiError::conflict("volume already exists"))
            }
            Err(e) => Err(e.into()),
        }
    })
    .await?;
    Ok(StatusCode::CREATED)
}

/// POST /volumes/:name - change plan, options or team owner; binds are kept
pub async fn update(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let current = load(&state, &name).await?;
    require(&caller.token, VOLUME_UPDATE, &volume_contexts(&current))?;
    let mut volume: Volume = input.parse()?;
    volume.name = name;
    volume.binds = current.binds.clone();
    if volume.team_owner.is_empty() {
        volume.team_owner = current.team_owner.clone();
    }
    if volume.pool.is_empty() {
        volume.pool = current.pool.clone();
    }
    if volume.plan.is_empty() {
        volume.plan = current.plan.clone();
    }
    let evt = start_event(
        &state,
        &caller,
        Audit::new(volume_target(&volume.name), VOLUME_UPDATE, volume_allowed(&current))
            .input(&input),
    )
    .await?;
    finish(&evt, async {
        validate(&state, &volume).await?;
        state.storage.volumes.update(volume).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// DELETE /volumes/:name - only volumes no app binds
pub async fn remove(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let volume = load(&state, &name).await?;
    require(&caller.token, VOLUME_DELETE, &volume_contexts(&volume))?;
    if !volume.binds.is_empty() {
        return Err(ApiError::bad_request(
            "this volume is still bound, unbind it from every app before removing it",
        ));
    }
    let evt = start_event(
        &state,
        &caller,
        Audit::new(volume_target(&name), VOLUME_DELETE, volume_allowed(&volume)).input(&input),
    )
    .await?;
    finish(&evt, async {
        state.storage.volumes.remove(&name).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// GET /volumeplans - plans grouped by provisioner
pub async fn plans(
    State(state): State<AppState>,
    _caller: Caller,
) -> Result<ApiResponse<BTreeMap<String, Vec<VolumePlan>>>, ApiError> {
    let mut grouped: BTreeMap<String, Vec<VolumePlan>> = BTreeMap::new();
    for plan in state.storage.volume_plans.list().await? {
        grouped
            .entry(plan.provisioner.clone())
            .or_default()
            .push(plan);
    }
    Ok(ApiResponse::success(grouped))
}
