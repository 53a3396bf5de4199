//! Resource plans and platforms.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};

use super::{require, start_event, Audit};
use crate::error::ApiError;
use crate::event::{finish, AllowedPermission, Target, TargetType};
use crate::input::RequestInput;
use crate::middleware::{list_or_no_content, Caller};
use crate::permission::scheme::{
    PLAN_CREATE, PLAN_DELETE, PLAN_READ, PLATFORM_CREATE, PLATFORM_DELETE, PLATFORM_READ,
    PLATFORM_UPDATE,
};
use crate::permission::check;
use crate::services::valid_name;
use crate::state::AppState;
use crate::storage::models::{Plan, Platform};
use crate::storage::StorageError;

fn plan_allowed() -> AllowedPermission {
    AllowedPermission::new(PLAN_READ, vec![])
}

fn platform_allowed() -> AllowedPermission {
    AllowedPermission::new(PLATFORM_READ, vec![])
}

/// GET /plans
pub async fn list_plans(
    State(state): State<AppState>,
    _caller: Caller,
) -> Result<Response, ApiError> {
    let mut plans = state.storage.plans.list().await?;
    plans.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(list_or_no_content(plans))
}

/// POST /plans - only one plan may be the default
pub async fn create_plan(
    State(state): State<AppState>,
    caller: Caller,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, PLAN_CREATE, &[])?;
    let plan: Plan = input.parse()?;
    if plan.name.is_empty() {
        return Err(ApiError::bad_request("plan must have a name"));
    }
    if plan.memory < 0 || plan.cpu_milli < 0 {
        return Err(ApiError::bad_request("plan limits may not be negative"));
    }
    let evt = start_event(
        &state,
        &caller,
        Audit::new(Target::new(TargetType::Plan, &plan.name), PLAN_CREATE, plan_allowed())
            .input(&input),
    )
    .await?;
    finish(&evt, async {
        if plan.default {
            let existing = state.storage.plans.list().await?;
            if existing.iter().any(|p| p.default) {
                return Err(ApiError::conflict("Default plan already exists."));
            }
        }
        match state.storage.plans.insert(plan).await {
            Ok(()) => Ok::<_, ApiError>(()),
            Err(StorageError::AlreadyExists { .. }) => {
                Err(ApiError::conflict("plan already exists"))
            }
            Err(e) => Err(e.into()),
        }
    })
    .await?;
    Ok(StatusCode::CREATED)
}

/// DELETE /plans/:name
pub async fn remove_plan(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, PLAN_DELETE, &[])?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(Target::new(TargetType::Plan, &name), PLAN_DELETE, plan_allowed())
            .input(&input),
    )
    .await?;
    finish(&evt, async {
        state.storage.plans.remove(&name).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// GET /platforms - disabled platforms are only listed for platform admins
pub async fn list_platforms(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Response, ApiError> {
    let admin = check(&caller.token, PLATFORM_UPDATE, &[]);
    let platforms: Vec<Platform> = state
        .storage
        .platforms
        .list()
        .await?
        .into_iter()
        .filter(|p| admin || !p.disabled)
        .collect();
    Ok(list_or_no_content(platforms))
}

/// POST /platforms
pub async fn create_platform(
    State(state): State<AppState>,
    caller: Caller,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, PLATFORM_CREATE, &[])?;
    let platform: Platform = input.parse()?;
    if !valid_name(&platform.name) {
        return Err(ApiError::bad_request(
            "Invalid platform name, should have at most 40 characters, containing only lower case letters, numbers or dashes, starting with a letter.",
        ));
    }
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            Target::new(TargetType::Platform, &platform.name),
            PLATFORM_CREATE,
            platform_allowed(),
        )
        .input(&input),
    )
    .await?;
    finish(&evt, async {
        match state.storage.platforms.insert(platform).await {
            Ok(()) => Ok::<_, ApiError>(()),
            Err(StorageError::AlreadyExists { .. }) => {
                Err(ApiError::conflict("Duplicate platform"))
            }
            Err(e) => Err(ApiError::from(e)),
        }
    })
    .await?;
    Ok(StatusCode::OK)
}

/// PUT /platforms/:name - enable, disable or point at another image
pub async fn update_platform(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, PLATFORM_UPDATE, &[])?;
    let mut platform = state.storage.platforms.get(&name).await?;
    if input.input_value("disabled").is_some() {
        platform.disabled = input.input_bool("disabled")?;
    }
    if let Some(image) = input.input_value("image").filter(|i| !i.is_empty()) {
        platform.image = image;
    }
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            Target::new(TargetType::Platform, &name),
            PLATFORM_UPDATE,
            platform_allowed(),
        )
        .input(&input),
    )
    .await?;
    finish(&evt, async {
        state.storage.platforms.update(platform).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// DELETE /platforms/:name - refused while apps use it
pub async fn remove_platform(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, PLATFORM_DELETE, &[])?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            Target::new(TargetType::Platform, &name),
            PLATFORM_DELETE,
            platform_allowed(),
        )
        .input(&input),
    )
    .await?;
    finish(&evt, async {
        let in_use = state
            .storage
            .apps
            .list()
            .await?
            .iter()
            .any(|a| a.platform == name);
        if in_use {
            return Err(ApiError::forbidden(
                "Failed to remove platform: App using platform.",
            ));
        }
        state.storage.platforms.remove(&name).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}
