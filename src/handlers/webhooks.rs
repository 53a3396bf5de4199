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
    WEBHOOK_CREATE, WEBHOOK_DELETE, WEBHOOK_READ, WEBHOOK_UPDATE,
};
use crate::permission::{contexts_for_permission, team_for_permission, Context, ContextType};
use crate::state::AppState;
use crate::storage::models::Webhook;

fn webhook_target(name: &str) -> Target {
    Target::new(TargetType::Webhook, name)
}

fn webhook_allowed(team: &str) -> AllowedPermission {
    AllowedPermission::new(WEBHOOK_READ, vec![Context::team(team)])
}

/// GET /events/webhooks - webhooks of the teams the caller can read
pub async fn list(State(state): State<AppState>, caller: Caller) -> Result<Response, ApiError> {
    let contexts = contexts_for_permission(&caller.token, WEBHOOK_READ, &[ContextType::Team]);
    let teams: Option<Vec<String>> = if contexts.iter().any(|c| *c == Context::Global) {
        None
    } else {
        Some(contexts.iter().map(|c| c.value().to_string()).collect())
    };
    let hooks = state.webhooks().list(teams.as_deref()).await?;
    Ok(list_or_no_content(hooks))
}

/// GET /events/webhooks/:name
pub async fn info(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
) -> Result<ApiResponse<Webhook>, ApiError> {
    let hook = state.webhooks().get(&name).await?;
    require_visible(
        &caller.token,
        WEBHOOK_READ,
        &[Context::team(&hook.team_owner)],
        "webhook not found",
    )?;
    Ok(ApiResponse::success(hook))
}

/// POST /events/webhooks
pub async fn create(
    State(state): State<AppState>,
    caller: Caller,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let mut hook: Webhook = input.parse()?;
    if hook.team_owner.is_empty() {
        hook.team_owner = team_for_permission(&caller.token, WEBHOOK_CREATE)?;
    }
    require(&caller.token, WEBHOOK_CREATE, &[Context::team(&hook.team_owner)])?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            webhook_target(&hook.name),
            WEBHOOK_CREATE,
            webhook_allowed(&hook.team_owner),
        )
        .input(&input),
    )
    .await?;
    finish(&evt, async {
        state.webhooks().create(hook).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// PUT /events/webhooks/:name - replace a webhook; moving it to another
/// team needs the update permission on both teams
pub async fn update(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let current = state.webhooks().get(&name).await?;
    require(
        &caller.token,
        WEBHOOK_UPDATE,
        &[Context::team(&current.team_owner)],
    )?;
    let mut hook: Webhook = input.parse()?;
    hook.name = name;
    if hook.team_owner.is_empty() {
        hook.team_owner = current.team_owner.clone();
    } else if hook.team_owner != current.team_owner {
        require(&caller.token, WEBHOOK_UPDATE, &[Context::team(&hook.team_owner)])?;
    }
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            webhook_target(&hook.name),
            WEBHOOK_UPDATE,
            webhook_allowed(&current.team_owner),
        )
        .input(&input),
    )
    .await?;
    finish(&evt, async {
        state.webhooks().update(hook).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// DELETE /events/webhooks/:name
pub async fn remove(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let hook = state.webhooks().get(&name).await?;
    require(&caller.token, WEBHOOK_DELETE, &[Context::team(&hook.team_owner)])?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            webhook_target(&name),
            WEBHOOK_DELETE,
            webhook_allowed(&hook.team_owner),
        )
        .input(&input),
    )
    .await?;
    finish(&evt, async {
        state.webhooks().remove(&name).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}
