//! Node side administration: node autoscale rules and node containers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::{require, require_visible, start_event, stream_event, Audit};
use crate::error::ApiError;
use crate::event::{finish, AllowedPermission, Filter, Target, TargetType};
use crate::input::RequestInput;
use crate::middleware::{list_or_no_content, ApiResponse, Caller};
use crate::permission::scheme::{
    EVENT_CANCEL, NODECONTAINER_CREATE, NODECONTAINER_DELETE, NODECONTAINER_READ,
    NODECONTAINER_UPDATE, NODECONTAINER_UPDATE_UPGRADE, NODE_AUTOSCALE_DELETE, NODE_AUTOSCALE_READ,
    NODE_AUTOSCALE_UPDATE, NODE_AUTOSCALE_UPDATE_RUN,
};
use crate::permission::{check, Context};
use crate::services::autoscale::AutoscaleConfig;
use crate::state::AppState;
use crate::storage::models::{NodeAutoscaleRule, NodeContainer};

/// Internal kind of events recorded by autoscale cycles.
pub const AUTOSCALE_KIND: &str = "autoscale";

/// Rules are scoped by pool; the rule with an empty filter applies everywhere.
fn rule_contexts(metadata_filter: &str) -> Vec<Context> {
    if metadata_filter.is_empty() {
        vec![]
    } else {
        vec![Context::pool(metadata_filter)]
    }
}

fn rule_target(metadata_filter: &str) -> Target {
    if metadata_filter.is_empty() {
        Target::new(TargetType::Global, "")
    } else {
        Target::new(TargetType::Pool, metadata_filter)
    }
}

/// GET /autoscale/config - scaler settings
pub async fn autoscale_config(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<ApiResponse<AutoscaleConfig>, ApiError> {
    require(&caller.token, NODE_AUTOSCALE_READ, &[])?;
    Ok(ApiResponse::success(state.node_autoscale().config().await?))
}

/// GET /autoscale/rules
pub async fn list_rules(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Response, ApiError> {
    let rules: Vec<NodeAutoscaleRule> = state
        .node_autoscale()
        .rules()
        .await?
        .into_iter()
        .filter(|r| check(&caller.token, NODE_AUTOSCALE_READ, &rule_contexts(&r.metadata_filter)))
        .collect();
    Ok(list_or_no_content(rules))
}

/// POST /autoscale/rules - add or replace the rule of a pool
pub async fn set_rule(
    State(state): State<AppState>,
    caller: Caller,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let rule: NodeAutoscaleRule = input.parse()?;
    let contexts = rule_contexts(&rule.metadata_filter);
    require(&caller.token, NODE_AUTOSCALE_UPDATE, &contexts)?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            rule_target(&rule.metadata_filter),
            NODE_AUTOSCALE_UPDATE,
            AllowedPermission::new(NODE_AUTOSCALE_READ, contexts),
        )
        .input(&input),
    )
    .await?;
    finish(&evt, async {
        state.node_autoscale().upsert(rule).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

async fn delete_rule(
    state: &AppState,
    caller: &Caller,
    metadata_filter: &str,
    input: &RequestInput,
) -> Result<StatusCode, ApiError> {
    let contexts = rule_contexts(metadata_filter);
    require(&caller.token, NODE_AUTOSCALE_DELETE, &contexts)?;
    let evt = start_event(
        state,
        caller,
        Audit::new(
            rule_target(metadata_filter),
            NODE_AUTOSCALE_DELETE,
            AllowedPermission::new(NODE_AUTOSCALE_READ, contexts),
        )
        .input(input),
    )
    .await?;
    finish(&evt, async {
        state.node_autoscale().remove(metadata_filter).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// DELETE /autoscale/rules/:id
pub async fn remove_rule(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    delete_rule(&state, &caller, &id, &input).await
}

/// DELETE /autoscale/rules - the rule with no pool filter
pub async fn remove_default_rule(
    State(state): State<AppState>,
    caller: Caller,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    delete_rule(&state, &caller, "", &input).await
}

/// POST /autoscale/run - one scaling cycle, streamed and cancelable
pub async fn run_autoscale(
    State(state): State<AppState>,
    caller: Caller,
    input: RequestInput,
) -> Result<Response, ApiError> {
    require(&caller.token, NODE_AUTOSCALE_UPDATE_RUN, &[])?;
    let mut opts = Audit::new(
        Target::new(TargetType::Global, ""),
        NODE_AUTOSCALE_UPDATE_RUN,
        AllowedPermission::new(NODE_AUTOSCALE_READ, vec![]),
    )
    .input(&input)
    .opts(&caller);
    opts.cancelable = true;
    opts.allowed_cancel = AllowedPermission::new(EVENT_CANCEL, vec![]);
    let evt = state.journal.new_event(opts).await?;
    let autoscale = state.node_autoscale();
    Ok(stream_event(&state, evt, move |evt, writer| async move {
        autoscale.run(&evt).await?;
        writer.line("autoscale cycle finished");
        Ok(())
    }))
}

/// GET /autoscale - past scaling cycles
pub async fn history(State(state): State<AppState>, caller: Caller) -> Result<Response, ApiError> {
    require(&caller.token, NODE_AUTOSCALE_READ, &[])?;
    let mut filter = Filter {
        kind_names: vec![AUTOSCALE_KIND.to_string(), NODE_AUTOSCALE_UPDATE_RUN.to_string()],
        ..Default::default()
    };
    filter.prune();
    let events = state.journal.list(&caller.token, &filter).await?;
    Ok(list_or_no_content(events))
}

fn container_contexts(pool: &str) -> Vec<Context> {
    if pool.is_empty() {
        vec![]
    } else {
        vec![Context::pool(pool)]
    }
}

fn container_target(name: &str) -> Target {
    Target::new(TargetType::NodeContainer, name)
}

fn container_allowed(pool: &str) -> AllowedPermission {
    AllowedPermission::new(NODECONTAINER_READ, container_contexts(pool))
}

/// GET /docker/nodecontainers
pub async fn list_containers(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Response, ApiError> {
    let containers: Vec<NodeContainer> = state
        .node_containers()
        .list()
        .await?
        .into_iter()
        .filter(|c| check(&caller.token, NODECONTAINER_READ, &container_contexts(&c.pool)))
        .collect();
    Ok(list_or_no_content(containers))
}

/// POST /docker/nodecontainers
pub async fn create_container(
    State(state): State<AppState>,
    caller: Caller,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let container: NodeContainer = input.parse()?;
    require(
        &caller.token,
        NODECONTAINER_CREATE,
        &container_contexts(&container.pool),
    )?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            container_target(&container.name),
            NODECONTAINER_CREATE,
            container_allowed(&container.pool),
        )
        .input(&input),
    )
    .await?;
    finish(&evt, async {
        state.node_containers().create(container).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// GET /docker/nodecontainers/:name - every pool configuration of a container
pub async fn container_info(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
) -> Result<ApiResponse<Vec<NodeContainer>>, ApiError> {
    let visible: Vec<NodeContainer> = state
        .node_containers()
        .info(&name)
        .await?
        .into_iter()
        .filter(|c| check(&caller.token, NODECONTAINER_READ, &container_contexts(&c.pool)))
        .collect();
    if visible.is_empty() {
        require_visible(&caller.token, NODECONTAINER_READ, &[], "node container not found")?;
    }
    Ok(ApiResponse::success(visible))
}

/// POST /docker/nodecontainers/:name - merge a configuration change
pub async fn update_container(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let mut container: NodeContainer = input.parse()?;
    container.name = name;
    require(
        &caller.token,
        NODECONTAINER_UPDATE,
        &container_contexts(&container.pool),
    )?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            container_target(&container.name),
            NODECONTAINER_UPDATE,
            container_allowed(&container.pool),
        )
        .input(&input),
    )
    .await?;
    finish(&evt, async {
        state.node_containers().update(container).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// DELETE /docker/nodecontainers/:name?pool=&kill=true
///
/// With `kill` the running containers are removed too and progress is
/// streamed; failures on several pools are reported together.
pub async fn remove_container(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<Response, ApiError> {
    let pool = input.input_value("pool").unwrap_or_default();
    let kill = input.input_bool("kill")?;
    require(&caller.token, NODECONTAINER_DELETE, &container_contexts(&pool))?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            container_target(&name),
            NODECONTAINER_DELETE,
            container_allowed(&pool),
        )
        .input(&input),
    )
    .await?;
    let containers = state.node_containers();
    if !kill {
        finish(&evt, async {
            containers.remove(&name, &pool, false, &evt).await?;
            Ok::<_, ApiError>(())
        })
        .await?;
        return Ok(StatusCode::OK.into_response());
    }
    Ok(stream_event(&state, evt, move |evt, _writer| async move {
        containers.remove(&name, &pool, true, &evt).await?;
        Ok(())
    }))
}

/// POST /docker/nodecontainers/:name/upgrade?pool= - recreate on every node (streamed)
pub async fn upgrade_container(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<Response, ApiError> {
    let pool = input.input_value("pool").unwrap_or_default();
    require(
        &caller.token,
        NODECONTAINER_UPDATE_UPGRADE,
        &container_contexts(&pool),
    )?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            container_target(&name),
            NODECONTAINER_UPDATE_UPGRADE,
            container_allowed(&pool),
        )
        .input(&input),
    )
    .await?;
    let containers = state.node_containers();
    Ok(stream_event(&state, evt, move |evt, _writer| async move {
        containers.upgrade(&name, &pool, &evt).await?;
        Ok(())
    }))
}
