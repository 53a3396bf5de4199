use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};

use super::{require, start_event, Audit};
use crate::error::ApiError;
use crate::event::{finish, AllowedPermission, Target, TargetType};
use crate::input::RequestInput;
use crate::middleware::{list_or_no_content, ApiResponse, Caller};
use crate::permission::scheme::{
    CLUSTER_CREATE, CLUSTER_DELETE, CLUSTER_READ, CLUSTER_READ_EVENTS, CLUSTER_UPDATE,
};
use crate::services::valid_name;
use crate::state::AppState;
use crate::storage::models::Cluster;

/// Fields that never reach the event journal.
const CLUSTER_SECRETS: [&str; 3] = ["clientkey", "cacert", "clientcert"];

fn cluster_target(name: &str) -> Target {
    Target::new(TargetType::Cluster, name)
}

fn cluster_allowed() -> AllowedPermission {
    AllowedPermission::new(CLUSTER_READ_EVENTS, vec![])
}

/// A cluster either serves every pool or a fixed list of them.
fn validate(state: &AppState, cluster: &Cluster) -> Result<(), ApiError> {
    if !valid_name(&cluster.name) {
        return Err(ApiError::bad_request(
            "Invalid cluster name, cluster name should have at most 40 characters, containing only lower case letters, numbers or dashes, starting with a letter.",
        ));
    }
    if cluster.default == !cluster.pools.is_empty() {
        return Err(ApiError::bad_request(
            "either default or a list of pools must be set",
        ));
    }
    state
        .provisioners
        .get(&cluster.provisioner)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(())
}

/// GET /provisioner/clusters
pub async fn list(State(state): State<AppState>, caller: Caller) -> Result<Response, ApiError> {
    require(&caller.token, CLUSTER_READ, &[])?;
    let clusters: Vec<Cluster> = state
        .storage
        .clusters
        .list()
        .await?
        .iter()
        .map(Cluster::redacted)
        .collect();
    Ok(list_or_no_content(clusters))
}

/// GET /provisioner/clusters/:name
pub async fn info(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
) -> Result<ApiResponse<Cluster>, ApiError> {
    require(&caller.token, CLUSTER_READ, &[])?;
    let cluster = state.storage.clusters.get(&name).await?;
    Ok(ApiResponse::success(cluster.redacted()))
}

/// POST /provisioner/clusters
pub async fn create(
    State(state): State<AppState>,
    caller: Caller,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, CLUSTER_CREATE, &[])?;
    let cluster: Cluster = input.parse()?;
    validate(&state, &cluster)?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(cluster_target(&cluster.name), CLUSTER_CREATE, cluster_allowed())
            .input(&input)
            .sensitive(&CLUSTER_SECRETS),
    )
    .await?;
    finish(&evt, async {
        state.storage.clusters.insert(cluster).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// POST /provisioner/clusters/:name - replace a cluster definition
pub async fn update(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, CLUSTER_UPDATE, &[])?;
    let mut cluster: Cluster = input.parse()?;
    cluster.name = name;
    validate(&state, &cluster)?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(cluster_target(&cluster.name), CLUSTER_UPDATE, cluster_allowed())
            .input(&input)
            .sensitive(&CLUSTER_SECRETS),
    )
    .await?;
    finish(&evt, async {
        state.storage.clusters.update(cluster).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// DELETE /provisioner/clusters/:name
pub async fn remove(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    require(&caller.token, CLUSTER_DELETE, &[])?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(cluster_target(&name), CLUSTER_DELETE, cluster_allowed()).input(&input),
    )
    .await?;
    finish(&evt, async {
        state.storage.clusters.remove(&name).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}
