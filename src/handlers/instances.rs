use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use super::apps::app_contexts;
use super::jobs::job_contexts;
use super::services::{
    instance_contexts, is_audited_method, proxy_context, proxy_custom_data, service_visible,
    CallbackQuery,
};
use super::{request_meta, require, require_visible, start_event, stream_event, Audit};
use crate::error::ApiError;
use crate::event::{finish, AllowedPermission, ExtraTarget, Target, TargetType};
use crate::input::RequestInput;
use crate::middleware::{ApiResponse, Caller};
use crate::permission::scheme::{
    APP_READ_EVENTS, APP_UPDATE_BIND, APP_UPDATE_UNBIND, JOB_READ_EVENTS, JOB_UPDATE_BIND,
    JOB_UPDATE_UNBIND, SERVICE_INSTANCE_CREATE, SERVICE_INSTANCE_DELETE, SERVICE_INSTANCE_READ,
    SERVICE_INSTANCE_READ_EVENTS, SERVICE_INSTANCE_READ_STATUS, SERVICE_INSTANCE_UPDATE,
    SERVICE_INSTANCE_UPDATE_BIND, SERVICE_INSTANCE_UPDATE_DESCRIPTION,
    SERVICE_INSTANCE_UPDATE_GRANT, SERVICE_INSTANCE_UPDATE_PLAN, SERVICE_INSTANCE_UPDATE_PROXY,
    SERVICE_INSTANCE_UPDATE_REVOKE, SERVICE_INSTANCE_UPDATE_TAGS,
    SERVICE_INSTANCE_UPDATE_TEAMOWNER, SERVICE_INSTANCE_UPDATE_UNBIND,
};
use crate::permission::{team_for_permission, Context};
use crate::proxy::ProxyRequest;
use crate::services::ServicePlan;
use crate::state::AppState;
use crate::storage::models::{Service, ServiceInstance};

const INSTANCE_NOT_FOUND: &str = "service instance not found";

fn instance_target(instance: &ServiceInstance) -> Target {
    Target::new(TargetType::ServiceInstance, instance.context_value())
}

fn instance_allowed(instance: &ServiceInstance) -> AllowedPermission {
    AllowedPermission::new(SERVICE_INSTANCE_READ_EVENTS, instance_contexts(instance))
}

/// Service and instance named by the path.
async fn lookup(
    state: &AppState,
    service: &str,
    instance: &str,
) -> Result<(Service, ServiceInstance), ApiError> {
    let service = state.catalog().get(service).await?;
    let instance = state.instances().get(&service.name, instance).await?;
    Ok((service, instance))
}

#[derive(Debug, Default, Deserialize)]
pub struct NewInstance {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tag: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// POST /services/:service/instances - provision an instance
pub async fn create(
    State(state): State<AppState>,
    caller: Caller,
    Path(service_name): Path<String>,
    input: RequestInput,
) -> Result<Response, ApiError> {
    let form: NewInstance = input.parse()?;
    let service = state.catalog().get(&service_name).await?;
    if !service_visible(&caller.token, &service) {
        return Err(ApiError::not_found("Service not found"));
    }
    let owner = if form.owner.is_empty() {
        team_for_permission(&caller.token, SERVICE_INSTANCE_CREATE)?
    } else {
        form.owner
    };
    require(&caller.token, SERVICE_INSTANCE_CREATE, &[Context::team(&owner)])?;

    let mut tags = form.tags;
    tags.extend(form.tag);
    let instance = ServiceInstance {
        service_name: service.name.clone(),
        name: form.name,
        team_owner: owner,
        pool: form.pool,
        plan_name: form.plan,
        description: form.description,
        tags,
        parameters: form.parameters,
        ..Default::default()
    };
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            instance_target(&instance),
            SERVICE_INSTANCE_CREATE,
            instance_allowed(&instance),
        )
        .input(&input),
    )
    .await?;
    let meta = request_meta(&caller, Some(&evt));
    finish(&evt, async {
        state.instances().create(&service, instance, &meta).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::CREATED.into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct InstanceChange {
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "teamOwner")]
    pub teamowner: String,
    #[serde(default)]
    pub tag: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// PUT /services/:service/instances/:instance - change description, owner, tags or plan
///
/// Each changed attribute is checked against its own permission.
pub async fn update(
    State(state): State<AppState>,
    caller: Caller,
    Path((service_name, name)): Path<(String, String)>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let change: InstanceChange = input.parse()?;
    let mut tags = change.tags;
    tags.extend(change.tag);
    if change.description.is_empty()
        && change.teamowner.is_empty()
        && tags.is_empty()
        && change.plan.is_empty()
    {
        return Err(ApiError::bad_request(
            "Neither the description, team owner, tags or plan were set. You must define at least one.",
        ));
    }
    let (service, mut instance) = lookup(&state, &service_name, &name).await?;
    let contexts = instance_contexts(&instance);
    require_visible(&caller.token, SERVICE_INSTANCE_READ, &contexts, INSTANCE_NOT_FOUND)?;

    if !change.description.is_empty() {
        require(&caller.token, SERVICE_INSTANCE_UPDATE_DESCRIPTION, &contexts)?;
        instance.description = change.description;
    }
    if !change.teamowner.is_empty() {
        require(&caller.token, SERVICE_INSTANCE_UPDATE_TEAMOWNER, &contexts)?;
        if state.storage.teams.find(&change.teamowner).await?.is_none() {
            return Err(ApiError::bad_request(format!(
                "Team owner {:?} not found",
                change.teamowner
            )));
        }
        if !instance.teams.contains(&change.teamowner) {
            instance.teams.push(change.teamowner.clone());
        }
        instance.team_owner = change.teamowner;
    }
    if !tags.is_empty() {
        require(&caller.token, SERVICE_INSTANCE_UPDATE_TAGS, &contexts)?;
        instance.tags = tags;
    }
    if !change.plan.is_empty() {
        require(&caller.token, SERVICE_INSTANCE_UPDATE_PLAN, &contexts)?;
        instance.plan_name = change.plan;
    }
    if !change.parameters.is_empty() {
        instance.parameters = change.parameters;
    }

    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            instance_target(&instance),
            SERVICE_INSTANCE_UPDATE,
            instance_allowed(&instance),
        )
        .input(&input),
    )
    .await?;
    let meta = request_meta(&caller, Some(&evt));
    finish(&evt, async {
        state.instances().update(&service, instance, &meta).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// DELETE /services/:service/instances/:instance - deprovision an instance
///
/// With `unbindall=true` bound apps and jobs are unbound first and the
/// progress is streamed; otherwise a bound instance is refused.
pub async fn remove(
    State(state): State<AppState>,
    caller: Caller,
    Path((service_name, name)): Path<(String, String)>,
    input: RequestInput,
) -> Result<Response, ApiError> {
    let unbind_all = input.input_bool("unbindall")?;
    let (service, instance) = lookup(&state, &service_name, &name).await?;
    require(
        &caller.token,
        SERVICE_INSTANCE_DELETE,
        &instance_contexts(&instance),
    )?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            instance_target(&instance),
            SERVICE_INSTANCE_DELETE,
            instance_allowed(&instance),
        )
        .input(&input),
    )
    .await?;
    let meta = request_meta(&caller, Some(&evt));

    if !unbind_all {
        finish(&evt, async {
            state
                .instances()
                .remove(&service, &instance, false, &evt, &meta)
                .await?;
            Ok::<_, ApiError>(())
        })
        .await?;
        return Ok((StatusCode::OK, "service instance successfully removed\n").into_response());
    }

    let instances = state.instances();
    Ok(stream_event(&state, evt, move |evt, writer| async move {
        instances
            .remove(&service, &instance, true, &evt, &meta)
            .await?;
        writer.line("service instance successfully removed");
        Ok(())
    }))
}

#[derive(Debug, Serialize)]
pub struct InstanceInfo {
    pub apps: Vec<String>,
    pub jobs: Vec<String>,
    pub teams: Vec<String>,
    pub team_owner: String,
    pub description: String,
    pub plan_name: String,
    pub plan_description: String,
    pub pool: String,
    pub tags: Vec<String>,
    pub parameters: BTreeMap<String, String>,
}

/// GET /services/:service/instances/:instance - instance attributes and bindings
pub async fn info(
    State(state): State<AppState>,
    caller: Caller,
    Path((service_name, name)): Path<(String, String)>,
) -> Result<ApiResponse<InstanceInfo>, ApiError> {
    let (service, instance) = lookup(&state, &service_name, &name).await?;
    require_visible(
        &caller.token,
        SERVICE_INSTANCE_READ,
        &instance_contexts(&instance),
        INSTANCE_NOT_FOUND,
    )?;
    let mut plan_description = String::new();
    if !instance.plan_name.is_empty() {
        match state
            .instances()
            .plans(&service, &request_meta(&caller, None))
            .await
        {
            Ok(plans) => {
                if let Some(plan) = plans.into_iter().find(|p| p.name == instance.plan_name) {
                    plan_description = plan.description;
                }
            }
            Err(e) => warn!("unable to load plans of service {}: {}", service.name, e),
        }
    }
    Ok(ApiResponse::success(InstanceInfo {
        apps: instance.apps,
        jobs: instance.jobs,
        teams: instance.teams,
        team_owner: instance.team_owner,
        description: instance.description,
        plan_name: instance.plan_name,
        plan_description,
        pool: instance.pool,
        tags: instance.tags,
        parameters: instance.parameters,
    }))
}

/// GET /services/:service/instances/:instance/status - status reported by the back end
pub async fn status(
    State(state): State<AppState>,
    caller: Caller,
    Path((service_name, name)): Path<(String, String)>,
) -> Result<String, ApiError> {
    let (service, instance) = lookup(&state, &service_name, &name).await?;
    require_visible(
        &caller.token,
        SERVICE_INSTANCE_READ_STATUS,
        &instance_contexts(&instance),
        INSTANCE_NOT_FOUND,
    )?;
    let status = state
        .instances()
        .status(&service, &instance, &request_meta(&caller, None))
        .await?;
    Ok(format!("Service instance {:?} is {}", instance.name, status))
}

/// GET /services/:service/instances/:instance/plans
pub async fn plans(
    State(state): State<AppState>,
    caller: Caller,
    Path((service_name, name)): Path<(String, String)>,
) -> Result<ApiResponse<Vec<ServicePlan>>, ApiError> {
    let (service, instance) = lookup(&state, &service_name, &name).await?;
    require_visible(
        &caller.token,
        SERVICE_INSTANCE_READ,
        &instance_contexts(&instance),
        INSTANCE_NOT_FOUND,
    )?;
    let plans = state
        .instances()
        .plans(&service, &request_meta(&caller, None))
        .await?;
    Ok(ApiResponse::success(plans))
}

/// PUT /services/:service/instances/permission/:instance/:team - share an instance with a team
pub async fn grant_team(
    State(state): State<AppState>,
    caller: Caller,
    Path((service_name, name, team)): Path<(String, String, String)>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let (_, instance) = lookup(&state, &service_name, &name).await?;
    require(
        &caller.token,
        SERVICE_INSTANCE_UPDATE_GRANT,
        &instance_contexts(&instance),
    )?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            instance_target(&instance),
            SERVICE_INSTANCE_UPDATE_GRANT,
            instance_allowed(&instance),
        )
        .input(&input),
    )
    .await?;
    finish(&evt, async {
        state.instances().grant_team(&instance, &team).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// DELETE /services/:service/instances/permission/:instance/:team
pub async fn revoke_team(
    State(state): State<AppState>,
    caller: Caller,
    Path((service_name, name, team)): Path<(String, String, String)>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let (_, instance) = lookup(&state, &service_name, &name).await?;
    require(
        &caller.token,
        SERVICE_INSTANCE_UPDATE_REVOKE,
        &instance_contexts(&instance),
    )?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            instance_target(&instance),
            SERVICE_INSTANCE_UPDATE_REVOKE,
            instance_allowed(&instance),
        )
        .input(&input),
    )
    .await?;
    finish(&evt, async {
        state.instances().revoke_team(&instance, &team).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// Instance as an additional locked target of a binding event.
fn bound_instance(instance: &ServiceInstance) -> ExtraTarget {
    ExtraTarget {
        target: instance_target(instance),
        lock: true,
    }
}

/// PUT /services/:service/instances/:instance/apps/:app - bind an app (streamed)
pub async fn bind_app(
    State(state): State<AppState>,
    caller: Caller,
    Path((service_name, name, app_name)): Path<(String, String, String)>,
    input: RequestInput,
) -> Result<Response, ApiError> {
    let (service, instance) = lookup(&state, &service_name, &name).await?;
    let app = state.apps().get(&app_name).await?;
    caller.token.ensure_app(&app.name)?;
    require(
        &caller.token,
        SERVICE_INSTANCE_UPDATE_BIND,
        &instance_contexts(&instance),
    )?;
    let contexts = app_contexts(&app);
    require(&caller.token, APP_UPDATE_BIND, &contexts)?;

    let mut opts = Audit::new(
        Target::app(&app.name),
        APP_UPDATE_BIND,
        AllowedPermission::new(APP_READ_EVENTS, contexts),
    )
    .input(&input)
    .opts(&caller);
    opts.extra_targets.push(bound_instance(&instance));
    let evt = state.journal.new_event(opts).await?;
    let meta = request_meta(&caller, Some(&evt));
    let instances = state.instances();
    Ok(stream_event(&state, evt, move |evt, _writer| async move {
        instances
            .bind_app(&service, &instance, &app.name, &evt, &meta)
            .await?;
        Ok(())
    }))
}

/// DELETE /services/:service/instances/:instance/apps/:app - unbind an app (streamed)
pub async fn unbind_app(
    State(state): State<AppState>,
    caller: Caller,
    Path((service_name, name, app_name)): Path<(String, String, String)>,
    input: RequestInput,
) -> Result<Response, ApiError> {
    let (service, instance) = lookup(&state, &service_name, &name).await?;
    let app = state.apps().get(&app_name).await?;
    caller.token.ensure_app(&app.name)?;
    require(
        &caller.token,
        SERVICE_INSTANCE_UPDATE_UNBIND,
        &instance_contexts(&instance),
    )?;
    let contexts = app_contexts(&app);
    require(&caller.token, APP_UPDATE_UNBIND, &contexts)?;

    let mut opts = Audit::new(
        Target::app(&app.name),
        APP_UPDATE_UNBIND,
        AllowedPermission::new(APP_READ_EVENTS, contexts),
    )
    .input(&input)
    .opts(&caller);
    opts.extra_targets.push(bound_instance(&instance));
    let evt = state.journal.new_event(opts).await?;
    let meta = request_meta(&caller, Some(&evt));
    let instances = state.instances();
    Ok(stream_event(&state, evt, move |evt, _writer| async move {
        instances
            .unbind_app(&service, &instance, &app.name, &evt, &meta)
            .await?;
        Ok(())
    }))
}

/// PUT /services/:service/instances/:instance/jobs/:job - bind a job (streamed)
pub async fn bind_job(
    State(state): State<AppState>,
    caller: Caller,
    Path((service_name, name, job_name)): Path<(String, String, String)>,
    input: RequestInput,
) -> Result<Response, ApiError> {
    let (service, instance) = lookup(&state, &service_name, &name).await?;
    let job = state.jobs().get(&job_name).await?;
    require(
        &caller.token,
        SERVICE_INSTANCE_UPDATE_BIND,
        &instance_contexts(&instance),
    )?;
    let contexts = job_contexts(&job);
    require(&caller.token, JOB_UPDATE_BIND, &contexts)?;

    let mut opts = Audit::new(
        Target::new(TargetType::Job, &job.name),
        JOB_UPDATE_BIND,
        AllowedPermission::new(JOB_READ_EVENTS, contexts),
    )
    .input(&input)
    .opts(&caller);
    opts.extra_targets.push(bound_instance(&instance));
    let evt = state.journal.new_event(opts).await?;
    let meta = request_meta(&caller, Some(&evt));
    let instances = state.instances();
    Ok(stream_event(&state, evt, move |evt, _writer| async move {
        instances
            .bind_job(&service, &instance, &job.name, &evt, &meta)
            .await?;
        Ok(())
    }))
}

/// DELETE /services/:service/instances/:instance/jobs/:job - unbind a job (streamed)
pub async fn unbind_job(
    State(state): State<AppState>,
    caller: Caller,
    Path((service_name, name, job_name)): Path<(String, String, String)>,
    input: RequestInput,
) -> Result<Response, ApiError> {
    let (service, instance) = lookup(&state, &service_name, &name).await?;
    let job = state.jobs().get(&job_name).await?;
    require(
        &caller.token,
        SERVICE_INSTANCE_UPDATE_UNBIND,
        &instance_contexts(&instance),
    )?;
    let contexts = job_contexts(&job);
    require(&caller.token, JOB_UPDATE_UNBIND, &contexts)?;

    let mut opts = Audit::new(
        Target::new(TargetType::Job, &job.name),
        JOB_UPDATE_UNBIND,
        AllowedPermission::new(JOB_READ_EVENTS, contexts),
    )
    .input(&input)
    .opts(&caller);
    opts.extra_targets.push(bound_instance(&instance));
    let evt = state.journal.new_event(opts).await?;
    let meta = request_meta(&caller, Some(&evt));
    let instances = state.instances();
    Ok(stream_event(&state, evt, move |evt, _writer| async move {
        instances
            .unbind_job(&service, &instance, &job.name, &evt, &meta)
            .await?;
        Ok(())
    }))
}

#[allow(clippy::too_many_arguments)]
async fn proxy_to_instance(
    state: AppState,
    caller: Caller,
    service_name: String,
    name: String,
    path: String,
    method: Method,
    headers: HeaderMap,
    input: RequestInput,
) -> Result<Response, ApiError> {
    let (service, instance) = lookup(&state, &service_name, &name).await?;
    require(
        &caller.token,
        SERVICE_INSTANCE_UPDATE_PROXY,
        &instance_contexts(&instance),
    )?;
    let request = ProxyRequest {
        method: method.clone(),
        query: input.query_pairs().to_vec(),
        headers,
        body: input.body().clone(),
    };
    if !is_audited_method(&method) {
        let ctx = proxy_context(&caller, None);
        return Ok(state
            .proxy
            .proxy_instance(&service, &instance, &path, request, &ctx)
            .await?);
    }

    let mut opts = Audit::new(
        instance_target(&instance),
        SERVICE_INSTANCE_UPDATE_PROXY,
        instance_allowed(&instance),
    )
    .opts(&caller);
    opts.custom_data = proxy_custom_data(&method, &input);
    let evt = state.journal.new_event(opts).await?;
    let ctx = proxy_context(&caller, Some(&evt));
    finish(&evt, async {
        Ok::<_, ApiError>(
            state
                .proxy
                .proxy_instance(&service, &instance, &path, request, &ctx)
                .await?,
        )
    })
    .await
}

/// ANY /services/:service/proxy/:instance?callback=/path - forward a call
/// to the instance's resource on the back end
pub async fn proxy(
    State(state): State<AppState>,
    caller: Caller,
    Path((service_name, name)): Path<(String, String)>,
    Query(query): Query<CallbackQuery>,
    method: Method,
    headers: HeaderMap,
    input: RequestInput,
) -> Result<Response, ApiError> {
    proxy_to_instance(
        state,
        caller,
        service_name,
        name,
        query.callback,
        method,
        headers,
        input,
    )
    .await
}

/// ANY /services/:service/resources/:instance/*path - same as [`proxy`]
/// with the back-end path taken from the request path
pub async fn proxy_v2(
    State(state): State<AppState>,
    caller: Caller,
    Path((service_name, name, path)): Path<(String, String, String)>,
    method: Method,
    headers: HeaderMap,
    input: RequestInput,
) -> Result<Response, ApiError> {
    proxy_to_instance(state, caller, service_name, name, path, method, headers, input).await
}
