use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{request_meta, require, require_visible, start_event, Audit};
use crate::auth::Token;
use crate::error::ApiError;
use crate::event::{finish, AllowedPermission, Event, Target, TargetType};
use crate::input::{FieldValue, InputField, RequestInput};
use crate::middleware::{list_or_no_content, ApiResponse, Caller};
use crate::permission::scheme::{
    SERVICE_CREATE, SERVICE_DELETE, SERVICE_INSTANCE_READ, SERVICE_READ, SERVICE_READ_DOC,
    SERVICE_READ_EVENTS, SERVICE_READ_PLANS, SERVICE_UPDATE, SERVICE_UPDATE_DOC,
    SERVICE_UPDATE_GRANT_ACCESS, SERVICE_UPDATE_PROXY, SERVICE_UPDATE_REVOKE_ACCESS,
};
use crate::permission::{check, team_for_permission, Context};
use crate::proxy::{ProxyContext, ProxyRequest};
use crate::services::ServicePlan;
use crate::state::AppState;
use crate::storage::models::{Service, ServiceInstance};

/// Contexts a service is reachable through: itself and its owner teams.
pub(crate) fn service_contexts(service: &Service) -> Vec<Context> {
    let mut contexts = vec![Context::service(&service.name)];
    contexts.extend(Context::teams(&service.owner_teams));
    contexts
}

/// Contexts a service instance is reachable through: itself and the teams
/// sharing it.
pub(crate) fn instance_contexts(instance: &ServiceInstance) -> Vec<Context> {
    let mut contexts = vec![Context::service_instance(instance.context_value())];
    contexts.extend(Context::teams(&instance.teams));
    contexts
}

fn service_target(name: &str) -> Target {
    Target::new(TargetType::Service, name)
}

fn service_allowed(service: &Service) -> AllowedPermission {
    AllowedPermission::new(SERVICE_READ_EVENTS, service_contexts(service))
}

/// Unrestricted services are usable by everyone; restricted ones only by
/// readers of the service or of a team granted access.
pub(crate) fn service_visible(token: &Token, service: &Service) -> bool {
    if !service.is_restricted {
        return true;
    }
    let mut contexts = service_contexts(service);
    contexts.extend(Context::teams(&service.teams));
    check(token, SERVICE_READ, &contexts)
}

/// Forwarding metadata for back-end calls made on the caller's behalf.
pub(crate) fn proxy_context(caller: &Caller, evt: Option<&Event>) -> ProxyContext {
    ProxyContext {
        user: Some(caller.token.user_name().to_string()),
        event_id: evt.map(Event::id),
        request_id: caller.request_id.as_ref().and_then(|(name, value)| {
            HeaderName::from_bytes(name.as_bytes())
                .ok()
                .map(|name| (name, value.clone()))
        }),
    }
}

/// Start data for an audited proxy call: method first, then every input field.
pub(crate) fn proxy_custom_data(method: &Method, input: &RequestInput) -> Option<serde_json::Value> {
    let mut fields = vec![InputField::new("method", FieldValue::text(method.as_str()))];
    fields.extend(input.fields(&[]));
    serde_json::to_value(fields).ok()
}

pub(crate) fn is_audited_method(method: &Method) -> bool {
    *method != Method::GET && *method != Method::HEAD
}

#[derive(Debug, Serialize)]
pub struct ServiceModel {
    pub service: String,
    pub instances: Vec<String>,
    pub plans: Vec<String>,
    pub service_instances: Vec<ServiceInstance>,
}

/// GET /services - services the caller may use with the instances it can read
pub async fn list(State(state): State<AppState>, caller: Caller) -> Result<Response, ApiError> {
    let instances = state.instances().list().await?;
    let mut models = Vec::new();
    for service in state.catalog().list().await? {
        if !service_visible(&caller.token, &service) {
            continue;
        }
        let service_instances: Vec<ServiceInstance> = instances
            .iter()
            .filter(|i| i.service_name == service.name)
            .filter(|i| check(&caller.token, SERVICE_INSTANCE_READ, &instance_contexts(i)))
            .cloned()
            .collect();
        models.push(ServiceModel {
            service: service.name,
            instances: service_instances.iter().map(|i| i.name.clone()).collect(),
            plans: service_instances.iter().map(|i| i.plan_name.clone()).collect(),
            service_instances,
        });
    }
    Ok(list_or_no_content(models))
}

#[derive(Debug, Default, Deserialize)]
pub struct ServiceForm {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub endpoint: BTreeMap<String, String>,
    #[serde(default)]
    pub team: String,
    #[serde(default, alias = "multi-cluster")]
    pub multi_cluster: bool,
}

impl ServiceForm {
    fn into_service(self, owner_teams: Vec<String>) -> Service {
        Service {
            name: self.id,
            endpoints: self.endpoint,
            username: self.username,
            password: self.password,
            owner_teams,
            teams: Vec::new(),
            doc: String::new(),
            is_restricted: false,
            is_multi_cluster: self.multi_cluster,
        }
    }
}

/// POST /services - register a service back end
///
/// Without an explicit `team` the owner is the single team on which the
/// caller may create services.
pub async fn create(
    State(state): State<AppState>,
    caller: Caller,
    input: RequestInput,
) -> Result<Response, ApiError> {
    let form: ServiceForm = input.parse()?;
    let team = if form.team.is_empty() {
        team_for_permission(&caller.token, SERVICE_CREATE)?
    } else {
        form.team.clone()
    };
    require(&caller.token, SERVICE_CREATE, &[Context::team(&team)])?;
    let service = form.into_service(vec![team.clone()]);
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            service_target(&service.name),
            SERVICE_CREATE,
            service_allowed(&service),
        )
        .input(&input),
    )
    .await?;
    finish(&evt, async {
        state.catalog().create(service).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::CREATED.into_response())
}

/// PUT /services/:name - replace endpoints, credentials or owner team
pub async fn update(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let mut form: ServiceForm = input.parse()?;
    let current = state.catalog().get(&name).await?;
    require(&caller.token, SERVICE_UPDATE, &service_contexts(&current))?;
    let owner_teams = if form.team.is_empty() {
        current.owner_teams.clone()
    } else {
        require(&caller.token, SERVICE_UPDATE, &[Context::team(&form.team)])?;
        vec![form.team.clone()]
    };
    form.id = name.clone();
    let mut service = form.into_service(owner_teams);
    service.is_restricted = current.is_restricted;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(service_target(&name), SERVICE_UPDATE, service_allowed(&current))
            .input(&input),
    )
    .await?;
    finish(&evt, async {
        state.catalog().update(service).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// DELETE /services/:name - unregister a service with no instances
pub async fn remove(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let service = state.catalog().get(&name).await?;
    require(&caller.token, SERVICE_DELETE, &service_contexts(&service))?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(service_target(&name), SERVICE_DELETE, service_allowed(&service))
            .input(&input),
    )
    .await?;
    finish(&evt, async {
        state.catalog().delete(&name).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// GET /services/:name - instances of a service the caller can read
pub async fn info(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
) -> Result<ApiResponse<Vec<ServiceInstance>>, ApiError> {
    let service = state.catalog().get(&name).await?;
    if !service_visible(&caller.token, &service) {
        return Err(ApiError::not_found("Service not found"));
    }
    let instances = state
        .instances()
        .list()
        .await?
        .into_iter()
        .filter(|i| i.service_name == name)
        .filter(|i| check(&caller.token, SERVICE_INSTANCE_READ, &instance_contexts(i)))
        .collect();
    Ok(ApiResponse::success(instances))
}

/// GET /services/:name/plans - plans offered by the back end
pub async fn plans(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
) -> Result<ApiResponse<Vec<ServicePlan>>, ApiError> {
    let service = state.catalog().get(&name).await?;
    if !service_visible(&caller.token, &service) {
        require_visible(
            &caller.token,
            SERVICE_READ_PLANS,
            &service_contexts(&service),
            "Service not found",
        )?;
    }
    let plans = state
        .instances()
        .plans(&service, &request_meta(&caller, None))
        .await?;
    Ok(ApiResponse::success(plans))
}

/// GET /services/:name/doc
pub async fn doc(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
) -> Result<String, ApiError> {
    let service = state.catalog().get(&name).await?;
    if !service_visible(&caller.token, &service) {
        require_visible(
            &caller.token,
            SERVICE_READ_DOC,
            &service_contexts(&service),
            "Service not found",
        )?;
    }
    Ok(service.doc)
}

#[derive(Debug, Default, Deserialize)]
pub struct DocForm {
    #[serde(default)]
    pub doc: String,
}

/// PUT /services/:name/doc
pub async fn set_doc(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let DocForm { doc } = input.parse()?;
    let service = state.catalog().get(&name).await?;
    require(&caller.token, SERVICE_UPDATE_DOC, &service_contexts(&service))?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(service_target(&name), SERVICE_UPDATE_DOC, service_allowed(&service))
            .input(&input),
    )
    .await?;
    finish(&evt, async {
        state.catalog().set_doc(&name, doc).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// PUT /services/:service/team/:team - let a team use a restricted service
pub async fn grant_access(
    State(state): State<AppState>,
    caller: Caller,
    Path((name, team)): Path<(String, String)>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let service = state.catalog().get(&name).await?;
    require(
        &caller.token,
        SERVICE_UPDATE_GRANT_ACCESS,
        &service_contexts(&service),
    )?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            service_target(&name),
            SERVICE_UPDATE_GRANT_ACCESS,
            service_allowed(&service),
        )
        .input(&input),
    )
    .await?;
    finish(&evt, async {
        state.catalog().grant_access(&name, &team).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// DELETE /services/:service/team/:team
pub async fn revoke_access(
    State(state): State<AppState>,
    caller: Caller,
    Path((name, team)): Path<(String, String)>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let service = state.catalog().get(&name).await?;
    require(
        &caller.token,
        SERVICE_UPDATE_REVOKE_ACCESS,
        &service_contexts(&service),
    )?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            service_target(&name),
            SERVICE_UPDATE_REVOKE_ACCESS,
            service_allowed(&service),
        )
        .input(&input),
    )
    .await?;
    finish(&evt, async {
        state.catalog().revoke_access(&name, &team).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub callback: String,
}

/// ANY /services/proxy/service/:service?callback=/path - forward a call to
/// the service back end under its own credentials
///
/// Calls other than GET and HEAD are recorded as `service.update.proxy`
/// events.
pub async fn proxy(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    Query(query): Query<CallbackQuery>,
    method: Method,
    headers: HeaderMap,
    input: RequestInput,
) -> Result<Response, ApiError> {
    let service = state.catalog().get(&name).await?;
    require(&caller.token, SERVICE_UPDATE_PROXY, &service_contexts(&service))?;

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
            .proxy_service(&service, &query.callback, request, &ctx)
            .await?);
    }

    let mut opts = Audit::new(
        service_target(&name),
        SERVICE_UPDATE_PROXY,
        service_allowed(&service),
    )
    .opts(&caller);
    opts.custom_data = proxy_custom_data(&method, &input);
    let evt = state.journal.new_event(opts).await?;
    let ctx = proxy_context(&caller, Some(&evt));
    finish(&evt, async {
        Ok::<_, ApiError>(
            state
                .proxy
                .proxy_service(&service, &query.callback, request, &ctx)
                .await?,
        )
    })
    .await
}
