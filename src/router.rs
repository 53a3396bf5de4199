use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    middleware::{from_fn, from_fn_with_state},
    routing::{any, delete, get, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::handlers::{
    apps, clusters, events, info, instances, jobs, logs, node, plans, pools, roles, services,
    teams, users, volumes, webhooks,
};
use crate::metrics;
use crate::middleware::{request_id_middleware, token_middleware, version_headers_middleware};
use crate::state::AppState;

/// Full API router with the global middleware stack.
pub fn app(state: AppState) -> Router {
    let body_limit = state.config.api.max_request_size_bytes;
    let cors = cors_layer(&state.config.security.cors_origins);

    Router::new()
        .merge(public_routes())
        .merge(user_routes())
        .merge(role_routes())
        .merge(service_routes())
        .merge(app_routes())
        .merge(infra_routes())
        .merge(event_routes())
        .merge(autoscale_routes("/autoscale"))
        .merge(autoscale_routes("/node/autoscale"))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            ServiceBuilder::new()
                .layer(from_fn_with_state(state.clone(), request_id_middleware))
                .layer(from_fn(version_headers_middleware))
                .layer(from_fn_with_state(state.clone(), token_middleware))
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("ignoring invalid CORS origin {:?}", o);
                None
            }
        })
        .collect();
    CorsLayer::permissive().allow_origin(AllowOrigin::list(allowed))
}

fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(info::index))
        .route("/healthcheck", get(info::healthcheck))
        .route("/info", get(info::info))
        .route("/metrics", get(metrics::handler))
        .route("/auth/scheme", get(users::auth_scheme))
        .route("/logs", get(logs::websocket))
}

fn user_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/users",
            get(users::list).post(users::create).delete(users::remove),
        )
        .route("/users/info", get(users::info))
        .route("/users/tokens", delete(users::logout))
        .route("/users/password", put(users::change_password))
        .route(
            "/users/api-key",
            get(users::show_api_key).post(users::regenerate_api_key),
        )
        .route("/users/:email/tokens", post(users::login))
        .route("/users/:email/password", post(users::reset_password))
        .route("/teams", get(teams::list).post(teams::create))
        .route(
            "/teams/:name",
            get(teams::info).put(teams::update).delete(teams::remove),
        )
}

fn role_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/roles",
            get(roles::list).post(roles::create).put(roles::update),
        )
        .route("/roles/:name", get(roles::info).delete(roles::remove))
        .route("/roles/:name/permissions", post(roles::add_permissions))
        .route(
            "/roles/:name/permissions/:permission",
            delete(roles::remove_permission),
        )
        .route("/roles/:name/user", post(roles::assign))
        .route("/roles/:name/user/:email", delete(roles::dissociate))
        .route(
            "/role/default",
            get(roles::list_default)
                .post(roles::add_default)
                .delete(roles::remove_default),
        )
        .route("/permissions", get(roles::list_permissions))
}

fn service_routes() -> Router<AppState> {
    Router::new()
        .route("/services", get(services::list).post(services::create))
        .route(
            "/services/:service",
            get(services::info)
                .put(services::update)
                .delete(services::remove),
        )
        .route("/services/:service/plans", get(services::plans))
        .route(
            "/services/:service/doc",
            get(services::doc).put(services::set_doc),
        )
        .route(
            "/services/:service/team/:team",
            put(services::grant_access).delete(services::revoke_access),
        )
        .route("/services/proxy/service/:service", any(services::proxy))
        .route("/services/:service/instances", post(instances::create))
        .route(
            "/services/:service/instances/:instance",
            get(instances::info)
                .put(instances::update)
                .delete(instances::remove),
        )
        .route(
            "/services/:service/instances/:instance/status",
            get(instances::status),
        )
        .route(
            "/services/:service/instances/:instance/plans",
            get(instances::plans),
        )
        .route(
            "/services/:service/instances/permission/:instance/:team",
            put(instances::grant_team).delete(instances::revoke_team),
        )
        .route(
            "/services/:service/instances/:instance/apps/:app",
            put(instances::bind_app).delete(instances::unbind_app),
        )
        .route(
            "/services/:service/instances/:instance/jobs/:job",
            put(instances::bind_job).delete(instances::unbind_job),
        )
        .route("/services/:service/proxy/:instance", any(instances::proxy))
        .route(
            "/services/:service/resources/:instance/*path",
            any(instances::proxy_v2),
        )
}

fn app_routes() -> Router<AppState> {
    Router::new()
        .route("/apps", get(apps::list).post(apps::create))
        .route(
            "/apps/:app",
            get(apps::info).put(apps::update).delete(apps::remove),
        )
        .route(
            "/apps/:app/units/autoscale",
            get(apps::autoscale_info)
                .post(apps::set_autoscale)
                .put(apps::set_autoscale)
                .delete(apps::remove_autoscale),
        )
        .route("/apps/:app/build", post(apps::build))
        .route("/jobs", get(jobs::list).post(jobs::create))
        .route("/jobs/list", get(jobs::list))
        .route(
            "/jobs/:name",
            get(jobs::info).put(jobs::update).delete(jobs::remove),
        )
        .route("/jobs/:name/trigger", post(jobs::trigger))
        .route("/job/trigger/:name", post(jobs::trigger))
        .route("/plans", get(plans::list_plans).post(plans::create_plan))
        .route("/plans/:name", delete(plans::remove_plan))
        .route(
            "/platforms",
            get(plans::list_platforms).post(plans::create_platform),
        )
        .route(
            "/platforms/:name",
            put(plans::update_platform).delete(plans::remove_platform),
        )
        .route("/volumes", get(volumes::list).post(volumes::create))
        .route(
            "/volumes/:name",
            get(volumes::info)
                .post(volumes::update)
                .put(volumes::update)
                .delete(volumes::remove),
        )
        .route("/volumeplans", get(volumes::plans))
}

fn infra_routes() -> Router<AppState> {
    Router::new()
        .route("/pools", get(pools::list).post(pools::create))
        .route(
            "/pools/:name",
            get(pools::info).put(pools::update).delete(pools::remove),
        )
        .route(
            "/pools/:name/team",
            post(pools::add_teams).delete(pools::remove_teams),
        )
        .route(
            "/provisioner/clusters",
            get(clusters::list).post(clusters::create),
        )
        .route(
            "/provisioner/clusters/:name",
            get(clusters::info)
                .post(clusters::update)
                .put(clusters::update)
                .delete(clusters::remove),
        )
        .route(
            "/docker/nodecontainers",
            get(node::list_containers).post(node::create_container),
        )
        .route(
            "/docker/nodecontainers/:name",
            get(node::container_info)
                .post(node::update_container)
                .put(node::update_container)
                .delete(node::remove_container),
        )
        .route(
            "/docker/nodecontainers/:name/upgrade",
            post(node::upgrade_container),
        )
}

fn event_routes() -> Router<AppState> {
    Router::new()
        .route("/events", get(events::list))
        .route("/events/kinds", get(events::kinds))
        .route("/events/:uuid", get(events::info))
        .route("/events/:uuid/cancel", post(events::cancel))
        .route("/events/webhooks", get(webhooks::list).post(webhooks::create))
        .route(
            "/events/webhooks/:name",
            get(webhooks::info)
                .put(webhooks::update)
                .delete(webhooks::remove),
        )
}

/// Node autoscale routes, served under both the current and the legacy prefix.
fn autoscale_routes(prefix: &str) -> Router<AppState> {
    Router::new()
        .route(prefix, get(node::history))
        .route(&format!("{}/config", prefix), get(node::autoscale_config))
        .route(
            &format!("{}/rules", prefix),
            get(node::list_rules)
                .post(node::set_rule)
                .delete(node::remove_default_rule),
        )
        .route(&format!("{}/rules/:id", prefix), delete(node::remove_rule))
        .route(&format!("{}/run", prefix), post(node::run_autoscale))
}
