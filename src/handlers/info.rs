use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::middleware::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    pub check: Option<String>,
}

/// GET /healthcheck - liveness, or every registered check with `?check=all`
pub async fn healthcheck(
    State(state): State<AppState>,
    Query(query): Query<HealthQuery>,
) -> Response {
    let Some(check) = query.check.filter(|c| !c.is_empty()) else {
        return "WORKING".into_response();
    };

    let mut lines = Vec::new();
    let mut failed = false;

    if check == "all" || check == "events" {
        match state.journal.health_check().await {
            Ok(()) => lines.push("events: WORKING".to_string()),
            Err(e) => {
                failed = true;
                lines.push(format!("events: fail ({})", e));
            }
        }
    }
    for provisioner in state.provisioners.all() {
        let name = format!("provisioner {}", provisioner.name());
        if check != "all" && check != provisioner.name() {
            continue;
        }
        match provisioner.health_check().await {
            Ok(()) => lines.push(format!("{}: WORKING", name)),
            Err(e) => {
                failed = true;
                lines.push(format!("{}: fail ({})", name, e));
            }
        }
    }

    let status = if failed {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (status, format!("{}\n", lines.join("\n"))).into_response()
}

/// GET /info - server version
pub async fn info() -> ApiResponse<Value> {
    ApiResponse::success(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

/// GET / - landing page, rendered from the configured template when present
pub async fn index(State(state): State<AppState>) -> Response {
    let template = match &state.config.api.index_page_template {
        Some(path) => match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!("unable to read index template {}: {}", path, e);
                DEFAULT_INDEX.to_string()
            }
        },
        None => DEFAULT_INDEX.to_string(),
    };
    Html(template.replace("{{.Version}}", env!("CARGO_PKG_VERSION"))).into_response()
}

const DEFAULT_INDEX: &str = "<html><head><title>tsuru</title></head><body><h1>tsuru API {{.Version}}</h1><p>Use the tsuru client to talk to this server.</p></body></html>";

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_info_reports_version() {
        let resp = info().await;
        assert_eq!(resp.data["version"], env!("CARGO_PKG_VERSION"));
    }
}
