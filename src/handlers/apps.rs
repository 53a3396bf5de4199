use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{require, require_visible, start_event, stream_event, Audit};
use crate::error::ApiError;
use crate::event::{finish, AllowedPermission, Target};
use crate::input::RequestInput;
use crate::middleware::{list_or_no_content, ApiResponse, Caller};
use crate::permission::scheme::{
    APP_BUILD, APP_CREATE, APP_DELETE, APP_READ, APP_READ_EVENTS, APP_READ_UNIT_AUTOSCALE,
    APP_UPDATE, APP_UPDATE_UNIT_AUTOSCALE_ADD, APP_UPDATE_UNIT_AUTOSCALE_REMOVE,
};
use crate::permission::{check, team_for_permission, Context};
use crate::services::BuildSource;
use crate::state::AppState;
use crate::storage::models::{App, AutoScaleSpec};

const APP_NOT_FOUND: &str = "App not found";

/// Contexts an app is reachable through: itself, its teams and its pool.
pub(crate) fn app_contexts(app: &App) -> Vec<Context> {
    let mut contexts = vec![Context::app(&app.name)];
    contexts.extend(Context::teams(&app.teams));
    if !app.pool.is_empty() {
        contexts.push(Context::pool(&app.pool));
    }
    contexts
}

fn app_allowed(app: &App) -> AllowedPermission {
    AllowedPermission::new(APP_READ_EVENTS, app_contexts(app))
}

/// Load the app named by the path after checking an app token addresses it.
async fn load(state: &AppState, caller: &Caller, name: &str) -> Result<App, ApiError> {
    caller.token.ensure_app(name)?;
    Ok(state.apps().get(name).await?)
}

/// GET /apps - apps the caller can read
pub async fn list(State(state): State<AppState>, caller: Caller) -> Result<Response, ApiError> {
    let apps: Vec<App> = state
        .apps()
        .list()
        .await?
        .into_iter()
        .filter(|a| check(&caller.token, APP_READ, &app_contexts(a)))
        .collect();
    Ok(list_or_no_content(apps))
}

#[derive(Debug, Default, Deserialize)]
pub struct AppForm {
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "teamOwner")]
    pub team_owner: String,
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub description: String,
}

impl AppForm {
    fn into_app(self) -> App {
        App {
            name: self.name,
            team_owner: self.team_owner,
            pool: self.pool,
            plan: self.plan,
            platform: self.platform,
            description: self.description,
            ..Default::default()
        }
    }
}

/// POST /apps - create an app owned by one of the caller's teams
pub async fn create(
    State(state): State<AppState>,
    caller: Caller,
    input: RequestInput,
) -> Result<ApiResponse<Value>, ApiError> {
    let mut form: AppForm = input.parse()?;
    if form.team_owner.is_empty() {
        form.team_owner = team_for_permission(&caller.token, APP_CREATE)?;
    }
    let mut contexts = vec![Context::team(&form.team_owner)];
    if !form.pool.is_empty() {
        contexts.push(Context::pool(&form.pool));
    }
    require(&caller.token, APP_CREATE, &contexts)?;
    let app = form.into_app();
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            Target::app(&app.name),
            APP_CREATE,
            AllowedPermission::new(APP_READ_EVENTS, vec![Context::app(&app.name)]),
        )
        .input(&input),
    )
    .await?;
    let created = finish(&evt, async {
        Ok::<_, ApiError>(state.apps().create(app).await?)
    })
    .await?;
    Ok(ApiResponse::created(json!({
        "status": "success",
        "name": created.name,
        "pool": created.pool,
    })))
}

/// GET /apps/:app
pub async fn info(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
) -> Result<ApiResponse<App>, ApiError> {
    let app = load(&state, &caller, &name).await?;
    require_visible(&caller.token, APP_READ, &app_contexts(&app), APP_NOT_FOUND)?;
    Ok(ApiResponse::success(app))
}

/// PUT /apps/:app - change description, plan, pool or team owner
pub async fn update(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let form: AppForm = input.parse()?;
    let app = load(&state, &caller, &name).await?;
    require(&caller.token, APP_UPDATE, &app_contexts(&app))?;
    if !form.team_owner.is_empty() {
        require(&caller.token, APP_UPDATE, &[Context::team(&form.team_owner)])?;
    }
    let evt = start_event(
        &state,
        &caller,
        Audit::new(Target::app(&name), APP_UPDATE, app_allowed(&app)).input(&input),
    )
    .await?;
    finish(&evt, async {
        state.apps().update(&name, form.into_app()).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// DELETE /apps/:app - remove an app and its bindings (streamed)
pub async fn remove(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<Response, ApiError> {
    let app = load(&state, &caller, &name).await?;
    require(&caller.token, APP_DELETE, &app_contexts(&app))?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(Target::app(&name), APP_DELETE, app_allowed(&app)).input(&input),
    )
    .await?;
    let apps = state.apps();
    Ok(stream_event(&state, evt, move |evt, _writer| async move {
        apps.remove(&name, &evt).await?;
        Ok(())
    }))
}

/// GET /apps/:app/units/autoscale - autoscale specs per process
pub async fn autoscale_info(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
) -> Result<ApiResponse<Vec<AutoScaleSpec>>, ApiError> {
    let app = load(&state, &caller, &name).await?;
    require_visible(
        &caller.token,
        APP_READ_UNIT_AUTOSCALE,
        &app_contexts(&app),
        APP_NOT_FOUND,
    )?;
    Ok(ApiResponse::success(state.apps().autoscale_info(&name).await?))
}

/// POST|PUT /apps/:app/units/autoscale - set the autoscale spec of a process
///
/// The event locks the app, so concurrent changes to the same app are
/// refused with a conflict.
pub async fn set_autoscale(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let spec: AutoScaleSpec = input.parse()?;
    let app = load(&state, &caller, &name).await?;
    require(
        &caller.token,
        APP_UPDATE_UNIT_AUTOSCALE_ADD,
        &app_contexts(&app),
    )?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            Target::app(&name),
            APP_UPDATE_UNIT_AUTOSCALE_ADD,
            app_allowed(&app),
        )
        .input(&input),
    )
    .await?;
    finish(&evt, async {
        state.apps().set_autoscale(&name, spec).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// DELETE /apps/:app/units/autoscale?process=web
pub async fn remove_autoscale(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let process = input.input_value("process").unwrap_or_default();
    let app = load(&state, &caller, &name).await?;
    require(
        &caller.token,
        APP_UPDATE_UNIT_AUTOSCALE_REMOVE,
        &app_contexts(&app),
    )?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            Target::app(&name),
            APP_UPDATE_UNIT_AUTOSCALE_REMOVE,
            app_allowed(&app),
        )
        .input(&input),
    )
    .await?;
    finish(&evt, async {
        state.apps().remove_autoscale(&name, &process).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// Where the image comes from: an uploaded archive, an archive URL or an
/// existing image, in that order of precedence.
fn build_source(input: &RequestInput) -> Result<BuildSource, ApiError> {
    if let Some(file) = input.file("file") {
        return Ok(BuildSource::Archive {
            file_name: file.file_name.clone().unwrap_or_default(),
            data: file.data.clone(),
        });
    }
    if let Some(url) = input.input_value("archive-url").filter(|u| !u.is_empty()) {
        return Ok(BuildSource::ArchiveUrl(url));
    }
    if let Some(image) = input.input_value("image").filter(|i| !i.is_empty()) {
        return Ok(BuildSource::Image(image));
    }
    Err(ApiError::bad_request(
        "you must specify either the archive-url, a image url or upload a file.",
    ))
}

/// POST /apps/:app/build - build an image without deploying it (streamed)
pub async fn build(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<Response, ApiError> {
    let source = build_source(&input)?;
    let tag = input.input_value("tag").filter(|t| !t.is_empty());
    let app = load(&state, &caller, &name).await?;
    require(&caller.token, APP_BUILD, &app_contexts(&app))?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(Target::app(&name), APP_BUILD, app_allowed(&app)).input(&input),
    )
    .await?;
    let apps = state.apps();
    Ok(stream_event(&state, evt, move |evt, writer| async move {
        let image = apps.build(&name, source, tag.as_deref(), &evt).await?;
        writer.line(format!("OK\nImage: {}", image));
        Ok(())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_contexts_cover_teams_and_pool() {
        let app = App {
            name: "myapp".into(),
            teams: vec!["acme".into(), "ops".into()],
            pool: "pool1".into(),
            ..Default::default()
        };
        assert_eq!(
            app_contexts(&app),
            vec![
                Context::app("myapp"),
                Context::team("acme"),
                Context::team("ops"),
                Context::pool("pool1"),
            ]
        );
    }

    #[tokio::test]
    async fn test_build_source_precedence() {
        let input = RequestInput::decode(
            Some("application/x-www-form-urlencoded"),
            None,
            "image=tsuru/python&archive-url=http://example.com/a.tar.gz".into(),
        )
        .await
        .unwrap();
        assert!(matches!(
            build_source(&input).unwrap(),
            BuildSource::ArchiveUrl(url) if url == "http://example.com/a.tar.gz"
        ));

        let empty = RequestInput::decode(None, None, "".into()).await.unwrap();
        assert_eq!(build_source(&empty).unwrap_err().status_code(), 400);
    }
}
