use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::{require, require_visible, start_event, stream_event, Audit};
use crate::error::ApiError;
use crate::event::{finish, AllowedPermission, Target, TargetType};
use crate::input::RequestInput;
use crate::middleware::{list_or_no_content, ApiResponse, Caller};
use crate::permission::scheme::{
    JOB_CREATE, JOB_DELETE, JOB_READ, JOB_READ_EVENTS, JOB_TRIGGER, JOB_UPDATE,
};
use crate::permission::{check, team_for_permission, Context};
use crate::state::AppState;
use crate::storage::models::{Job, JobContainer};

const JOB_NOT_FOUND: &str = "Job not found";

/// Contexts a job is reachable through: itself, its teams and its pool.
pub(crate) fn job_contexts(job: &Job) -> Vec<Context> {
    let mut contexts = vec![Context::job(&job.name)];
    contexts.extend(Context::teams(&job.teams));
    if !job.pool.is_empty() {
        contexts.push(Context::pool(&job.pool));
    }
    contexts
}

fn job_target(name: &str) -> Target {
    Target::new(TargetType::Job, name)
}

fn job_allowed(job: &Job) -> AllowedPermission {
    AllowedPermission::new(JOB_READ_EVENTS, job_contexts(job))
}

#[derive(Debug, Default, Deserialize)]
pub struct JobForm {
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "teamOwner")]
    pub team_owner: String,
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub container: JobContainer,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
}

impl JobForm {
    fn into_job(self) -> Job {
        Job {
            name: self.name,
            team_owner: self.team_owner,
            pool: self.pool,
            plan: self.plan,
            description: self.description,
            schedule: self.schedule,
            container: self.container,
            envs: self.envs,
            ..Default::default()
        }
    }
}

/// GET /jobs - jobs the caller can read
pub async fn list(State(state): State<AppState>, caller: Caller) -> Result<Response, ApiError> {
    let jobs: Vec<Job> = state
        .jobs()
        .list()
        .await?
        .into_iter()
        .filter(|j| check(&caller.token, JOB_READ, &job_contexts(j)))
        .collect();
    Ok(list_or_no_content(jobs))
}

/// POST /jobs
pub async fn create(
    State(state): State<AppState>,
    caller: Caller,
    input: RequestInput,
) -> Result<ApiResponse<Value>, ApiError> {
    let mut form: JobForm = input.parse()?;
    if form.team_owner.is_empty() {
        form.team_owner = team_for_permission(&caller.token, JOB_CREATE)?;
    }
    let mut contexts = vec![Context::team(&form.team_owner)];
    if !form.pool.is_empty() {
        contexts.push(Context::pool(&form.pool));
    }
    require(&caller.token, JOB_CREATE, &contexts)?;
    let job = form.into_job();
    let evt = start_event(
        &state,
        &caller,
        Audit::new(
            job_target(&job.name),
            JOB_CREATE,
            AllowedPermission::new(JOB_READ_EVENTS, vec![Context::job(&job.name)]),
        )
        .input(&input),
    )
    .await?;
    let created = finish(&evt, async {
        Ok::<_, ApiError>(state.jobs().create(job).await?)
    })
    .await?;
    Ok(ApiResponse::created(json!({
        "status": "success",
        "jobName": created.name,
    })))
}

/// GET /jobs/:name
pub async fn info(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
) -> Result<ApiResponse<Job>, ApiError> {
    let job = state.jobs().get(&name).await?;
    require_visible(&caller.token, JOB_READ, &job_contexts(&job), JOB_NOT_FOUND)?;
    Ok(ApiResponse::success(job))
}

/// PUT /jobs/:name
pub async fn update(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let form: JobForm = input.parse()?;
    let job = state.jobs().get(&name).await?;
    require(&caller.token, JOB_UPDATE, &job_contexts(&job))?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(job_target(&name), JOB_UPDATE, job_allowed(&job)).input(&input),
    )
    .await?;
    finish(&evt, async {
        state.jobs().update(&name, form.into_job()).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// DELETE /jobs/:name
pub async fn remove(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let job = state.jobs().get(&name).await?;
    require(&caller.token, JOB_DELETE, &job_contexts(&job))?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(job_target(&name), JOB_DELETE, job_allowed(&job)).input(&input),
    )
    .await?;
    finish(&evt, async {
        state.jobs().remove(&name).await?;
        Ok::<_, ApiError>(())
    })
    .await?;
    Ok(StatusCode::OK)
}

/// POST /jobs/:name/trigger - run a job now (streamed)
pub async fn trigger(
    State(state): State<AppState>,
    caller: Caller,
    Path(name): Path<String>,
    input: RequestInput,
) -> Result<Response, ApiError> {
    let job = state.jobs().get(&name).await?;
    require(&caller.token, JOB_TRIGGER, &job_contexts(&job))?;
    let evt = start_event(
        &state,
        &caller,
        Audit::new(job_target(&name), JOB_TRIGGER, job_allowed(&job)).input(&input),
    )
    .await?;
    let jobs = state.jobs();
    Ok(stream_event(&state, evt, move |evt, writer| async move {
        jobs.trigger(&name, &evt).await?;
        writer.line(format!("job {} triggered", name));
        Ok(())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_contexts_skip_empty_pool() {
        let job = Job {
            name: "cron".into(),
            teams: vec!["acme".into()],
            ..Default::default()
        };
        assert_eq!(
            job_contexts(&job),
            vec![Context::job("cron"), Context::team("acme")]
        );
    }
}
