use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::error::ApiError;
use crate::event::{EventData, Filter, Kind, TargetType};
use crate::input::RequestInput;
use crate::middleware::{list_or_no_content, ApiResponse, Caller};
use crate::state::AppState;

fn non_empty(input: &RequestInput, name: &str) -> Option<String> {
    input.input_value(name).filter(|v| !v.is_empty())
}

/// Lower case enum names such as `permission` or `user`.
fn parse_name<T: DeserializeOwned>(name: &str, value: String) -> Result<T, ApiError> {
    serde_json::from_value(Value::String(value.clone()))
        .map_err(|_| ApiError::bad_request(format!("invalid {} {:?}", name, value)))
}

fn parse_time(name: &str, value: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ApiError::bad_request(format!("invalid {} {:?}", name, value)))
}

fn parse_count(name: &str, value: Option<String>) -> Result<Option<usize>, ApiError> {
    value
        .map(|v| {
            v.parse::<usize>()
                .map_err(|_| ApiError::bad_request(format!("invalid {} {:?}", name, v)))
        })
        .transpose()
}

/// Build a reader filter from the query string.
pub(crate) fn filter_from_input(input: &RequestInput) -> Result<Filter, ApiError> {
    let mut filter = Filter::default();
    if let Some(t) = non_empty(input, "target.type") {
        filter.target_type = Some(
            t.parse::<TargetType>()
                .map_err(|e| ApiError::bad_request(e.to_string()))?,
        );
    }
    filter.target_value = non_empty(input, "target.value");
    if let Some(k) = non_empty(input, "kindtype") {
        filter.kind_type = Some(parse_name("kind type", k)?);
    }
    filter.kind_names = input
        .input_values("kindname")
        .into_iter()
        .filter(|k| !k.is_empty())
        .collect();
    if let Some(o) = non_empty(input, "ownertype") {
        filter.owner_type = Some(parse_name("owner type", o)?);
    }
    filter.owner_name = non_empty(input, "ownername");
    if let Some(since) = non_empty(input, "since") {
        filter.since = Some(parse_time("since", &since)?);
    }
    if let Some(until) = non_empty(input, "until") {
        filter.until = Some(parse_time("until", &until)?);
    }
    if input.input_value("running").is_some() {
        filter.running = Some(input.input_bool("running")?);
    }
    filter.error_only = input.input_bool("errorOnly")?;
    filter.skip = parse_count("skip", non_empty(input, "skip"))?.unwrap_or(0);
    filter.limit = parse_count("limit", non_empty(input, "limit"))?;
    filter.prune();
    Ok(filter)
}

fn parse_uuid(uuid: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(uuid).map_err(|_| ApiError::bad_request("uuid parameter is required"))
}

/// GET /events - events the caller may read, newest first
pub async fn list(
    State(state): State<AppState>,
    caller: Caller,
    input: RequestInput,
) -> Result<Response, ApiError> {
    let filter = filter_from_input(&input)?;
    let events = state.journal.list(&caller.token, &filter).await?;
    Ok(list_or_no_content(events))
}

/// GET /events/kinds
pub async fn kinds(
    State(state): State<AppState>,
    _caller: Caller,
) -> Result<Response, ApiError> {
    let kinds: Vec<Kind> = state.journal.kinds().await?;
    Ok(list_or_no_content(kinds))
}

/// GET /events/:uuid
pub async fn info(
    State(state): State<AppState>,
    caller: Caller,
    Path(uuid): Path<String>,
) -> Result<ApiResponse<EventData>, ApiError> {
    let id = parse_uuid(&uuid)?;
    Ok(ApiResponse::success(
        state.journal.get_visible(id, &caller.token).await?,
    ))
}

/// POST /events/:uuid/cancel - ask the running operation to stop
pub async fn cancel(
    State(state): State<AppState>,
    caller: Caller,
    Path(uuid): Path<String>,
    input: RequestInput,
) -> Result<StatusCode, ApiError> {
    let id = parse_uuid(&uuid)?;
    let reason = non_empty(&input, "reason")
        .ok_or_else(|| ApiError::bad_request("reason is mandatory"))?;
    state.journal.try_cancel(id, &caller.token, &reason).await?;
    Ok(StatusCode::NO_CONTENT)
}
