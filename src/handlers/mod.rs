//! Resource handlers.
//!
//! Every mutating handler follows the same envelope: check the caller's
//! permission on the resource's contexts, open an event carrying the
//! scrubbed input, run the domain call inside [`finish`] so the event is
//! finalized on every exit, then map the outcome to a response.

pub mod apps;
pub mod clusters;
pub mod events;
pub mod info;
pub mod instances;
pub mod jobs;
pub mod logs;
pub mod node;
pub mod plans;
pub mod pools;
pub mod roles;
pub mod services;
pub mod teams;
pub mod users;
pub mod volumes;
pub mod webhooks;

use axum::response::Response;
use std::future::Future;
use std::sync::Arc;

use crate::auth::Token;
use crate::error::ApiError;
use crate::event::{finish, AllowedPermission, Event, Opts, Owner, Target};
use crate::input::RequestInput;
use crate::middleware::Caller;
use crate::permission;
use crate::permission::Context;
use crate::services::RequestMeta;
use crate::state::AppState;
use crate::stream::{streamed, JsonMessageWriter};

/// Reject with 403 unless the token holds `scheme` on one of `contexts`.
pub(crate) fn require(token: &Token, scheme: &str, contexts: &[Context]) -> Result<(), ApiError> {
    if permission::check(token, scheme, contexts) {
        Ok(())
    } else {
        Err(ApiError::permission_denied())
    }
}

/// Like [`require`] for reads: a resource the caller cannot see is reported
/// as missing so it cannot be enumerated.
pub(crate) fn require_visible(
    token: &Token,
    scheme: &str,
    contexts: &[Context],
    not_found: &str,
) -> Result<(), ApiError> {
    if permission::check(token, scheme, contexts) {
        Ok(())
    } else {
        Err(ApiError::not_found(not_found))
    }
}

/// What an audited action is about.
pub(crate) struct Audit<'a> {
    pub target: Target,
    pub kind: &'a str,
    pub allowed: AllowedPermission,
    pub input: Option<&'a RequestInput>,
    pub sensitive: &'a [&'a str],
}

impl<'a> Audit<'a> {
    pub fn new(target: Target, kind: &'a str, allowed: AllowedPermission) -> Self {
        Self {
            target,
            kind,
            allowed,
            input: None,
            sensitive: &[],
        }
    }

    pub fn input(mut self, input: &'a RequestInput) -> Self {
        self.input = Some(input);
        self
    }

    pub fn sensitive(mut self, names: &'a [&'a str]) -> Self {
        self.sensitive = names;
        self
    }

    pub fn opts(self, caller: &Caller) -> Opts {
        let custom_data = self
            .input
            .map(|input| input.fields(self.sensitive))
            .and_then(|fields| serde_json::to_value(fields).ok());
        Opts {
            target: Some(self.target),
            kind: Some(self.kind.to_string()),
            owner: Some(Owner::from_token(&caller.token)),
            remote_addr: caller.remote_addr.clone(),
            custom_data,
            allowed: self.allowed,
            ..Default::default()
        }
    }
}

/// Open the event for an audited action.
pub(crate) async fn start_event(
    state: &AppState,
    caller: &Caller,
    audit: Audit<'_>,
) -> Result<Event, ApiError> {
    Ok(state.journal.new_event(audit.opts(caller)).await?)
}

/// Caller identity as forwarded to service back ends.
pub(crate) fn request_meta(caller: &Caller, evt: Option<&Event>) -> RequestMeta {
    RequestMeta {
        user: caller.token.user_name().to_string(),
        event_id: evt.map(Event::id),
        request_id: caller.request_id.clone(),
    }
}

/// Run `work` as a streamed response whose log is the event log.
pub(crate) fn stream_event<F, Fut>(state: &AppState, evt: Event, work: F) -> Response
where
    F: FnOnce(Event, JsonMessageWriter) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ApiError>> + Send + 'static,
{
    streamed(state.config.keepalive_interval(), move |writer| async move {
        evt.set_log_writer(Arc::new(writer.clone()));
        let handle = evt.clone();
        finish(&handle, work(evt, writer)).await
    })
}
