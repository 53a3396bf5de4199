pub mod journal;
pub mod postgres;
pub mod store;
pub mod webhook;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::auth::Token;
use crate::permission::{Context, PermissionError};

pub use journal::{finish, Event, EventHook, Journal, LogWriter};
pub use store::{EventStore, MemoryEventStore};

/// Error recorded when a cooperating handler stops after a cancel request.
pub const CANCELED_ERROR: &str = "canceled by user request";

/// Upper bound on events returned by one listing.
pub const FILTER_MAX_LIMIT: usize = 100;

const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EventError {
    #[error("event locked: {0}")]
    Locked(String),

    #[error("{0}")]
    Throttled(String),

    #[error("event not found")]
    NotFound,

    #[error("event is not cancelable")]
    NotCancelable,

    #[error("event cancel already requested")]
    CancelAlreadyRequested,

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error("{0}")]
    Validation(&'static str),

    #[error("invalid event target type {0:?}")]
    InvalidTargetType(String),

    #[error("event store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetType {
    Global,
    App,
    Node,
    Container,
    Pool,
    Service,
    ServiceInstance,
    Team,
    User,
    Iaas,
    Role,
    Platform,
    Plan,
    NodeContainer,
    InstallHost,
    EventBlock,
    Cluster,
    Volume,
    Webhook,
    Router,
    Job,
}

impl TargetType {
    pub const ALL: [TargetType; 21] = [
        TargetType::Global,
        TargetType::App,
        TargetType::Node,
        TargetType::Container,
        TargetType::Pool,
        TargetType::Service,
        TargetType::ServiceInstance,
        TargetType::Team,
        TargetType::User,
        TargetType::Iaas,
        TargetType::Role,
        TargetType::Platform,
        TargetType::Plan,
        TargetType::NodeContainer,
        TargetType::InstallHost,
        TargetType::EventBlock,
        TargetType::Cluster,
        TargetType::Volume,
        TargetType::Webhook,
        TargetType::Router,
        TargetType::Job,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Global => "global",
            TargetType::App => "app",
            TargetType::Node => "node",
            TargetType::Container => "container",
            TargetType::Pool => "pool",
            TargetType::Service => "service",
            TargetType::ServiceInstance => "service-instance",
            TargetType::Team => "team",
            TargetType::User => "user",
            TargetType::Iaas => "iaas",
            TargetType::Role => "role",
            TargetType::Platform => "platform",
            TargetType::Plan => "plan",
            TargetType::NodeContainer => "node-container",
            TargetType::InstallHost => "install-host",
            TargetType::EventBlock => "event-block",
            TargetType::Cluster => "cluster",
            TargetType::Volume => "volume",
            TargetType::Webhook => "webhook",
            TargetType::Router => "router",
            TargetType::Job => "job",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TargetType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| EventError::InvalidTargetType(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Target {
    #[serde(rename = "Type")]
    pub target_type: TargetType,
    pub value: String,
}

impl Target {
    pub fn new(target_type: TargetType, value: impl Into<String>) -> Self {
        Self {
            target_type,
            value: value.into(),
        }
    }

    pub fn app(name: impl Into<String>) -> Self {
        Self::new(TargetType::App, name)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.target_type, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtraTarget {
    pub target: Target,
    pub lock: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    User,
    App,
    Internal,
    Token,
}

impl fmt::Display for OwnerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OwnerType::User => "user",
            OwnerType::App => "app",
            OwnerType::Internal => "internal",
            OwnerType::Token => "token",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Owner {
    #[serde(rename = "Type")]
    pub owner_type: OwnerType,
    pub name: String,
}

impl Owner {
    pub fn from_token(token: &Token) -> Self {
        match token.app_name() {
            Some(app) => Owner {
                owner_type: OwnerType::App,
                name: app.to_string(),
            },
            None => Owner {
                owner_type: OwnerType::User,
                name: token.user_name().to_string(),
            },
        }
    }

    pub fn internal() -> Self {
        Owner {
            owner_type: OwnerType::Internal,
            name: String::new(),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.owner_type, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindType {
    Permission,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Kind {
    #[serde(rename = "Type")]
    pub kind_type: KindType,
    pub name: String,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Permission a reader must hold to see (or cancel) an event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AllowedPermission {
    pub scheme: String,
    #[serde(default)]
    pub contexts: Vec<Context>,
}

impl AllowedPermission {
    pub fn new(scheme: &str, contexts: Vec<Context>) -> Self {
        Self {
            scheme: scheme.to_string(),
            contexts,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scheme.is_empty() && self.contexts.is_empty()
    }

    pub fn check(&self, token: &Token) -> bool {
        crate::permission::check(token, &self.scheme, &self.contexts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CancelInfo {
    pub owner: String,
    pub start_time: Option<DateTime<Utc>>,
    pub ack_time: Option<DateTime<Utc>>,
    pub reason: String,
    pub asked: bool,
    pub canceled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogEntry {
    pub date: DateTime<Utc>,
    pub message: String,
}

/// Persisted form of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventData {
    #[serde(rename = "UniqueID")]
    pub unique_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub target: Target,
    #[serde(default)]
    pub extra_targets: Vec<ExtraTarget>,
    pub start_custom_data: Option<Value>,
    pub end_custom_data: Option<Value>,
    pub other_custom_data: Option<Value>,
    pub kind: Kind,
    pub owner: Owner,
    #[serde(rename = "SourceIP")]
    pub source_ip: String,
    pub lock_update_time: DateTime<Utc>,
    pub error: String,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub structured_log: Vec<LogEntry>,
    #[serde(default)]
    pub cancel_info: CancelInfo,
    pub cancelable: bool,
    pub running: bool,
    pub lockable: bool,
    pub allowed: AllowedPermission,
    pub allowed_cancel: AllowedPermission,
}

impl EventData {
    /// Targets this event holds exclusively while running.
    pub fn lock_targets(&self) -> Vec<&Target> {
        let primary = self.lockable.then_some(&self.target);
        primary
            .into_iter()
            .chain(
                self.extra_targets
                    .iter()
                    .filter(|et| et.lock)
                    .map(|et| &et.target),
            )
            .collect()
    }

    pub fn holds_lock(&self, target: &Target) -> bool {
        self.running && self.lock_targets().into_iter().any(|t| t == target)
    }

    pub fn lock_expired(&self, now: DateTime<Utc>, expire: Duration) -> bool {
        let expire = chrono::Duration::from_std(expire).unwrap_or(chrono::Duration::zero());
        now > self.lock_update_time + expire
    }

    /// Mark the event finished. A finished event is never changed again.
    pub fn finalize(&mut self, error: Option<String>, end_data: Option<Value>) -> bool {
        if !self.running {
            return false;
        }
        let now = Utc::now();
        match error {
            Some(error) => {
                if error == CANCELED_ERROR && !self.cancel_info.canceled {
                    self.cancel_info = CancelInfo {
                        owner: self.owner.to_string(),
                        start_time: Some(now),
                        ack_time: Some(now),
                        reason: "context canceled".to_string(),
                        asked: self.cancel_info.asked,
                        canceled: true,
                    };
                }
                self.error = error;
            }
            None if self.cancel_info.canceled => self.error = CANCELED_ERROR.to_string(),
            None => {}
        }
        self.end_time = Some(now);
        self.end_custom_data = end_data;
        self.running = false;
        self.log = self.render_log();
        true
    }

    /// Log lines prefixed with their local timestamp.
    pub fn render_log(&self) -> String {
        self.structured_log
            .iter()
            .map(|entry| {
                let prefix = format!(
                    "{}: ",
                    entry.date.with_timezone(&Local).format(LOG_TIME_FORMAT)
                );
                add_line_prefix(&entry.message, &prefix)
            })
            .collect()
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    pub fn request_cancel(&mut self, owner: &str, reason: &str) -> Result<(), EventError> {
        if !self.cancelable || !self.running {
            return Err(EventError::NotCancelable);
        }
        if self.cancel_info.asked {
            return Err(EventError::CancelAlreadyRequested);
        }
        self.cancel_info = CancelInfo {
            owner: owner.to_string(),
            start_time: Some(Utc::now()),
            ack_time: None,
            reason: reason.to_string(),
            asked: true,
            canceled: false,
        };
        Ok(())
    }

    /// Acknowledge a pending cancel request. Returns whether one was pending.
    pub fn ack_cancel(&mut self) -> bool {
        if !self.running || !self.cancel_info.asked {
            return false;
        }
        if !self.cancel_info.canceled {
            self.cancel_info.ack_time = Some(Utc::now());
            self.cancel_info.canceled = true;
        }
        true
    }
}

impl fmt::Display for EventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} running {:?} start by {} at {}",
            self.target,
            self.kind.name,
            self.owner,
            self.start_time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        )
    }
}

fn add_line_prefix(data: &str, prefix: &str) -> String {
    let (body, suffix) = match data.strip_suffix('\n') {
        Some(body) => (body, "\n"),
        None => (data, ""),
    };
    format!("{}{}{}", prefix, body.replace('\n', &format!("\n{}", prefix)), suffix)
}

/// Options for creating an event.
#[derive(Debug, Clone, Default)]
pub struct Opts {
    pub target: Option<Target>,
    pub extra_targets: Vec<ExtraTarget>,
    /// Permission scheme describing the action.
    pub kind: Option<String>,
    pub internal_kind: Option<String>,
    pub owner: Option<Owner>,
    pub remote_addr: Option<String>,
    pub custom_data: Option<Value>,
    pub disable_lock: bool,
    pub cancelable: bool,
    pub allowed: AllowedPermission,
    pub allowed_cancel: AllowedPermission,
    pub retry_timeout: Option<Duration>,
}

/// Limits on how often events of a kind may be created for a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ThrottlingSpec {
    pub target_type: TargetType,
    #[serde(default)]
    pub kind_name: String,
    #[serde(rename = "limit")]
    pub max: usize,
    /// Window length in seconds.
    #[serde(rename = "window")]
    pub window_secs: u64,
    #[serde(default)]
    pub all_targets: bool,
    #[serde(default)]
    pub wait_finish: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFilter {
    pub target_type: TargetType,
    /// `None` matches every value of the type.
    pub values: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub target_type: Option<TargetType>,
    pub target_value: Option<String>,
    pub kind_type: Option<KindType>,
    pub kind_names: Vec<String>,
    pub owner_type: Option<OwnerType>,
    pub owner_name: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub running: Option<bool>,
    pub error_only: bool,
    pub allowed_targets: Option<Vec<TargetFilter>>,
    pub skip: usize,
    /// `None` means unbounded; reader-supplied filters are clamped by [`Filter::prune`].
    pub limit: Option<usize>,
    pub oldest_first: bool,
}

impl Filter {
    /// Clamp values a reader may not choose freely.
    pub fn prune(&mut self) {
        self.allowed_targets = None;
        self.limit = match self.limit {
            Some(l) if l > 0 && l <= FILTER_MAX_LIMIT => Some(l),
            _ => Some(FILTER_MAX_LIMIT),
        };
    }

    fn targets(evt: &EventData) -> impl Iterator<Item = &Target> {
        std::iter::once(&evt.target).chain(evt.extra_targets.iter().map(|et| &et.target))
    }

    pub fn matches(&self, evt: &EventData) -> bool {
        if let Some(t) = self.target_type {
            if !Self::targets(evt).any(|target| target.target_type == t) {
                return false;
            }
        }
        if let Some(v) = &self.target_value {
            if !Self::targets(evt).any(|target| &target.value == v) {
                return false;
            }
        }
        if let Some(allowed) = &self.allowed_targets {
            let ok = Self::targets(evt).any(|target| {
                allowed.iter().any(|at| {
                    at.target_type == target.target_type
                        && at
                            .values
                            .as_ref()
                            .map_or(true, |values| values.contains(&target.value))
                })
            });
            if !ok {
                return false;
            }
        }
        if self.kind_type.is_some_and(|k| k != evt.kind.kind_type) {
            return false;
        }
        if !self.kind_names.is_empty() && !self.kind_names.contains(&evt.kind.name) {
            return false;
        }
        if self.owner_type.is_some_and(|o| o != evt.owner.owner_type) {
            return false;
        }
        if self.owner_name.as_ref().is_some_and(|n| *n != evt.owner.name) {
            return false;
        }
        if self.since.is_some_and(|since| evt.start_time < since) {
            return false;
        }
        if self.until.is_some_and(|until| evt.start_time > until) {
            return false;
        }
        if self.running.is_some_and(|r| r != evt.running) {
            return false;
        }
        if self.error_only && evt.error.is_empty() {
            return false;
        }
        true
    }

    /// Sort, skip and limit an already matched list.
    pub fn paginate(&self, mut events: Vec<EventData>) -> Vec<EventData> {
        if self.oldest_first {
            events.sort_by_key(|e| e.start_time);
        } else {
            events.reverse();
            events.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        }
        let iter = events.into_iter().skip(self.skip);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn sample(target: Target) -> EventData {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        EventData {
            unique_id: Uuid::new_v4(),
            start_time: start,
            end_time: None,
            target,
            extra_targets: vec![],
            start_custom_data: None,
            end_custom_data: None,
            other_custom_data: None,
            kind: Kind {
                kind_type: KindType::Permission,
                name: "app.update".into(),
            },
            owner: Owner {
                owner_type: OwnerType::User,
                name: "me@example.com".into(),
            },
            source_ip: String::new(),
            lock_update_time: start,
            error: String::new(),
            log: String::new(),
            structured_log: vec![],
            cancel_info: CancelInfo::default(),
            cancelable: false,
            running: true,
            lockable: true,
            allowed: AllowedPermission::new("app.read.events", vec![]),
            allowed_cancel: AllowedPermission::default(),
        }
    }

    #[test]
    fn test_display_names_holder() {
        let evt = sample(Target::app("myapp"));
        assert_eq!(
            evt.to_string(),
            "app(myapp) running \"app.update\" start by user me@example.com at 2024-05-01T12:00:00Z"
        );
    }

    #[test]
    fn test_finalize_is_write_once() {
        let mut evt = sample(Target::app("myapp"));
        assert!(evt.finalize(Some("boom".into()), None));
        let end = evt.end_time;
        assert!(!evt.finalize(None, Some(serde_json::json!({"x": 1}))));
        assert_eq!(evt.error, "boom");
        assert_eq!(evt.end_time, end);
        assert!(evt.end_custom_data.is_none());
        assert!(!evt.running);
    }

    #[test]
    fn test_finalize_after_acknowledged_cancel() {
        let mut evt = sample(Target::app("myapp"));
        evt.cancel_info.asked = true;
        evt.cancel_info.canceled = true;
        evt.finalize(None, None);
        assert_eq!(evt.error, CANCELED_ERROR);
    }

    #[test]
    fn test_lock_targets_follow_flags() {
        let mut evt = sample(Target::app("a"));
        evt.extra_targets = vec![
            ExtraTarget { target: Target::app("b"), lock: true },
            ExtraTarget { target: Target::app("c"), lock: false },
        ];
        assert!(evt.holds_lock(&Target::app("a")));
        assert!(evt.holds_lock(&Target::app("b")));
        assert!(!evt.holds_lock(&Target::app("c")));
        evt.lockable = false;
        assert!(!evt.holds_lock(&Target::app("a")));
    }

    #[test]
    fn test_filter_matches_extra_targets_and_allowed() {
        let mut evt = sample(Target::app("a"));
        evt.extra_targets = vec![ExtraTarget {
            target: Target::new(TargetType::Pool, "p1"),
            lock: false,
        }];
        let filter = Filter {
            target_type: Some(TargetType::Pool),
            target_value: Some("p1".into()),
            ..Default::default()
        };
        assert!(filter.matches(&evt));

        let filter = Filter {
            allowed_targets: Some(vec![TargetFilter {
                target_type: TargetType::App,
                values: Some(vec!["other".into()]),
            }]),
            ..Default::default()
        };
        assert!(!filter.matches(&evt));
    }

    #[test]
    fn test_cancel_transitions() {
        let mut evt = sample(Target::app("myapp"));
        assert_eq!(evt.request_cancel("admin", "stop"), Err(EventError::NotCancelable));
        evt.cancelable = true;
        assert!(!evt.ack_cancel());
        evt.request_cancel("admin", "stop").unwrap();
        assert_eq!(
            evt.request_cancel("admin", "again"),
            Err(EventError::CancelAlreadyRequested)
        );
        assert!(evt.ack_cancel());
        assert!(evt.cancel_info.canceled);
        assert!(evt.cancel_info.ack_time.is_some());
    }

    #[test]
    fn test_log_lines_are_prefixed() {
        assert_eq!(add_line_prefix("a\nb\n", "> "), "> a\n> b\n");
        assert_eq!(add_line_prefix("a", "> "), "> a");
    }

    #[test]
    fn test_target_type_parsing() {
        assert_eq!("service-instance".parse::<TargetType>().unwrap(), TargetType::ServiceInstance);
        assert!("nope".parse::<TargetType>().is_err());
    }
}
