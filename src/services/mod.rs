pub mod apps;
pub mod autoscale;
pub mod backend;
pub mod catalog;
pub mod instances;
pub mod jobs;
pub mod node_containers;
pub mod pools;
pub mod provisioner;
pub mod roles;
pub mod teams;
pub mod webhooks;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::event::{EventError, CANCELED_ERROR};
use crate::permission::PermissionError;
use crate::storage::StorageError;

pub use apps::AppService;
pub use autoscale::{AutoscaleError, NodeAutoscaleService};
pub use backend::{HttpServiceBackend, MemoryServiceBackend, RequestMeta, ServiceBackend, ServicePlan};
pub use catalog::ServiceCatalog;
pub use instances::InstanceService;
pub use jobs::JobService;
pub use node_containers::NodeContainerService;
pub use pools::PoolService;
pub use provisioner::{BuildSource, Builder, LocalBuilder, LocalProvisioner, Provisioner, ProvisionerRegistry};
pub use roles::RoleService;
pub use teams::TeamService;
pub use webhooks::WebhookService;

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9-]{0,39}$").expect("valid name regex"));

static INSTANCE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][-a-zA-Z0-9_]+$").expect("valid instance name regex"));

/// Lower case letters, numbers or dashes, starting with a letter, at most 40 chars.
pub fn valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

pub fn valid_instance_name(name: &str) -> bool {
    INSTANCE_NAME_RE.is_match(name)
}

fn quoted(names: &[String]) -> String {
    names
        .iter()
        .map(|n| format!("{:?}", n))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error(
        "This service instance is bound to at least one app or job. Unbind them before removing it: apps: [{}], jobs: [{}]",
        quoted(.apps),
        quoted(.jobs)
    )]
    InstanceHasBindings { apps: Vec<String>, jobs: Vec<String> },

    #[error("This app is not bound to this service instance.")]
    NotBound,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Precondition(String),

    #[error("{message}")]
    Upstream { status: u16, message: String },

    #[error("failed to reach service back end: {0}")]
    Transport(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error("{}", CANCELED_ERROR)]
    Canceled,

    #[error(transparent)]
    InvalidAutoscaleRule(#[from] AutoscaleError),

    #[error("{0}")]
    Provisioner(String),

    #[error("multiple errors reported ({}):\n{}", .0.len(), .0.join("\n"))]
    Aggregate(Vec<String>),
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        ServiceError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(valid_name("myapp"));
        assert!(valid_name("my-app-2"));
        assert!(!valid_name("MyApp"));
        assert!(!valid_name("2app"));
        assert!(!valid_name(&"a".repeat(41)));
        assert!(valid_instance_name("My_Instance-1"));
        assert!(!valid_instance_name("_x"));
    }

    #[test]
    fn test_bindings_message_names_consumers() {
        let err = ServiceError::InstanceHasBindings {
            apps: vec!["foo-bar".into()],
            jobs: vec![],
        };
        assert!(err.to_string().contains("\"foo-bar\""));
    }

    #[test]
    fn test_aggregate_message_lists_every_error() {
        let err = ServiceError::Aggregate(vec!["pool a: boom".into(), "pool b: bang".into()]);
        assert_eq!(
            err.to_string(),
            "multiple errors reported (2):\npool a: boom\npool b: bang"
        );
    }
}
