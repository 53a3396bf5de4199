use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Entity;
use crate::permission::{Role, RoleInstance};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub email: String,
    /// Password hash; never serialized in responses.
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub roles: Vec<RoleInstance>,
}

impl Entity for User {
    const COLLECTION: &'static str = "users";
    fn key(&self) -> String {
        self.email.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Team {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub created_by: String,
}

impl Entity for Team {
    const COLLECTION: &'static str = "teams";
    fn key(&self) -> String {
        self.name.clone()
    }
}

impl Entity for Role {
    const COLLECTION: &'static str = "roles";
    fn key(&self) -> String {
        self.name.clone()
    }
}

/// A login session issued by the native scheme.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub user_email: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Entity for Session {
    const COLLECTION: &'static str = "tokens";
    fn key(&self) -> String {
        self.id.clone()
    }
}

/// Opaque token that acts on behalf of an app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppToken {
    pub token: String,
    pub app_name: String,
    pub created_at: DateTime<Utc>,
}

impl Entity for AppToken {
    const COLLECTION: &'static str = "app_tokens";
    fn key(&self) -> String {
        self.token.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PasswordToken {
    pub token: String,
    pub user_email: String,
    pub created_at: DateTime<Utc>,
    pub used: bool,
}

impl Entity for PasswordToken {
    const COLLECTION: &'static str = "password_tokens";
    fn key(&self) -> String {
        self.token.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
    #[serde(default, skip_serializing)]
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub owner_teams: Vec<String>,
    #[serde(default)]
    pub teams: Vec<String>,
    #[serde(default)]
    pub doc: String,
    #[serde(default)]
    pub is_restricted: bool,
    #[serde(default)]
    pub is_multi_cluster: bool,
}

impl Service {
    pub fn production_endpoint(&self) -> Option<&str> {
        self.endpoints.get("production").map(String::as_str)
    }
}

impl Entity for Service {
    const COLLECTION: &'static str = "services";
    fn key(&self) -> String {
        self.name.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServiceInstance {
    pub service_name: String,
    pub name: String,
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub team_owner: String,
    #[serde(default)]
    pub teams: Vec<String>,
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub plan_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub apps: Vec<String>,
    #[serde(default)]
    pub jobs: Vec<String>,
    #[serde(default)]
    pub bound_units: Vec<String>,
    #[serde(default)]
    pub force_remove: bool,
}

impl ServiceInstance {
    /// Name used by the service back end to address this instance.
    pub fn identifier(&self) -> String {
        if self.id != 0 {
            self.id.to_string()
        } else {
            self.name.clone()
        }
    }

    /// Value of the service-instance permission context.
    pub fn context_value(&self) -> String {
        format!("{}/{}", self.service_name, self.name)
    }
}

impl Entity for ServiceInstance {
    const COLLECTION: &'static str = "service_instances";
    fn key(&self) -> String {
        self.context_value()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoScaleSpec {
    #[serde(default)]
    pub process: String,
    #[serde(rename = "minUnits", default)]
    pub min_units: u32,
    #[serde(rename = "maxUnits", default)]
    pub max_units: u32,
    #[serde(rename = "averageCPU", default)]
    pub average_cpu: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct App {
    pub name: String,
    #[serde(default)]
    pub team_owner: String,
    #[serde(default)]
    pub teams: Vec<String>,
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub autoscale: Vec<AutoScaleSpec>,
}

impl Entity for App {
    const COLLECTION: &'static str = "apps";
    fn key(&self) -> String {
        self.name.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct JobContainer {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Job {
    pub name: String,
    #[serde(default)]
    pub team_owner: String,
    #[serde(default)]
    pub teams: Vec<String>,
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
    #[serde(default)]
    pub last_trigger: Option<DateTime<Utc>>,
}

impl Entity for Job {
    const COLLECTION: &'static str = "jobs";
    fn key(&self) -> String {
        self.name.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Pool {
    pub name: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub provisioner: String,
    #[serde(default)]
    pub teams: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Entity for Pool {
    const COLLECTION: &'static str = "pools";
    fn key(&self) -> String {
        self.name.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Cluster {
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub provisioner: String,
    #[serde(default)]
    pub cacert: String,
    #[serde(default)]
    pub clientcert: String,
    #[serde(default)]
    pub clientkey: String,
    #[serde(default)]
    pub pools: Vec<String>,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub custom_data: BTreeMap<String, String>,
}

impl Cluster {
    /// Copy safe to hand to readers: the client key is dropped.
    pub fn redacted(&self) -> Cluster {
        Cluster {
            clientkey: String::new(),
            ..self.clone()
        }
    }
}

impl Entity for Cluster {
    const COLLECTION: &'static str = "clusters";
    fn key(&self) -> String {
        self.name.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct NodeAutoscaleRule {
    #[serde(default)]
    pub metadata_filter: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub max_container_count: u32,
    #[serde(default)]
    pub scale_down_ratio: f64,
    #[serde(default)]
    pub prevent_rebalance: bool,
    #[serde(default)]
    pub max_memory_ratio: f64,
}

impl Entity for NodeAutoscaleRule {
    const COLLECTION: &'static str = "autoscale_rules";
    fn key(&self) -> String {
        self.metadata_filter.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NodeContainerConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub privileged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NodeContainer {
    pub name: String,
    /// Empty pool means the configuration applies to every pool.
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub config: NodeContainerConfig,
}

impl Entity for NodeContainer {
    const COLLECTION: &'static str = "node_containers";
    fn key(&self) -> String {
        format!("{}/{}", self.name, self.pool)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WebhookEventFilter {
    #[serde(default)]
    pub target_types: Vec<String>,
    #[serde(default)]
    pub target_values: Vec<String>,
    #[serde(default)]
    pub kind_types: Vec<String>,
    #[serde(default)]
    pub kind_names: Vec<String>,
    #[serde(default)]
    pub error_only: bool,
    #[serde(default)]
    pub success_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Webhook {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub team_owner: String,
    #[serde(default)]
    pub event_filter: WebhookEventFilter,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub proxy_url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub insecure: bool,
}

impl Entity for Webhook {
    const COLLECTION: &'static str = "webhooks";
    fn key(&self) -> String {
        self.name.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VolumePlan {
    pub name: String,
    #[serde(default)]
    pub provisioner: String,
    #[serde(default)]
    pub opts: BTreeMap<String, String>,
}

impl Entity for VolumePlan {
    const COLLECTION: &'static str = "volume_plans";
    fn key(&self) -> String {
        self.name.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VolumeBind {
    pub app: String,
    pub mount_point: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Volume {
    pub name: String,
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub team_owner: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub opts: BTreeMap<String, String>,
    #[serde(default)]
    pub binds: Vec<VolumeBind>,
}

impl Entity for Volume {
    const COLLECTION: &'static str = "volumes";
    fn key(&self) -> String {
        self.name.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Plan {
    pub name: String,
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub cpu_milli: i64,
    #[serde(default)]
    pub default: bool,
}

impl Entity for Plan {
    const COLLECTION: &'static str = "plans";
    fn key(&self) -> String {
        self.name.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Platform {
    pub name: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub image: String,
}

impl Entity for Platform {
    const COLLECTION: &'static str = "platforms";
    fn key(&self) -> String {
        self.name.clone()
    }
}
