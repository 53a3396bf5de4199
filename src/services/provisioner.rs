use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::ServiceError;
use crate::event::Event;
use crate::storage::models::{App, AutoScaleSpec, Job, NodeAutoscaleRule, NodeContainer};

/// Placement back end for apps, jobs and node-side containers.
#[async_trait]
pub trait Provisioner: Send + Sync {
    fn name(&self) -> &str;

    async fn set_autoscale(&self, app: &App, spec: &AutoScaleSpec) -> Result<(), ServiceError>;

    async fn remove_autoscale(&self, app: &App, process: &str) -> Result<(), ServiceError>;

    /// Recreate `container` on every node of `pool`.
    async fn upgrade_node_container(
        &self,
        pool: &str,
        container: &NodeContainer,
        evt: &Event,
    ) -> Result<(), ServiceError>;

    async fn remove_node_container(
        &self,
        pool: &str,
        name: &str,
        kill: bool,
        evt: &Event,
    ) -> Result<(), ServiceError>;

    /// Run one node autoscale cycle with the given rules.
    async fn run_node_autoscale(
        &self,
        rules: &[NodeAutoscaleRule],
        evt: &Event,
    ) -> Result<(), ServiceError>;

    async fn trigger_job(&self, job: &Job, evt: &Event) -> Result<(), ServiceError>;

    async fn health_check(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Provisioners by name, with a default for pools that name none.
#[derive(Clone)]
pub struct ProvisionerRegistry {
    default: Arc<dyn Provisioner>,
    named: BTreeMap<String, Arc<dyn Provisioner>>,
}

impl ProvisionerRegistry {
    pub fn new(default: Arc<dyn Provisioner>) -> Self {
        let mut named = BTreeMap::new();
        named.insert(default.name().to_string(), default.clone());
        Self { default, named }
    }

    pub fn register(&mut self, provisioner: Arc<dyn Provisioner>) {
        self.named.insert(provisioner.name().to_string(), provisioner);
    }

    pub fn default_provisioner(&self) -> &Arc<dyn Provisioner> {
        &self.default
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provisioner>, ServiceError> {
        if name.is_empty() {
            return Ok(self.default.clone());
        }
        self.named
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::Provisioner(format!("unknown provisioner: {:?}", name)))
    }

    pub fn all(&self) -> Vec<Arc<dyn Provisioner>> {
        self.named.values().cloned().collect()
    }
}

/// In-process provisioner: records every call and reports progress to the event log.
#[derive(Default)]
pub struct LocalProvisioner {
    delay: Duration,
    failing_pools: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl LocalProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every mutating call take at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every node-container operation on `pool`.
    pub fn failing_on(mut self, pool: impl Into<String>) -> Self {
        self.failing_pools.insert(pool.into());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    async fn record(&self, call: String) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        info!("provisioner local: {}", call);
        self.calls.lock().push(call);
    }

    fn check_pool(&self, pool: &str) -> Result<(), ServiceError> {
        if self.failing_pools.contains(pool) {
            return Err(ServiceError::Provisioner(format!(
                "pool {:?}: node unreachable",
                pool
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    fn name(&self) -> &str {
        "local"
    }

    async fn set_autoscale(&self, app: &App, spec: &AutoScaleSpec) -> Result<(), ServiceError> {
        self.record(format!(
            "set autoscale {}/{} {}-{} cpu {}",
            app.name, spec.process, spec.min_units, spec.max_units, spec.average_cpu
        ))
        .await;
        Ok(())
    }

    async fn remove_autoscale(&self, app: &App, process: &str) -> Result<(), ServiceError> {
        self.record(format!("remove autoscale {}/{}", app.name, process))
            .await;
        Ok(())
    }

    async fn upgrade_node_container(
        &self,
        pool: &str,
        container: &NodeContainer,
        evt: &Event,
    ) -> Result<(), ServiceError> {
        self.check_pool(pool)?;
        evt.log(format!(
            "upgrading node container {:?} in pool {:?} to {}",
            container.name, pool, container.config.image
        ));
        self.record(format!("upgrade node container {} on {}", container.name, pool))
            .await;
        Ok(())
    }

    async fn remove_node_container(
        &self,
        pool: &str,
        name: &str,
        kill: bool,
        evt: &Event,
    ) -> Result<(), ServiceError> {
        self.check_pool(pool)?;
        if kill {
            evt.log(format!("killing node container {:?} in pool {:?}", name, pool));
        }
        self.record(format!("remove node container {} on {} kill={}", name, pool, kill))
            .await;
        Ok(())
    }

    async fn run_node_autoscale(
        &self,
        rules: &[NodeAutoscaleRule],
        evt: &Event,
    ) -> Result<(), ServiceError> {
        if rules.is_empty() {
            evt.log("no autoscale rules configured, nothing to do");
        }
        for rule in rules.iter().filter(|r| r.enabled) {
            let pool = if rule.metadata_filter.is_empty() {
                "all pools"
            } else {
                rule.metadata_filter.as_str()
            };
            evt.log(format!(
                "running scaler for {}: max {} containers per node",
                pool, rule.max_container_count
            ));
        }
        self.record(format!("node autoscale with {} rules", rules.len()))
            .await;
        evt.log("autoscale cycle finished");
        Ok(())
    }

    async fn trigger_job(&self, job: &Job, evt: &Event) -> Result<(), ServiceError> {
        evt.log(format!("triggering job {:?}", job.name));
        self.record(format!("trigger job {}", job.name)).await;
        Ok(())
    }
}

/// Where the code for a build comes from.
#[derive(Debug, Clone)]
pub enum BuildSource {
    Archive { file_name: String, data: Bytes },
    ArchiveUrl(String),
    Image(String),
}

/// Turns a build source into a deployable image.
#[async_trait]
pub trait Builder: Send + Sync {
    /// Returns the produced image name.
    async fn build(
        &self,
        app: &App,
        source: BuildSource,
        tag: Option<&str>,
        evt: &Event,
    ) -> Result<String, ServiceError>;
}

#[derive(Default)]
pub struct LocalBuilder {
    builds: Mutex<BTreeMap<String, u32>>,
}

impl LocalBuilder {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Builder for LocalBuilder {
    async fn build(
        &self,
        app: &App,
        source: BuildSource,
        tag: Option<&str>,
        evt: &Event,
    ) -> Result<String, ServiceError> {
        match &source {
            BuildSource::Archive { file_name, data } => {
                if data.is_empty() {
                    return Err(ServiceError::Validation("archive file is empty".into()));
                }
                evt.log(format!("uploaded {} ({} bytes)", file_name, data.len()));
            }
            BuildSource::ArchiveUrl(url) => {
                url::Url::parse(url)
                    .map_err(|e| ServiceError::Validation(format!("invalid archive url: {}", e)))?;
                evt.log(format!("downloading archive from {}", url));
            }
            BuildSource::Image(image) => evt.log(format!("using image {}", image)),
        }

        let version = {
            let mut builds = self.builds.lock();
            let version = builds.entry(app.name.clone()).or_insert(0);
            *version += 1;
            *version
        };
        let image = match tag {
            Some(tag) if !tag.is_empty() => format!("tsuru/app-{}:{}", app.name, tag),
            _ => format!("tsuru/app-{}:v{}", app.name, version),
        };
        evt.log(format!("---- Building image {} ----", image));
        evt.log("OK");
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_default_and_named() {
        let registry = ProvisionerRegistry::new(Arc::new(LocalProvisioner::new()));
        assert_eq!(registry.get("").unwrap().name(), "local");
        assert_eq!(registry.get("local").unwrap().name(), "local");
        assert!(registry.get("swarm").is_err());
    }

    #[tokio::test]
    async fn test_local_provisioner_records_calls() {
        let prov = LocalProvisioner::new();
        let app = App {
            name: "myapp".into(),
            ..Default::default()
        };
        prov.remove_autoscale(&app, "web").await.unwrap();
        assert_eq!(prov.calls(), vec!["remove autoscale myapp/web".to_string()]);
    }
}
