use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

use super::{valid_name, Provisioner, ProvisionerRegistry, ServiceError};
use crate::event::Event;
use crate::storage::models::NodeContainer;
use crate::storage::{Storage, StorageError};

/// Containers that run on every node of a pool, with per-pool overrides.
pub struct NodeContainerService {
    storage: Storage,
    provisioners: ProvisionerRegistry,
}

impl NodeContainerService {
    pub fn new(storage: Storage, provisioners: ProvisionerRegistry) -> Self {
        Self {
            storage,
            provisioners,
        }
    }

    pub async fn list(&self) -> Result<Vec<NodeContainer>, ServiceError> {
        Ok(self.storage.node_containers.list().await?)
    }

    /// Every configuration stored under `name`, the pool-less one first.
    pub async fn info(&self, name: &str) -> Result<Vec<NodeContainer>, ServiceError> {
        let mut found: Vec<NodeContainer> = self
            .list()
            .await?
            .into_iter()
            .filter(|c| c.name == name)
            .collect();
        if found.is_empty() {
            return Err(ServiceError::NotFound("node container not found".into()));
        }
        found.sort_by(|a, b| a.pool.cmp(&b.pool));
        Ok(found)
    }

    async fn get(&self, name: &str, pool: &str) -> Result<NodeContainer, ServiceError> {
        self.storage
            .node_containers
            .find(&format!("{}/{}", name, pool))
            .await?
            .ok_or_else(|| ServiceError::NotFound("node container not found".into()))
    }

    async fn validate(&self, container: &NodeContainer) -> Result<(), ServiceError> {
        if container.name.is_empty() {
            return Err(ServiceError::Validation("node container name is required".into()));
        }
        if !valid_name(&container.name) {
            return Err(ServiceError::Validation(format!(
                "invalid node container name {:?}",
                container.name
            )));
        }
        if !container.pool.is_empty() && self.storage.pools.find(&container.pool).await?.is_none() {
            return Err(ServiceError::NotFound("Pool does not exist.".into()));
        }
        Ok(())
    }

    pub async fn create(&self, container: NodeContainer) -> Result<(), ServiceError> {
        self.validate(&container).await?;
        if container.pool.is_empty() && container.config.image.is_empty() {
            return Err(ServiceError::Validation(
                "node container config image is required".into(),
            ));
        }
        match self.storage.node_containers.insert(container.clone()).await {
            Ok(()) => {
                info!("node container {} created for pool {:?}", container.name, container.pool);
                Ok(())
            }
            Err(StorageError::AlreadyExists { .. }) => Err(ServiceError::Conflict(format!(
                "node container {:?} already exists",
                container.name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Merge `container` over the stored configuration for its pool.
    pub async fn update(&self, container: NodeContainer) -> Result<(), ServiceError> {
        self.validate(&container).await?;
        let mut current = match self.get(&container.name, &container.pool).await {
            Ok(current) => current,
            Err(ServiceError::NotFound(_)) if !container.pool.is_empty() => {
                // a pool override may be created through update once the base exists
                self.get(&container.name, "").await?;
                return Ok(self.storage.node_containers.insert(container).await?);
            }
            Err(e) => return Err(e),
        };
        if !container.config.image.is_empty() {
            current.config.image = container.config.image;
        }
        if !container.config.env.is_empty() {
            current.config.env = container.config.env;
        }
        current.config.privileged = container.config.privileged;
        Ok(self.storage.node_containers.update(current).await?)
    }

    /// Pools a node container applies to.
    async fn target_pools(&self, pool: &str) -> Result<Vec<(String, String)>, ServiceError> {
        let pools = self.storage.pools.list().await?;
        Ok(pools
            .into_iter()
            .filter(|p| pool.is_empty() || p.name == pool)
            .map(|p| (p.name, p.provisioner))
            .collect())
    }

    /// Run `op` for every pool and collect the failures into one error.
    async fn for_each_pool<F, Fut>(&self, pool: &str, evt: &Event, op: F) -> Result<(), ServiceError>
    where
        F: Fn(String, Arc<dyn Provisioner>) -> Fut,
        Fut: Future<Output = Result<(), ServiceError>>,
    {
        let mut errors = Vec::new();
        for (name, provisioner) in self.target_pools(pool).await? {
            let result = match self.provisioners.get(&provisioner) {
                Ok(prov) => op(name.clone(), prov).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!("node container operation failed on pool {}: {}", name, e);
                evt.log(format!("error in pool {:?}: {}", name, e));
                errors.push(e.to_string());
            }
        }
        match errors.len() {
            0 => Ok(()),
            _ => Err(ServiceError::Aggregate(errors)),
        }
    }

    /// Drop the stored configuration; with `kill` the running containers go too.
    pub async fn remove(
        &self,
        name: &str,
        pool: &str,
        kill: bool,
        evt: &Event,
    ) -> Result<(), ServiceError> {
        self.get(name, pool).await?;
        self.storage
            .node_containers
            .remove(&format!("{}/{}", name, pool))
            .await?;
        if !kill {
            return Ok(());
        }
        self.for_each_pool(pool, evt, |target, prov| async move {
            prov.remove_node_container(&target, name, true, evt).await
        })
        .await
    }

    /// Recreate the node container on every node of the pools it applies to.
    pub async fn upgrade(&self, name: &str, pool: &str, evt: &Event) -> Result<(), ServiceError> {
        let container = match self.get(name, pool).await {
            Ok(found) => found,
            Err(ServiceError::NotFound(_)) if !pool.is_empty() => self.get(name, "").await?,
            Err(e) => return Err(e),
        };
        self.for_each_pool(pool, evt, |target, prov| {
            let container = container.clone();
            async move { prov.upgrade_node_container(&target, &container, evt).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::journal::JournalSettings;
    use crate::event::{AllowedPermission, Journal, MemoryEventStore, Opts, Owner, Target, TargetType};
    use crate::permission::scheme::NODECONTAINER_UPDATE_UPGRADE;
    use crate::permission::Context;
    use crate::services::LocalProvisioner;
    use crate::storage::models::{NodeContainerConfig, Pool};
    use std::time::Duration;

    async fn setup(prov: LocalProvisioner) -> (NodeContainerService, Arc<LocalProvisioner>, Journal) {
        let storage = Storage::memory();
        for name in ["pool1", "pool2"] {
            storage
                .pools
                .insert(Pool {
                    name: name.into(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let prov = Arc::new(prov);
        let journal = Journal::new(
            Arc::new(MemoryEventStore::new()),
            JournalSettings {
                lock_expire: Duration::from_secs(60),
                lock_update_interval: Duration::from_secs(5),
                app_lock_retry: Duration::ZERO,
                throttling: Vec::new(),
            },
        );
        (
            NodeContainerService::new(storage, ProvisionerRegistry::new(prov.clone())),
            prov,
            journal,
        )
    }

    async fn event(journal: &Journal) -> Event {
        journal
            .new_event(Opts {
                target: Some(Target::new(TargetType::NodeContainer, "bs")),
                kind: Some(NODECONTAINER_UPDATE_UPGRADE.to_string()),
                owner: Some(Owner::internal()),
                allowed: AllowedPermission::new(NODECONTAINER_UPDATE_UPGRADE, vec![Context::Global]),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    fn bs(pool: &str) -> NodeContainer {
        NodeContainer {
            name: "bs".into(),
            pool: pool.into(),
            config: NodeContainerConfig {
                image: "tsuru/bs".into(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_upgrade_runs_on_every_pool() {
        let (svc, prov, journal) = setup(LocalProvisioner::new()).await;
        svc.create(bs("")).await.unwrap();
        assert!(matches!(svc.create(bs("")).await, Err(ServiceError::Conflict(_))));
        let evt = event(&journal).await;
        svc.upgrade("bs", "", &evt).await.unwrap();
        assert_eq!(
            prov.calls(),
            vec![
                "upgrade node container bs on pool1".to_string(),
                "upgrade node container bs on pool2".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_kill_aggregates_pool_errors() {
        let (svc, _prov, journal) = setup(LocalProvisioner::new().failing_on("pool2")).await;
        svc.create(bs("")).await.unwrap();
        let evt = event(&journal).await;
        let err = svc.remove("bs", "", true, &evt).await.unwrap_err();
        match err {
            ServiceError::Aggregate(errors) => {
                assert_eq!(errors, vec!["pool \"pool2\": node unreachable".to_string()])
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(svc.info("bs").await.is_err());
    }
}
