pub mod models;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::permission::Role;
use models::*;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StorageError {
    #[error("{collection} {key:?} already exists")]
    AlreadyExists { collection: &'static str, key: String },

    #[error("{collection} {key:?} not found")]
    NotFound { collection: &'static str, key: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// A record persisted under a natural key.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    const COLLECTION: &'static str;
    fn key(&self) -> String;
}

/// Persistence collaborator for one entity collection.
#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    async fn insert(&self, item: T) -> Result<(), StorageError>;
    async fn update(&self, item: T) -> Result<(), StorageError>;
    async fn find(&self, key: &str) -> Result<Option<T>, StorageError>;
    async fn list(&self) -> Result<Vec<T>, StorageError>;
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<T, StorageError> {
        self.find(key).await?.ok_or_else(|| StorageError::NotFound {
            collection: T::COLLECTION,
            key: key.to_string(),
        })
    }

    async fn upsert(&self, item: T) -> Result<(), StorageError> {
        match self.insert(item.clone()).await {
            Err(StorageError::AlreadyExists { .. }) => self.update(item).await,
            other => other,
        }
    }
}

/// In-process repository, ordered by key.
pub struct MemoryRepository<T> {
    items: RwLock<BTreeMap<String, T>>,
}

impl<T> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T: Entity> MemoryRepository<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for MemoryRepository<T> {
    async fn insert(&self, item: T) -> Result<(), StorageError> {
        let key = item.key();
        let mut items = self.items.write();
        if items.contains_key(&key) {
            return Err(StorageError::AlreadyExists {
                collection: T::COLLECTION,
                key,
            });
        }
        items.insert(key, item);
        Ok(())
    }

    async fn update(&self, item: T) -> Result<(), StorageError> {
        let key = item.key();
        let mut items = self.items.write();
        match items.get_mut(&key) {
            Some(existing) => {
                *existing = item;
                Ok(())
            }
            None => Err(StorageError::NotFound {
                collection: T::COLLECTION,
                key,
            }),
        }
    }

    async fn find(&self, key: &str) -> Result<Option<T>, StorageError> {
        Ok(self.items.read().get(key).cloned())
    }

    async fn list(&self) -> Result<Vec<T>, StorageError> {
        Ok(self.items.read().values().cloned().collect())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match self.items.write().remove(key) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound {
                collection: T::COLLECTION,
                key: key.to_string(),
            }),
        }
    }
}

/// Every entity collection the API reads or writes.
#[derive(Clone)]
pub struct Storage {
    pub users: Arc<dyn Repository<User>>,
    pub sessions: Arc<dyn Repository<Session>>,
    pub app_tokens: Arc<dyn Repository<AppToken>>,
    pub password_tokens: Arc<dyn Repository<PasswordToken>>,
    pub teams: Arc<dyn Repository<Team>>,
    pub roles: Arc<dyn Repository<Role>>,
    pub services: Arc<dyn Repository<Service>>,
    pub service_instances: Arc<dyn Repository<ServiceInstance>>,
    pub apps: Arc<dyn Repository<App>>,
    pub jobs: Arc<dyn Repository<Job>>,
    pub pools: Arc<dyn Repository<Pool>>,
    pub clusters: Arc<dyn Repository<Cluster>>,
    pub autoscale_rules: Arc<dyn Repository<NodeAutoscaleRule>>,
    pub node_containers: Arc<dyn Repository<NodeContainer>>,
    pub webhooks: Arc<dyn Repository<Webhook>>,
    pub volumes: Arc<dyn Repository<Volume>>,
    pub volume_plans: Arc<dyn Repository<VolumePlan>>,
    pub plans: Arc<dyn Repository<Plan>>,
    pub platforms: Arc<dyn Repository<Platform>>,
}

impl Storage {
    pub fn memory() -> Self {
        Self {
            users: Arc::new(MemoryRepository::new()),
            sessions: Arc::new(MemoryRepository::new()),
            app_tokens: Arc::new(MemoryRepository::new()),
            password_tokens: Arc::new(MemoryRepository::new()),
            teams: Arc::new(MemoryRepository::new()),
            roles: Arc::new(MemoryRepository::new()),
            services: Arc::new(MemoryRepository::new()),
            service_instances: Arc::new(MemoryRepository::new()),
            apps: Arc::new(MemoryRepository::new()),
            jobs: Arc::new(MemoryRepository::new()),
            pools: Arc::new(MemoryRepository::new()),
            clusters: Arc::new(MemoryRepository::new()),
            autoscale_rules: Arc::new(MemoryRepository::new()),
            node_containers: Arc::new(MemoryRepository::new()),
            webhooks: Arc::new(MemoryRepository::new()),
            volumes: Arc::new(MemoryRepository::new()),
            volume_plans: Arc::new(MemoryRepository::new()),
            plans: Arc::new(MemoryRepository::new()),
            platforms: Arc::new(MemoryRepository::new()),
        }
    }

    pub async fn find_user_by_api_key(&self, key: &str) -> Result<Option<User>, StorageError> {
        Ok(self
            .users
            .list()
            .await?
            .into_iter()
            .find(|u| u.api_key.as_deref() == Some(key)))
    }

    pub async fn users_with_role(&self, role: &str) -> Result<Vec<User>, StorageError> {
        Ok(self
            .users
            .list()
            .await?
            .into_iter()
            .filter(|u| u.roles.iter().any(|r| r.name == role))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_repository_insert_conflict_and_update() {
        let repo: MemoryRepository<Team> = MemoryRepository::new();
        let team = Team {
            name: "acme".into(),
            tags: vec![],
            created_by: "me@example.com".into(),
        };
        repo.insert(team.clone()).await.unwrap();
        assert!(matches!(
            repo.insert(team.clone()).await,
            Err(StorageError::AlreadyExists { .. })
        ));

        let mut updated = team.clone();
        updated.tags.push("prod".into());
        repo.update(updated.clone()).await.unwrap();
        assert_eq!(repo.get("acme").await.unwrap(), updated);

        repo.remove("acme").await.unwrap();
        assert!(matches!(repo.get("acme").await, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates() {
        let repo: MemoryRepository<Plan> = MemoryRepository::new();
        let mut plan = Plan {
            name: "small".into(),
            memory: 128,
            ..Default::default()
        };
        repo.upsert(plan.clone()).await.unwrap();
        plan.memory = 256;
        repo.upsert(plan.clone()).await.unwrap();
        assert_eq!(repo.list().await.unwrap(), vec![plan]);
    }
}
