use tracing::info;

use super::{valid_name, ServiceError};
use crate::storage::models::Pool;
use crate::storage::{Storage, StorageError};

pub struct PoolService {
    storage: Storage,
}

impl PoolService {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub async fn list(&self) -> Result<Vec<Pool>, ServiceError> {
        Ok(self.storage.pools.list().await?)
    }

    pub async fn get(&self, name: &str) -> Result<Pool, ServiceError> {
        self.storage
            .pools
            .find(name)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Pool does not exist.".into()))
    }

    /// Clear the default flag of the current default pool, or refuse.
    async fn claim_default(&self, name: &str, force: bool) -> Result<(), ServiceError> {
        let current = self
            .storage
            .pools
            .list()
            .await?
            .into_iter()
            .find(|p| p.default && p.name != name);
        let Some(mut current) = current else {
            return Ok(());
        };
        if !force {
            return Err(ServiceError::Conflict("Default pool already exists.".into()));
        }
        current.default = false;
        self.storage.pools.update(current).await?;
        Ok(())
    }

    pub async fn create(&self, pool: Pool, force: bool) -> Result<Pool, ServiceError> {
        if pool.name.trim().is_empty() {
            return Err(ServiceError::Validation("Pool name is required.".into()));
        }
        if !valid_name(&pool.name) {
            return Err(ServiceError::Validation(
                "Invalid pool name, pool name should have at most 40 characters, containing only lower case letters, numbers or dashes, starting with a letter.".into(),
            ));
        }
        if self.storage.pools.find(&pool.name).await?.is_some() {
            return Err(ServiceError::Conflict("Pool already exists.".into()));
        }
        if pool.default {
            self.claim_default(&pool.name, force).await?;
        }
        match self.storage.pools.insert(pool.clone()).await {
            Ok(()) => {
                info!("pool {} created", pool.name);
                Ok(pool)
            }
            Err(StorageError::AlreadyExists { .. }) => {
                Err(ServiceError::Conflict("Pool already exists.".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update(
        &self,
        name: &str,
        default: Option<bool>,
        public: Option<bool>,
        force: bool,
    ) -> Result<Pool, ServiceError> {
        let mut pool = self.get(name).await?;
        if let Some(default) = default {
            if default && !pool.default {
                self.claim_default(name, force).await?;
            }
            pool.default = default;
        }
        if let Some(public) = public {
            pool.public = public;
        }
        self.storage.pools.update(pool.clone()).await?;
        Ok(pool)
    }

    pub async fn remove(&self, name: &str) -> Result<(), ServiceError> {
        self.get(name).await?;
        let in_use = self
            .storage
            .apps
            .list()
            .await?
            .iter()
            .any(|a| a.pool == name);
        if in_use {
            return Err(ServiceError::Precondition(
                "This pool has apps, you need to migrate or remove them before removing the pool".into(),
            ));
        }
        self.storage.pools.remove(name).await?;
        info!("pool {} removed", name);
        Ok(())
    }

    pub async fn add_teams(&self, name: &str, teams: &[String]) -> Result<(), ServiceError> {
        let mut pool = self.get(name).await?;
        for team in teams {
            if self.storage.teams.find(team).await?.is_none() {
                return Err(ServiceError::NotFound(format!("Team {:?} not found", team)));
            }
        }
        for team in teams {
            if !pool.teams.contains(team) {
                pool.teams.push(team.clone());
            }
        }
        Ok(self.storage.pools.update(pool).await?)
    }

    pub async fn remove_teams(&self, name: &str, teams: &[String]) -> Result<(), ServiceError> {
        let mut pool = self.get(name).await?;
        pool.teams.retain(|t| !teams.contains(t));
        Ok(self.storage.pools.update(pool).await?)
    }

    /// Pool an app should land on when none is requested.
    pub async fn default_for(&self, team: &str) -> Result<Pool, ServiceError> {
        let pools = self.storage.pools.list().await?;
        pools
            .iter()
            .find(|p| p.teams.iter().any(|t| t == team))
            .or_else(|| pools.iter().find(|p| p.default))
            .cloned()
            .ok_or_else(|| ServiceError::Validation("No pool available for this team".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(name: &str, default: bool) -> Pool {
        Pool {
            name: name.into(),
            default,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_single_default_pool() {
        let svc = PoolService::new(Storage::memory());
        svc.create(pool("one", true), false).await.unwrap();
        assert_eq!(
            svc.create(pool("two", true), false).await.unwrap_err().to_string(),
            "Default pool already exists."
        );
        svc.create(pool("two", true), true).await.unwrap();
        assert!(!svc.get("one").await.unwrap().default);
        assert!(svc.get("two").await.unwrap().default);
        assert_eq!(svc.default_for("nobody").await.unwrap().name, "two");
    }

    #[tokio::test]
    async fn test_team_attach_requires_team() {
        let svc = PoolService::new(Storage::memory());
        svc.create(pool("one", false), false).await.unwrap();
        assert!(matches!(
            svc.add_teams("one", &["ghost".to_string()]).await,
            Err(ServiceError::NotFound(_))
        ));
    }
}
