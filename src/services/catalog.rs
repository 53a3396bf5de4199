use tracing::info;

use super::{valid_name, ServiceError};
use crate::storage::models::Service;
use crate::storage::{Storage, StorageError};

/// Registered services, their access lists and documentation.
pub struct ServiceCatalog {
    storage: Storage,
}

impl ServiceCatalog {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub async fn list(&self) -> Result<Vec<Service>, ServiceError> {
        Ok(self.storage.services.list().await?)
    }

    pub async fn get(&self, name: &str) -> Result<Service, ServiceError> {
        self.storage
            .services
            .find(name)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Service not found".into()))
    }

    async fn validate(&self, service: &Service) -> Result<(), ServiceError> {
        if !valid_name(&service.name) {
            return Err(ServiceError::Validation(
                "Invalid service id, should have at most 40 characters, containing only lower case letters, numbers or dashes, starting with a letter.".into(),
            ));
        }
        match service.production_endpoint() {
            Some(endpoint) if !endpoint.trim().is_empty() => {
                url::Url::parse(endpoint).map_err(|e| {
                    ServiceError::Validation(format!("Service production endpoint is invalid: {}", e))
                })?;
            }
            _ => {
                return Err(ServiceError::Validation(
                    "Service production endpoint is required".into(),
                ))
            }
        }
        if service.password.is_empty() {
            return Err(ServiceError::Validation("Service password is required".into()));
        }
        if service.owner_teams.is_empty() {
            return Err(ServiceError::Validation(
                "At least one service team owner is required".into(),
            ));
        }
        for team in &service.owner_teams {
            if self.storage.teams.find(team).await?.is_none() {
                return Err(ServiceError::Validation(format!("Team owner {:?} not found", team)));
            }
        }
        Ok(())
    }

    pub async fn create(&self, mut service: Service) -> Result<Service, ServiceError> {
        if service.username.is_empty() {
            service.username = service.name.clone();
        }
        self.validate(&service).await?;
        match self.storage.services.insert(service.clone()).await {
            Ok(()) => {
                info!("service {} created", service.name);
                Ok(service)
            }
            Err(StorageError::AlreadyExists { .. }) => {
                Err(ServiceError::Conflict(format!("Service {:?} already exists.", service.name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace endpoints, credentials and owners. An empty password keeps the stored one.
    pub async fn update(&self, mut service: Service) -> Result<(), ServiceError> {
        let current = self.get(&service.name).await?;
        if service.password.is_empty() {
            service.password = current.password.clone();
        }
        if service.username.is_empty() {
            service.username = current.username.clone();
        }
        service.teams = current.teams;
        service.doc = current.doc;
        self.validate(&service).await?;
        Ok(self.storage.services.update(service).await?)
    }

    pub async fn delete(&self, name: &str) -> Result<(), ServiceError> {
        self.get(name).await?;
        let has_instances = self
            .storage
            .service_instances
            .list()
            .await?
            .iter()
            .any(|i| i.service_name == name);
        if has_instances {
            return Err(ServiceError::Precondition(
                "This service cannot be removed because it has instances.\nPlease remove these instances before removing the service.".into(),
            ));
        }
        self.storage.services.remove(name).await?;
        info!("service {} removed", name);
        Ok(())
    }

    pub async fn grant_access(&self, name: &str, team: &str) -> Result<(), ServiceError> {
        let mut service = self.get(name).await?;
        if self.storage.teams.find(team).await?.is_none() {
            return Err(ServiceError::Validation("Team not found".into()));
        }
        if service.teams.iter().any(|t| t == team) {
            return Err(ServiceError::Conflict(
                "This team already has access to this service".into(),
            ));
        }
        service.teams.push(team.to_string());
        Ok(self.storage.services.update(service).await?)
    }

    pub async fn revoke_access(&self, name: &str, team: &str) -> Result<(), ServiceError> {
        let mut service = self.get(name).await?;
        if self.storage.teams.find(team).await?.is_none() {
            return Err(ServiceError::Validation("Team not found".into()));
        }
        if !service.teams.iter().any(|t| t == team) {
            return Err(ServiceError::NotFound(
                "This team does not have access to this service".into(),
            ));
        }
        if service.teams.len() == 1 {
            return Err(ServiceError::Precondition(
                "You can not revoke the access from this team, because it is the unique team with access to this service, and a service can not be orphaned".into(),
            ));
        }
        service.teams.retain(|t| t != team);
        Ok(self.storage.services.update(service).await?)
    }

    pub async fn doc(&self, name: &str) -> Result<String, ServiceError> {
        Ok(self.get(name).await?.doc)
    }

    pub async fn set_doc(&self, name: &str, doc: String) -> Result<(), ServiceError> {
        let mut service = self.get(name).await?;
        service.doc = doc;
        Ok(self.storage.services.update(service).await?)
    }
}
