use tracing::info;

use super::ServiceError;
use crate::permission::{registry, ContextType, PermissionError, Role, RoleEvent, RoleInstance};
use crate::storage::models::User;
use crate::storage::{Storage, StorageError};

/// Role definitions and their assignment to users.
pub struct RoleService {
    storage: Storage,
}

impl RoleService {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub async fn list(&self) -> Result<Vec<Role>, ServiceError> {
        Ok(self.storage.roles.list().await?)
    }

    pub async fn get(&self, name: &str) -> Result<Role, ServiceError> {
        self.storage
            .roles
            .find(name)
            .await?
            .ok_or_else(|| PermissionError::RoleNotFound.into())
    }

    pub async fn create(
        &self,
        name: &str,
        context_type: &str,
        description: &str,
    ) -> Result<Role, ServiceError> {
        let role = Role::new(name, context_type, description)?;
        match self.storage.roles.insert(role.clone()).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists { .. }) => {
                return Err(PermissionError::RoleAlreadyExists.into())
            }
            Err(e) => return Err(e.into()),
        }
        info!("role {} created", role.name);
        Ok(role)
    }

    /// Remove a role no user is assigned to.
    pub async fn remove(&self, name: &str) -> Result<(), ServiceError> {
        if !self.storage.users_with_role(name).await?.is_empty() {
            return Err(PermissionError::RemoveRoleWithUsers.into());
        }
        match self.storage.roles.remove(name).await {
            Ok(()) => Ok(()),
            Err(StorageError::NotFound { .. }) => Err(PermissionError::RoleNotFound.into()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn add_permissions(&self, name: &str, schemes: &[String]) -> Result<(), ServiceError> {
        let mut role = self.get(name).await?;
        role.add_permissions(registry(), schemes)?;
        Ok(self.storage.roles.update(role).await?)
    }

    pub async fn remove_permission(&self, name: &str, scheme: &str) -> Result<(), ServiceError> {
        let mut role = self.get(name).await?;
        role.remove_permissions(&[scheme.to_string()]);
        Ok(self.storage.roles.update(role).await?)
    }

    /// Rename a role, change its context type or description. A rename is
    /// carried to every user holding the role.
    pub async fn update(
        &self,
        name: &str,
        new_name: Option<&str>,
        context_type: Option<&str>,
        description: Option<&str>,
    ) -> Result<(), ServiceError> {
        let mut role = self.get(name).await?;
        if let Some(ctx) = context_type {
            role.context_type = ctx.parse::<ContextType>()?;
        }
        if let Some(description) = description {
            role.description = description.to_string();
        }
        let Some(new_name) = new_name.map(str::trim).filter(|n| !n.is_empty() && *n != name) else {
            return Ok(self.storage.roles.update(role).await?);
        };

        role.name = new_name.to_string();
        match self.storage.roles.insert(role).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists { .. }) => {
                return Err(PermissionError::RoleAlreadyExists.into())
            }
            Err(e) => return Err(e.into()),
        }
        for mut user in self.storage.users_with_role(name).await? {
            for assignment in user.roles.iter_mut().filter(|r| r.name == name) {
                assignment.name = new_name.to_string();
            }
            self.storage.users.update(user).await?;
        }
        self.storage.roles.remove(name).await?;
        info!("role {} renamed to {}", name, new_name);
        Ok(())
    }

    async fn user(&self, email: &str) -> Result<User, ServiceError> {
        self.storage
            .users
            .find(email)
            .await?
            .ok_or_else(|| ServiceError::NotFound("user not found".into()))
    }

    /// Check that `context_value` names something a role of this type can
    /// be scoped to.
    pub async fn validate_context_value(
        &self,
        role: &Role,
        context_value: &str,
    ) -> Result<(), ServiceError> {
        if role.context_type == ContextType::Global {
            return Ok(());
        }
        if context_value.is_empty() {
            return Err(ServiceError::Validation(format!(
                "Global context value is not valid for role with context type {}",
                role.context_type
            )));
        }
        let exists = match role.context_type {
            ContextType::Team => self.storage.teams.find(context_value).await?.is_some(),
            ContextType::App => self.storage.apps.find(context_value).await?.is_some(),
            ContextType::Job => self.storage.jobs.find(context_value).await?.is_some(),
            ContextType::Pool => self.storage.pools.find(context_value).await?.is_some(),
            ContextType::Service => self.storage.services.find(context_value).await?.is_some(),
            ContextType::ServiceInstance => self
                .storage
                .service_instances
                .find(context_value)
                .await?
                .is_some(),
            ContextType::Volume => self.storage.volumes.find(context_value).await?.is_some(),
            ContextType::Cluster => self.storage.clusters.find(context_value).await?.is_some(),
            _ => true,
        };
        if exists {
            Ok(())
        } else {
            Err(ServiceError::Validation(format!(
                "{} {} not found",
                role.context_type, context_value
            )))
        }
    }

    pub async fn assign(&self, email: &str, role: &str, context_value: &str) -> Result<(), ServiceError> {
        let mut user = self.user(email).await?;
        let assignment = RoleInstance::new(role, context_value);
        if !user.roles.contains(&assignment) {
            user.roles.push(assignment);
            self.storage.users.update(user).await?;
        }
        Ok(())
    }

    pub async fn dissociate(
        &self,
        email: &str,
        role: &str,
        context_value: &str,
    ) -> Result<(), ServiceError> {
        let mut user = self.user(email).await?;
        user.roles
            .retain(|r| !(r.name == role && r.context_value == context_value));
        Ok(self.storage.users.update(user).await?)
    }

    pub async fn add_event(&self, name: &str, event: RoleEvent) -> Result<(), ServiceError> {
        let mut role = self.get(name).await?;
        role.add_event(event)?;
        Ok(self.storage.roles.update(role).await?)
    }

    pub async fn remove_event(&self, name: &str, event: RoleEvent) -> Result<(), ServiceError> {
        let mut role = self.get(name).await?;
        role.remove_event(event);
        Ok(self.storage.roles.update(role).await?)
    }

    /// Roles bound to at least one role event.
    pub async fn defaults(&self) -> Result<Vec<Role>, ServiceError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| !r.events.is_empty())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::scheme::{APP_UPDATE, POOL_CREATE};

    async fn with_user(storage: &Storage, email: &str) {
        storage
            .users
            .insert(User {
                email: email.into(),
                password: String::new(),
                api_key: None,
                roles: vec![],
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_rejects_blank_and_duplicate_names() {
        let roles = RoleService::new(Storage::memory());
        assert_eq!(
            roles.create("  ", "team", "").await.unwrap_err().to_string(),
            "invalid role name"
        );
        roles.create(" deployer ", "team", "").await.unwrap();
        assert!(matches!(
            roles.create("deployer", "team", "").await,
            Err(ServiceError::Permission(PermissionError::RoleAlreadyExists))
        ));
        assert_eq!(roles.get("deployer").await.unwrap().name, "deployer");
    }

    #[tokio::test]
    async fn test_permissions_must_fit_the_context_type() {
        let roles = RoleService::new(Storage::memory());
        roles.create("deployer", "team", "").await.unwrap();
        roles
            .add_permissions("deployer", &[APP_UPDATE.to_string()])
            .await
            .unwrap();
        assert!(matches!(
            roles.add_permissions("deployer", &[POOL_CREATE.to_string()]).await,
            Err(ServiceError::Permission(PermissionError::PermissionNotAllowed { .. }))
        ));
        assert!(matches!(
            roles.add_permissions("deployer", &["no.such".to_string()]).await,
            Err(ServiceError::Permission(PermissionError::PermissionNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_remove_blocked_while_assigned() {
        let storage = Storage::memory();
        with_user(&storage, "a@example.com").await;
        let roles = RoleService::new(storage);
        roles.create("deployer", "global", "").await.unwrap();
        roles.assign("a@example.com", "deployer", "").await.unwrap();

        assert!(matches!(
            roles.remove("deployer").await,
            Err(ServiceError::Permission(PermissionError::RemoveRoleWithUsers))
        ));
        roles.dissociate("a@example.com", "deployer", "").await.unwrap();
        roles.remove("deployer").await.unwrap();
        assert!(matches!(
            roles.get("deployer").await,
            Err(ServiceError::Permission(PermissionError::RoleNotFound))
        ));
    }

    #[tokio::test]
    async fn test_rename_follows_assignments() {
        let storage = Storage::memory();
        with_user(&storage, "a@example.com").await;
        let roles = RoleService::new(storage.clone());
        roles.create("old", "global", "").await.unwrap();
        roles.assign("a@example.com", "old", "").await.unwrap();

        roles.update("old", Some("new"), None, Some("desc")).await.unwrap();
        let user = storage.users.get("a@example.com").await.unwrap();
        assert_eq!(user.roles, vec![RoleInstance::new("new", "")]);
        assert_eq!(roles.get("new").await.unwrap().description, "desc");
        assert!(roles.get("old").await.is_err());
    }

    #[tokio::test]
    async fn test_context_value_must_exist() {
        let roles = RoleService::new(Storage::memory());
        let role = roles.create("deployer", "team", "").await.unwrap();
        assert!(roles.validate_context_value(&role, "").await.is_err());
        assert_eq!(
            roles
                .validate_context_value(&role, "ghost")
                .await
                .unwrap_err()
                .to_string(),
            "team ghost not found"
        );
    }
}
