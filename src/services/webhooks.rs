use tracing::info;

use super::{valid_name, ServiceError};
use crate::storage::models::Webhook;
use crate::storage::{Storage, StorageError};

pub struct WebhookService {
    storage: Storage,
}

impl WebhookService {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Webhooks owned by one of `teams`; `None` lists all of them.
    pub async fn list(&self, teams: Option<&[String]>) -> Result<Vec<Webhook>, ServiceError> {
        let hooks = self.storage.webhooks.list().await?;
        Ok(match teams {
            None => hooks,
            Some(teams) => hooks
                .into_iter()
                .filter(|h| teams.contains(&h.team_owner))
                .collect(),
        })
    }

    pub async fn get(&self, name: &str) -> Result<Webhook, ServiceError> {
        self.storage
            .webhooks
            .find(name)
            .await?
            .ok_or_else(|| ServiceError::NotFound("webhook not found".into()))
    }

    async fn validate(&self, hook: &mut Webhook) -> Result<(), ServiceError> {
        if hook.name.is_empty() {
            return Err(ServiceError::Validation("webhook name must not be empty".into()));
        }
        if !valid_name(&hook.name) {
            return Err(ServiceError::Validation(
                "Invalid webhook name, webhook name should have at most 40 characters, containing only lower case letters, numbers or dashes, starting with a letter.".into(),
            ));
        }
        if hook.url.is_empty() {
            return Err(ServiceError::Validation("webhook url must not be empty".into()));
        }
        url::Url::parse(&hook.url)
            .map_err(|e| ServiceError::Validation(format!("webhook url is not valid: {}", e)))?;
        if !hook.proxy_url.is_empty() {
            url::Url::parse(&hook.proxy_url).map_err(|e| {
                ServiceError::Validation(format!("webhook proxy url is not valid: {}", e))
            })?;
        }
        if hook.team_owner.is_empty() {
            return Err(ServiceError::Validation("webhook team owner is required".into()));
        }
        if self.storage.teams.find(&hook.team_owner).await?.is_none() {
            return Err(ServiceError::NotFound("Team not found".into()));
        }
        if hook.method.is_empty() {
            hook.method = "POST".into();
        }
        hook.method = hook.method.to_uppercase();
        Ok(())
    }

    pub async fn create(&self, mut hook: Webhook) -> Result<Webhook, ServiceError> {
        self.validate(&mut hook).await?;
        match self.storage.webhooks.insert(hook.clone()).await {
            Ok(()) => {
                info!("webhook {} created for team {}", hook.name, hook.team_owner);
                Ok(hook)
            }
            Err(StorageError::AlreadyExists { .. }) => Err(ServiceError::Conflict(format!(
                "webhook with name {:?} already exists",
                hook.name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update(&self, mut hook: Webhook) -> Result<(), ServiceError> {
        self.get(&hook.name).await?;
        self.validate(&mut hook).await?;
        Ok(self.storage.webhooks.update(hook).await?)
    }

    pub async fn remove(&self, name: &str) -> Result<(), ServiceError> {
        self.get(name).await?;
        self.storage.webhooks.remove(name).await?;
        info!("webhook {} removed", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::Team;

    async fn service() -> WebhookService {
        let storage = Storage::memory();
        storage
            .teams
            .insert(Team {
                name: "acme".into(),
                tags: vec![],
                created_by: String::new(),
            })
            .await
            .unwrap();
        WebhookService::new(storage)
    }

    fn hook(name: &str, url: &str) -> Webhook {
        Webhook {
            name: name.into(),
            url: url.into(),
            team_owner: "acme".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_validation_messages() {
        let svc = service().await;
        assert_eq!(
            svc.create(hook("", "http://a.com")).await.unwrap_err().to_string(),
            "webhook name must not be empty"
        );
        assert!(svc
            .create(hook("Bad_Name", "http://a.com"))
            .await
            .unwrap_err()
            .to_string()
            .starts_with("Invalid webhook name"));
        assert_eq!(
            svc.create(hook("wh1", "")).await.unwrap_err().to_string(),
            "webhook url must not be empty"
        );
        assert!(svc
            .create(hook("wh1", "not a url"))
            .await
            .unwrap_err()
            .to_string()
            .starts_with("webhook url is not valid"));
    }

    #[tokio::test]
    async fn test_create_defaults_method_and_filters_by_team() {
        let svc = service().await;
        let created = svc.create(hook("wh1", "http://a.com/hook")).await.unwrap();
        assert_eq!(created.method, "POST");
        assert!(matches!(
            svc.create(hook("wh1", "http://a.com/hook")).await,
            Err(ServiceError::Conflict(_))
        ));
        assert_eq!(svc.list(Some(&["acme".to_string()])).await.unwrap().len(), 1);
        assert!(svc.list(Some(&["other".to_string()])).await.unwrap().is_empty());
        svc.remove("wh1").await.unwrap();
        assert!(svc.list(None).await.unwrap().is_empty());
    }
}
