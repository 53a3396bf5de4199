use std::sync::Arc;
use tracing::info;

use super::autoscale::validate_app_spec;
use super::{valid_name, BuildSource, Builder, PoolService, Provisioner, ProvisionerRegistry, ServiceError};
use crate::event::Event;
use crate::storage::models::{App, AutoScaleSpec};
use crate::storage::{Storage, StorageError};

/// Application records, unit autoscale and image builds.
pub struct AppService {
    storage: Storage,
    provisioners: ProvisionerRegistry,
    builder: Arc<dyn Builder>,
}

impl AppService {
    pub fn new(storage: Storage, provisioners: ProvisionerRegistry, builder: Arc<dyn Builder>) -> Self {
        Self {
            storage,
            provisioners,
            builder,
        }
    }

    pub async fn list(&self) -> Result<Vec<App>, ServiceError> {
        Ok(self.storage.apps.list().await?)
    }

    pub async fn get(&self, name: &str) -> Result<App, ServiceError> {
        self.storage
            .apps
            .find(name)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("App {} not found.", name)))
    }

    async fn provisioner_for(&self, app: &App) -> Result<Arc<dyn Provisioner>, ServiceError> {
        let provisioner = match self.storage.pools.find(&app.pool).await? {
            Some(pool) => pool.provisioner,
            None => String::new(),
        };
        self.provisioners.get(&provisioner)
    }

    pub async fn create(&self, mut app: App) -> Result<App, ServiceError> {
        if !valid_name(&app.name) {
            return Err(ServiceError::Validation(
                "Invalid app name, your app should have at most 40 characters, containing only lower case letters, numbers or dashes, starting with a letter.".into(),
            ));
        }
        if app.team_owner.is_empty() {
            return Err(ServiceError::Validation("team owner is required".into()));
        }
        if self.storage.teams.find(&app.team_owner).await?.is_none() {
            return Err(ServiceError::NotFound("Team not found".into()));
        }
        if app.pool.is_empty() {
            app.pool = PoolService::new(self.storage.clone())
                .default_for(&app.team_owner)
                .await?
                .name;
        } else if self.storage.pools.find(&app.pool).await?.is_none() {
            return Err(ServiceError::NotFound("Pool does not exist.".into()));
        }
        if app.plan.is_empty() {
            if let Some(plan) = self.storage.plans.list().await?.into_iter().find(|p| p.default) {
                app.plan = plan.name;
            }
        }
        if !app.teams.contains(&app.team_owner) {
            app.teams.push(app.team_owner.clone());
        }
        match self.storage.apps.insert(app.clone()).await {
            Ok(()) => {
                info!("app {} created in pool {}", app.name, app.pool);
                Ok(app)
            }
            Err(StorageError::AlreadyExists { .. }) => Err(ServiceError::Conflict(
                "there is already an app with this name".into(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply the non-empty fields of `changes` to the stored app.
    pub async fn update(&self, name: &str, changes: App) -> Result<App, ServiceError> {
        let mut app = self.get(name).await?;
        if !changes.description.is_empty() {
            app.description = changes.description;
        }
        if !changes.plan.is_empty() {
            if self.storage.plans.find(&changes.plan).await?.is_none() {
                return Err(ServiceError::NotFound("Plan not found".into()));
            }
            app.plan = changes.plan;
        }
        if !changes.pool.is_empty() {
            if self.storage.pools.find(&changes.pool).await?.is_none() {
                return Err(ServiceError::NotFound("Pool does not exist.".into()));
            }
            app.pool = changes.pool;
        }
        if !changes.team_owner.is_empty() {
            if self.storage.teams.find(&changes.team_owner).await?.is_none() {
                return Err(ServiceError::NotFound("Team not found".into()));
            }
            if !app.teams.contains(&changes.team_owner) {
                app.teams.push(changes.team_owner.clone());
            }
            app.team_owner = changes.team_owner;
        }
        self.storage.apps.update(app.clone()).await?;
        Ok(app)
    }

    /// Delete the app and drop it from every service instance binding list.
    pub async fn remove(&self, name: &str, evt: &Event) -> Result<(), ServiceError> {
        let app = self.get(name).await?;
        for mut instance in self.storage.service_instances.list().await? {
            if instance.apps.iter().any(|a| a == name) {
                instance.apps.retain(|a| a != name);
                evt.log(format!(
                    "Removing binding with instance {:?} of service {:?}",
                    instance.name, instance.service_name
                ));
                self.storage.service_instances.update(instance).await?;
            }
        }
        let provisioner = self.provisioner_for(&app).await?;
        for spec in &app.autoscale {
            provisioner.remove_autoscale(&app, &spec.process).await?;
        }
        self.storage.apps.remove(name).await?;
        evt.log(format!("app {:?} removed", name));
        Ok(())
    }

    pub async fn autoscale_info(&self, name: &str) -> Result<Vec<AutoScaleSpec>, ServiceError> {
        Ok(self.get(name).await?.autoscale)
    }

    /// Validate `spec`, hand it to the provisioner and store it for its process.
    pub async fn set_autoscale(&self, name: &str, spec: AutoScaleSpec) -> Result<(), ServiceError> {
        let mut app = self.get(name).await?;
        validate_app_spec(&spec)?;
        self.provisioner_for(&app)
            .await?
            .set_autoscale(&app, &spec)
            .await?;
        app.autoscale.retain(|s| s.process != spec.process);
        app.autoscale.push(spec);
        Ok(self.storage.apps.update(app).await?)
    }

    pub async fn remove_autoscale(&self, name: &str, process: &str) -> Result<(), ServiceError> {
        let mut app = self.get(name).await?;
        self.provisioner_for(&app)
            .await?
            .remove_autoscale(&app, process)
            .await?;
        app.autoscale.retain(|s| s.process != process);
        Ok(self.storage.apps.update(app).await?)
    }

    /// Build an image for the app and record it as the app's current image.
    pub async fn build(
        &self,
        name: &str,
        source: BuildSource,
        tag: Option<&str>,
        evt: &Event,
    ) -> Result<String, ServiceError> {
        let mut app = self.get(name).await?;
        let image = self.builder.build(&app, source, tag, evt).await?;
        evt.set_other_custom_data(serde_json::json!({ "image": image }))
            .await?;
        app.image = image.clone();
        self.storage.apps.update(app).await?;
        Ok(image)
    }
}
