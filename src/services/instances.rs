use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::{valid_instance_name, RequestMeta, ServiceBackend, ServiceError, ServicePlan};
use crate::event::Event;
use crate::storage::models::{Service, ServiceInstance};
use crate::storage::{Storage, StorageError};

/// Lifecycle of service instances and their app and job bindings.
pub struct InstanceService {
    storage: Storage,
    backend: Arc<dyn ServiceBackend>,
}

impl InstanceService {
    pub fn new(storage: Storage, backend: Arc<dyn ServiceBackend>) -> Self {
        Self { storage, backend }
    }

    pub fn backend(&self) -> &Arc<dyn ServiceBackend> {
        &self.backend
    }

    pub async fn get(&self, service: &str, name: &str) -> Result<ServiceInstance, ServiceError> {
        self.storage
            .service_instances
            .find(&format!("{}/{}", service, name))
            .await?
            .ok_or_else(|| ServiceError::NotFound("service instance not found".into()))
    }

    pub async fn list(&self) -> Result<Vec<ServiceInstance>, ServiceError> {
        Ok(self.storage.service_instances.list().await?)
    }

    /// Register the instance and ask the back end to provision it.
    /// The record is rolled back when the back end refuses.
    pub async fn create(
        &self,
        service: &Service,
        mut instance: ServiceInstance,
        meta: &RequestMeta,
    ) -> Result<ServiceInstance, ServiceError> {
        if !valid_instance_name(&instance.name) {
            return Err(ServiceError::Validation(
                "Invalid service instance name, the name should start with a letter and contain only letters, numbers, underscores and dashes.".into(),
            ));
        }
        if self.storage.teams.find(&instance.team_owner).await?.is_none() {
            return Err(ServiceError::Validation(format!(
                "Team owner {:?} not found",
                instance.team_owner
            )));
        }
        instance.service_name = service.name.clone();
        if !instance.teams.contains(&instance.team_owner) {
            instance.teams.push(instance.team_owner.clone());
        }

        match self.storage.service_instances.insert(instance.clone()).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists { .. }) => {
                return Err(ServiceError::Conflict("Instance name already exists.".into()))
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.backend.create(service, &instance, meta).await {
            warn!(
                "service {} refused instance {}: {}",
                service.name, instance.name, e
            );
            if let Err(rollback) = self
                .storage
                .service_instances
                .remove(&instance.context_value())
                .await
            {
                warn!("unable to roll back instance {}: {}", instance.name, rollback);
            }
            return Err(e);
        }
        info!("service instance {} created", instance.context_value());
        Ok(instance)
    }

    /// Persist new attributes and notify the back end.
    pub async fn update(
        &self,
        service: &Service,
        instance: ServiceInstance,
        meta: &RequestMeta,
    ) -> Result<(), ServiceError> {
        self.storage.service_instances.update(instance.clone()).await?;
        self.backend.update(service, &instance, meta).await
    }

    /// Remove an instance. With `unbind_all` every bound app and job is
    /// unbound first, each step reported on the event log; targets already
    /// unbound stay unbound if a later step fails.
    pub async fn remove(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        unbind_all: bool,
        evt: &Event,
        meta: &RequestMeta,
    ) -> Result<(), ServiceError> {
        let mut current = self.get(&instance.service_name, &instance.name).await?;
        let bound = !current.apps.is_empty() || !current.jobs.is_empty();
        if bound && !unbind_all && !current.force_remove {
            return Err(ServiceError::InstanceHasBindings {
                apps: current.apps.clone(),
                jobs: current.jobs.clone(),
            });
        }

        if unbind_all {
            for app in current.apps.clone() {
                evt.log(format!("Unbind app {:?} ...", app));
                self.backend
                    .unbind_app(service, &current, &app, meta)
                    .await?;
                current.apps.retain(|a| *a != app);
                self.storage.service_instances.update(current.clone()).await?;
            }
            for job in current.jobs.clone() {
                evt.log(format!("Unbind job {:?} ...", job));
                self.backend
                    .unbind_job(service, &current, &job, meta)
                    .await?;
                current.jobs.retain(|j| *j != job);
                self.storage.service_instances.update(current.clone()).await?;
            }
        }

        match self.backend.destroy(service, &current, meta).await {
            Ok(()) => {}
            Err(ServiceError::NotFound(_)) if current.force_remove => {
                warn!("instance {} already gone from back end", current.name);
            }
            Err(e) => return Err(e),
        }
        self.storage
            .service_instances
            .remove(&current.context_value())
            .await?;
        info!("service instance {} removed", current.context_value());
        Ok(())
    }

    pub async fn bind_app(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        app: &str,
        evt: &Event,
        meta: &RequestMeta,
    ) -> Result<BTreeMap<String, String>, ServiceError> {
        let mut current = self.get(&instance.service_name, &instance.name).await?;
        if current.apps.iter().any(|a| a == app) {
            return Err(ServiceError::Conflict(
                "This app is already bound to this service instance.".into(),
            ));
        }
        let envs = self.backend.bind_app(service, &current, app, meta).await?;
        current.apps.push(app.to_string());
        self.storage.service_instances.update(current).await?;
        for name in envs.keys() {
            evt.log(format!("---- Setting {} environment variable ----", name));
        }
        evt.log(format!(
            "Instance {:?} is now bound to the app {:?}.",
            instance.name, app
        ));
        Ok(envs)
    }

    pub async fn unbind_app(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        app: &str,
        evt: &Event,
        meta: &RequestMeta,
    ) -> Result<(), ServiceError> {
        let mut current = self.get(&instance.service_name, &instance.name).await?;
        if !current.apps.iter().any(|a| a == app) {
            return Err(ServiceError::NotBound);
        }
        self.backend.unbind_app(service, &current, app, meta).await?;
        current.apps.retain(|a| a != app);
        self.storage.service_instances.update(current).await?;
        evt.log(format!(
            "Instance {:?} is not bound to the app {:?} anymore.",
            instance.name, app
        ));
        Ok(())
    }

    pub async fn bind_job(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        job: &str,
        evt: &Event,
        meta: &RequestMeta,
    ) -> Result<BTreeMap<String, String>, ServiceError> {
        let mut current = self.get(&instance.service_name, &instance.name).await?;
        if current.jobs.iter().any(|j| j == job) {
            return Err(ServiceError::Conflict(
                "This job is already bound to this service instance.".into(),
            ));
        }
        let envs = self.backend.bind_job(service, &current, job, meta).await?;
        current.jobs.push(job.to_string());
        self.storage.service_instances.update(current).await?;
        evt.log(format!(
            "Instance {:?} is now bound to the job {:?}.",
            instance.name, job
        ));
        Ok(envs)
    }

    pub async fn unbind_job(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        job: &str,
        evt: &Event,
        meta: &RequestMeta,
    ) -> Result<(), ServiceError> {
        let mut current = self.get(&instance.service_name, &instance.name).await?;
        if !current.jobs.iter().any(|j| j == job) {
            return Err(ServiceError::Validation(
                "This job is not bound to this service instance.".into(),
            ));
        }
        self.backend.unbind_job(service, &current, job, meta).await?;
        current.jobs.retain(|j| j != job);
        self.storage.service_instances.update(current).await?;
        evt.log(format!(
            "Instance {:?} is not bound to the job {:?} anymore.",
            instance.name, job
        ));
        Ok(())
    }

    pub async fn grant_team(
        &self,
        instance: &ServiceInstance,
        team: &str,
    ) -> Result<(), ServiceError> {
        if self.storage.teams.find(team).await?.is_none() {
            return Err(ServiceError::NotFound("Team not found".into()));
        }
        let mut current = self.get(&instance.service_name, &instance.name).await?;
        if current.teams.iter().any(|t| t == team) {
            return Err(ServiceError::Conflict(
                "This team already has access to this instance".into(),
            ));
        }
        current.teams.push(team.to_string());
        Ok(self.storage.service_instances.update(current).await?)
    }

    pub async fn revoke_team(
        &self,
        instance: &ServiceInstance,
        team: &str,
    ) -> Result<(), ServiceError> {
        let mut current = self.get(&instance.service_name, &instance.name).await?;
        if !current.teams.iter().any(|t| t == team) {
            return Err(ServiceError::NotFound(
                "This team does not have access to this instance".into(),
            ));
        }
        if current.team_owner == team {
            return Err(ServiceError::Precondition(
                "You cannot revoke access from the team owner of the instance".into(),
            ));
        }
        current.teams.retain(|t| t != team);
        Ok(self.storage.service_instances.update(current).await?)
    }

    pub async fn status(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        meta: &RequestMeta,
    ) -> Result<String, ServiceError> {
        self.backend.status(service, instance, meta).await
    }

    pub async fn plans(
        &self,
        service: &Service,
        meta: &RequestMeta,
    ) -> Result<Vec<ServicePlan>, ServiceError> {
        self.backend.plans(service, meta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::journal::JournalSettings;
    use crate::event::{AllowedPermission, Journal, MemoryEventStore, Opts, Owner, Target, TargetType};
    use crate::permission::scheme::{SERVICE_INSTANCE_DELETE, SERVICE_INSTANCE_READ_EVENTS};
    use crate::permission::Context;
    use crate::services::backend::MemoryServiceBackend;
    use crate::storage::models::Team;
    use std::time::Duration;

    async fn event(journal: &Journal) -> Event {
        journal
            .new_event(Opts {
                target: Some(Target::new(TargetType::ServiceInstance, "mysql/db1")),
                kind: Some(SERVICE_INSTANCE_DELETE.to_string()),
                owner: Some(Owner::internal()),
                allowed: AllowedPermission::new(
                    SERVICE_INSTANCE_READ_EVENTS,
                    vec![Context::service_instance("mysql/db1")],
                ),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn setup() -> (InstanceService, Arc<MemoryServiceBackend>, Service, Journal) {
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
        let backend = Arc::new(MemoryServiceBackend::new());
        let journal = Journal::new(
            Arc::new(MemoryEventStore::new()),
            JournalSettings {
                lock_expire: Duration::from_secs(60),
                lock_update_interval: Duration::from_secs(5),
                app_lock_retry: Duration::ZERO,
                throttling: Vec::new(),
            },
        );
        let service = Service {
            name: "mysql".into(),
            ..Default::default()
        };
        (
            InstanceService::new(storage, backend.clone()),
            backend,
            service,
            journal,
        )
    }

    fn instance(name: &str) -> ServiceInstance {
        ServiceInstance {
            name: name.into(),
            team_owner: "acme".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_bad_names() {
        let (svc, backend, service, _) = setup().await;
        let meta = RequestMeta::default();
        let created = svc.create(&service, instance("db1"), &meta).await.unwrap();
        assert_eq!(created.teams, vec!["acme".to_string()]);
        assert!(matches!(
            svc.create(&service, instance("db1"), &meta).await,
            Err(ServiceError::Conflict(_))
        ));
        assert!(matches!(
            svc.create(&service, instance("1db"), &meta).await,
            Err(ServiceError::Validation(_))
        ));
        assert_eq!(backend.calls(), vec!["create mysql/db1".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_requires_unbind_all_when_bound() {
        let (svc, backend, service, journal) = setup().await;
        let meta = RequestMeta::default();
        let created = svc.create(&service, instance("db1"), &meta).await.unwrap();
        let evt = event(&journal).await;
        svc.bind_app(&service, &created, "foo-bar", &evt, &meta)
            .await
            .unwrap();

        let err = svc
            .remove(&service, &created, false, &evt, &meta)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("\"foo-bar\""));
        assert!(svc.get("mysql", "db1").await.is_ok());

        svc.remove(&service, &created, true, &evt, &meta).await.unwrap();
        assert!(svc.get("mysql", "db1").await.is_err());
        assert!(backend
            .calls()
            .contains(&"unbind-app mysql/db1 foo-bar".to_string()));
        evt.done(None).await.unwrap();
        let data = journal.get(evt.id()).await.unwrap();
        assert!(data.log.contains("Unbind app \"foo-bar\""));
    }

    #[tokio::test]
    async fn test_unbind_requires_binding() {
        let (svc, _, service, journal) = setup().await;
        let meta = RequestMeta::default();
        let created = svc.create(&service, instance("db1"), &meta).await.unwrap();
        let evt = event(&journal).await;
        assert!(matches!(
            svc.unbind_app(&service, &created, "ghost", &evt, &meta).await,
            Err(ServiceError::NotBound)
        ));
        evt.done(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_team_access() {
        let (svc, _, service, _) = setup().await;
        let created = svc
            .create(&service, instance("db1"), &RequestMeta::default())
            .await
            .unwrap();
        assert!(matches!(
            svc.grant_team(&created, "nobody").await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            svc.grant_team(&created, "acme").await,
            Err(ServiceError::Conflict(_))
        ));
        assert!(matches!(
            svc.revoke_team(&created, "acme").await,
            Err(ServiceError::Precondition(_))
        ));
    }
}
