use chrono::Utc;
use tracing::info;

use super::{valid_name, PoolService, ProvisionerRegistry, ServiceError};
use crate::event::Event;
use crate::storage::models::Job;
use crate::storage::{Storage, StorageError};

pub struct JobService {
    storage: Storage,
    provisioners: ProvisionerRegistry,
}

impl JobService {
    pub fn new(storage: Storage, provisioners: ProvisionerRegistry) -> Self {
        Self {
            storage,
            provisioners,
        }
    }

    pub async fn list(&self) -> Result<Vec<Job>, ServiceError> {
        Ok(self.storage.jobs.list().await?)
    }

    pub async fn get(&self, name: &str) -> Result<Job, ServiceError> {
        self.storage
            .jobs
            .find(name)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Job not found".into()))
    }

    pub async fn create(&self, mut job: Job) -> Result<Job, ServiceError> {
        if !valid_name(&job.name) {
            return Err(ServiceError::Validation(
                "Invalid job name, your job should have at most 40 characters, containing only lower case letters, numbers or dashes, starting with a letter.".into(),
            ));
        }
        if job.team_owner.is_empty() {
            return Err(ServiceError::Validation("team owner is required".into()));
        }
        if self.storage.teams.find(&job.team_owner).await?.is_none() {
            return Err(ServiceError::NotFound("Team not found".into()));
        }
        if job.container.image.is_empty() {
            return Err(ServiceError::Validation("container image is required".into()));
        }
        if job.pool.is_empty() {
            job.pool = PoolService::new(self.storage.clone())
                .default_for(&job.team_owner)
                .await?
                .name;
        }
        if !job.teams.contains(&job.team_owner) {
            job.teams.push(job.team_owner.clone());
        }
        match self.storage.jobs.insert(job.clone()).await {
            Ok(()) => {
                info!("job {} created in pool {}", job.name, job.pool);
                Ok(job)
            }
            Err(StorageError::AlreadyExists { .. }) => Err(ServiceError::Conflict(
                "a job with the same name already exists".into(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply the non-empty fields of `changes` to the stored job.
    pub async fn update(&self, name: &str, changes: Job) -> Result<Job, ServiceError> {
        let mut job = self.get(name).await?;
        if !changes.description.is_empty() {
            job.description = changes.description;
        }
        if !changes.schedule.is_empty() {
            job.schedule = changes.schedule;
        }
        if !changes.plan.is_empty() {
            job.plan = changes.plan;
        }
        if !changes.container.image.is_empty() {
            job.container = changes.container;
        }
        if !changes.envs.is_empty() {
            job.envs.extend(changes.envs);
        }
        if !changes.team_owner.is_empty() {
            if self.storage.teams.find(&changes.team_owner).await?.is_none() {
                return Err(ServiceError::NotFound("Team not found".into()));
            }
            job.team_owner = changes.team_owner;
        }
        self.storage.jobs.update(job.clone()).await?;
        Ok(job)
    }

    pub async fn remove(&self, name: &str) -> Result<(), ServiceError> {
        self.get(name).await?;
        let bound = self
            .storage
            .service_instances
            .list()
            .await?
            .into_iter()
            .any(|i| i.jobs.iter().any(|j| j == name));
        if bound {
            return Err(ServiceError::Precondition(
                "job is bound to service instances, unbind them before removing it".into(),
            ));
        }
        self.storage.jobs.remove(name).await?;
        info!("job {} removed", name);
        Ok(())
    }

    /// Run the job now, outside its schedule.
    pub async fn trigger(&self, name: &str, evt: &Event) -> Result<(), ServiceError> {
        let mut job = self.get(name).await?;
        let provisioner = match self.storage.pools.find(&job.pool).await? {
            Some(pool) => self.provisioners.get(&pool.provisioner)?,
            None => self.provisioners.default_provisioner().clone(),
        };
        provisioner.trigger_job(&job, evt).await?;
        job.last_trigger = Some(Utc::now());
        Ok(self.storage.jobs.update(job).await?)
    }
}
