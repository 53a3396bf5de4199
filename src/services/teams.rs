use tracing::info;

use super::{valid_name, ServiceError};
use crate::permission::{RoleEvent, RoleInstance};
use crate::storage::models::{Team, User};
use crate::storage::{Storage, StorageError};

pub struct TeamService {
    storage: Storage,
}

impl TeamService {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub async fn list(&self) -> Result<Vec<Team>, ServiceError> {
        Ok(self.storage.teams.list().await?)
    }

    pub async fn get(&self, name: &str) -> Result<Team, ServiceError> {
        self.storage
            .teams
            .find(name)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Team not found".into()))
    }

    /// Create a team and hand the creator every role bound to team creation.
    pub async fn create(&self, team: Team, creator: Option<&User>) -> Result<Team, ServiceError> {
        let name = team.name.trim().to_string();
        if !valid_name(&name) {
            return Err(ServiceError::Validation(
                "Invalid team name, team name should have at most 40 characters, containing only lower case letters, numbers or dashes, starting with a letter.".into(),
            ));
        }
        let team = Team { name, ..team };
        match self.storage.teams.insert(team.clone()).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists { .. }) => {
                return Err(ServiceError::Conflict("team already exists".into()))
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(creator) = creator {
            assign_event_roles(&self.storage, &creator.email, RoleEvent::TeamCreate, &team.name)
                .await?;
        }
        info!("team {} created", team.name);
        Ok(team)
    }

    /// Rename a team and/or replace its tags. A rename is carried to every
    /// app, job, pool and service instance referencing the team.
    pub async fn update(
        &self,
        name: &str,
        new_name: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<Team, ServiceError> {
        let mut team = self.get(name).await?;
        if let Some(tags) = tags {
            team.tags = tags;
        }
        let new_name = new_name.filter(|n| !n.is_empty() && n != name);
        let Some(new_name) = new_name else {
            self.storage.teams.update(team.clone()).await?;
            return Ok(team);
        };

        if !valid_name(&new_name) {
            return Err(ServiceError::Validation("Invalid new team name".into()));
        }
        team.name = new_name.clone();
        match self.storage.teams.insert(team.clone()).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists { .. }) => {
                return Err(ServiceError::Conflict("team already exists".into()))
            }
            Err(e) => return Err(e.into()),
        }
        self.rename_references(name, &new_name).await?;
        self.storage.teams.remove(name).await?;
        info!("team {} renamed to {}", name, new_name);
        Ok(team)
    }

    async fn rename_references(&self, old: &str, new: &str) -> Result<(), ServiceError> {
        let swap = |teams: &mut Vec<String>| {
            for t in teams.iter_mut().filter(|t| t.as_str() == old) {
                *t = new.to_string();
            }
        };
        for mut app in self.storage.apps.list().await? {
            if app.team_owner == old || app.teams.iter().any(|t| t == old) {
                if app.team_owner == old {
                    app.team_owner = new.to_string();
                }
                swap(&mut app.teams);
                self.storage.apps.update(app).await?;
            }
        }
        for mut job in self.storage.jobs.list().await? {
            if job.team_owner == old || job.teams.iter().any(|t| t == old) {
                if job.team_owner == old {
                    job.team_owner = new.to_string();
                }
                swap(&mut job.teams);
                self.storage.jobs.update(job).await?;
            }
        }
        for mut instance in self.storage.service_instances.list().await? {
            if instance.team_owner == old || instance.teams.iter().any(|t| t == old) {
                if instance.team_owner == old {
                    instance.team_owner = new.to_string();
                }
                swap(&mut instance.teams);
                self.storage.service_instances.update(instance).await?;
            }
        }
        for mut pool in self.storage.pools.list().await? {
            if pool.teams.iter().any(|t| t == old) {
                swap(&mut pool.teams);
                self.storage.pools.update(pool).await?;
            }
        }
        Ok(())
    }

    /// Remove a team that no app or service instance references.
    pub async fn remove(&self, name: &str) -> Result<(), ServiceError> {
        self.get(name).await?;
        let apps: Vec<String> = self
            .storage
            .apps
            .list()
            .await?
            .into_iter()
            .filter(|a| a.team_owner == name || a.teams.iter().any(|t| t == name))
            .map(|a| a.name)
            .collect();
        let instances: Vec<String> = self
            .storage
            .service_instances
            .list()
            .await?
            .into_iter()
            .filter(|i| i.team_owner == name || i.teams.iter().any(|t| t == name))
            .map(|i| i.context_value())
            .collect();
        if !apps.is_empty() || !instances.is_empty() {
            let mut message = String::from("This team cannot be removed because there are still references to it:");
            if !apps.is_empty() {
                message.push_str(&format!("\nApps: {}", apps.join(", ")));
            }
            if !instances.is_empty() {
                message.push_str(&format!("\nService instances: {}", instances.join(", ")));
            }
            return Err(ServiceError::Precondition(message));
        }
        self.storage.teams.remove(name).await?;
        info!("team {} removed", name);
        Ok(())
    }
}

/// Give `email` every role registered for `event`, on `context_value`.
pub async fn assign_event_roles(
    storage: &Storage,
    email: &str,
    event: RoleEvent,
    context_value: &str,
) -> Result<(), ServiceError> {
    let roles: Vec<String> = storage
        .roles
        .list()
        .await?
        .into_iter()
        .filter(|r| r.events.contains(&event))
        .map(|r| r.name)
        .collect();
    if roles.is_empty() {
        return Ok(());
    }
    let Some(mut user) = storage.users.find(email).await? else {
        return Ok(());
    };
    for role in roles {
        let assignment = RoleInstance::new(role, context_value);
        if !user.roles.contains(&assignment) {
            user.roles.push(assignment);
        }
    }
    Ok(storage.users.update(user).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::Role;
    use crate::storage::models::App;

    fn team(name: &str) -> Team {
        Team {
            name: name.into(),
            tags: vec![],
            created_by: "me@example.com".into(),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_default_roles() {
        let storage = Storage::memory();
        let mut role = Role::new("team-member", "team", "").unwrap();
        role.add_event(RoleEvent::TeamCreate).unwrap();
        storage.roles.insert(role).await.unwrap();
        let user = User {
            email: "me@example.com".into(),
            password: String::new(),
            api_key: None,
            roles: vec![],
        };
        storage.users.insert(user.clone()).await.unwrap();

        let svc = TeamService::new(storage.clone());
        svc.create(team("acme"), Some(&user)).await.unwrap();
        let stored = storage.users.get("me@example.com").await.unwrap();
        assert_eq!(stored.roles, vec![RoleInstance::new("team-member", "acme")]);

        assert!(matches!(
            svc.create(team("acme"), None).await,
            Err(ServiceError::Conflict(_))
        ));
        assert!(matches!(
            svc.create(team("Bad Name"), None).await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_blocked_by_apps() {
        let storage = Storage::memory();
        let svc = TeamService::new(storage.clone());
        svc.create(team("acme"), None).await.unwrap();
        storage
            .apps
            .insert(App {
                name: "myapp".into(),
                team_owner: "acme".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let err = svc.remove("acme").await.unwrap_err();
        assert!(err.to_string().contains("Apps: myapp"));

        svc.update("acme", Some("acme2".into()), None).await.unwrap();
        assert_eq!(storage.apps.get("myapp").await.unwrap().team_owner, "acme2");
        assert!(storage.teams.find("acme").await.unwrap().is_none());
    }
}
