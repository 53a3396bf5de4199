use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::scheme::{self, PermissionRegistry, ROOT};
use super::{Context, ContextType, Permission, PermissionError};

/// Events that automatically assign a role to the acting user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoleEvent {
    TeamCreate,
    UserCreate,
}

impl RoleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleEvent::TeamCreate => "team-create",
            RoleEvent::UserCreate => "user-create",
        }
    }

    pub fn context_type(&self) -> ContextType {
        match self {
            RoleEvent::TeamCreate => ContextType::Team,
            RoleEvent::UserCreate => ContextType::Global,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            RoleEvent::TeamCreate => "role added to user when a new team is created",
            RoleEvent::UserCreate => "role added to user when user is created",
        }
    }

    pub fn all() -> [RoleEvent; 2] {
        [RoleEvent::TeamCreate, RoleEvent::UserCreate]
    }
}

impl fmt::Display for RoleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleEvent {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "team-create" => Ok(RoleEvent::TeamCreate),
            "user-create" => Ok(RoleEvent::UserCreate),
            other => Err(PermissionError::InvalidRoleEvent(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(rename = "context")]
    pub context_type: ContextType,
    pub description: String,
    pub scheme_names: Vec<String>,
    pub events: Vec<RoleEvent>,
}

/// A role bound to a context value on some principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleInstance {
    pub name: String,
    #[serde(rename = "contextvalue")]
    pub context_value: String,
}

impl RoleInstance {
    pub fn new(name: impl Into<String>, context_value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context_value: context_value.into(),
        }
    }
}

impl Role {
    /// Validate a new role. The name is trimmed; persistence checks uniqueness.
    pub fn new(name: &str, context_type: &str, description: &str) -> Result<Role, PermissionError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PermissionError::InvalidRoleName);
        }
        let context_type = context_type.parse::<ContextType>()?;
        Ok(Role {
            name: name.to_string(),
            context_type,
            description: description.to_string(),
            scheme_names: Vec::new(),
            events: Vec::new(),
        })
    }

    pub fn add_permissions(
        &mut self,
        registry: &PermissionRegistry,
        names: &[String],
    ) -> Result<(), PermissionError> {
        for name in names {
            if name != ROOT {
                if !registry.contains(name) {
                    return Err(PermissionError::PermissionNotFound(name.clone()));
                }
                if !registry.allowed_contexts(name).contains(&self.context_type) {
                    return Err(PermissionError::PermissionNotAllowed {
                        permission: name.clone(),
                        context: self.context_type.to_string(),
                    });
                }
            }
        }
        for name in names {
            if !self.scheme_names.contains(name) {
                self.scheme_names.push(name.clone());
            }
        }
        Ok(())
    }

    pub fn remove_permissions(&mut self, names: &[String]) {
        self.scheme_names.retain(|n| !names.contains(n));
    }

    pub fn add_event(&mut self, event: RoleEvent) -> Result<(), PermissionError> {
        if event.context_type() != self.context_type {
            return Err(PermissionError::RoleEventContextMismatch {
                event: event.to_string(),
                context: self.context_type.to_string(),
            });
        }
        if !self.events.contains(&event) {
            self.events.push(event);
        }
        Ok(())
    }

    pub fn remove_event(&mut self, event: RoleEvent) {
        self.events.retain(|e| *e != event);
    }

    /// Cartesian product of this role's schemes with the assigned context value.
    pub fn permissions_for(&self, context_value: &str) -> Vec<Permission> {
        let context = Context::new(self.context_type, context_value);
        self.valid_schemes()
            .map(|s| Permission::new(s.clone(), context.clone()))
            .collect()
    }

    fn valid_schemes(&self) -> impl Iterator<Item = &String> {
        let registry = scheme::registry();
        self.scheme_names
            .iter()
            .filter(move |s| registry.contains(s))
    }
}
