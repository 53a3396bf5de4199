use once_cell::sync::Lazy;
use std::collections::BTreeMap;

use super::ContextType;

/// Name used by roles to grant every registered scheme.
pub const ROOT: &str = "*";

pub const APP: &str = "app";
pub const APP_CREATE: &str = "app.create";
pub const APP_DELETE: &str = "app.delete";
pub const APP_READ: &str = "app.read";
pub const APP_READ_EVENTS: &str = "app.read.events";
pub const APP_UPDATE: &str = "app.update";
pub const APP_BUILD: &str = "app.build";
pub const APP_DEPLOY: &str = "app.deploy";
pub const APP_UPDATE_UNIT_AUTOSCALE_ADD: &str = "app.update.unit.autoscale.add";
pub const APP_UPDATE_UNIT_AUTOSCALE_REMOVE: &str = "app.update.unit.autoscale.remove";
pub const APP_READ_UNIT_AUTOSCALE: &str = "app.read.unit.autoscale";
pub const APP_UPDATE_BIND: &str = "app.update.bind";
pub const APP_UPDATE_UNBIND: &str = "app.update.unbind";

pub const JOB: &str = "job";
pub const JOB_CREATE: &str = "job.create";
pub const JOB_DELETE: &str = "job.delete";
pub const JOB_READ: &str = "job.read";
pub const JOB_READ_EVENTS: &str = "job.read.events";
pub const JOB_UPDATE: &str = "job.update";
pub const JOB_TRIGGER: &str = "job.trigger";
pub const JOB_UPDATE_BIND: &str = "job.update.bind";
pub const JOB_UPDATE_UNBIND: &str = "job.update.unbind";

pub const TEAM: &str = "team";
pub const TEAM_CREATE: &str = "team.create";
pub const TEAM_DELETE: &str = "team.delete";
pub const TEAM_READ: &str = "team.read";
pub const TEAM_READ_EVENTS: &str = "team.read.events";
pub const TEAM_UPDATE: &str = "team.update";

pub const USER: &str = "user";
pub const USER_CREATE: &str = "user.create";
pub const USER_DELETE: &str = "user.delete";
pub const USER_READ: &str = "user.read";
pub const USER_READ_EVENTS: &str = "user.read.events";
pub const USER_UPDATE: &str = "user.update";
pub const USER_UPDATE_TOKEN: &str = "user.update.token";
pub const USER_UPDATE_PASSWORD: &str = "user.update.password";
pub const USER_UPDATE_RESET: &str = "user.update.reset";

pub const SERVICE: &str = "service";
pub const SERVICE_CREATE: &str = "service.create";
pub const SERVICE_DELETE: &str = "service.delete";
pub const SERVICE_READ: &str = "service.read";
pub const SERVICE_READ_DOC: &str = "service.read.doc";
pub const SERVICE_READ_PLANS: &str = "service.read.plans";
pub const SERVICE_READ_EVENTS: &str = "service.read.events";
pub const SERVICE_UPDATE: &str = "service.update";
pub const SERVICE_UPDATE_PROXY: &str = "service.update.proxy";
pub const SERVICE_UPDATE_DOC: &str = "service.update.doc";
pub const SERVICE_UPDATE_GRANT_ACCESS: &str = "service.update.grant-access";
pub const SERVICE_UPDATE_REVOKE_ACCESS: &str = "service.update.revoke-access";

pub const SERVICE_INSTANCE: &str = "service-instance";
pub const SERVICE_INSTANCE_CREATE: &str = "service-instance.create";
pub const SERVICE_INSTANCE_DELETE: &str = "service-instance.delete";
pub const SERVICE_INSTANCE_READ: &str = "service-instance.read";
pub const SERVICE_INSTANCE_READ_EVENTS: &str = "service-instance.read.events";
pub const SERVICE_INSTANCE_READ_STATUS: &str = "service-instance.read.status";
pub const SERVICE_INSTANCE_UPDATE: &str = "service-instance.update";
pub const SERVICE_INSTANCE_UPDATE_PROXY: &str = "service-instance.update.proxy";
pub const SERVICE_INSTANCE_UPDATE_BIND: &str = "service-instance.update.bind";
pub const SERVICE_INSTANCE_UPDATE_UNBIND: &str = "service-instance.update.unbind";
pub const SERVICE_INSTANCE_UPDATE_GRANT: &str = "service-instance.update.grant";
pub const SERVICE_INSTANCE_UPDATE_REVOKE: &str = "service-instance.update.revoke";
pub const SERVICE_INSTANCE_UPDATE_DESCRIPTION: &str = "service-instance.update.description";
pub const SERVICE_INSTANCE_UPDATE_TAGS: &str = "service-instance.update.tags";
pub const SERVICE_INSTANCE_UPDATE_TEAMOWNER: &str = "service-instance.update.teamowner";
pub const SERVICE_INSTANCE_UPDATE_PLAN: &str = "service-instance.update.plan";

pub const POOL: &str = "pool";
pub const POOL_CREATE: &str = "pool.create";
pub const POOL_DELETE: &str = "pool.delete";
pub const POOL_READ: &str = "pool.read";
pub const POOL_READ_EVENTS: &str = "pool.read.events";
pub const POOL_UPDATE: &str = "pool.update";
pub const POOL_UPDATE_TEAM_ADD: &str = "pool.update.team.add";
pub const POOL_UPDATE_TEAM_REMOVE: &str = "pool.update.team.remove";

pub const CLUSTER: &str = "cluster";
pub const CLUSTER_CREATE: &str = "cluster.create";
pub const CLUSTER_DELETE: &str = "cluster.delete";
pub const CLUSTER_READ: &str = "cluster.read";
pub const CLUSTER_READ_EVENTS: &str = "cluster.read.events";
pub const CLUSTER_UPDATE: &str = "cluster.update";

pub const NODE_AUTOSCALE: &str = "node.autoscale";
pub const NODE_AUTOSCALE_READ: &str = "node.autoscale.read";
pub const NODE_AUTOSCALE_UPDATE: &str = "node.autoscale.update";
pub const NODE_AUTOSCALE_UPDATE_RUN: &str = "node.autoscale.update.run";
pub const NODE_AUTOSCALE_DELETE: &str = "node.autoscale.delete";

pub const NODECONTAINER: &str = "nodecontainer";
pub const NODECONTAINER_CREATE: &str = "nodecontainer.create";
pub const NODECONTAINER_DELETE: &str = "nodecontainer.delete";
pub const NODECONTAINER_READ: &str = "nodecontainer.read";
pub const NODECONTAINER_UPDATE: &str = "nodecontainer.update";
pub const NODECONTAINER_UPDATE_UPGRADE: &str = "nodecontainer.update.upgrade";

pub const WEBHOOK: &str = "webhook";
pub const WEBHOOK_CREATE: &str = "webhook.create";
pub const WEBHOOK_DELETE: &str = "webhook.delete";
pub const WEBHOOK_READ: &str = "webhook.read";
pub const WEBHOOK_UPDATE: &str = "webhook.update";

pub const VOLUME: &str = "volume";
pub const VOLUME_CREATE: &str = "volume.create";
pub const VOLUME_DELETE: &str = "volume.delete";
pub const VOLUME_READ: &str = "volume.read";
pub const VOLUME_READ_EVENTS: &str = "volume.read.events";
pub const VOLUME_UPDATE: &str = "volume.update";

pub const ROLE: &str = "role";
pub const ROLE_CREATE: &str = "role.create";
pub const ROLE_DELETE: &str = "role.delete";
pub const ROLE_READ_EVENTS: &str = "role.read.events";
pub const ROLE_UPDATE: &str = "role.update";
pub const ROLE_UPDATE_ASSIGN: &str = "role.update.assign";
pub const ROLE_UPDATE_DISSOCIATE: &str = "role.update.dissociate";
pub const ROLE_UPDATE_PERMISSION_ADD: &str = "role.update.permission.add";
pub const ROLE_UPDATE_PERMISSION_REMOVE: &str = "role.update.permission.remove";
pub const ROLE_DEFAULT_CREATE: &str = "role.default.create";
pub const ROLE_DEFAULT_DELETE: &str = "role.default.delete";

pub const PLAN: &str = "plan";
pub const PLAN_CREATE: &str = "plan.create";
pub const PLAN_DELETE: &str = "plan.delete";
pub const PLAN_READ: &str = "plan.read";

pub const PLATFORM: &str = "platform";
pub const PLATFORM_CREATE: &str = "platform.create";
pub const PLATFORM_DELETE: &str = "platform.delete";
pub const PLATFORM_READ: &str = "platform.read";
pub const PLATFORM_UPDATE: &str = "platform.update";

pub const EVENT_CANCEL: &str = "event.cancel";

/// App actions served by other components that roles may still grant.
const APP_EXTRA: &[&str] = &[
    "app.admin.quota",
    "app.admin.routes",
    "app.admin.unlock",
    "app.deploy.archive-url",
    "app.deploy.build",
    "app.deploy.git",
    "app.deploy.image",
    "app.deploy.rollback",
    "app.deploy.upload",
    "app.read.certificate",
    "app.read.deploy",
    "app.read.env",
    "app.read.info",
    "app.read.log",
    "app.read.metric",
    "app.read.router",
    "app.run",
    "app.run.shell",
    "app.update.bind-volume",
    "app.update.certificate.set",
    "app.update.certificate.unset",
    "app.update.cname.add",
    "app.update.cname.remove",
    "app.update.description",
    "app.update.env.set",
    "app.update.env.unset",
    "app.update.grant",
    "app.update.image-reset",
    "app.update.log",
    "app.update.plan",
    "app.update.platform",
    "app.update.pool",
    "app.update.restart",
    "app.update.revoke",
    "app.update.router.add",
    "app.update.router.remove",
    "app.update.router.update",
    "app.update.start",
    "app.update.stop",
    "app.update.tags",
    "app.update.teamowner",
    "app.update.unbind-volume",
    "app.update.unit.add",
    "app.update.unit.register",
    "app.update.unit.remove",
    "app.update.unit.status",
];

const TEAM_EXTRA: &[&str] = &[
    "team.token.create",
    "team.token.delete",
    "team.token.read",
    "team.token.update",
];

const USER_EXTRA: &[&str] = &["user.read.quota", "user.update.quota", "user.update.key"];

/// True when `parent` is `child` or one of its dotted ancestors.
pub fn is_parent(parent: &str, child: &str) -> bool {
    if parent == ROOT || parent.is_empty() {
        return true;
    }
    child == parent
        || (child.len() > parent.len()
            && child.starts_with(parent)
            && child.as_bytes()[parent.len()] == b'.')
}

#[derive(Debug, Clone)]
pub struct PermissionScheme {
    pub name: String,
    /// Context types declared on this node; empty means inherited.
    declared: Vec<ContextType>,
}

impl PermissionScheme {
    pub fn full_name(&self) -> &str {
        &self.name
    }
}

/// Hierarchical permission names and the context types each accepts.
#[derive(Debug, Default)]
pub struct PermissionRegistry {
    schemes: BTreeMap<String, PermissionScheme>,
}

impl PermissionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dotted scheme, creating intermediate nodes on the way.
    pub fn register(&mut self, name: &str, contexts: &[ContextType]) {
        let mut path = String::new();
        for segment in name.split('.') {
            if !path.is_empty() {
                path.push('.');
            }
            path.push_str(segment);
            self.schemes
                .entry(path.clone())
                .or_insert_with(|| PermissionScheme {
                    name: path.clone(),
                    declared: Vec::new(),
                });
        }
        if let Some(scheme) = self.schemes.get_mut(name) {
            for ctx in contexts {
                if !scheme.declared.contains(ctx) {
                    scheme.declared.push(*ctx);
                }
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&PermissionScheme> {
        self.schemes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        name == ROOT || self.schemes.contains_key(name)
    }

    /// Context types a scheme may be granted on. Global is always allowed.
    pub fn allowed_contexts(&self, name: &str) -> Vec<ContextType> {
        let mut allowed = vec![ContextType::Global];
        let mut current = Some(name);
        while let Some(n) = current {
            if let Some(scheme) = self.schemes.get(n) {
                if !scheme.declared.is_empty() {
                    allowed.extend(scheme.declared.iter().copied());
                    break;
                }
            }
            current = n.rfind('.').map(|idx| &n[..idx]);
        }
        allowed
    }

    /// Every registered scheme in tree order: parents before their children.
    pub fn all(&self) -> Vec<&PermissionScheme> {
        let mut all: Vec<&PermissionScheme> = self.schemes.values().collect();
        all.sort_by(|a, b| a.name.split('.').cmp(b.name.split('.')));
        all
    }

    pub fn permissions_with_context_type(&self, ctx: ContextType) -> Vec<&PermissionScheme> {
        self.all()
            .into_iter()
            .filter(|s| self.allowed_contexts(&s.name).contains(&ctx))
            .collect()
    }
}

pub static REGISTRY: Lazy<PermissionRegistry> = Lazy::new(default_registry);

pub fn registry() -> &'static PermissionRegistry {
    &REGISTRY
}

fn default_registry() -> PermissionRegistry {
    use ContextType::*;

    let mut r = PermissionRegistry::new();
    r.register(APP, &[Team, App, Pool]);
    for name in [
        APP_CREATE,
        APP_DELETE,
        APP_READ,
        APP_READ_EVENTS,
        APP_READ_UNIT_AUTOSCALE,
        APP_UPDATE,
        APP_BUILD,
        APP_DEPLOY,
        APP_UPDATE_UNIT_AUTOSCALE_ADD,
        APP_UPDATE_UNIT_AUTOSCALE_REMOVE,
        APP_UPDATE_BIND,
        APP_UPDATE_UNBIND,
    ]
    .into_iter()
    .chain(APP_EXTRA.iter().copied())
    {
        r.register(name, &[]);
    }
    // Creation happens before the app exists, so only team and pool apply.
    r.register(APP_CREATE, &[Team, Pool]);

    r.register(JOB, &[Team, Job, Pool]);
    for name in [
        JOB_DELETE,
        JOB_READ,
        JOB_READ_EVENTS,
        JOB_UPDATE,
        JOB_TRIGGER,
        JOB_UPDATE_BIND,
        JOB_UPDATE_UNBIND,
    ] {
        r.register(name, &[]);
    }
    r.register(JOB_CREATE, &[Team, Pool]);

    r.register(TEAM, &[Team]);
    for name in [TEAM_DELETE, TEAM_READ, TEAM_READ_EVENTS, TEAM_UPDATE]
        .into_iter()
        .chain(TEAM_EXTRA.iter().copied())
    {
        r.register(name, &[]);
    }
    r.register(TEAM_CREATE, &[Global]);

    r.register(USER, &[User]);
    for name in [
        USER_CREATE,
        USER_DELETE,
        USER_READ,
        USER_READ_EVENTS,
        USER_UPDATE,
        USER_UPDATE_TOKEN,
        USER_UPDATE_PASSWORD,
        USER_UPDATE_RESET,
    ]
    .into_iter()
    .chain(USER_EXTRA.iter().copied())
    {
        r.register(name, &[]);
    }

    r.register(SERVICE, &[Team, Service]);
    for name in [
        SERVICE_DELETE,
        SERVICE_READ,
        SERVICE_READ_DOC,
        SERVICE_READ_PLANS,
        SERVICE_READ_EVENTS,
        SERVICE_UPDATE,
        SERVICE_UPDATE_PROXY,
        SERVICE_UPDATE_DOC,
        SERVICE_UPDATE_GRANT_ACCESS,
        SERVICE_UPDATE_REVOKE_ACCESS,
    ] {
        r.register(name, &[]);
    }
    r.register(SERVICE_CREATE, &[Team]);

    r.register(SERVICE_INSTANCE, &[Team, ServiceInstance, Pool]);
    for name in [
        SERVICE_INSTANCE_DELETE,
        SERVICE_INSTANCE_READ,
        SERVICE_INSTANCE_READ_EVENTS,
        SERVICE_INSTANCE_READ_STATUS,
        SERVICE_INSTANCE_UPDATE,
        SERVICE_INSTANCE_UPDATE_PROXY,
        SERVICE_INSTANCE_UPDATE_BIND,
        SERVICE_INSTANCE_UPDATE_UNBIND,
        SERVICE_INSTANCE_UPDATE_GRANT,
        SERVICE_INSTANCE_UPDATE_REVOKE,
        SERVICE_INSTANCE_UPDATE_DESCRIPTION,
        SERVICE_INSTANCE_UPDATE_TAGS,
        SERVICE_INSTANCE_UPDATE_TEAMOWNER,
        SERVICE_INSTANCE_UPDATE_PLAN,
    ] {
        r.register(name, &[]);
    }
    r.register(SERVICE_INSTANCE_CREATE, &[Team]);

    r.register(POOL, &[Pool]);
    for name in [
        POOL_DELETE,
        POOL_READ,
        POOL_READ_EVENTS,
        POOL_UPDATE,
        POOL_UPDATE_TEAM_ADD,
        POOL_UPDATE_TEAM_REMOVE,
    ] {
        r.register(name, &[]);
    }
    r.register(POOL_CREATE, &[Global]);

    r.register(CLUSTER, &[Cluster]);
    for name in [
        CLUSTER_DELETE,
        CLUSTER_READ,
        CLUSTER_READ_EVENTS,
        CLUSTER_UPDATE,
    ] {
        r.register(name, &[]);
    }
    r.register(CLUSTER_CREATE, &[Global]);

    r.register(NODE_AUTOSCALE, &[Pool]);
    for name in [
        NODE_AUTOSCALE_READ,
        NODE_AUTOSCALE_UPDATE,
        NODE_AUTOSCALE_UPDATE_RUN,
        NODE_AUTOSCALE_DELETE,
    ] {
        r.register(name, &[]);
    }

    r.register(NODECONTAINER, &[Pool, NodeContainer]);
    for name in [
        NODECONTAINER_CREATE,
        NODECONTAINER_DELETE,
        NODECONTAINER_READ,
        NODECONTAINER_UPDATE,
        NODECONTAINER_UPDATE_UPGRADE,
    ] {
        r.register(name, &[]);
    }

    r.register(WEBHOOK, &[Team, Webhook]);
    for name in [WEBHOOK_DELETE, WEBHOOK_READ, WEBHOOK_UPDATE] {
        r.register(name, &[]);
    }
    r.register(WEBHOOK_CREATE, &[Team]);

    r.register(VOLUME, &[Team, Volume, Pool]);
    for name in [VOLUME_DELETE, VOLUME_READ, VOLUME_READ_EVENTS, VOLUME_UPDATE] {
        r.register(name, &[]);
    }
    r.register(VOLUME_CREATE, &[Team, Pool]);

    r.register(ROLE, &[Role]);
    for name in [
        ROLE_CREATE,
        ROLE_DELETE,
        ROLE_READ_EVENTS,
        ROLE_UPDATE,
        ROLE_UPDATE_ASSIGN,
        ROLE_UPDATE_DISSOCIATE,
        ROLE_UPDATE_PERMISSION_ADD,
        ROLE_UPDATE_PERMISSION_REMOVE,
        ROLE_DEFAULT_CREATE,
        ROLE_DEFAULT_DELETE,
    ] {
        r.register(name, &[]);
    }

    r.register(PLAN, &[Global]);
    for name in [PLAN_CREATE, PLAN_DELETE, PLAN_READ] {
        r.register(name, &[]);
    }
    r.register(PLATFORM, &[Global]);
    for name in [PLATFORM_CREATE, PLATFORM_DELETE, PLATFORM_READ, PLATFORM_UPDATE] {
        r.register(name, &[]);
    }

    r.register(EVENT_CANCEL, &[Global]);

    r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_parent_uses_dotted_segments() {
        assert!(is_parent("app", "app.update"));
        assert!(is_parent("app.update", "app.update.unit.autoscale.add"));
        assert!(is_parent("app.create", "app.create"));
        assert!(is_parent(ROOT, "service.update.proxy"));
        assert!(!is_parent("app.update", "app"));
        assert!(!is_parent("app", "apps.read"));
        assert!(!is_parent("service", "service-instance.read"));
    }

    #[test]
    fn test_register_builds_intermediate_nodes() {
        let mut r = PermissionRegistry::new();
        r.register("a.b.c", &[ContextType::Team]);
        assert!(r.get("a").is_some());
        assert!(r.get("a.b").is_some());
        assert_eq!(r.get("a.b.c").unwrap().full_name(), "a.b.c");
    }

    #[test]
    fn test_allowed_contexts_inherit_from_nearest_declared_ancestor() {
        let r = registry();
        let allowed = r.allowed_contexts(APP_UPDATE_UNIT_AUTOSCALE_ADD);
        assert!(allowed.contains(&ContextType::Global));
        assert!(allowed.contains(&ContextType::App));
        assert!(allowed.contains(&ContextType::Team));

        let create = r.allowed_contexts(APP_CREATE);
        assert!(create.contains(&ContextType::Team));
        assert!(!create.contains(&ContextType::App));
    }

    #[test]
    fn test_permissions_with_context_type_are_in_tree_order() {
        let r = registry();
        let team_perms: Vec<&str> = r
            .permissions_with_context_type(ContextType::Team)
            .into_iter()
            .map(|s| s.full_name())
            .collect();
        let app = team_perms.iter().position(|n| *n == APP).unwrap();
        let create = team_perms.iter().position(|n| *n == APP_CREATE).unwrap();
        assert!(app < create);
        assert!(!team_perms.contains(&POOL_CREATE));
    }

    #[test]
    fn test_deploy_schemes_are_registered() {
        let r = registry();
        assert!(r.contains(APP_DEPLOY));
        assert!(r.contains("app.deploy.rollback"));
        assert!(r.contains("team.token.create"));
        let allowed = r.allowed_contexts(APP_DEPLOY);
        assert_eq!(allowed[0], ContextType::Global);
        assert!(allowed.contains(&ContextType::App));
        assert!(allowed.contains(&ContextType::Team));
    }
}
