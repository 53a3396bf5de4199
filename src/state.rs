use std::sync::Arc;

use crate::auth::{Authenticator, AuthScheme, LogMailer, Mailer, NativeScheme};
use crate::config::AppConfig;
use crate::event::journal::JournalSettings;
use crate::event::webhook::{DispatcherSettings, WebhookDispatcher};
use crate::event::{EventStore, Journal, MemoryEventStore};
use crate::proxy::ServiceProxy;
use crate::services::{
    AppService, Builder, HttpServiceBackend, InstanceService, JobService, LocalBuilder,
    LocalProvisioner, NodeAutoscaleService, NodeContainerService, PoolService, Provisioner,
    ProvisionerRegistry, RoleService, ServiceBackend, ServiceCatalog, TeamService, WebhookService,
};
use crate::storage::Storage;
use crate::tracker::LogTracker;

/// Everything a handler may reach. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub storage: Storage,
    pub auth: Authenticator,
    pub mailer: Arc<dyn Mailer>,
    pub journal: Journal,
    pub proxy: ServiceProxy,
    pub backend: Arc<dyn ServiceBackend>,
    pub provisioners: ProvisionerRegistry,
    pub builder: Arc<dyn Builder>,
    pub tracker: LogTracker,
}

impl AppState {
    /// Start from the in-memory collaborators; swap any of them before `build`.
    pub fn builder(config: AppConfig) -> AppStateBuilder {
        AppStateBuilder {
            config,
            storage: Storage::memory(),
            event_store: None,
            mailer: None,
            scheme: None,
            backend: None,
            provisioner: None,
            builder: None,
            webhooks: true,
        }
    }

    pub fn teams(&self) -> TeamService {
        TeamService::new(self.storage.clone())
    }

    pub fn roles(&self) -> RoleService {
        RoleService::new(self.storage.clone())
    }

    pub fn catalog(&self) -> ServiceCatalog {
        ServiceCatalog::new(self.storage.clone())
    }

    pub fn instances(&self) -> InstanceService {
        InstanceService::new(self.storage.clone(), self.backend.clone())
    }

    pub fn pools(&self) -> PoolService {
        PoolService::new(self.storage.clone())
    }

    pub fn apps(&self) -> AppService {
        AppService::new(
            self.storage.clone(),
            self.provisioners.clone(),
            self.builder.clone(),
        )
    }

    pub fn jobs(&self) -> JobService {
        JobService::new(self.storage.clone(), self.provisioners.clone())
    }

    pub fn node_containers(&self) -> NodeContainerService {
        NodeContainerService::new(self.storage.clone(), self.provisioners.clone())
    }

    pub fn node_autoscale(&self) -> NodeAutoscaleService {
        NodeAutoscaleService::new(self.storage.clone(), self.provisioners.clone())
    }

    pub fn webhooks(&self) -> WebhookService {
        WebhookService::new(self.storage.clone())
    }
}

pub struct AppStateBuilder {
    config: AppConfig,
    storage: Storage,
    event_store: Option<Arc<dyn EventStore>>,
    mailer: Option<Arc<dyn Mailer>>,
    scheme: Option<Arc<dyn AuthScheme>>,
    backend: Option<Arc<dyn ServiceBackend>>,
    provisioner: Option<Arc<dyn Provisioner>>,
    builder: Option<Arc<dyn Builder>>,
    webhooks: bool,
}

impl AppStateBuilder {
    pub fn storage(mut self, storage: Storage) -> Self {
        self.storage = storage;
        self
    }

    pub fn event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.event_store = Some(store);
        self
    }

    pub fn mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    pub fn auth_scheme(mut self, scheme: Arc<dyn AuthScheme>) -> Self {
        self.scheme = Some(scheme);
        self
    }

    pub fn service_backend(mut self, backend: Arc<dyn ServiceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn image_builder(mut self, builder: Arc<dyn Builder>) -> Self {
        self.builder = Some(builder);
        self
    }

    /// Toggle the background webhook dispatcher.
    pub fn webhooks(mut self, enabled: bool) -> Self {
        self.webhooks = enabled;
        self
    }

    pub fn build(self) -> anyhow::Result<AppState> {
        crate::metrics::register_metrics();
        let config = self.config;
        let storage = self.storage;

        if config.auth.scheme != "native" && self.scheme.is_none() {
            anyhow::bail!("unknown auth scheme {:?}", config.auth.scheme);
        }
        let mailer = self
            .mailer
            .unwrap_or_else(|| Arc::new(LogMailer::new(config.smtp.server.clone())));
        let scheme = self.scheme.unwrap_or_else(|| {
            Arc::new(NativeScheme::new(storage.clone(), mailer.clone(), &config))
        });

        let store = self
            .event_store
            .unwrap_or_else(|| Arc::new(MemoryEventStore::new()));
        let journal = Journal::new(store, JournalSettings::from(&config.events));
        if self.webhooks {
            journal.add_hook(WebhookDispatcher::start(
                storage.webhooks.clone(),
                DispatcherSettings::from(&config.events),
            ));
        }

        let backend: Arc<dyn ServiceBackend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(HttpServiceBackend::new(config.proxy_timeout())?),
        };
        let provisioner = self
            .provisioner
            .unwrap_or_else(|| Arc::new(LocalProvisioner::new()));
        let builder = self.builder.unwrap_or_else(|| Arc::new(LocalBuilder::new()));

        Ok(AppState {
            auth: Authenticator::new(scheme, storage.clone()),
            proxy: ServiceProxy::new(config.proxy_timeout())?,
            tracker: LogTracker::new(config.api.app_log_buffer_size),
            config: Arc::new(config),
            storage,
            mailer,
            journal,
            backend,
            provisioners: ProvisionerRegistry::new(provisioner),
            builder,
        })
    }
}
