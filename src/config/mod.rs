use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::event::ThrottlingSpec;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub security: SecurityConfig,
    pub events: EventConfig,
    pub smtp: SmtpConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Name of the active auth scheme. Only "native" ships with the API.
    pub scheme: String,
    pub user_registration: bool,
    pub hash_cost: u32,
    pub token_expire_days: i64,
    pub max_simultaneous_sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// When set, events are journaled in PostgreSQL instead of memory.
    pub url: Option<String>,
    pub name: String,
    pub max_connections: u32,
    pub connection_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub request_id_header: Option<String>,
    pub keepalive_interval_secs: u64,
    pub proxy_timeout_secs: u64,
    pub max_request_size_bytes: usize,
    pub app_log_buffer_size: usize,
    pub index_page_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub cors_origins: Vec<String>,
    pub token_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    pub lock_expire_secs: u64,
    pub lock_update_secs: u64,
    pub app_lock_retry_millis: u64,
    pub webhook_workers: usize,
    pub webhook_max_retries: u32,
    pub webhook_timeout_secs: u64,
    #[serde(default)]
    pub throttling: Vec<ThrottlingSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub server: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let environment = match env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            Ok("staging") | Ok("stage") => Environment::Staging,
            _ => Environment::Development,
        };

        let base = match env::var("TSURU_CONFIG") {
            Ok(path) => match Self::from_file(&path) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("ignoring config file {}: {}", path, e);
                    Self::for_environment(environment)
                }
            },
            Err(_) => Self::for_environment(environment),
        };

        base.with_env_overrides()
    }

    /// Load a full configuration from a YAML document.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    pub fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
            Environment::Development => Self::development(),
        }
    }

    fn with_env_overrides(mut self) -> Self {
        // Server overrides
        if let Some(v) = env::var("TSURU_API_PORT").ok().or_else(|| env::var("PORT").ok()) {
            self.server.port = v.parse().unwrap_or(self.server.port);
        }
        if let Ok(v) = env::var("TSURU_SHUTDOWN_GRACE_SECS") {
            self.server.shutdown_grace_secs = v.parse().unwrap_or(self.server.shutdown_grace_secs);
        }

        // Auth overrides
        if let Ok(v) = env::var("TSURU_AUTH_SCHEME") {
            self.auth.scheme = v;
        }
        if let Ok(v) = env::var("TSURU_AUTH_USER_REGISTRATION") {
            self.auth.user_registration = v.parse().unwrap_or(self.auth.user_registration);
        }
        if let Ok(v) = env::var("TSURU_AUTH_HASH_COST") {
            self.auth.hash_cost = v.parse().unwrap_or(self.auth.hash_cost);
        }
        if let Ok(v) = env::var("TSURU_AUTH_TOKEN_EXPIRE_DAYS") {
            self.auth.token_expire_days = v.parse().unwrap_or(self.auth.token_expire_days);
        }
        if let Ok(v) = env::var("TSURU_AUTH_MAX_SIMULTANEOUS_SESSIONS") {
            self.auth.max_simultaneous_sessions =
                v.parse().unwrap_or(self.auth.max_simultaneous_sessions);
        }

        // Database overrides
        if let Ok(v) = env::var("DATABASE_URL") {
            if !v.trim().is_empty() {
                self.database.url = Some(v);
            }
        }
        if let Ok(v) = env::var("TSURU_DATABASE_NAME") {
            self.database.name = v;
        }
        if let Ok(v) = env::var("DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = v.parse().unwrap_or(self.database.max_connections);
        }
        if let Ok(v) = env::var("DATABASE_CONNECTION_TIMEOUT") {
            self.database.connection_timeout = v.parse().unwrap_or(self.database.connection_timeout);
        }

        // API overrides
        if let Ok(v) = env::var("TSURU_REQUEST_ID_HEADER") {
            self.api.request_id_header = Some(v).filter(|h| !h.trim().is_empty());
        }
        if let Ok(v) = env::var("TSURU_KEEPALIVE_INTERVAL_SECS") {
            self.api.keepalive_interval_secs = v.parse().unwrap_or(self.api.keepalive_interval_secs);
        }
        if let Ok(v) = env::var("TSURU_PROXY_TIMEOUT_SECS") {
            self.api.proxy_timeout_secs = v.parse().unwrap_or(self.api.proxy_timeout_secs);
        }
        if let Ok(v) = env::var("TSURU_MAX_REQUEST_SIZE_BYTES") {
            self.api.max_request_size_bytes = v.parse().unwrap_or(self.api.max_request_size_bytes);
        }
        if let Ok(v) = env::var("TSURU_APP_LOG_BUFFER_SIZE") {
            self.api.app_log_buffer_size = v.parse().unwrap_or(self.api.app_log_buffer_size);
        }
        if let Ok(v) = env::var("TSURU_INDEX_PAGE_TEMPLATE") {
            self.api.index_page_template = Some(v);
        }

        // Security overrides
        if let Ok(v) = env::var("TSURU_CORS_ORIGINS") {
            self.security.cors_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = env::var("TSURU_TOKEN_SECRET") {
            self.security.token_secret = v;
        }

        // Event overrides
        if let Ok(v) = env::var("TSURU_EVENT_LOCK_EXPIRE_SECS") {
            self.events.lock_expire_secs = v.parse().unwrap_or(self.events.lock_expire_secs);
        }
        if let Ok(v) = env::var("TSURU_EVENT_LOCK_UPDATE_SECS") {
            self.events.lock_update_secs = v.parse().unwrap_or(self.events.lock_update_secs);
        }
        if let Ok(v) = env::var("TSURU_WEBHOOK_WORKERS") {
            self.events.webhook_workers = v.parse().unwrap_or(self.events.webhook_workers);
        }
        if let Ok(v) = env::var("TSURU_WEBHOOK_MAX_RETRIES") {
            self.events.webhook_max_retries = v.parse().unwrap_or(self.events.webhook_max_retries);
        }

        // SMTP overrides
        if let Ok(v) = env::var("TSURU_SMTP_SERVER") {
            self.smtp.server = Some(v);
        }
        if let Ok(v) = env::var("TSURU_SMTP_USER") {
            self.smtp.user = Some(v);
        }
        if let Ok(v) = env::var("TSURU_SMTP_PASSWORD") {
            self.smtp.password = Some(v);
        }

        self
    }

    fn development() -> Self {
        Self {
            environment: Environment::Development,
            server: ServerConfig {
                port: 8080,
                shutdown_grace_secs: 10,
            },
            auth: AuthConfig {
                scheme: "native".to_string(),
                user_registration: true,
                hash_cost: 4,
                token_expire_days: 7,
                max_simultaneous_sessions: 0,
            },
            database: DatabaseConfig {
                url: None,
                name: "tsuru".to_string(),
                max_connections: 10,
                connection_timeout: 30,
            },
            api: ApiConfig {
                request_id_header: Some("X-Request-ID".to_string()),
                keepalive_interval_secs: 15,
                proxy_timeout_secs: 30,
                max_request_size_bytes: 32 * 1024 * 1024, // 32MB, multipart uploads
                app_log_buffer_size: 1000,
                index_page_template: None,
            },
            security: SecurityConfig {
                cors_origins: vec!["*".to_string()],
                token_secret: "development-secret".to_string(),
            },
            events: EventConfig {
                lock_expire_secs: 60,
                lock_update_secs: 5,
                app_lock_retry_millis: 10_000,
                webhook_workers: 4,
                webhook_max_retries: 3,
                webhook_timeout_secs: 15,
                throttling: Vec::new(),
            },
            smtp: SmtpConfig {
                server: None,
                user: None,
                password: None,
            },
        }
    }

    fn staging() -> Self {
        Self {
            environment: Environment::Staging,
            server: ServerConfig {
                port: 8080,
                shutdown_grace_secs: 30,
            },
            auth: AuthConfig {
                scheme: "native".to_string(),
                user_registration: false,
                hash_cost: 10,
                token_expire_days: 7,
                max_simultaneous_sessions: 10,
            },
            database: DatabaseConfig {
                url: None,
                name: "tsuru".to_string(),
                max_connections: 20,
                connection_timeout: 10,
            },
            api: ApiConfig {
                request_id_header: Some("X-Request-ID".to_string()),
                keepalive_interval_secs: 30,
                proxy_timeout_secs: 60,
                max_request_size_bytes: 32 * 1024 * 1024,
                app_log_buffer_size: 5000,
                index_page_template: None,
            },
            security: SecurityConfig {
                cors_origins: vec!["https://staging.example.com".to_string()],
                token_secret: String::new(),
            },
            events: EventConfig {
                lock_expire_secs: 60,
                lock_update_secs: 10,
                app_lock_retry_millis: 10_000,
                webhook_workers: 8,
                webhook_max_retries: 5,
                webhook_timeout_secs: 15,
                throttling: Vec::new(),
            },
            smtp: SmtpConfig {
                server: None,
                user: None,
                password: None,
            },
        }
    }

    fn production() -> Self {
        Self {
            environment: Environment::Production,
            server: ServerConfig {
                port: 8080,
                shutdown_grace_secs: 60,
            },
            auth: AuthConfig {
                scheme: "native".to_string(),
                user_registration: false,
                hash_cost: 12,
                token_expire_days: 7,
                max_simultaneous_sessions: 10,
            },
            database: DatabaseConfig {
                url: None,
                name: "tsuru".to_string(),
                max_connections: 50,
                connection_timeout: 5,
            },
            api: ApiConfig {
                request_id_header: Some("X-Request-ID".to_string()),
                keepalive_interval_secs: 30,
                proxy_timeout_secs: 60,
                max_request_size_bytes: 32 * 1024 * 1024,
                app_log_buffer_size: 10000,
                index_page_template: None,
            },
            security: SecurityConfig {
                cors_origins: Vec::new(),
                token_secret: String::new(),
            },
            events: EventConfig {
                lock_expire_secs: 60,
                lock_update_secs: 10,
                app_lock_retry_millis: 10_000,
                webhook_workers: 16,
                webhook_max_retries: 5,
                webhook_timeout_secs: 15,
                throttling: Vec::new(),
            },
            smtp: SmtpConfig {
                server: None,
                user: None,
                password: None,
            },
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.api.keepalive_interval_secs.max(1))
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.api.proxy_timeout_secs.max(1))
    }
}

// Global singleton config - initialized once at startup
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

// Convenience function for accessing config
pub fn config() -> &'static AppConfig {
    &CONFIG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_development_config() {
        let config = AppConfig::development();
        assert!(config.auth.user_registration);
        assert_eq!(config.api.keepalive_interval_secs, 15);
        assert!(config.database.url.is_none());
    }

    #[test]
    fn test_default_production_config() {
        let config = AppConfig::production();
        assert!(!config.auth.user_registration);
        assert_eq!(config.api.keepalive_interval_secs, 30);
        assert!(config.security.cors_origins.is_empty());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = AppConfig::staging();
        let raw = serde_yaml::to_string(&config).unwrap();
        let parsed: AppConfig = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(parsed.environment, Environment::Staging);
        assert_eq!(parsed.events.webhook_workers, 8);
    }
}
