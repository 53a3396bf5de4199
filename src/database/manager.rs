use sqlx::{postgres::PgPoolOptions, PgPool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::DatabaseConfig;

/// Errors from DatabaseManager
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Missing configuration: {0}")]
    ConfigMissing(&'static str),

    #[error("Invalid database URL")]
    InvalidDatabaseUrl,

    #[error("Invalid database name: {0}")]
    InvalidDatabaseName(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Connection pools keyed by database name, created lazily.
pub struct DatabaseManager {
    pools: Arc<RwLock<HashMap<String, PgPool>>>,
}

impl DatabaseManager {
    fn instance() -> &'static DatabaseManager {
        use std::sync::OnceLock;
        static INSTANCE: OnceLock<DatabaseManager> = OnceLock::new();
        INSTANCE.get_or_init(|| DatabaseManager {
            pools: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Pool for the configured API database.
    pub async fn pool(config: &DatabaseConfig) -> Result<PgPool, DatabaseError> {
        if !Self::is_valid_db_name(&config.name) {
            return Err(DatabaseError::InvalidDatabaseName(config.name.clone()));
        }
        Self::instance().get_pool(config).await
    }

    async fn get_pool(&self, config: &DatabaseConfig) -> Result<PgPool, DatabaseError> {
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(&config.name) {
                return Ok(pool.clone());
            }
        }

        let connection_string = Self::build_connection_string(config)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout))
            .connect(&connection_string)
            .await?;

        {
            let mut pools = self.pools.write().await;
            pools.insert(config.name.clone(), pool.clone());
        }

        info!("Created database pool for: {}", config.name);
        Ok(pool)
    }

    fn build_connection_string(config: &DatabaseConfig) -> Result<String, DatabaseError> {
        let base = config
            .url
            .as_deref()
            .ok_or(DatabaseError::ConfigMissing("DATABASE_URL"))?;

        let mut url = url::Url::parse(base).map_err(|_| DatabaseError::InvalidDatabaseUrl)?;
        url.set_path(&format!("/{}", config.name));
        Ok(url.into())
    }

    fn is_valid_db_name(name: &str) -> bool {
        !name.is_empty()
            && name.len() <= 63
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !name.starts_with(|c: char| c.is_ascii_digit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: Option<&str>, name: &str) -> DatabaseConfig {
        DatabaseConfig {
            url: url.map(str::to_string),
            name: name.to_string(),
            max_connections: 5,
            connection_timeout: 5,
        }
    }

    #[test]
    fn test_connection_string_swaps_database() {
        let cfg = config(Some("postgres://u:p@localhost:5432/postgres"), "tsuru");
        assert_eq!(
            DatabaseManager::build_connection_string(&cfg).unwrap(),
            "postgres://u:p@localhost:5432/tsuru"
        );
        assert!(matches!(
            DatabaseManager::build_connection_string(&config(None, "tsuru")),
            Err(DatabaseError::ConfigMissing(_))
        ));
    }

    #[test]
    fn test_database_name_validation() {
        assert!(DatabaseManager::is_valid_db_name("tsuru_api"));
        assert!(!DatabaseManager::is_valid_db_name("1tsuru"));
        assert!(!DatabaseManager::is_valid_db_name("tsuru;drop"));
        assert!(!DatabaseManager::is_valid_db_name(""));
    }
}
