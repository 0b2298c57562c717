//! Primary/secondary handle registry
//!
//! Services that want one process-wide pair of handles build a
//! [`DatabaseRegistry`] and either pass it around or install it with
//! [`install_global`].

use crate::config::DatabaseConfig;
use crate::connector::Connector;
use crate::database::Database;
use crate::options::ConnectionOptions;
use crate::{Error, Result};
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;

/// Holds the primary handle and an optional secondary one.
///
/// The secondary falls back to the primary when it was not configured.
#[derive(Debug)]
pub struct DatabaseRegistry {
    connector: Connector,
    primary: RwLock<Option<Arc<Database>>>,
    secondary: RwLock<Option<Arc<Database>>>,
}

impl DatabaseRegistry {
    /// Empty registry that connects through `connector`
    pub fn new(connector: Connector) -> Self {
        Self {
            connector,
            primary: RwLock::new(None),
            secondary: RwLock::new(None),
        }
    }

    /// Connect the primary, and the secondary when its database name is set.
    ///
    /// Options are derived from each target's own flags. Handles already
    /// registered are replaced but not closed; call [`reset`](Self::reset) first.
    pub async fn init(
        &self,
        primary: &DatabaseConfig,
        secondary: Option<&DatabaseConfig>,
    ) -> Result<()> {
        let db = self
            .connector
            .connect(primary, ConnectionOptions::for_config(primary))
            .await?;
        self.set_primary(db).await;

        if let Some(cfg) = secondary.filter(|cfg| !cfg.database.is_empty()) {
            let db = self
                .connector
                .connect(cfg, ConnectionOptions::for_config(cfg))
                .await?;
            self.set_secondary(db).await;
        }

        tracing::info!(
            secondary = self.secondary.read().await.is_some(),
            "database registry initialized"
        );
        Ok(())
    }

    /// Register an already-open primary handle
    pub async fn set_primary(&self, db: Database) -> Arc<Database> {
        let db = Arc::new(db);
        *self.primary.write().await = Some(db.clone());
        db
    }

    /// Register an already-open secondary handle
    pub async fn set_secondary(&self, db: Database) -> Arc<Database> {
        let db = Arc::new(db);
        *self.secondary.write().await = Some(db.clone());
        db
    }

    /// The primary handle
    pub async fn primary(&self) -> Result<Arc<Database>> {
        self.primary.read().await.clone().ok_or(Error::NotInitialized)
    }

    /// The secondary handle, or the primary when none is registered
    pub async fn secondary(&self) -> Result<Arc<Database>> {
        if let Some(db) = self.secondary.read().await.clone() {
            return Ok(db);
        }
        self.primary().await
    }

    /// Ping every registered handle
    pub async fn health_check(&self) -> Result<()> {
        self.primary().await?.health().await?;
        if let Some(db) = self.secondary.read().await.clone() {
            db.health().await?;
        }
        Ok(())
    }

    /// Does [`health_check`](Self::health_check) pass?
    pub async fn is_alive(&self) -> bool {
        self.health_check().await.is_ok()
    }

    /// Close and unregister every handle.
    ///
    /// All handles are closed even if one fails. A single failure is returned
    /// as is; several are combined into [`Error::Close`].
    pub async fn reset(&self) -> Result<()> {
        let primary = self.primary.write().await.take();
        let secondary = self.secondary.write().await.take();

        let mut errors = Vec::new();
        for db in [primary, secondary].into_iter().flatten() {
            if let Err(e) = db.close().await {
                errors.push(e);
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Close(errors)),
        }
    }
}

static GLOBAL: OnceLock<DatabaseRegistry> = OnceLock::new();

/// Install the process-wide registry. Fails if one is already installed.
pub fn install_global(registry: DatabaseRegistry) -> Result<&'static DatabaseRegistry> {
    GLOBAL
        .set(registry)
        .map_err(|_| Error::Config("global database registry already installed".to_string()))?;
    global()
}

/// The process-wide registry
pub fn global() -> Result<&'static DatabaseRegistry> {
    GLOBAL.get().ok_or(Error::NotInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> DatabaseConfig {
        DatabaseConfig::new("sqlite", ":memory:").max_open_conns(1)
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let registry = DatabaseRegistry::new(Connector::new());
        assert!(matches!(registry.primary().await, Err(Error::NotInitialized)));
        assert!(matches!(registry.secondary().await, Err(Error::NotInitialized)));
        assert!(matches!(registry.health_check().await, Err(Error::NotInitialized)));
        assert!(!registry.is_alive().await);
        registry.reset().await.unwrap();
    }

    #[tokio::test]
    async fn test_secondary_falls_back_to_primary() {
        let registry = DatabaseRegistry::new(Connector::new());
        let unnamed = DatabaseConfig::new("sqlite", "");
        registry.init(&memory(), Some(&unnamed)).await.unwrap();

        let primary = registry.primary().await.unwrap();
        let secondary = registry.secondary().await.unwrap();
        assert!(Arc::ptr_eq(&primary, &secondary));
        assert!(registry.is_alive().await);

        registry.reset().await.unwrap();
        assert!(matches!(registry.primary().await, Err(Error::NotInitialized)));
    }

    #[tokio::test]
    async fn test_init_with_secondary() {
        let registry = DatabaseRegistry::new(Connector::new());
        registry
            .init(&memory(), Some(&memory()))
            .await
            .unwrap();

        let primary = registry.primary().await.unwrap();
        let secondary = registry.secondary().await.unwrap();
        assert!(!Arc::ptr_eq(&primary, &secondary));
        registry.health_check().await.unwrap();

        registry.reset().await.unwrap();
        assert!(primary.pool().is_closed());
        assert!(secondary.pool().is_closed());
    }

    #[tokio::test]
    async fn test_init_unsupported_driver() {
        let registry = DatabaseRegistry::new(Connector::new());
        let err = registry
            .init(&DatabaseConfig::new("oracle", "app"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedDriver(_)));
        assert!(registry.primary().await.is_err());
    }
}
