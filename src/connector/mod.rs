//! Connection strategies and driver dispatch
//!
//! * [`connect_standard`]: postgres, mysql, sqlite, sqlserver over a direct socket
//! * [`connect_managed`]: cloudsql-postgres, cloudsql-mysql through a tunnel dialer
//!
//! Both return a pool that has already answered a bounded ping, plus the
//! cleanup the handle must run on close.

mod managed;
mod standard;

pub use managed::connect_managed;
pub use standard::connect_standard;

use crate::config::DatabaseConfig;
use crate::database::Database;
use crate::logger::RedactingLogger;
use crate::options::ConnectionOptions;
use crate::pool::DbPool;
use crate::tunnel::DialerRegistry;
use crate::{Error, Result};
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::Instrument;

/// Deferred teardown step run by [`Database::close`]
pub type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Result of a successful connection attempt
pub struct Connected {
    /// Pool that answered the startup ping
    pub pool: DbPool,
    /// Teardown to run when the handle closes
    pub cleanup: Option<Cleanup>,
}

impl std::fmt::Debug for Connected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connected")
            .field("pool", &self.pool)
            .field("cleanup", &self.cleanup.is_some())
            .finish()
    }
}

/// Opens database handles, dispatching on the configured driver name.
///
/// Managed drivers need a [`DialerRegistry`]; share one registry across every
/// connector in the process so each family gets a single dialer.
///
/// # Examples
///
/// ```no_run
/// use sqlconn::{ConnectionOptions, Connector, DatabaseConfig};
///
/// # async fn example() -> sqlconn::Result<()> {
/// let cfg = DatabaseConfig::new("sqlite", "app");
/// let db = Connector::new().connect(&cfg, ConnectionOptions::default()).await?;
/// db.health().await?;
/// db.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Connector {
    dialers: Option<Arc<DialerRegistry>>,
}

impl Connector {
    /// Connector for the standard drivers only
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector that can also reach managed instances
    pub fn with_dialers(dialers: Arc<DialerRegistry>) -> Self {
        Self {
            dialers: Some(dialers),
        }
    }

    /// Registry used for managed drivers, if any
    pub fn dialers(&self) -> Option<&Arc<DialerRegistry>> {
        self.dialers.as_ref()
    }

    /// Open a pool for `cfg` with the strategy its driver requires
    pub async fn open(&self, cfg: &DatabaseConfig, opts: &ConnectionOptions) -> Result<Connected> {
        let driver = cfg.driver()?;
        if driver.is_managed() {
            let dialers = self.dialers.as_deref().ok_or_else(|| {
                Error::Config(format!("{} requires a tunnel dialer registry", driver))
            })?;
            connect_managed(cfg, opts, dialers).await
        } else {
            connect_standard(cfg, opts).await
        }
    }

    /// Open a handle for `cfg`, attaching a redacting query logger
    pub async fn connect(&self, cfg: &DatabaseConfig, opts: ConnectionOptions) -> Result<Database> {
        let opts = opts.with_defaults();
        let driver = cfg.driver()?;

        let connected = self
            .open(cfg, &opts)
            .instrument(tracing::info_span!(
                "connect",
                driver = driver.as_str(),
                database = %cfg.database
            ))
            .await
            .map_err(|e| {
                crate::metrics::counters::connection_failed(driver.as_str(), e.stage());
                tracing::warn!(driver = driver.as_str(), stage = e.stage(), error = %e, "database connection failed");
                e
            })?;

        crate::metrics::counters::connection_opened(driver.as_str());
        let logger = Arc::new(RedactingLogger::for_options(&opts));
        Ok(Database::from_parts(driver, connected, opts, logger))
    }
}

/// Cleanup that closes `pool`
pub(crate) fn close_pool(pool: DbPool) -> Cleanup {
    Box::new(move || {
        Box::pin(async move {
            pool.close().await;
            Ok(())
        })
    })
}
