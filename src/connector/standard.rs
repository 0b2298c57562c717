//! Direct-socket strategy for postgres, mysql, sqlite and sqlserver

use super::{close_pool, Connected};
use crate::config::DatabaseConfig;
use crate::dsn::build_dsn;
use crate::options::ConnectionOptions;
use crate::pool::{DbPool, PoolSettings};
use crate::{Error, Result};

/// Open and verify a pool for one of the four standard drivers.
///
/// Managed driver names are rejected with [`Error::UnsupportedDriver`].
pub async fn connect_standard(cfg: &DatabaseConfig, opts: &ConnectionOptions) -> Result<Connected> {
    let opts = opts.clone().with_defaults();
    let driver = cfg.driver()?;
    if driver.is_managed() {
        return Err(Error::UnsupportedDriver(driver.as_str().to_string()));
    }

    let dsn = build_dsn(cfg)?;
    let settings = PoolSettings::resolve(cfg, &opts);
    let pool = DbPool::open(driver, &dsn, settings, opts.ping_timeout)?;

    if let Err(e) = pool.ping_within(opts.ping_timeout).await {
        pool.close().await;
        return Err(e);
    }

    tracing::info!(
        driver = driver.as_str(),
        host = %cfg.host,
        database = %cfg.database,
        max_open = settings.max_open,
        "database connected"
    );

    let cleanup = close_pool(pool.clone());
    Ok(Connected {
        pool,
        cleanup: Some(cleanup),
    })
}
