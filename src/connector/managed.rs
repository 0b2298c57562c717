//! Tunnel-dialed strategy for managed instances

use super::{Cleanup, Connected};
use crate::config::DatabaseConfig;
use crate::dsn::managed_dsn;
use crate::options::ConnectionOptions;
use crate::pool::{DbPool, PoolSettings};
use crate::tunnel::{DialerOptions, DialerRegistry, InstanceName, TunnelProxy};
use crate::{Error, Result};

/// Open and verify a pool for `cloudsql-postgres` or `cloudsql-mysql`.
///
/// The family's shared dialer is created on first use. The pool's driver
/// connects to a loopback [`TunnelProxy`] whose sockets are bridged to
/// tunnels opened by that dialer, so `cfg.host` and `cfg.port` are ignored.
///
/// A failed ping leaves the shared dialer in place for later attempts.
pub async fn connect_managed(
    cfg: &DatabaseConfig,
    opts: &ConnectionOptions,
    dialers: &DialerRegistry,
) -> Result<Connected> {
    let opts = opts.clone().with_defaults();
    let driver = cfg.driver()?;
    let family = driver
        .family()
        .ok_or_else(|| Error::UnsupportedDriver(driver.as_str().to_string()))?;

    if cfg.instance.is_empty() {
        return Err(Error::MissingInstance {
            driver: driver.as_str(),
        });
    }
    let instance: InstanceName = cfg.instance.parse()?;
    let dialer_opts = DialerOptions::from(&opts);

    let shared = dialers.dialer(family, &dialer_opts).await?;
    // Dropped on any early return below without releasing the dialer.
    let lease = shared.lease()?;
    let mut proxy = TunnelProxy::bind(shared.clone(), instance.clone(), opts.ping_timeout).await?;

    let dsn = managed_dsn(cfg, proxy.local_addr(), opts.managed_auth)?;
    let settings = PoolSettings::resolve(cfg, &opts);
    let pool = DbPool::open(driver, &dsn, settings, opts.ping_timeout)?;

    if let Err(e) = pool.ping_within(opts.ping_timeout).await {
        pool.close().await;
        proxy.shutdown().await;
        return Err(e);
    }

    tracing::info!(
        driver = driver.as_str(),
        instance = %instance,
        routing = dialer_opts.routing(),
        managed_auth = opts.managed_auth,
        database = %cfg.database,
        "managed database connected"
    );

    let handle_pool = pool.clone();
    let cleanup: Cleanup = Box::new(move || {
        Box::pin(async move {
            handle_pool.close().await;
            proxy.shutdown().await;
            lease.release().await
        })
    });

    Ok(Connected {
        pool,
        cleanup: Some(cleanup),
    })
}
