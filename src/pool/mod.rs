//! Connection pools behind a database handle
//!
//! Postgres, MySQL and SQLite (and the managed drivers, which speak the
//! Postgres/MySQL wire protocols through a tunnel) use sqlx's `Any` pool.
//! SQL Server uses tiberius connections pooled by bb8.

mod sqlserver;

pub use sqlserver::{SqlServerManager, SqlServerPool};

use crate::config::{DatabaseConfig, Driver};
use crate::error::DriverError;
use crate::options::ConnectionOptions;
use crate::{Error, Result};
use sqlx::any::{AnyConnectOptions, AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, ConnectOptions, Connection, Row};
use std::str::FromStr;
use std::sync::{Arc, Once, OnceLock, Weak};
use std::time::{Duration, Instant};

static INSTALL_DRIVERS: Once = Once::new();

/// Register the sqlx drivers with the `Any` runtime. Safe to call repeatedly.
pub fn install_drivers() {
    INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);
}

/// Effective pool limits for one handle.
///
/// Non-zero per-target overrides from [`DatabaseConfig`] win over
/// [`ConnectionOptions`]. The idle ceiling never exceeds the open ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Open-connection ceiling
    pub max_open: u32,
    /// Retained idle-connection ceiling
    pub max_idle: u32,
    /// Connection lifetime
    pub max_lifetime: Duration,
    /// Idle time before a connection is closed
    pub max_idle_time: Duration,
}

impl PoolSettings {
    /// Resolve settings from options and per-target overrides
    pub fn resolve(cfg: &DatabaseConfig, opts: &ConnectionOptions) -> Self {
        let opts = opts.clone().with_defaults();

        let max_open = override_or(cfg.max_open_conns, opts.max_open_conns);
        let max_idle = override_or(cfg.max_idle_conns, opts.max_idle_conns);
        let max_lifetime = if cfg.conn_max_lifetime_minutes > 0 {
            Duration::from_secs(u64::from(cfg.conn_max_lifetime_minutes) * 60)
        } else {
            opts.conn_max_lifetime
        };

        Self {
            max_open,
            max_idle: max_idle.min(max_open),
            max_lifetime,
            max_idle_time: opts.conn_max_idle_time,
        }
    }

    fn sqlx_options(&self, acquire_timeout: Duration, cap: Arc<IdleCap>) -> AnyPoolOptions {
        AnyPoolOptions::new()
            .max_connections(self.max_open)
            .min_connections(0)
            .max_lifetime(self.max_lifetime)
            .idle_timeout(self.max_idle_time)
            .acquire_timeout(acquire_timeout)
            .after_release(move |_conn, _meta| {
                let keep = cap.keep();
                Box::pin(std::future::ready(Ok(keep)))
            })
    }
}

fn override_or(value: u32, fallback: u32) -> u32 {
    if value > 0 {
        value
    } else {
        fallback
    }
}

/// One result row, in the representation of the backend that produced it
pub enum DbRow {
    Sqlx(AnyRow),
    SqlServer(tiberius::Row),
}

impl DbRow {
    /// Number of columns
    pub fn len(&self) -> usize {
        match self {
            DbRow::Sqlx(row) => row.len(),
            DbRow::SqlServer(row) => row.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for DbRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self {
            DbRow::Sqlx(_) => "sqlx",
            DbRow::SqlServer(_) => "sqlserver",
        };
        f.debug_struct("DbRow")
            .field("backend", &backend)
            .field("columns", &self.len())
            .finish()
    }
}

/// Drops released connections once the pool already holds `max_idle` idle ones.
struct IdleCap {
    max_idle: usize,
    pool: OnceLock<Weak<AnyPool>>,
}

impl IdleCap {
    fn new(max_idle: u32) -> Self {
        Self {
            max_idle: max_idle as usize,
            pool: OnceLock::new(),
        }
    }

    fn attach(&self, pool: &Arc<AnyPool>) {
        let _ = self.pool.set(Arc::downgrade(pool));
    }

    fn keep(&self) -> bool {
        match self.pool.get().and_then(Weak::upgrade) {
            Some(pool) => pool.num_idle() < self.max_idle,
            None => true,
        }
    }
}

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently open (idle + in use)
    pub open: u32,
    /// Idle connections
    pub idle: u32,
    /// Open-connection ceiling
    pub max_open: u32,
}

#[derive(Clone)]
enum Backend {
    Sqlx {
        pool: Arc<AnyPool>,
        connect: Arc<AnyConnectOptions>,
    },
    SqlServer(Arc<SqlServerPool>),
}

/// Pooled connections for one handle. Cheap to clone.
#[derive(Clone)]
pub struct DbPool {
    driver: Driver,
    settings: PoolSettings,
    backend: Backend,
}

impl DbPool {
    /// Create the pool without connecting; the first ping opens a connection.
    pub(crate) fn open(
        driver: Driver,
        dsn: &str,
        settings: PoolSettings,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let backend = match driver {
            Driver::SqlServer => {
                let config = sqlserver::config_from_dsn(dsn)?;
                Backend::SqlServer(Arc::new(SqlServerPool::new(
                    config,
                    &settings,
                    acquire_timeout,
                )))
            }
            _ => {
                install_drivers();
                let connect = AnyConnectOptions::from_str(dsn)
                    .map_err(|e| Error::Open(e.into()))?
                    .disable_statement_logging();
                let cap = Arc::new(IdleCap::new(settings.max_idle));
                let pool = Arc::new(
                    settings
                        .sqlx_options(acquire_timeout, cap.clone())
                        .connect_lazy_with(connect.clone()),
                );
                cap.attach(&pool);
                Backend::Sqlx {
                    pool,
                    connect: Arc::new(connect),
                }
            }
        };

        tracing::debug!(
            driver = driver.as_str(),
            max_open = settings.max_open,
            max_idle = settings.max_idle,
            max_lifetime_s = settings.max_lifetime.as_secs(),
            max_idle_time_s = settings.max_idle_time.as_secs(),
            "pool configured"
        );

        Ok(Self {
            driver,
            settings,
            backend,
        })
    }

    /// Driver this pool was opened for
    pub fn driver(&self) -> Driver {
        self.driver
    }

    /// Applied limits
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Current occupancy
    pub fn stats(&self) -> PoolStats {
        let (open, idle) = match &self.backend {
            Backend::Sqlx { pool, .. } => (pool.size(), pool.num_idle() as u32),
            Backend::SqlServer(pool) => pool.occupancy(),
        };
        PoolStats {
            open,
            idle,
            max_open: self.settings.max_open,
        }
    }

    /// The sqlx pool, for postgres/mysql/sqlite and managed handles.
    ///
    /// Queries issued directly on the raw pool bypass the handle's query
    /// logger and are neither traced nor redacted.
    pub fn as_sqlx(&self) -> Option<&AnyPool> {
        match &self.backend {
            Backend::Sqlx { pool, .. } => Some(&**pool),
            Backend::SqlServer(_) => None,
        }
    }

    /// The SQL Server pool
    pub fn as_sqlserver(&self) -> Option<&SqlServerPool> {
        match &self.backend {
            Backend::SqlServer(pool) => Some(&**pool),
            Backend::Sqlx { .. } => None,
        }
    }

    /// Single round-trip to the server (unbounded).
    ///
    /// Uses an idle pooled connection when one is available, otherwise makes
    /// exactly one connection attempt outside the pool. Connect failures are
    /// reported as they happen; nothing is retried.
    pub async fn ping(&self) -> Result<()> {
        match &self.backend {
            Backend::Sqlx { pool, connect } => {
                if let Some(mut conn) = pool.try_acquire() {
                    return conn.ping().await.map_err(|e| Error::Ping(e.into()));
                }
                let mut conn = connect
                    .connect()
                    .await
                    .map_err(|e| Error::Ping(e.into()))?;
                let outcome = conn.ping().await.map_err(|e| Error::Ping(e.into()));
                let _ = conn.close().await;
                outcome
            }
            Backend::SqlServer(pool) => pool.ping().await,
        }
    }

    /// [`ping`](Self::ping) bounded by `limit`
    pub async fn ping_within(&self, limit: Duration) -> Result<()> {
        let started = Instant::now();
        let outcome = tokio::time::timeout(limit, self.ping()).await;
        crate::metrics::histograms::ping_duration(
            self.driver.as_str(),
            started.elapsed().as_millis() as u64,
        );
        outcome.map_err(|_| Error::PingTimeout(limit))?
    }

    /// Run a statement, returning the affected row count
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        match &self.backend {
            Backend::Sqlx { pool, .. } => sqlx::query(sql)
                .execute(&**pool)
                .await
                .map(|done| done.rows_affected())
                .map_err(|e| Error::Query(DriverError::Sqlx(e))),
            Backend::SqlServer(pool) => pool.execute(sql).await,
        }
    }

    /// Fetch every row of the first result set
    pub async fn fetch_all(&self, sql: &str) -> Result<Vec<DbRow>> {
        match &self.backend {
            Backend::Sqlx { pool, .. } => sqlx::query(sql)
                .fetch_all(&**pool)
                .await
                .map(|rows| rows.into_iter().map(DbRow::Sqlx).collect())
                .map_err(|e| Error::Query(DriverError::Sqlx(e))),
            Backend::SqlServer(pool) => Ok(pool
                .fetch_all(sql)
                .await?
                .into_iter()
                .map(DbRow::SqlServer)
                .collect()),
        }
    }

    /// Fetch the first row, if any
    pub async fn fetch_optional(&self, sql: &str) -> Result<Option<DbRow>> {
        match &self.backend {
            Backend::Sqlx { pool, .. } => sqlx::query(sql)
                .fetch_optional(&**pool)
                .await
                .map(|row| row.map(DbRow::Sqlx))
                .map_err(|e| Error::Query(DriverError::Sqlx(e))),
            Backend::SqlServer(pool) => Ok(pool
                .fetch_all(sql)
                .await?
                .into_iter()
                .next()
                .map(DbRow::SqlServer)),
        }
    }

    /// Fetch exactly one row.
    ///
    /// An empty result is `Error::Query(DriverError::Sqlx(RowNotFound))` on
    /// every backend, so callers and the logger see a single "no rows" shape.
    pub async fn fetch_one(&self, sql: &str) -> Result<DbRow> {
        self.fetch_optional(sql)
            .await?
            .ok_or(Error::Query(DriverError::Sqlx(sqlx::Error::RowNotFound)))
    }

    /// Close every connection; waits for checked-out connections to return
    pub async fn close(&self) {
        match &self.backend {
            Backend::Sqlx { pool, .. } => pool.close().await,
            Backend::SqlServer(pool) => pool.close(),
        }
    }

    /// Has [`close`](Self::close) been called?
    pub fn is_closed(&self) -> bool {
        match &self.backend {
            Backend::Sqlx { pool, .. } => pool.is_closed(),
            Backend::SqlServer(pool) => pool.is_closed(),
        }
    }
}

impl std::fmt::Debug for DbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbPool")
            .field("driver", &self.driver)
            .field("settings", &self.settings)
            .field("closed", &self.is_closed())
            .finish()
    }
}
