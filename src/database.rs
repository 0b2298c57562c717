//! The database handle: pool, logger and deferred cleanups

use crate::config::{DatabaseConfig, Driver};
use crate::connector::{Cleanup, Connected, Connector};
use crate::logger::QueryLogger;
use crate::options::ConnectionOptions;
use crate::pool::{DbPool, DbRow};
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// An open database with its pool, query logger and teardown steps.
///
/// [`close`](Self::close) runs every registered cleanup exactly once, in
/// registration order. A handle is not reopened after close.
pub struct Database {
    driver: Driver,
    pool: DbPool,
    options: ConnectionOptions,
    logger: Arc<dyn QueryLogger>,
    cleanups: Mutex<Vec<Cleanup>>,
}

impl Database {
    /// Connect with a standard-drivers-only [`Connector`]
    pub async fn connect(cfg: &DatabaseConfig, opts: ConnectionOptions) -> Result<Self> {
        Connector::new().connect(cfg, opts).await
    }

    pub(crate) fn from_parts(
        driver: Driver,
        connected: Connected,
        options: ConnectionOptions,
        logger: Arc<dyn QueryLogger>,
    ) -> Self {
        Self {
            driver,
            pool: connected.pool,
            options,
            logger,
            cleanups: Mutex::new(connected.cleanup.into_iter().collect()),
        }
    }

    /// Driver this handle was opened with
    pub fn driver(&self) -> Driver {
        self.driver
    }

    /// The connection pool
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Effective options (defaults applied)
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Query logger attached to this handle
    pub fn logger(&self) -> Arc<dyn QueryLogger> {
        self.logger.clone()
    }

    /// Register an additional teardown step; runs after those already registered
    pub async fn on_close(&self, cleanup: Cleanup) {
        self.cleanups.lock().await.push(cleanup);
    }

    /// Ping bounded by the configured ping timeout.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`] once the pool is closed; otherwise
    /// [`Error::Ping`] or [`Error::PingTimeout`].
    pub async fn health(&self) -> Result<()> {
        if self.pool.is_closed() {
            return Err(Error::NotInitialized);
        }
        self.pool.ping_within(self.options.ping_timeout).await
    }

    /// Run a statement through the pool, reporting it to the query logger
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        self.traced(sql, self.pool.execute(sql), |n| *n).await
    }

    /// Fetch exactly one row; an empty result is a "no rows" query error
    /// that the logger suppresses when configured to ignore not-found.
    pub async fn fetch_one(&self, sql: &str) -> Result<DbRow> {
        self.traced(sql, self.pool.fetch_one(sql), |_| 1).await
    }

    /// Fetch the first row, if any
    pub async fn fetch_optional(&self, sql: &str) -> Result<Option<DbRow>> {
        self.traced(sql, self.pool.fetch_optional(sql), |row| u64::from(row.is_some()))
            .await
    }

    /// Fetch every row of the first result set
    pub async fn fetch_all(&self, sql: &str) -> Result<Vec<DbRow>> {
        self.traced(sql, self.pool.fetch_all(sql), |rows| rows.len() as u64)
            .await
    }

    async fn traced<T>(
        &self,
        sql: &str,
        run: impl Future<Output = Result<T>>,
        rows: fn(&T) -> u64,
    ) -> Result<T> {
        if self.pool.is_closed() {
            return Err(Error::NotInitialized);
        }

        let begin = Instant::now();
        let outcome = run.await;
        let affected = outcome.as_ref().map(rows).unwrap_or(0);
        self.logger.trace(
            begin,
            &|| (sql.to_string(), affected),
            outcome.as_ref().err().map(|e| e as &(dyn std::error::Error + 'static)),
        );
        outcome
    }

    /// Run every pending cleanup, then close the pool.
    ///
    /// Every cleanup runs even if an earlier one fails; all failures are
    /// returned together in [`Error::Close`]. A second call is a no-op.
    pub async fn close(&self) -> Result<()> {
        let pending = std::mem::take(&mut *self.cleanups.lock().await);
        let mut errors = Vec::new();

        for cleanup in pending {
            if let Err(e) = cleanup().await {
                tracing::warn!(driver = self.driver.as_str(), error = %e, "cleanup failed");
                errors.push(e);
            }
        }

        if !self.pool.is_closed() {
            self.pool.close().await;
        }

        if errors.is_empty() {
            tracing::debug!(driver = self.driver.as_str(), "database closed");
            Ok(())
        } else {
            Err(Error::Close(errors))
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("driver", &self.driver)
            .field("pool", &self.pool)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::connect_standard;
    use crate::logger::RedactingLogger;
    use crate::DriverError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn memory_db() -> Database {
        let cfg = DatabaseConfig::new("sqlite", ":memory:").max_open_conns(1);
        let opts = ConnectionOptions::default().with_defaults();
        let connected = connect_standard(&cfg, &opts).await.unwrap();
        Database::from_parts(
            Driver::Sqlite,
            connected,
            opts.clone(),
            Arc::new(RedactingLogger::for_options(&opts)),
        )
    }

    fn failing(counter: Arc<AtomicUsize>, msg: &'static str) -> Cleanup {
        Box::new(move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Dial(msg.to_string()))
            })
        })
    }

    #[tokio::test]
    async fn test_health_and_execute() {
        let db = memory_db().await;
        db.health().await.unwrap();

        assert_eq!(db.execute("CREATE TABLE t (id INTEGER)").await.unwrap(), 0);
        assert_eq!(db.execute("INSERT INTO t VALUES (1), (2)").await.unwrap(), 2);
        assert!(matches!(
            db.execute("SELECT * FROM missing_table").await,
            Err(Error::Query(_))
        ));

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_rows() {
        let db = memory_db().await;
        db.execute("CREATE TABLE t (id INTEGER, name TEXT)").await.unwrap();
        db.execute("INSERT INTO t VALUES (1, 'a'), (2, 'b'), (3, 'c')")
            .await
            .unwrap();

        let rows = db.fetch_all("SELECT id, name FROM t").await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].len(), 2);

        let row = db.fetch_one("SELECT id FROM t WHERE id = 2").await.unwrap();
        assert_eq!(row.len(), 1);

        assert!(db
            .fetch_optional("SELECT id FROM t WHERE id = 99")
            .await
            .unwrap()
            .is_none());

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_one_empty_is_not_found() {
        let db = memory_db().await;
        db.execute("CREATE TABLE t (id INTEGER)").await.unwrap();

        let err = db.fetch_one("SELECT id FROM t").await.unwrap_err();
        assert!(
            matches!(err, Error::Query(DriverError::Sqlx(sqlx::Error::RowNotFound))),
            "{err:?}"
        );
        assert!(crate::logger::is_not_found(&err));

        db.close().await.unwrap();
        assert!(matches!(
            db.fetch_all("SELECT 1").await,
            Err(Error::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_health_after_close() {
        let db = memory_db().await;
        db.close().await.unwrap();
        assert!(matches!(db.health().await, Err(Error::NotInitialized)));
        assert!(matches!(db.execute("SELECT 1").await, Err(Error::NotInitialized)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let db = memory_db().await;
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        db.on_close(Box::new(move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }))
        .await;

        db.close().await.unwrap();
        db.close().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_aggregates_failures() {
        let db = memory_db().await;
        let runs = Arc::new(AtomicUsize::new(0));
        db.on_close(failing(runs.clone(), "first")).await;
        db.on_close(failing(runs.clone(), "second")).await;

        let err = db.close().await.unwrap_err();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        match err {
            Error::Close(errors) => {
                assert_eq!(errors.len(), 2);
                let msg = Error::Close(errors).to_string();
                assert!(msg.contains("first"));
                assert!(msg.contains("second"));
            }
            other => panic!("expected close error, got {other:?}"),
        }
        assert!(db.pool().is_closed());
    }
}
