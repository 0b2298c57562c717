//! Query logging with slow-query detection and secret redaction
//!
//! [`QueryLogger`] is the contract a query layer reports through: leveled
//! messages plus one `trace` call per executed statement. [`RedactingLogger`]
//! is the implementation every handle gets; it emits `tracing` events and
//! never lets credentials or other sensitive literals reach the log.

mod redact;

pub use redact::{redact_sql, REDACTED};

use crate::error::DriverError;
use crate::options::{ConnectionOptions, LogLevel, DEFAULT_SLOW_QUERY_THRESHOLD};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Logging contract for query layers.
pub trait QueryLogger: Send + Sync {
    /// Copy of this logger at a different level
    fn log_mode(&self, level: LogLevel) -> Arc<dyn QueryLogger>;

    /// Informational message, emitted at `Info`
    fn info(&self, args: fmt::Arguments<'_>);

    /// Warning, emitted at `Warn` and above
    fn warn(&self, args: fmt::Arguments<'_>);

    /// Error, emitted at `Error` and above
    fn error(&self, args: fmt::Arguments<'_>);

    /// Report one executed statement.
    ///
    /// `query` is only invoked when something will be logged and returns the
    /// SQL text and affected row count.
    fn trace(
        &self,
        begin: Instant,
        query: &dyn Fn() -> (String, u64),
        err: Option<&(dyn StdError + 'static)>,
    );
}

/// Settings for [`RedactingLogger`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggerConfig {
    /// Minimum level emitted
    pub level: LogLevel,
    /// Successful queries slower than this are warnings (zero = 500ms)
    pub slow_threshold: Duration,
    /// Suppress "no rows" results instead of logging them as errors
    pub ignore_not_found: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Warn,
            slow_threshold: DEFAULT_SLOW_QUERY_THRESHOLD,
            ignore_not_found: true,
        }
    }
}

impl From<&ConnectionOptions> for LoggerConfig {
    fn from(opts: &ConnectionOptions) -> Self {
        Self {
            level: opts.level(),
            slow_threshold: opts.slow_query_threshold,
            ignore_not_found: true,
        }
    }
}

/// Query logger that routes through `tracing` and redacts SQL.
#[derive(Debug, Clone)]
pub struct RedactingLogger {
    config: LoggerConfig,
}

impl RedactingLogger {
    /// Create a logger; a zero threshold becomes the 500ms default
    pub fn new(mut config: LoggerConfig) -> Self {
        if config.slow_threshold.is_zero() {
            config.slow_threshold = DEFAULT_SLOW_QUERY_THRESHOLD;
        }
        Self { config }
    }

    /// Logger for a handle opened with `opts`
    pub fn for_options(opts: &ConnectionOptions) -> Self {
        Self::new(LoggerConfig::from(opts))
    }

    /// Active settings
    pub fn config(&self) -> &LoggerConfig {
        &self.config
    }

    fn enabled(&self, level: LogLevel) -> bool {
        self.config.level != LogLevel::Silent && self.config.level >= level
    }
}

impl Default for RedactingLogger {
    fn default() -> Self {
        Self::new(LoggerConfig::default())
    }
}

impl QueryLogger for RedactingLogger {
    fn log_mode(&self, level: LogLevel) -> Arc<dyn QueryLogger> {
        Arc::new(Self::new(LoggerConfig {
            level,
            ..self.config
        }))
    }

    fn info(&self, args: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Info) {
            tracing::info!("{}", args);
        }
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Warn) {
            tracing::warn!("{}", args);
        }
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        if self.enabled(LogLevel::Error) {
            tracing::error!("{}", args);
        }
    }

    fn trace(
        &self,
        begin: Instant,
        query: &dyn Fn() -> (String, u64),
        err: Option<&(dyn StdError + 'static)>,
    ) {
        if self.config.level == LogLevel::Silent {
            return;
        }

        let elapsed = begin.elapsed();
        let duration_ms = elapsed.as_millis() as u64;
        let (sql, rows_affected) = query();
        let sql = redact_sql(&sql);

        if let Some(err) = err {
            if self.config.ignore_not_found && is_not_found(err) {
                crate::metrics::counters::query_completed(crate::metrics::labels::OUTCOME_NOT_FOUND);
                return;
            }
            crate::metrics::counters::query_completed(crate::metrics::labels::OUTCOME_ERROR);
            tracing::error!(
                duration_ms,
                rows_affected,
                sql = %sql,
                error = %err,
                "query failed"
            );
            return;
        }

        // Slow statements are reported at every non-silent level, Error included.
        if elapsed > self.config.slow_threshold {
            crate::metrics::counters::query_completed(crate::metrics::labels::OUTCOME_SLOW);
            tracing::warn!(
                duration_ms,
                rows_affected,
                sql = %sql,
                slow = true,
                threshold_ms = self.config.slow_threshold.as_millis() as u64,
                "slow query detected"
            );
            return;
        }

        crate::metrics::counters::query_completed(crate::metrics::labels::OUTCOME_SUCCESS);
        if self.enabled(LogLevel::Info) {
            tracing::info!(duration_ms, rows_affected, sql = %sql, "query executed");
        }
    }
}

/// Does `err` (or anything in its source chain) mean "no rows"?
pub fn is_not_found(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(sqlx::Error::RowNotFound) = e.downcast_ref::<sqlx::Error>() {
            return true;
        }
        if let Some(DriverError::Sqlx(sqlx::Error::RowNotFound)) = e.downcast_ref::<DriverError>()
        {
            return true;
        }
        current = e.source();
    }
    false
}
