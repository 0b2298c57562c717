//! Connection tuning options and their built-in defaults

use crate::config::DatabaseConfig;
use crate::Error;
use std::time::Duration;

pub(crate) const DEFAULT_MAX_OPEN_CONNS: u32 = 30;
pub(crate) const DEFAULT_MAX_IDLE_CONNS: u32 = 10;
pub(crate) const DEFAULT_CONN_MAX_LIFETIME: Duration = Duration::from_secs(30 * 60);
pub(crate) const DEFAULT_CONN_MAX_IDLE_TIME: Duration = Duration::from_secs(10 * 60);
pub(crate) const DEFAULT_SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(500);
pub(crate) const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

// High-throughput pool limits, see `ConnectionOptions::production_pool_defaults`
const PRODUCTION_MAX_OPEN_CONNS: u32 = 150;
const PRODUCTION_MAX_IDLE_CONNS: u32 = 50;

/// Query log verbosity, ordered from quietest to loudest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    /// Nothing is logged, `trace` returns before any work
    Silent,
    /// Failed queries only
    Error,
    /// Failed and slow queries
    #[default]
    Warn,
    /// Every query
    Info,
}

impl LogLevel {
    /// Map the raw 1..=4 scale used by configuration files.
    ///
    /// Anything outside that range is `None`, which defaulting turns into `Warn`.
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            1 => Some(Self::Silent),
            2 => Some(Self::Error),
            3 => Some(Self::Warn),
            4 => Some(Self::Info),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Silent => write!(f, "silent"),
            Self::Error => write!(f, "error"),
            Self::Warn => write!(f, "warn"),
            Self::Info => write!(f, "info"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "silent" => Ok(Self::Silent),
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            _ => Err(Error::Config(format!(
                "invalid log level '{}': expected silent, error, warn, or info",
                s
            ))),
        }
    }
}

/// Tuning parameters shared by every connection strategy.
///
/// Zero values mean "use the default"; call [`ConnectionOptions::apply_defaults`]
/// (the connectors do this themselves) to resolve them.
///
/// # Examples
///
/// ```
/// use sqlconn::ConnectionOptions;
/// use std::time::Duration;
///
/// let opts = ConnectionOptions::default()
///     .with_max_open_conns(50)
///     .with_ping_timeout(Duration::from_secs(2))
///     .with_defaults();
///
/// assert_eq!(opts.max_open_conns, 50);
/// assert_eq!(opts.max_idle_conns, 10);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Authenticate managed instances with a short-lived identity token
    pub managed_auth: bool,
    /// Route managed-instance tunnels over the private network path
    pub private_network: bool,
    /// Query log level (`None` = default `Warn`)
    pub log_level: Option<LogLevel>,
    /// Ceiling on open connections
    pub max_open_conns: u32,
    /// Ceiling on retained idle connections
    pub max_idle_conns: u32,
    /// Maximum lifetime of a single connection
    pub conn_max_lifetime: Duration,
    /// Maximum time a connection may sit idle
    pub conn_max_idle_time: Duration,
    /// Successful queries slower than this are logged as warnings
    pub slow_query_threshold: Duration,
    /// Bound on every ping (startup and health)
    pub ping_timeout: Duration,
}

impl ConnectionOptions {
    /// Options derived from a target's own flags (query logging turns on `Info`).
    pub fn for_config(cfg: &DatabaseConfig) -> Self {
        Self {
            log_level: cfg.log_queries.then_some(LogLevel::Info),
            ..Self::default()
        }
    }

    /// Replace every unset field with its built-in default.
    ///
    /// Total and idempotent.
    pub fn apply_defaults(&mut self) {
        if self.max_open_conns == 0 {
            self.max_open_conns = DEFAULT_MAX_OPEN_CONNS;
        }
        if self.max_idle_conns == 0 {
            self.max_idle_conns = DEFAULT_MAX_IDLE_CONNS;
        }
        if self.conn_max_lifetime.is_zero() {
            self.conn_max_lifetime = DEFAULT_CONN_MAX_LIFETIME;
        }
        if self.conn_max_idle_time.is_zero() {
            self.conn_max_idle_time = DEFAULT_CONN_MAX_IDLE_TIME;
        }
        if self.slow_query_threshold.is_zero() {
            self.slow_query_threshold = DEFAULT_SLOW_QUERY_THRESHOLD;
        }
        if self.ping_timeout.is_zero() {
            self.ping_timeout = DEFAULT_PING_TIMEOUT;
        }
        if self.log_level.is_none() {
            self.log_level = Some(LogLevel::Warn);
        }
    }

    /// Consuming variant of [`apply_defaults`](Self::apply_defaults)
    pub fn with_defaults(mut self) -> Self {
        self.apply_defaults();
        self
    }

    /// Effective log level (`Warn` when unset)
    pub fn level(&self) -> LogLevel {
        self.log_level.unwrap_or_default()
    }

    /// Enable or disable token authentication for managed instances
    pub fn with_managed_auth(mut self, enabled: bool) -> Self {
        self.managed_auth = enabled;
        self
    }

    /// Enable or disable private-network routing for managed instances
    pub fn with_private_network(mut self, enabled: bool) -> Self {
        self.private_network = enabled;
        self
    }

    /// Set the query log level
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Set the open-connection ceiling
    pub fn with_max_open_conns(mut self, n: u32) -> Self {
        self.max_open_conns = n;
        self
    }

    /// Set the idle-connection ceiling
    pub fn with_max_idle_conns(mut self, n: u32) -> Self {
        self.max_idle_conns = n;
        self
    }

    /// Set the connection lifetime
    pub fn with_conn_max_lifetime(mut self, d: Duration) -> Self {
        self.conn_max_lifetime = d;
        self
    }

    /// Set the idle time before a connection is reaped
    pub fn with_conn_max_idle_time(mut self, d: Duration) -> Self {
        self.conn_max_idle_time = d;
        self
    }

    /// Set the slow-query threshold
    pub fn with_slow_query_threshold(mut self, d: Duration) -> Self {
        self.slow_query_threshold = d;
        self
    }

    /// Set the ping timeout
    pub fn with_ping_timeout(mut self, d: Duration) -> Self {
        self.ping_timeout = d;
        self
    }

    /// Raise pool limits for high-throughput services (150 open / 50 idle).
    pub fn production_pool_defaults(mut self) -> Self {
        self.max_open_conns = PRODUCTION_MAX_OPEN_CONNS;
        self.max_idle_conns = PRODUCTION_MAX_IDLE_CONNS;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_defaults() {
        let opts = ConnectionOptions::default().with_defaults();

        assert_eq!(opts.max_open_conns, 30);
        assert_eq!(opts.max_idle_conns, 10);
        assert_eq!(opts.conn_max_lifetime, Duration::from_secs(1800));
        assert_eq!(opts.conn_max_idle_time, Duration::from_secs(600));
        assert_eq!(opts.slow_query_threshold, Duration::from_millis(500));
        assert_eq!(opts.ping_timeout, Duration::from_secs(5));
        assert_eq!(opts.log_level, Some(LogLevel::Warn));
    }

    #[test]
    fn test_apply_defaults_respects_explicit() {
        let opts = ConnectionOptions {
            max_open_conns: 50,
            max_idle_conns: 20,
            conn_max_lifetime: Duration::from_secs(3600),
            conn_max_idle_time: Duration::from_secs(900),
            slow_query_threshold: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(10),
            log_level: Some(LogLevel::Info),
            ..Default::default()
        }
        .with_defaults();

        assert_eq!(opts.max_open_conns, 50);
        assert_eq!(opts.max_idle_conns, 20);
        assert_eq!(opts.conn_max_lifetime, Duration::from_secs(3600));
        assert_eq!(opts.conn_max_idle_time, Duration::from_secs(900));
        assert_eq!(opts.slow_query_threshold, Duration::from_secs(1));
        assert_eq!(opts.ping_timeout, Duration::from_secs(10));
        assert_eq!(opts.log_level, Some(LogLevel::Info));
    }

    #[test]
    fn test_apply_defaults_idempotent() {
        let inputs = [
            ConnectionOptions::default(),
            ConnectionOptions::default().with_max_idle_conns(3),
            ConnectionOptions::default()
                .with_ping_timeout(Duration::from_millis(1))
                .with_log_level(LogLevel::Silent),
        ];

        for input in inputs {
            let once = input.with_defaults();
            let twice = once.clone().with_defaults();
            assert_eq!(once, twice);
            assert!(once.max_open_conns > 0);
            assert!(once.max_idle_conns > 0);
            assert!(!once.conn_max_lifetime.is_zero());
            assert!(!once.conn_max_idle_time.is_zero());
            assert!(!once.slow_query_threshold.is_zero());
            assert!(!once.ping_timeout.is_zero());
            assert!(once.log_level.is_some());
        }
    }

    #[test]
    fn test_production_pool_defaults() {
        let opts = ConnectionOptions::default()
            .production_pool_defaults()
            .with_defaults();
        assert_eq!(opts.max_open_conns, 150);
        assert_eq!(opts.max_idle_conns, 50);
    }

    #[test]
    fn test_for_config_log_queries() {
        let mut cfg = DatabaseConfig::new("sqlite", "app");
        assert_eq!(ConnectionOptions::for_config(&cfg).log_level, None);

        cfg.log_queries = true;
        assert_eq!(
            ConnectionOptions::for_config(&cfg).log_level,
            Some(LogLevel::Info)
        );
    }

    #[test]
    fn test_log_level_from_raw() {
        assert_eq!(LogLevel::from_raw(1), Some(LogLevel::Silent));
        assert_eq!(LogLevel::from_raw(4), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_raw(0), None);
        assert_eq!(LogLevel::from_raw(7), None);

        let opts = ConnectionOptions {
            log_level: LogLevel::from_raw(-3),
            ..Default::default()
        }
        .with_defaults();
        assert_eq!(opts.level(), LogLevel::Warn);
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("silent".parse::<LogLevel>().unwrap(), LogLevel::Silent);
        assert_eq!("INFO".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Silent < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
    }
}
