//! Error types for sqlconn

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for sqlconn operations
#[derive(Debug, Error)]
pub enum Error {
    /// Driver name is not one of the recognized values
    #[error("unsupported driver: {0}")]
    UnsupportedDriver(String),

    /// Invalid or incomplete configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Managed driver used without an instance identifier
    #[error("instance required for {driver}")]
    MissingInstance {
        /// Wire name of the managed driver
        driver: &'static str,
    },

    /// Connection string could not be built
    #[error("build dsn: {0}")]
    Dsn(String),

    /// Driver-level open failed
    #[error("open: {0}")]
    Open(#[source] DriverError),

    /// Underlying pooled handle unavailable
    #[error("get pooled handle: {0}")]
    GetPool(String),

    /// Ping failed
    #[error("ping: {0}")]
    Ping(#[source] DriverError),

    /// Ping did not complete in time
    #[error("ping: timed out after {0:?}")]
    PingTimeout(Duration),

    /// Query failed
    #[error("query: {0}")]
    Query(#[source] DriverError),

    /// Tunnel dial failed
    #[error("dial: {0}")]
    Dial(String),

    /// The shared dialer for a family was already released
    #[error("dial: {family} dialer already released")]
    DialerReleased {
        /// Dialer family name
        family: &'static str,
    },

    /// TLS setup or handshake failed
    #[error("tls: {0}")]
    Tls(String),

    /// Handle has no open connection
    #[error("database not initialized")]
    NotInitialized,

    /// One or more cleanups failed during close
    #[error("close: {}", join_errors(.0))]
    Close(Vec<Error>),

    /// I/O error
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced by the underlying drivers
#[derive(Debug, Error)]
pub enum DriverError {
    /// sqlx (postgres, mysql, sqlite)
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    /// tiberius (sqlserver)
    #[error(transparent)]
    SqlServer(#[from] tiberius::error::Error),

    /// bb8 pool checkout (sqlserver)
    #[error("pool checkout: {0}")]
    Checkout(String),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Short stage tag for the failure, stable across message changes
    pub fn stage(&self) -> &'static str {
        match self {
            Error::UnsupportedDriver(_) | Error::Config(_) | Error::MissingInstance { .. } => {
                "config"
            }
            Error::Dsn(_) => "dsn",
            Error::Open(_) => "open",
            Error::GetPool(_) => "get_pool",
            Error::Ping(_) | Error::PingTimeout(_) => "ping",
            Error::Query(_) => "query",
            Error::Dial(_) | Error::DialerReleased { .. } => "dial",
            Error::Tls(_) => "tls",
            Error::NotInitialized => "lifecycle",
            Error::Close(_) => "close",
            Error::Io(_) => "io",
        }
    }

    /// Is this a configuration error (fail fast, never retried)?
    pub fn is_config_error(&self) -> bool {
        self.stage() == "config"
    }

    /// Is this a connection-attempt error?
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self.stage(),
            "dsn" | "open" | "get_pool" | "ping" | "dial" | "tls"
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
