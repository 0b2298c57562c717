//! Per-target connection parameters and the recognized driver names

use crate::options::ConnectionOptions;
use crate::tunnel::DialerFamily;
use crate::{Error, Result};
use serde::Deserialize;

// Values shipped in example configuration files; treated as unset.
const PLACEHOLDERS: &[&str] = &[
    "your_database_name",
    "your_database_user",
    "your_database_password",
];

/// The six recognized driver names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Driver {
    /// PostgreSQL over a direct socket
    Postgres,
    /// MySQL over a direct socket
    MySql,
    /// SQLite file
    Sqlite,
    /// Microsoft SQL Server over a direct socket
    SqlServer,
    /// Managed PostgreSQL reached through the tunnel dialer
    ManagedPostgres,
    /// Managed MySQL reached through the tunnel dialer
    ManagedMySql,
}

impl Driver {
    /// Every recognized driver, standard ones first
    pub const ALL: [Driver; 6] = [
        Driver::Postgres,
        Driver::MySql,
        Driver::Sqlite,
        Driver::SqlServer,
        Driver::ManagedPostgres,
        Driver::ManagedMySql,
    ];

    /// Wire name used in configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::Sqlite => "sqlite",
            Self::SqlServer => "sqlserver",
            Self::ManagedPostgres => "cloudsql-postgres",
            Self::ManagedMySql => "cloudsql-mysql",
        }
    }

    /// Is this one of the two tunnel-dialed drivers?
    pub fn is_managed(&self) -> bool {
        self.family().is_some()
    }

    /// Dialer family for managed drivers
    pub fn family(&self) -> Option<DialerFamily> {
        match self {
            Self::ManagedPostgres => Some(DialerFamily::Postgres),
            Self::ManagedMySql => Some(DialerFamily::MySql),
            _ => None,
        }
    }

    /// Does this driver talk to a network server (as opposed to a local file)?
    pub fn is_networked(&self) -> bool {
        !matches!(self, Self::Sqlite)
    }
}

impl std::fmt::Display for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Driver {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Driver::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| Error::UnsupportedDriver(s.to_string()))
    }
}

/// Connection parameters for one database target.
///
/// Pool overrides (`max_open_conns`, `max_idle_conns`,
/// `conn_max_lifetime_minutes`) win over [`ConnectionOptions`] when non-zero.
#[derive(Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Driver wire name, resolved at dispatch time
    pub driver: String,
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Username
    pub username: String,
    /// Password
    pub password: String,
    /// Database name (file stem for sqlite)
    #[serde(alias = "dbname")]
    pub database: String,
    /// Encrypt the driver connection
    #[serde(alias = "sslmode")]
    pub tls: bool,
    /// Log every query at info level
    #[serde(alias = "logmode")]
    pub log_queries: bool,
    /// Managed instance name, `project:region:instance`
    #[serde(alias = "cloud_sql_instance")]
    pub instance: String,
    /// Open-connection override
    pub max_open_conns: u32,
    /// Idle-connection override
    pub max_idle_conns: u32,
    /// Connection lifetime override, in minutes
    pub conn_max_lifetime_minutes: u32,
}

impl DatabaseConfig {
    /// Create configuration for a driver and database, other fields empty
    pub fn new(driver: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            database: database.into(),
            ..Self::default()
        }
    }

    /// Set host and port
    pub fn host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Set credentials
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Set the managed instance name
    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    /// Enable or disable driver-level TLS
    pub fn tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        self
    }

    /// Set the open-connection override
    pub fn max_open_conns(mut self, n: u32) -> Self {
        self.max_open_conns = n;
        self
    }

    /// Set the idle-connection override
    pub fn max_idle_conns(mut self, n: u32) -> Self {
        self.max_idle_conns = n;
        self
    }

    /// Set the connection lifetime override
    pub fn conn_max_lifetime_minutes(mut self, minutes: u32) -> Self {
        self.conn_max_lifetime_minutes = minutes;
        self
    }

    /// Resolve the driver name
    pub fn driver(&self) -> Result<Driver> {
        self.driver.parse()
    }

    /// Report every missing required field at once.
    ///
    /// Password is not required for sqlite or when managed auth supplies a token.
    pub fn validate(&self, opts: &ConnectionOptions) -> Result<()> {
        let driver = self.driver()?;
        let mut missing = Vec::new();

        if driver.is_managed() && self.instance.is_empty() {
            missing.push("instance");
        }
        if is_unset(&self.database) {
            missing.push("database");
        }
        if driver.is_networked() {
            if is_unset(&self.username) {
                missing.push("username");
            }
            let token_auth = driver.is_managed() && opts.managed_auth;
            if !token_auth && is_unset(&self.password) {
                missing.push("password");
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "missing database configuration: {}",
                missing.join(", ")
            )))
        }
    }
}

fn is_unset(value: &str) -> bool {
    value.is_empty() || PLACEHOLDERS.contains(&value)
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("tls", &self.tls)
            .field("log_queries", &self.log_queries)
            .field("instance", &self.instance)
            .field("max_open_conns", &self.max_open_conns)
            .field("max_idle_conns", &self.max_idle_conns)
            .field("conn_max_lifetime_minutes", &self.conn_max_lifetime_minutes)
            .finish()
    }
}
