//! sqlconn: relational database connection management
//!
//! Opens pooled handles to Postgres, MySQL, SQLite and SQL Server, and to
//! managed Postgres/MySQL instances reached through an encrypted tunnel.
//!
//! * Defaulted tuning options with per-target pool overrides
//! * Driver-native connection strings
//! * Bounded startup and health pings
//! * One shared tunnel dialer per managed family, released exactly once
//! * Query logging with slow-query warnings and secret redaction
//! * Ordered, idempotent close
//!
//! # Examples
//!
//! ```no_run
//! use sqlconn::{ConnectionOptions, Database, DatabaseConfig};
//!
//! # async fn example() -> sqlconn::Result<()> {
//! let cfg = DatabaseConfig::new("postgres", "orders")
//!     .host("db.internal", 5432)
//!     .credentials("app", "secret");
//!
//! let db = Database::connect(&cfg, ConnectionOptions::default()).await?;
//! db.health().await?;
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod connector;
pub mod database;
pub mod dsn;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod options;
pub mod pool;
pub mod registry;
pub mod tunnel;

pub use config::{DatabaseConfig, Driver};
pub use connector::{connect_managed, connect_standard, Cleanup, Connected, Connector};
pub use database::Database;
pub use error::{DriverError, Error, Result};
pub use logger::{LoggerConfig, QueryLogger, RedactingLogger};
pub use options::{ConnectionOptions, LogLevel};
pub use pool::{DbPool, DbRow, PoolSettings, PoolStats};
pub use registry::DatabaseRegistry;
pub use tunnel::{DialerFactory, DialerFamily, DialerOptions, DialerRegistry, TunnelDialer};
