//! Managed-instance tunnels
//!
//! This module handles:
//! * Instance naming (`project:region:instance`)
//! * The dialer abstraction and its factory
//! * Process-wide, create-once dialer registry with release-once guards
//! * A loopback proxy that turns the dial function into an address a driver can connect to
//! * The default rustls-based dialer

mod proxy;
mod registry;
mod tls;

pub use proxy::TunnelProxy;
pub use registry::{DialerLease, DialerRegistry, SharedDialer};
pub use tls::{
    InstanceEndpoints, InstanceResolver, StaticResolver, TlsDialerConfig, TlsDialerConfigBuilder,
    TlsDialerFactory, TlsTunnelDialer, DEFAULT_TUNNEL_PORT,
};

use crate::options::ConnectionOptions;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Managed driver family; one shared dialer exists per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialerFamily {
    /// Managed PostgreSQL
    Postgres,
    /// Managed MySQL
    MySql,
}

impl DialerFamily {
    /// Stable label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
        }
    }
}

impl std::fmt::Display for DialerFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical instance identifier, `project:region:instance`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceName {
    project: String,
    region: String,
    name: String,
}

impl InstanceName {
    /// Project component
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Region component
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Instance component
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for InstanceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.project, self.region, self.name)
    }
}

impl std::str::FromStr for InstanceName {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [project, region, name]
                if !project.is_empty() && !region.is_empty() && !name.is_empty() =>
            {
                Ok(Self {
                    project: project.to_string(),
                    region: region.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(Error::Config(format!(
                "invalid instance name '{}': expected project:region:instance",
                s
            ))),
        }
    }
}

/// Options a dialer is created with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialerOptions {
    /// Present a token-bound client identity instead of relying on a password
    pub managed_auth: bool,
    /// Only use the instance's private address
    pub private_network: bool,
}

impl DialerOptions {
    /// Routing label for logs
    pub fn routing(&self) -> &'static str {
        if self.private_network {
            "private"
        } else {
            "public"
        }
    }
}

impl From<&ConnectionOptions> for DialerOptions {
    fn from(opts: &ConnectionOptions) -> Self {
        Self {
            managed_auth: opts.managed_auth,
            private_network: opts.private_network,
        }
    }
}

/// Byte stream returned by a dialer
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

/// Boxed tunnel stream
pub type TunnelStream = Box<dyn TunnelIo>;

/// Opens encrypted, authenticated tunnels to managed instances.
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    /// Open a tunnel to `instance`. The caller bounds the wait.
    async fn dial(&self, instance: &InstanceName) -> Result<TunnelStream>;

    /// Release dialer-wide resources. Called at most once.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Creates the dialer for a family; invoked at most once per family per registry.
#[async_trait]
pub trait DialerFactory: Send + Sync {
    /// Build a dialer
    async fn create(
        &self,
        family: DialerFamily,
        options: &DialerOptions,
    ) -> Result<Arc<dyn TunnelDialer>>;
}
