//! Default dialer: TCP to the instance's server-side proxy, then rustls.
//!
//! Server certificates are validated against, in order of preference, a
//! custom CA bundle, the system roots, or the bundled webpki roots. Under
//! managed auth the dialer presents a client identity (certificate + key).

use super::{
    DialerFactory, DialerFamily, DialerOptions, InstanceName, TunnelDialer, TunnelStream,
};
use crate::{Error, Result};
use async_trait::async_trait;
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::Item;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Port the managed instance's server-side proxy listens on
pub const DEFAULT_TUNNEL_PORT: u16 = 3307;

/// Addresses and TLS identity of one managed instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceEndpoints {
    public_host: Option<String>,
    private_host: Option<String>,
    port: u16,
    server_name: String,
}

impl InstanceEndpoints {
    /// Endpoints whose certificate is issued for `server_name`
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            public_host: None,
            private_host: None,
            port: DEFAULT_TUNNEL_PORT,
            server_name: server_name.into(),
        }
    }

    /// Set the public address
    pub fn public(mut self, host: impl Into<String>) -> Self {
        self.public_host = Some(host.into());
        self
    }

    /// Set the private-network address
    pub fn private(mut self, host: impl Into<String>) -> Self {
        self.private_host = Some(host.into());
        self
    }

    /// Override the proxy port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// TLS server name
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Address to dial for the requested routing
    pub fn address(&self, private_network: bool) -> Result<(&str, u16)> {
        let host = if private_network {
            self.private_host.as_deref().ok_or_else(|| {
                Error::Dial(format!("{} has no private address", self.server_name))
            })?
        } else {
            self.public_host.as_deref().ok_or_else(|| {
                Error::Dial(format!("{} has no public address", self.server_name))
            })?
        };
        Ok((host, self.port))
    }
}

/// Looks up where a managed instance can be reached.
#[async_trait]
pub trait InstanceResolver: Send + Sync {
    /// Resolve `instance` to its endpoints
    async fn resolve(&self, instance: &InstanceName) -> Result<InstanceEndpoints>;
}

/// Resolver backed by a fixed table, keyed by `project:region:instance`.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    instances: HashMap<String, InstanceEndpoints>,
}

impl StaticResolver {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an instance
    pub fn with_instance(mut self, name: impl Into<String>, endpoints: InstanceEndpoints) -> Self {
        self.instances.insert(name.into(), endpoints);
        self
    }
}

#[async_trait]
impl InstanceResolver for StaticResolver {
    async fn resolve(&self, instance: &InstanceName) -> Result<InstanceEndpoints> {
        self.instances
            .get(&instance.to_string())
            .cloned()
            .ok_or_else(|| Error::Dial(format!("unknown instance '{}'", instance)))
    }
}

/// Certificate material for tunnel TLS.
///
/// # Examples
///
/// ```ignore
/// use sqlconn::tunnel::TlsDialerConfig;
///
/// let tls = TlsDialerConfig::builder()
///     .ca_cert_path("/etc/sqlconn/server-ca.pem")
///     .client_identity("/etc/sqlconn/client.pem", "/etc/sqlconn/client.key")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct TlsDialerConfig {
    ca_cert_path: Option<String>,
    client_identity: Option<(String, String)>,
    native_roots: bool,
}

impl TlsDialerConfig {
    /// Create a new builder
    pub fn builder() -> TlsDialerConfigBuilder {
        TlsDialerConfigBuilder::default()
    }

    /// Is a client identity configured?
    pub fn has_client_identity(&self) -> bool {
        self.client_identity.is_some()
    }

    /// Compile the rustls client configuration for a dialer.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - a certificate or key file cannot be read or parsed
    /// - `managed_auth` is requested without a client identity
    pub fn client_config(&self, options: &DialerOptions) -> Result<Arc<ClientConfig>> {
        if options.managed_auth && self.client_identity.is_none() {
            return Err(Error::Config(
                "managed auth requires a client identity (certificate and key)".to_string(),
            ));
        }

        let roots = match &self.ca_cert_path {
            Some(path) => load_custom_ca(path)?,
            None => self.default_roots(),
        };

        let builder = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_root_certificates(roots);

        let config = match &self.client_identity {
            Some((cert_path, key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_key(key_path)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| Error::Tls(format!("client identity: {}", e)))?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(Arc::new(config))
    }

    fn default_roots(&self) -> RootCertStore {
        let mut store = RootCertStore::empty();
        if self.native_roots {
            let result = rustls_native_certs::load_native_certs();
            for cert in result.certs {
                let _ = store.add_parsable_certificates(std::iter::once(cert));
            }
            if !result.errors.is_empty() {
                tracing::debug!(errors = result.errors.len(), "some system root certificates failed to load");
            }
        }
        if store.is_empty() {
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        store
    }
}

/// Builder for [`TlsDialerConfig`]
pub struct TlsDialerConfigBuilder {
    ca_cert_path: Option<String>,
    client_identity: Option<(String, String)>,
    native_roots: bool,
}

impl Default for TlsDialerConfigBuilder {
    fn default() -> Self {
        Self {
            ca_cert_path: None,
            client_identity: None,
            native_roots: true,
        }
    }
}

impl TlsDialerConfigBuilder {
    /// Validate servers against this CA bundle (PEM) instead of the system roots
    pub fn ca_cert_path(mut self, path: impl Into<String>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    /// Present this certificate chain and private key (PEM) to the server
    pub fn client_identity(mut self, cert_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        self.client_identity = Some((cert_path.into(), key_path.into()));
        self
    }

    /// Use system root certificates when no CA bundle is set (default: enabled).
    ///
    /// Without them, or when none load, the bundled webpki roots are used.
    pub fn native_roots(mut self, enabled: bool) -> Self {
        self.native_roots = enabled;
        self
    }

    /// Build the configuration. Files are read when a dialer is created.
    pub fn build(self) -> TlsDialerConfig {
        TlsDialerConfig {
            ca_cert_path: self.ca_cert_path,
            client_identity: self.client_identity,
            native_roots: self.native_roots,
        }
    }
}

fn read_pem(path: &str, what: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Config(format!("failed to read {} '{}': {}", what, path, e)))
}

fn load_custom_ca(path: &str) -> Result<RootCertStore> {
    let data = read_pem(path, "CA certificate file")?;
    let mut reader = std::io::Cursor::new(&data);
    let mut store = RootCertStore::empty();
    let mut found = 0;

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(Item::X509Certificate(cert))) => {
                let _ = store.add_parsable_certificates(std::iter::once(cert));
                found += 1;
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                return Err(Error::Config(format!(
                    "failed to parse CA certificate from '{}'",
                    path
                )));
            }
        }
    }

    if found == 0 {
        return Err(Error::Config(format!("no valid certificates found in '{}'", path)));
    }
    Ok(store)
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let data = read_pem(path, "client certificate")?;
    let certs = rustls_pemfile::certs(&mut std::io::Cursor::new(&data))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("failed to parse client certificate '{}': {}", path, e)))?;
    if certs.is_empty() {
        return Err(Error::Config(format!("no valid certificates found in '{}'", path)));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let data = read_pem(path, "client key")?;
    rustls_pemfile::private_key(&mut std::io::Cursor::new(&data))
        .map_err(|e| Error::Config(format!("failed to parse client key '{}': {}", path, e)))?
        .ok_or_else(|| Error::Config(format!("no private key found in '{}'", path)))
}

/// Dialer that opens rustls sessions to instance endpoints.
pub struct TlsTunnelDialer {
    resolver: Arc<dyn InstanceResolver>,
    connector: TlsConnector,
    options: DialerOptions,
    closed: AtomicBool,
}

impl TlsTunnelDialer {
    /// Create a dialer from a compiled client configuration
    pub fn new(
        resolver: Arc<dyn InstanceResolver>,
        client_config: Arc<ClientConfig>,
        options: DialerOptions,
    ) -> Self {
        Self {
            resolver,
            connector: TlsConnector::from(client_config),
            options,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TunnelDialer for TlsTunnelDialer {
    async fn dial(&self, instance: &InstanceName) -> Result<TunnelStream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Dial("dialer closed".to_string()));
        }

        let endpoints = self.resolver.resolve(instance).await?;
        let (host, port) = endpoints.address(self.options.private_network)?;

        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| Error::Dial(format!("connect {}:{}: {}", host, port, e)))?;
        tcp.set_nodelay(true)?;

        let server_name = ServerName::try_from(endpoints.server_name().to_string())
            .map_err(|e| Error::Tls(format!("invalid server name '{}': {}", endpoints.server_name(), e)))?;

        let stream = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Tls(format!("handshake with {}: {}", instance, e)))?;

        tracing::debug!(instance = %instance, routing = self.options.routing(), "tunnel established");
        Ok(Box::new(stream))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Factory producing [`TlsTunnelDialer`]s.
#[derive(Clone)]
pub struct TlsDialerFactory {
    resolver: Arc<dyn InstanceResolver>,
    tls: TlsDialerConfig,
}

impl TlsDialerFactory {
    /// Create a factory
    pub fn new(resolver: impl InstanceResolver + 'static, tls: TlsDialerConfig) -> Self {
        Self {
            resolver: Arc::new(resolver),
            tls,
        }
    }
}

#[async_trait]
impl DialerFactory for TlsDialerFactory {
    async fn create(
        &self,
        family: DialerFamily,
        options: &DialerOptions,
    ) -> Result<Arc<dyn TunnelDialer>> {
        let client_config = self.tls.client_config(options)?;
        tracing::info!(
            family = family.as_str(),
            routing = options.routing(),
            client_identity = self.tls.has_client_identity(),
            "tls dialer configured"
        );
        Ok(Arc::new(TlsTunnelDialer::new(
            self.resolver.clone(),
            client_config,
            *options,
        )))
    }
}

impl std::fmt::Debug for TlsDialerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsDialerFactory")
            .field("tls", &self.tls)
            .field("resolver", &"<InstanceResolver>")
            .finish()
    }
}
