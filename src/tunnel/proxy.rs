//! Loopback listener bridging driver sockets to tunnel streams

use super::{InstanceName, SharedDialer};
use crate::Result;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;

/// Local endpoint for one managed connection.
///
/// The driver connects to [`local_addr`](Self::local_addr) like any database
/// server. Every accepted socket is bridged to a fresh tunnel opened through
/// the shared dialer. Dropping the proxy aborts the listener and all bridges.
#[derive(Debug)]
pub struct TunnelProxy {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TunnelProxy {
    /// Bind `127.0.0.1:0` and start accepting
    pub async fn bind(
        dialer: Arc<SharedDialer>,
        instance: InstanceName,
        dial_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = oneshot::channel();

        tracing::debug!(local = %local_addr, instance = %instance, "tunnel proxy listening");
        let task = tokio::spawn(accept_loop(listener, rx, dialer, instance, dial_timeout));

        Ok(Self {
            local_addr,
            shutdown: Some(tx),
            task,
        })
    }

    /// Address drivers connect to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and tear down open bridges
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
            let _ = (&mut self.task).await;
        }
    }
}

impl Drop for TunnelProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown: oneshot::Receiver<()>,
    dialer: Arc<SharedDialer>,
    instance: InstanceName,
    dial_timeout: Duration,
) {
    let mut bridges = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    tracing::debug!(peer = %peer, instance = %instance, "bridging driver connection");
                    bridges.spawn(bridge(socket, dialer.clone(), instance.clone(), dial_timeout));
                }
                Err(e) => tracing::warn!(error = %e, "tunnel proxy accept failed"),
            },
            Some(_) = bridges.join_next(), if !bridges.is_empty() => {}
        }
    }

    bridges.shutdown().await;
    tracing::debug!(instance = %instance, "tunnel proxy stopped");
}

async fn bridge(
    mut local: TcpStream,
    dialer: Arc<SharedDialer>,
    instance: InstanceName,
    dial_timeout: Duration,
) {
    let _ = local.set_nodelay(true);

    let mut remote = match timeout(dial_timeout, dialer.dial(&instance)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!(instance = %instance, error = %e, "tunnel dial failed");
            return;
        }
        Err(_) => {
            tracing::warn!(instance = %instance, timeout_ms = dial_timeout.as_millis() as u64, "tunnel dial timed out");
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
        Ok((up, down)) => tracing::debug!(instance = %instance, up, down, "tunnel closed"),
        Err(e) => tracing::debug!(instance = %instance, error = %e, "tunnel closed with error"),
    }
}
