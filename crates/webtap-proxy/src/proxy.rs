//! Proxy listener.
//!
//! Binds the sniff port and hands every accepted connection to the request
//! router on its own task.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;

use webtap_core::AdapterRegistry;

use crate::ca::CertificateAuthority;
use crate::domains::DomainPolicy;
use crate::error::Result;
use crate::handler::{serve_connection, ProxyState};
use crate::sniff::SniffControl;
use crate::tls::upstream_client_config;
use crate::DEFAULT_PROXY_PORT;

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// Adapter name to record with, `None` to intercept without recording.
    pub adapter: Option<String>,
    /// Sniff domains and upstream proxy, shared so it can change at runtime.
    pub policy: Arc<DomainPolicy>,
    /// Skip certificate verification on the origin leg.
    pub insecure_upstream: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            adapter: None,
            policy: Arc::new(DomainPolicy::default()),
            insecure_upstream: false,
        }
    }
}

impl ProxyConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the adapter by registry name.
    pub fn with_adapter(mut self, name: impl Into<String>) -> Self {
        self.adapter = Some(name.into());
        self
    }

    /// Sets the domain policy.
    pub fn with_policy(mut self, policy: Arc<DomainPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Disables origin certificate verification.
    pub fn with_insecure_upstream(mut self, insecure: bool) -> Self {
        self.insecure_upstream = insecure;
        self
    }
}

/// A bound MITM proxy instance.
pub struct ProxyServer {
    listener: TcpListener,
    state: Arc<ProxyState>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("addr", &self.listener.local_addr().ok())
            .field("state", &self.state)
            .finish()
    }
}

impl ProxyServer {
    /// Resolves the adapter and binds the listener.
    ///
    /// Fails on an unknown adapter name, an unusable upstream proxy URL or
    /// when the port cannot be bound.
    pub async fn bind(
        config: ProxyConfig,
        ca: Arc<CertificateAuthority>,
        registry: &AdapterRegistry,
    ) -> Result<Self> {
        let adapter = config
            .adapter
            .as_deref()
            .map(|name| registry.resolve(name))
            .transpose()?;
        let dialer = config.policy.dialer()?;
        tracing::debug!(?dialer, "upstream route");
        let upstream_tls = upstream_client_config(config.insecure_upstream)?;
        let listener = TcpListener::bind(config.addr).await?;

        tracing::info!(
            "Proxy listening on {} (adapter: {})",
            listener.local_addr()?,
            adapter.as_ref().map(|a| a.name()).unwrap_or("none")
        );

        Ok(Self {
            listener,
            state: Arc::new(ProxyState {
                ca,
                policy: config.policy,
                adapter,
                control: SniffControl::new(),
                upstream_tls,
            }),
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Returns the sniffing control for this instance.
    pub fn sniff_control(&self) -> SniffControl {
        self.state.control.clone()
    }

    /// Returns the domain policy for this instance.
    pub fn policy(&self) -> Arc<DomainPolicy> {
        Arc::clone(&self.state.policy)
    }

    /// Accepts connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            tokio::spawn(serve_connection(Arc::clone(&self.state), stream, peer));
        }
    }

    /// Starts accepting in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub fn start(self) -> Result<ProxyHandle> {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let addr = self.local_addr()?;
        let control = self.sniff_control();

        let handle = tokio::spawn(async move {
            tokio::select! {
                result = self.run() => {
                    if let Err(e) = result {
                        tracing::error!("Proxy error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Proxy shutdown signal received");
                }
            }
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            control,
            handle,
        })
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    control: SniffControl,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the sniffing control for this instance.
    pub fn sniff_control(&self) -> SniffControl {
        self.control.clone()
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
