//! Main proxy server

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};

use super::api::Api;
use super::handler::ProxyHandler;
use super::upstream::UpstreamClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::har::{BodyCapture, Recorder};
use crate::modifier::stack::build_stack;
use crate::modifier::{InstalledPipeline, Registry, Session};
use crate::tls::{upstream_client_config, Authority, MitmConfig};

/// How long in-flight connections get to finish after shutdown is signalled
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// The main proxy server
pub struct ProxyServer {
    config: Config,
    authority: Arc<Authority>,
    installed: Arc<InstalledPipeline>,
    recorder: Arc<Recorder>,
    listener: Option<TcpListener>,
    upstream_port_override: Option<u16>,
    upstream_host_override: Option<String>,
    upstream_tls_config: Option<Arc<ClientConfig>>,
    shutdown_grace: Duration,
}

impl ProxyServer {
    /// Create a new proxy server from configuration: load or generate the
    /// authority and install the startup pipeline, if any.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let authority = match (&config.tls.ca_cert, &config.tls.ca_key) {
            (Some(cert), Some(key)) => {
                Authority::from_files(cert, key, &config.proxy.signature)?
            }
            _ => {
                tracing::info!("No CA configured, generating an ephemeral authority");
                Authority::generate(&config.proxy.signature, config.tls.authority_validity())?
            }
        };
        let authority = Arc::new(authority.with_validity(config.tls.validity()));

        let installed = Arc::new(InstalledPipeline::new(Registry::default()));
        if let Some(path) = &config.pipeline.file {
            let body = std::fs::read(path).map_err(|e| {
                Error::config(format!("Failed to read pipeline file '{}': {}", path, e))
            })?;
            installed.install(&body)?;
            tracing::info!(path = %path, "Installed startup pipeline");
        }

        let recorder = Arc::new(Recorder::new(BodyCapture {
            enabled: config.log.capture_bodies,
            max_bytes: config.log.max_body_bytes,
        }));

        Ok(Self {
            config,
            authority,
            installed,
            recorder,
            listener: None,
            upstream_port_override: None,
            upstream_host_override: None,
            upstream_tls_config: None,
            shutdown_grace: SHUTDOWN_GRACE,
        })
    }

    /// Use an existing authority instead of the configured one.
    pub fn with_authority(mut self, authority: Arc<Authority>) -> Self {
        self.authority = authority;
        self
    }

    /// Override the upstream port for all forwarded connections (for testing).
    pub fn with_upstream_port_override(mut self, port: u16) -> Self {
        self.upstream_port_override = Some(port);
        self
    }

    /// Override the upstream host for TCP connections (for testing with non-resolvable hostnames).
    /// The original hostname is still used for TLS SNI.
    pub fn with_upstream_host_override(mut self, host: String) -> Self {
        self.upstream_host_override = Some(host);
        self
    }

    /// Inject a custom TLS config for upstream connections (for testing with self-signed certs).
    pub fn with_upstream_tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.upstream_tls_config = Some(config);
        self
    }

    /// Parse pipelines with `registry`, typically the default one extended
    /// with application modifier types. The startup pipeline is re-parsed.
    pub fn with_registry(mut self, registry: Registry) -> Result<Self> {
        let installed = Arc::new(InstalledPipeline::new(registry));
        let raw = self.installed.raw_json();
        if raw.as_object().map_or(true, |o| !o.is_empty()) {
            installed.install(raw.to_string().as_bytes())?;
        }
        self.installed = installed;
        Ok(self)
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    pub fn installed(&self) -> &Arc<InstalledPipeline> {
        &self.installed
    }

    pub fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the proxy server with graceful shutdown
    pub async fn run_until_shutdown(mut self, shutdown: oneshot::Receiver<()>) -> Result<()> {
        let local_addr = self.bind().await?;
        tracing::info!(address = %local_addr, "Proxy server listening");
        self.serve(shutdown).await
    }

    /// Bind the server to its configured address and return the local address.
    ///
    /// Useful when binding to port 0 to discover the assigned port.
    /// Call `serve()` afterwards to start accepting connections.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let bind_address = &self.config.proxy.bind_address;
        let addr: SocketAddr = bind_address.parse().map_err(|e| {
            Error::config(format!("Invalid bind address '{}': {}", bind_address, e))
        })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::proxy(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::proxy(format!("Failed to get local address: {}", e)))?;

        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Serve connections using a previously bound listener.
    ///
    /// When `shutdown` fires (or its sender is dropped) the listener is
    /// closed, every connection is asked to finish its in-flight request and
    /// close, and this returns once they have or the grace period ran out.
    pub async fn serve(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| Error::proxy("bind() must be called before serve()"))?;

        let handler = self.make_handler()?;
        let (shutdown_tx, _) = watch::channel(false);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
                result = listener.accept() => {
                    let (stream, client_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    tracing::debug!(client = %client_addr, "New connection");
                    spawn_connection(stream, client_addr, handler.clone(), shutdown_tx.subscribe());
                }
            }
        }

        drop(listener);
        shutdown_tx.send_replace(true);
        let open = shutdown_tx.receiver_count();
        if open > 0 {
            tracing::info!(connections = open, "Waiting for open connections to finish");
        }
        if tokio::time::timeout(self.shutdown_grace, shutdown_tx.closed())
            .await
            .is_err()
        {
            tracing::warn!(
                connections = shutdown_tx.receiver_count(),
                "Grace period elapsed with connections still open"
            );
        }
        tracing::info!("Proxy server stopped");
        Ok(())
    }

    fn make_handler(&self) -> Result<ProxyHandler> {
        let stack = build_stack(
            &self.config,
            self.installed.clone(),
            Some(self.recorder.clone()),
        )?;

        let api = Api::new(
            self.installed.clone(),
            self.recorder.clone(),
            Some(self.authority.clone()),
        )
        .with_cors(self.config.proxy.cors);

        if self.config.tls.skip_tls_verify {
            tracing::warn!("Upstream TLS certificate verification is DISABLED");
        }
        let tls = self
            .upstream_tls_config
            .clone()
            .unwrap_or_else(|| upstream_client_config(self.config.tls.skip_tls_verify));
        let mut upstream = UpstreamClient::new(&self.config.upstream, tls);
        if let Some(port) = self.upstream_port_override {
            upstream = upstream.with_port_override(port);
        }
        if let Some(ref host) = self.upstream_host_override {
            upstream = upstream.with_host_override(host.clone());
        }

        let mitm = self
            .config
            .tls
            .mitm
            .then(|| Arc::new(MitmConfig::new(self.authority.clone())));

        Ok(ProxyHandler::new(
            Arc::new(stack),
            Arc::new(api),
            &self.config.proxy.api_host,
            Arc::new(upstream),
            &self.config.proxy.signature,
        )
        .with_mitm(mitm))
    }
}

/// Spawn a task to handle a single connection.
fn spawn_connection(
    stream: TcpStream,
    client_addr: SocketAddr,
    handler: ProxyHandler,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let io = TokioIo::new(stream);
        let session = Session::new(Some(client_addr.to_string()));
        let tunnel_shutdown = shutdown.clone();

        let service = service_fn(move |req| {
            handler
                .clone()
                .handle(session.clone(), req, tunnel_shutdown.clone())
        });

        let conn = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades();
        tokio::pin!(conn);

        let result = tokio::select! {
            r = conn.as_mut() => r,
            _ = crate::shutdown::signalled(&mut shutdown) => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };
        if let Err(e) = result {
            if !e.to_string().contains("connection closed") {
                tracing::debug!(client = %client_addr, error = %e, "Connection error");
            }
        }
    });
}
