//! Test infrastructure for proxy integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tapline::har::Recorder;
use tapline::modifier::{InstalledPipeline, Registry};
use tapline::tls::Authority;
use tapline::{Config, ProxyServer};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

// ---------------------------------------------------------------------------
// TestCa
// ---------------------------------------------------------------------------

/// A generated authority shared by the proxy and the test upstreams.
pub struct TestCa {
    pub authority: Arc<Authority>,
    pub cert_pem: String,
    pub cert_der: CertificateDer<'static>,
}

impl TestCa {
    pub fn generate() -> Self {
        tapline::tls::install_crypto_provider();
        let authority = Authority::generate("tapline-test", Duration::from_secs(24 * 3600)).unwrap();
        Self {
            cert_pem: authority.cert_pem().to_string(),
            cert_der: authority.cert_der().clone(),
            authority: Arc::new(authority),
        }
    }

    /// Client config that trusts this CA, HTTP/1.1 only like the proxy's own
    /// upstream connections.
    pub fn client_tls_config(&self) -> Arc<ClientConfig> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.add(self.cert_der.clone()).unwrap();
        let mut config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }

    /// Server config for `hostname` signed by this CA.
    pub fn server_tls_config(&self, hostname: &str) -> Arc<ServerConfig> {
        let issued = self.authority.issue(hostname).unwrap();
        let cert_chain = vec![issued.cert_der, self.cert_der.clone()];
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, issued.key_der)
            .unwrap();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }
}

// ---------------------------------------------------------------------------
// TestUpstream: a tiny HTTPS server
// ---------------------------------------------------------------------------

pub type UpstreamHandler =
    Arc<dyn Fn(Request<Incoming>) -> UpstreamResponse + Send + Sync + 'static>;

pub type UpstreamResponse = std::pin::Pin<
    Box<
        dyn std::future::Future<
                Output = std::result::Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error>,
            > + Send,
    >,
>;

/// A test HTTPS upstream server.
pub struct TestUpstream {
    pub addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
}

impl TestUpstream {
    /// Start an HTTPS upstream presenting a certificate for `localhost`.
    pub async fn start(ca: &TestCa, handler: UpstreamHandler) -> Self {
        let acceptor = TlsAcceptor::from(ca.server_tls_config("localhost"));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    result = listener.accept() => {
                        let (stream, _) = match result {
                            Ok(conn) => conn,
                            Err(_) => continue,
                        };

                        let acceptor = acceptor.clone();
                        let handler = handler.clone();

                        tokio::spawn(async move {
                            let tls_stream = match acceptor.accept(stream).await {
                                Ok(s) => s,
                                Err(_) => return,
                            };
                            let service = service_fn(move |req: Request<Incoming>| {
                                let handler = handler.clone();
                                handler(req)
                            });
                            let _ = http1::Builder::new()
                                .serve_connection(TokioIo::new(tls_stream), service)
                                .await;
                        });
                    }
                }
            }
        });

        Self { addr, shutdown_tx }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn text_response(body: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .unwrap()
}

/// An upstream handler that returns 200 with a text body.
pub fn ok_handler(body: &'static str) -> UpstreamHandler {
    Arc::new(move |_req| Box::pin(async move { Ok(text_response(body.to_string())) }))
}

/// An upstream handler that echoes the method, path and headers it received.
pub fn echo_handler() -> UpstreamHandler {
    Arc::new(|req: Request<Incoming>| {
        Box::pin(async move {
            let mut lines = vec![
                format!("method={}", req.method()),
                format!("path={}", req.uri().path()),
            ];
            for (name, value) in req.headers() {
                lines.push(format!("{}: {}", name, value.to_str().unwrap_or("?")));
            }
            Ok(text_response(lines.join("\n")))
        })
    })
}

// ---------------------------------------------------------------------------
// TestProxy: wraps ProxyServer with bind + spawn
// ---------------------------------------------------------------------------

pub struct TestProxy {
    pub addr: SocketAddr,
    pub recorder: Arc<Recorder>,
    pub installed: Arc<InstalledPipeline>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<tapline::Result<()>>,
}

pub struct TestProxyBuilder {
    config: Config,
    authority: Option<Arc<Authority>>,
    upstream_port: Option<u16>,
    upstream_host: Option<String>,
    upstream_tls: Option<Arc<ClientConfig>>,
    grace: Option<Duration>,
    registry: Option<Registry>,
}

impl TestProxyBuilder {
    pub fn config(mut self, f: impl FnOnce(&mut Config)) -> Self {
        f(&mut self.config);
        self
    }

    /// Sign MITM leaves with `ca` and trust it for upstream TLS.
    pub fn ca(mut self, ca: &TestCa) -> Self {
        self.authority = Some(ca.authority.clone());
        self.upstream_tls = Some(ca.client_tls_config());
        self
    }

    /// Sign MITM leaves with `ca` but keep the configured upstream TLS.
    pub fn signing_ca(mut self, ca: &TestCa) -> Self {
        self.authority = Some(ca.authority.clone());
        self
    }

    /// Send every upstream connection to 127.0.0.1:`port`.
    pub fn upstream(mut self, port: u16) -> Self {
        self.upstream_port = Some(port);
        self.upstream_host = Some("127.0.0.1".to_string());
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = Some(grace);
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub async fn start(self) -> TestProxy {
        let mut server = ProxyServer::new(self.config).unwrap();
        if let Some(authority) = self.authority {
            server = server.with_authority(authority);
        }
        if let Some(port) = self.upstream_port {
            server = server.with_upstream_port_override(port);
        }
        if let Some(host) = self.upstream_host {
            server = server.with_upstream_host_override(host);
        }
        if let Some(tls) = self.upstream_tls {
            server = server.with_upstream_tls(tls);
        }
        if let Some(grace) = self.grace {
            server = server.with_shutdown_grace(grace);
        }
        if let Some(registry) = self.registry {
            server = server.with_registry(registry).unwrap();
        }

        let recorder = server.recorder().clone();
        let installed = server.installed().clone();
        let addr = server.bind().await.unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(server.serve(shutdown_rx));

        TestProxy {
            addr,
            recorder,
            installed,
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }
}

impl TestProxy {
    pub fn builder() -> TestProxyBuilder {
        tapline::tls::install_crypto_provider();
        TestProxyBuilder {
            config: Config::minimal("127.0.0.1:0".to_string()),
            authority: None,
            upstream_port: None,
            upstream_host: None,
            upstream_tls: None,
            grace: None,
            registry: None,
        }
    }

    /// A proxy with default settings and no overrides.
    pub async fn start() -> Self {
        Self::builder().start().await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown without waiting for it to complete.
    pub fn trigger_shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for `serve` to return.
    pub async fn stopped(self) -> tapline::Result<()> {
        self.handle.await.unwrap()
    }

    pub async fn shutdown(mut self) {
        self.trigger_shutdown();
        self.stopped().await.unwrap();
    }
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

/// A reqwest client that routes through the proxy and trusts the test CA.
pub fn test_client(proxy_addr: SocketAddr, ca: &TestCa) -> reqwest::Client {
    let proxy = reqwest::Proxy::all(format!("http://{}", proxy_addr)).unwrap();
    let ca_cert = reqwest::tls::Certificate::from_pem(ca.cert_pem.as_bytes()).unwrap();
    reqwest::Client::builder()
        .proxy(proxy)
        .add_root_certificate(ca_cert)
        .build()
        .unwrap()
}

/// A reqwest client that routes plain HTTP through the proxy.
pub fn plain_client(proxy_addr: SocketAddr) -> reqwest::Client {
    let proxy = reqwest::Proxy::all(format!("http://{}", proxy_addr)).unwrap();
    reqwest::Client::builder().proxy(proxy).build().unwrap()
}

/// POST a modifier message to the configuration API through the proxy.
pub async fn configure(client: &reqwest::Client, message: &str) -> reqwest::Response {
    client
        .post("http://tapline.proxy/configure")
        .header("content-type", "application/json")
        .body(message.to_string())
        .send()
        .await
        .unwrap()
}

/// GET `url` through `client` and parse the body as JSON.
pub async fn get_json(client: &reqwest::Client, url: &str) -> serde_json::Value {
    let body = client.get(url).send().await.unwrap().text().await.unwrap();
    serde_json::from_str(&body).unwrap()
}
