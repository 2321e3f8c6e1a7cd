//! Origin connections: dialing, TLS and the keep-alive pool

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::http::uri::Scheme;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::{Request, Uri, Version};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use rustls::ClientConfig;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tower::Service;

use crate::config::UpstreamConfig;
use crate::error::{Error, Result};
use crate::modifier::{HttpRequest, HttpResponse};
use crate::tls::HANDSHAKE_TIMEOUT;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Origin {
    secure: bool,
    host: String,
    port: u16,
}

impl Origin {
    fn of(req: &HttpRequest, secure: bool) -> Result<Self> {
        let uri = req.uri();
        let secure = match uri.scheme_str() {
            Some(s) => s.eq_ignore_ascii_case("https"),
            None => secure,
        };

        let (host, port) = match uri.host() {
            Some(h) => (h.to_string(), uri.port_u16()),
            None => {
                let value = req
                    .headers()
                    .get(HOST)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| Error::proxy(format!("no upstream host for {}", uri)))?;
                let authority: hyper::http::uri::Authority = value
                    .parse()
                    .map_err(|_| Error::proxy(format!("invalid Host header: {:?}", value)))?;
                (authority.host().to_string(), authority.port_u16())
            }
        };

        Ok(Self {
            secure,
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port: port.unwrap_or(if secure { 443 } else { 80 }),
        })
    }

    fn default_port(&self) -> bool {
        self.port == if self.secure { 443 } else { 80 }
    }

    fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.default_port() {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

/// Where and how long to dial; shared by the pooled client and blind tunnels
#[derive(Debug, Clone)]
struct Dialer {
    timeout: Duration,
    port_override: Option<u16>,
    host_override: Option<String>,
}

impl Dialer {
    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
        let host = self.host_override.as_deref().unwrap_or(host);
        let port = self.port_override.unwrap_or(port);
        let addr = format!("{}:{}", host, port);

        let tcp = tokio::time::timeout(self.timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::timeout(format!("dialing {}", addr)))?
            .map_err(|e| Error::proxy(format!("Failed to connect to {}: {}", addr, e)))?;
        let _ = tcp.set_nodelay(true);
        Ok(tcp)
    }
}

/// Connector for the pooled client: dials through the [`Dialer`] and wraps
/// `https` origins in TLS with SNI set to the request's host.
#[derive(Clone)]
struct OriginConnector {
    dialer: Dialer,
    tls: Arc<ClientConfig>,
}

impl OriginConnector {
    async fn connect(self, uri: Uri) -> Result<OriginStream> {
        let secure = uri.scheme() == Some(&Scheme::HTTPS);
        let host = uri
            .host()
            .ok_or_else(|| Error::proxy(format!("no upstream host for {}", uri)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

        let tcp = self.dialer.dial(&host, port).await?;
        if !secure {
            return Ok(OriginStream::Plain(TokioIo::new(tcp)));
        }

        let server_name = rustls::pki_types::ServerName::try_from(host.clone())
            .map_err(|e| Error::proxy(format!("Invalid server name '{}': {}", host, e)))?;
        let connector = TlsConnector::from(self.tls);
        let tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| Error::timeout(format!("TLS handshake with {}", host)))?
            .map_err(|e| Error::tls(format!("TLS connection to {} failed: {}", host, e)))?;
        tracing::debug!(host = %host, "Upstream TLS handshake complete");
        Ok(OriginStream::Tls(Box::new(TokioIo::new(tls))))
    }
}

impl Service<Uri> for OriginConnector {
    type Response = OriginStream;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<OriginStream>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        Box::pin(self.clone().connect(uri))
    }
}

/// A dialed origin connection, plain or TLS
enum OriginStream {
    Plain(TokioIo<TcpStream>),
    Tls(Box<TokioIo<TlsStream<TcpStream>>>),
}

impl Connection for OriginStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl Read for OriginStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            OriginStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            OriginStream::Tls(s) => Pin::new(&mut **s).poll_read(cx, buf),
        }
    }
}

impl Write for OriginStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            OriginStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            OriginStream::Tls(s) => Pin::new(&mut **s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            OriginStream::Plain(s) => Pin::new(s).poll_flush(cx),
            OriginStream::Tls(s) => Pin::new(&mut **s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            OriginStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            OriginStream::Tls(s) => Pin::new(&mut **s).poll_shutdown(cx),
        }
    }
}

/// HTTP/1.1 client for origin servers.
///
/// Idle connections are pooled per origin for the keep-alive duration. With
/// keep-alive disabled every request carries `Connection: close` and nothing
/// is kept idle.
pub struct UpstreamClient {
    client: Client<OriginConnector, Full<Bytes>>,
    dialer: Dialer,
    tls: Arc<ClientConfig>,
    keepalive: Option<Duration>,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig, tls: Arc<ClientConfig>) -> Self {
        let dialer = Dialer {
            timeout: config.dial_timeout(),
            port_override: None,
            host_override: None,
        };
        let keepalive = if config.disable_keepalive {
            None
        } else {
            Some(config.keepalive())
        };
        Self {
            client: pooled_client(&dialer, &tls, keepalive),
            dialer,
            tls,
            keepalive,
        }
    }

    /// Dial this port instead of the request's (for testing).
    pub fn with_port_override(mut self, port: u16) -> Self {
        self.dialer.port_override = Some(port);
        self.rebuild()
    }

    /// Dial this host instead of the request's; SNI still uses the
    /// request's host (for testing with non-resolvable hostnames).
    pub fn with_host_override(mut self, host: String) -> Self {
        self.dialer.host_override = Some(host);
        self.rebuild()
    }

    fn rebuild(mut self) -> Self {
        self.client = pooled_client(&self.dialer, &self.tls, self.keepalive);
        self
    }

    /// Send `req` to its origin and buffer the response. Origin-form
    /// requests are resolved through the Host header; `secure` picks the
    /// scheme when the URI carries none.
    pub async fn round_trip(&self, req: HttpRequest, secure: bool) -> Result<HttpResponse> {
        let origin = Origin::of(&req, secure)?;
        let req = self.outbound(req, &origin)?;

        let res = self
            .client
            .request(req)
            .await
            .map_err(|e| client_error(&origin, &e))?;
        let (parts, body) = res.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| Error::proxy(format!("reading response from {} failed: {}", origin.host, e)))?
            .to_bytes();

        Ok(hyper::Response::from_parts(parts, body))
    }

    fn outbound(&self, req: HttpRequest, origin: &Origin) -> Result<Request<Full<Bytes>>> {
        let (mut parts, body) = req.into_parts();

        let target = format!(
            "{}://{}{}",
            if origin.secure { "https" } else { "http" },
            origin.host_header(),
            parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );
        parts.uri = target
            .parse()
            .map_err(|e| Error::proxy(format!("invalid request target {:?}: {}", target, e)))?;
        parts.version = Version::HTTP_11;

        parts.headers.remove(CONTENT_LENGTH);
        parts.headers.remove(TRANSFER_ENCODING);
        if !parts.headers.contains_key(HOST) {
            let host = HeaderValue::from_str(&origin.host_header())
                .map_err(|_| Error::proxy(format!("invalid host {:?}", origin.host)))?;
            parts.headers.insert(HOST, host);
        }
        if self.keepalive.is_none() {
            parts.headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }

        Ok(Request::from_parts(parts, Full::new(body)))
    }

    /// Open a TCP connection to `host:port` (after overrides) within the dial
    /// timeout.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
        self.dialer.dial(host, port).await
    }
}

fn pooled_client(
    dialer: &Dialer,
    tls: &Arc<ClientConfig>,
    keepalive: Option<Duration>,
) -> Client<OriginConnector, Full<Bytes>> {
    let connector = OriginConnector {
        dialer: dialer.clone(),
        tls: tls.clone(),
    };
    let mut builder = Client::builder(TokioExecutor::new());
    builder.pool_timer(TokioTimer::new());
    match keepalive {
        Some(idle) => builder.pool_idle_timeout(idle),
        None => builder.pool_max_idle_per_host(0),
    };
    builder.build(connector)
}

/// Flatten a client error and its causes; the connector's own error, if any,
/// keeps its kind.
fn client_error(origin: &Origin, e: &hyper_util::client::legacy::Error) -> Error {
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        if let Some(inner) = cause.downcast_ref::<Error>() {
            return match inner {
                Error::Timeout(msg) => Error::timeout(msg.clone()),
                Error::Tls(msg) => Error::tls(msg.clone()),
                other => Error::proxy(other.to_string()),
            };
        }
        source = cause.source();
    }
    let mut msg = format!("request to {} failed: {}", origin.host, e);
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    Error::proxy(msg)
}
