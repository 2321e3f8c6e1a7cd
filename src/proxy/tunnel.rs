//! CONNECT tunnels: TLS interception and blind splicing

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use super::handler::ProxyHandler;
use super::upstream::UpstreamClient;
use crate::error::{Error, Result};
use crate::modifier::{HttpRequest, Session};
use crate::tls::{MitmConfig, HANDSHAKE_TIMEOUT};

/// Terminate TLS on `upgraded` with a leaf issued for `host`, then serve the
/// decrypted HTTP/1.1 or HTTP/2 stream through `handler` as a secure session.
pub async fn run_mitm(
    handler: ProxyHandler,
    mitm: Arc<MitmConfig>,
    upgraded: Upgraded,
    outer: Arc<Session>,
    host: &str,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let server_config = mitm.server_config_for_host(host)?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let client_tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(TokioIo::new(upgraded)))
        .await
        .map_err(|_| Error::timeout(format!("client TLS handshake for {}", host)))?
        .map_err(|e| Error::tls(format!("Failed to accept TLS from client: {}", e)))?;
    tracing::debug!(host = %host, "TLS handshake with client complete");

    let session = Session::secure_within(&outer);
    let authority: Arc<str> = if port == 443 {
        Arc::from(bracketed(host))
    } else {
        Arc::from(format!("{}:{}", bracketed(host), port))
    };

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        let session = session.clone();
        let authority = authority.clone();
        async move {
            let (parts, body) = req.into_parts();
            let body = body.collect().await?.to_bytes();
            let mut req = Request::from_parts(parts, body);
            absolutize(&mut req, &authority);
            Ok::<_, hyper::Error>(handler.handle_exchange(session, req).await)
        }
    });

    let io = TokioIo::new(client_tls);
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true).half_close(true);
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        r = conn.as_mut() => r,
        _ = crate::shutdown::signalled(&mut shutdown) => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        let err_str = e.to_string();
        if !err_str.contains("connection closed") && !err_str.contains("early eof") {
            tracing::debug!(host = %host, "HTTP service error: {}", e);
        }
    }
    Ok(())
}

/// Splice the client and the origin together without looking at the bytes.
pub async fn run_blind(
    upstream: &UpstreamClient,
    upgraded: Upgraded,
    host: &str,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut server = upstream.dial(host, port).await?;
    let mut client = TokioIo::new(upgraded);

    tokio::select! {
        r = tokio::io::copy_bidirectional(&mut client, &mut server) => {
            let (up, down) = r?;
            tracing::debug!(host = %host, up, down, "Tunnel closed");
        }
        _ = crate::shutdown::signalled(&mut shutdown) => {
            tracing::debug!(host = %host, "Tunnel closed by shutdown");
        }
    }
    Ok(())
}

fn bracketed(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

/// Requests inside a tunnel arrive in origin form; give them an absolute
/// `https` URI from their Host header or the CONNECT target.
fn absolutize(req: &mut HttpRequest, connect_authority: &str) {
    if req.uri().scheme().is_some() {
        return;
    }
    let authority = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(connect_authority)
        .to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    match format!("https://{}{}", authority, path).parse::<Uri>() {
        Ok(uri) => *req.uri_mut() = uri,
        Err(e) => tracing::debug!(authority = %authority, error = %e, "Leaving tunneled URI as received"),
    }
}
