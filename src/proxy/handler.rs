//! Per-request handling: API diversion, the modifier stack and the upstream
//! round trip

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use std::sync::Arc;
use tokio::sync::watch;

use super::api::Api;
use super::response::{buffered, empty, error_response, into_response, ProxyBody};
use super::tunnel;
use super::upstream::UpstreamClient;
use crate::modifier::{
    ApiHostCondition, Context, HttpRequest, HttpResponse, Modifier, RequestHead, Session, Target,
};
use crate::tls::MitmConfig;

/// Main proxy request handler, cheap to clone into every connection and
/// tunnel.
#[derive(Clone)]
pub struct ProxyHandler {
    stack: Arc<dyn Modifier>,
    api: Arc<Api>,
    api_host: ApiHostCondition,
    upstream: Arc<UpstreamClient>,
    mitm: Option<Arc<MitmConfig>>,
    signature: Arc<str>,
}

impl ProxyHandler {
    pub fn new(
        stack: Arc<dyn Modifier>,
        api: Arc<Api>,
        api_host: &str,
        upstream: Arc<UpstreamClient>,
        signature: &str,
    ) -> Self {
        Self {
            stack,
            api,
            api_host: ApiHostCondition::new(api_host),
            upstream,
            mitm: None,
            signature: Arc::from(signature),
        }
    }

    /// Decrypt CONNECT tunnels with certificates from `mitm`; without it
    /// tunnels are spliced through unmodified.
    pub fn with_mitm(mut self, mitm: Option<Arc<MitmConfig>>) -> Self {
        self.mitm = mitm;
        self
    }

    pub(crate) fn upstream(&self) -> &Arc<UpstreamClient> {
        &self.upstream
    }

    /// Handle a request read from a client connection. `shutdown` is handed
    /// to any tunnel the request opens.
    pub async fn handle(
        self,
        session: Arc<Session>,
        req: Request<Incoming>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Response<ProxyBody>, hyper::Error> {
        if req.method() == Method::CONNECT {
            return Ok(self.handle_connect(session, req, shutdown).await);
        }

        let (parts, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok(self
            .handle_exchange(session, Request::from_parts(parts, body))
            .await)
    }

    /// Run one buffered exchange: requests for the API host go to the API,
    /// everything else through the stack and upstream.
    pub async fn handle_exchange(&self, session: Arc<Session>, req: HttpRequest) -> Response<ProxyBody> {
        let head_request = req.method() == Method::HEAD;

        if self.api_host.matches_target(&Target::of(&req)) {
            return into_response(self.api.handle(req), head_request);
        }

        let mut ctx = Context::new(session);
        let res = self.exchange(&mut ctx, req).await;
        into_response(res, head_request)
    }

    async fn exchange(&self, ctx: &mut Context, mut req: HttpRequest) -> HttpResponse {
        if let Err(e) = self.stack.modify_request(ctx, &mut req) {
            tracing::warn!(id = %ctx.id(), method = %req.method(), uri = %req.uri(), error = %e, "Request modification failed");
            return error_response(&self.signature, &e.to_string());
        }
        ctx.set_request(RequestHead::from_request(&req));

        let mut res = if ctx.should_skip_round_trip() {
            tracing::debug!(id = %ctx.id(), uri = %req.uri(), "Skipping round trip");
            buffered(StatusCode::OK)
        } else {
            ctx.mark_request_sent();
            let uri = req.uri().clone();
            let result = self.upstream.round_trip(req, ctx.is_secure()).await;
            ctx.mark_response_received();
            match result {
                Ok(res) => res,
                Err(e) => {
                    tracing::warn!(id = %ctx.id(), uri = %uri, error = %e, "Upstream round trip failed");
                    error_response(&self.signature, &e.to_string())
                }
            }
        };

        if let Err(e) = self.stack.modify_response(ctx, &mut res) {
            tracing::warn!(id = %ctx.id(), error = %e, "Response modification failed");
            return error_response(&self.signature, &e.to_string());
        }
        res
    }

    /// Run the CONNECT request through the stack, then open the tunnel if
    /// the (possibly modified) answer is still a success.
    async fn handle_connect(
        self,
        session: Arc<Session>,
        mut req: Request<Incoming>,
        shutdown: watch::Receiver<bool>,
    ) -> Response<ProxyBody> {
        let upgrade = hyper::upgrade::on(&mut req);
        let (parts, _body) = req.into_parts();
        let mut connect = Request::from_parts(parts, Bytes::new());

        let (host, port) = match connect.uri().authority() {
            Some(a) => (
                a.host().trim_start_matches('[').trim_end_matches(']').to_string(),
                a.port_u16().unwrap_or(443),
            ),
            None => {
                tracing::warn!(uri = %connect.uri(), "CONNECT without authority");
                return into_response(buffered(StatusCode::BAD_REQUEST), false);
            }
        };
        tracing::debug!(host = %host, port = %port, "CONNECT request");

        let mut ctx = Context::new(session.clone());
        if let Err(e) = self.stack.modify_request(&mut ctx, &mut connect) {
            tracing::warn!(host = %host, error = %e, "CONNECT modification failed");
            return into_response(error_response(&self.signature, &e.to_string()), false);
        }
        ctx.set_request(RequestHead::from_request(&connect));

        let mut res = buffered(StatusCode::OK);
        if let Err(e) = self.stack.modify_response(&mut ctx, &mut res) {
            tracing::warn!(host = %host, error = %e, "CONNECT response modification failed");
            return into_response(error_response(&self.signature, &e.to_string()), false);
        }
        if !res.status().is_success() {
            tracing::debug!(host = %host, status = %res.status(), "CONNECT refused by modifier");
            return into_response(res, false);
        }

        let handler = self.clone();
        tokio::spawn(async move {
            let upgraded = match upgrade.await {
                Ok(u) => u,
                Err(e) => {
                    tracing::error!(host = %host, error = %e, "Failed to upgrade connection");
                    return;
                }
            };

            let result = match handler.mitm.clone() {
                Some(mitm) => {
                    tunnel::run_mitm(handler, mitm, upgraded, session, &host, port, shutdown).await
                }
                None => {
                    tunnel::run_blind(handler.upstream(), upgraded, &host, port, shutdown).await
                }
            };
            if let Err(e) = result {
                let err_str = e.to_string();
                if !err_str.contains("connection closed") && !err_str.contains("early eof") {
                    tracing::warn!(host = %host, error = %e, "Tunnel error");
                }
            }
        });

        let mut out = into_response(res, false);
        *out.body_mut() = empty();
        out
    }
}
