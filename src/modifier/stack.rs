//! Protocol modifiers every exchange passes through, and the assembly of the
//! proxy's top-level modifier stack.

use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, VIA};
use std::sync::Arc;

use super::filter::{ApiHostCondition, Filter, Target};
use super::{Context, Group, HttpRequest, HttpResponse, InstalledPipeline, LogModifier, Modifier, ModifierError};
use crate::config::Config;
use crate::har::Recorder;

/// Hop-by-hop headers that must not be forwarded (RFC 7230 §6.1).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Strips hop-by-hop headers, including any named in `Connection`
#[derive(Debug, Clone, Copy, Default)]
pub struct HopByHop;

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

impl Modifier for HopByHop {
    fn modify_request(&self, _ctx: &mut Context, req: &mut HttpRequest) -> Result<(), ModifierError> {
        strip_hop_by_hop(req.headers_mut());
        Ok(())
    }

    fn modify_response(
        &self,
        _ctx: &mut Context,
        res: &mut HttpResponse,
    ) -> Result<(), ModifierError> {
        strip_hop_by_hop(res.headers_mut());
        Ok(())
    }
}

/// Appends `1.1 <signature>` to `Via` and rejects requests that already
/// passed through a proxy with the same signature.
#[derive(Debug, Clone)]
pub struct Via {
    signature: String,
    token: HeaderValue,
}

impl Via {
    pub fn new(signature: &str) -> crate::Result<Self> {
        let token = HeaderValue::from_str(&format!("1.1 {}", signature))
            .map_err(|_| crate::Error::config(format!("invalid signature: {:?}", signature)))?;
        Ok(Self {
            signature: signature.to_string(),
            token,
        })
    }

    fn seen(&self, headers: &HeaderMap) -> bool {
        headers
            .get_all(VIA)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .filter_map(|hop| hop.split_whitespace().nth(1))
            .any(|received_by| received_by.eq_ignore_ascii_case(&self.signature))
    }
}

impl Modifier for Via {
    fn modify_request(&self, _ctx: &mut Context, req: &mut HttpRequest) -> Result<(), ModifierError> {
        if self.seen(req.headers()) {
            return Err(ModifierError::LoopDetected(format!(
                "{} {} already passed through {}",
                req.method(),
                req.uri(),
                self.signature
            )));
        }
        req.headers_mut().append(VIA, self.token.clone());
        Ok(())
    }

    fn modify_response(
        &self,
        _ctx: &mut Context,
        res: &mut HttpResponse,
    ) -> Result<(), ModifierError> {
        res.headers_mut().append(VIA, self.token.clone());
        Ok(())
    }
}

/// Sets `X-Forwarded-For`, `X-Forwarded-Proto` and `X-Forwarded-Host`
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardedHeaders;

impl Modifier for ForwardedHeaders {
    fn modify_request(&self, ctx: &mut Context, req: &mut HttpRequest) -> Result<(), ModifierError> {
        if let Some(ip) = ctx.session().client_addr().map(client_ip) {
            let value = match req.headers().get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(existing) => format!("{}, {}", existing, ip),
                None => ip.to_string(),
            };
            if let Ok(v) = HeaderValue::from_str(&value) {
                req.headers_mut().insert(X_FORWARDED_FOR, v);
            }
        }

        let proto = if ctx.is_secure() || req.uri().scheme_str() == Some("https") {
            "https"
        } else {
            "http"
        };
        req.headers_mut()
            .insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

        if !req.headers().contains_key(&X_FORWARDED_HOST) {
            let host = req
                .headers()
                .get(HOST)
                .cloned()
                .or_else(|| req.uri().authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()));
            if let Some(host) = host {
                req.headers_mut().insert(X_FORWARDED_HOST, host);
            }
        }
        Ok(())
    }
}

fn client_ip(addr: &str) -> &str {
    match addr.rsplit_once(':') {
        Some((ip, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
            ip.trim_start_matches('[').trim_end_matches(']')
        }
        _ => addr,
    }
}

/// Records only exchanges that are not addressed to the API host
struct NotApiHost(ApiHostCondition);

impl super::Condition for NotApiHost {
    fn matches(&self, _ctx: &Context, target: &Target<'_>) -> bool {
        !self.0.matches_target(target)
    }
}

/// Assemble the top-level stack: protocol handling, the installed pipeline,
/// the console logger and the recorder.
pub fn build_stack(
    config: &Config,
    installed: Arc<InstalledPipeline>,
    recorder: Option<Arc<Recorder>>,
) -> crate::Result<Group> {
    let mut stack = Group::new()
        .with(Arc::new(HopByHop))
        .with(Arc::new(Via::new(&config.proxy.signature)?))
        .with(Arc::new(ForwardedHeaders))
        .with(installed)
        .with(Arc::new(LogModifier {
            log_bodies: config.logging.log_bodies,
        }));

    if let Some(recorder) = recorder {
        let condition = NotApiHost(ApiHostCondition::new(&config.proxy.api_host));
        stack.add(Arc::new(Filter::new(Arc::new(condition)).when_true(recorder)));
    }
    Ok(stack)
}
