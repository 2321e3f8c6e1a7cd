//! Shared HTTP response helpers

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING, WARNING};
use hyper::{Response, StatusCode};

use crate::modifier::HttpResponse;

/// Body type of every response the proxy writes
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|e| match e {}).boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|e| match e {}).boxed()
}

/// Buffered response with no body
pub fn buffered(status: StatusCode) -> HttpResponse {
    let mut res = Response::new(Bytes::new());
    *res.status_mut() = status;
    res
}

/// Add a `Warning: 199 <agent> "<text>"` header
pub fn add_warning(res: &mut HttpResponse, agent: &str, text: &str) {
    let text: String = text
        .chars()
        .map(|c| if c == '"' || c.is_control() { '\'' } else { c })
        .collect();
    if let Ok(value) = HeaderValue::from_str(&format!("199 {} \"{}\"", agent, text)) {
        res.headers_mut().append(WARNING, value);
    }
}

/// A 502 carrying the failure as a `Warning` header and plain text body
pub fn error_response(agent: &str, message: &str) -> HttpResponse {
    let mut res = buffered(StatusCode::BAD_GATEWAY);
    add_warning(&mut res, agent, message);
    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    *res.body_mut() = Bytes::from(format!("Proxy error: {}\n", message));
    res
}

/// Convert a buffered response for writing. Framing headers are dropped so
/// hyper derives them from the actual body; a HEAD response keeps the
/// origin's `Content-Length`.
pub fn into_response(mut res: HttpResponse, head_request: bool) -> Response<ProxyBody> {
    res.headers_mut().remove(TRANSFER_ENCODING);
    if !head_request {
        res.headers_mut().remove(CONTENT_LENGTH);
    }
    res.map(|body| if body.is_empty() { empty() } else { full(body) })
}
