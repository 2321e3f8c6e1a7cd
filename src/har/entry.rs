//! HAR 1.2 shaped transaction records

use base64::Engine;
use hyper::header::{CONTENT_TYPE, HOST, LOCATION};
use hyper::{HeaderMap, Version};
use serde::{Deserialize, Serialize};

use crate::modifier::{HttpRequest, HttpResponse};

/// Returns the current UTC time as an ISO 8601 / RFC 3339 string.
pub fn now_iso8601() -> String {
    format_rfc3339(time::OffsetDateTime::now_utc())
}

pub fn format_rfc3339(at: time::OffsetDateTime) -> String {
    at.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Top-level HAR document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarLog {
    pub log: Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    pub version: String,
    pub creator: Creator,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Creator {
    pub name: String,
    pub version: String,
}

impl HarLog {
    pub fn new(entries: Vec<Entry>) -> Self {
        Self {
            log: Log {
                version: "1.2".to_string(),
                creator: Creator {
                    name: env!("CARGO_PKG_NAME").to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
                entries,
            },
        }
    }
}

/// One recorded request/response exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    #[serde(rename = "_id")]
    pub id: String,
    pub started_date_time: String,
    /// Total elapsed time in milliseconds
    pub time: f64,
    pub request: Request,
    pub response: Response,
    pub timings: Timings,
}

impl Entry {
    pub fn is_connect(&self) -> bool {
        self.request.method.eq_ignore_ascii_case("CONNECT")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParam {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostData {
    pub mime_type: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub headers: Vec<Header>,
    pub query_string: Vec<QueryParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_data: Option<PostData>,
    pub headers_size: i64,
    pub body_size: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub size: i64,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    pub http_version: String,
    pub headers: Vec<Header>,
    pub content: Content,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub headers_size: i64,
    pub body_size: i64,
}

/// Phase durations in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub send: f64,
    pub wait: f64,
    pub receive: f64,
}

/// How message bodies end up in entries
#[derive(Debug, Clone, Copy)]
pub struct BodyCapture {
    pub enabled: bool,
    pub max_bytes: usize,
}

impl Default for BodyCapture {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: 1024 * 1024,
        }
    }
}

impl BodyCapture {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_bytes: 0,
        }
    }

    /// Body as `(text, encoding)`: UTF-8 text verbatim, anything else base64.
    /// `None` when capture is off or the body is empty.
    fn encode(&self, body: &[u8]) -> Option<(String, Option<String>)> {
        if !self.enabled || body.is_empty() {
            return None;
        }
        let truncated = body.len() > self.max_bytes;
        let body = &body[..body.len().min(self.max_bytes)];
        match std::str::from_utf8(body) {
            Ok(text) => Some((text.to_string(), None)),
            // The cap split a multi-byte character of otherwise valid text
            Err(e) if truncated && e.error_len().is_none() => {
                let text = String::from_utf8_lossy(&body[..e.valid_up_to()]);
                Some((text.into_owned(), None))
            }
            Err(_) => Some((
                base64::engine::general_purpose::STANDARD.encode(body),
                Some("base64".to_string()),
            )),
        }
    }
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

fn headers_of(headers: &HeaderMap) -> Vec<Header> {
    headers
        .iter()
        .map(|(name, value)| Header {
            name: name.as_str().to_string(),
            value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
        })
        .collect()
}

fn content_type(headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Absolute URL of a request; origin-form targets are completed from the
/// Host header.
fn absolute_url(req: &HttpRequest, secure: bool) -> String {
    let uri = req.uri();
    if uri.scheme().is_some() {
        return uri.to_string();
    }
    let scheme = if secure { "https" } else { "http" };
    let host = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default();
    if req.method() == hyper::Method::CONNECT {
        return host;
    }
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    format!("{}://{}{}", scheme, host, path)
}

fn query_params(query: Option<&str>) -> Vec<QueryParam> {
    query
        .unwrap_or("")
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            QueryParam {
                name: name.to_string(),
                value: value.to_string(),
            }
        })
        .collect()
}

impl Request {
    pub fn from_http(req: &HttpRequest, secure: bool, capture: &BodyCapture) -> Self {
        let post_data = capture.encode(req.body()).map(|(text, encoding)| PostData {
            mime_type: content_type(req.headers()),
            text,
            encoding,
        });
        Self {
            method: req.method().as_str().to_string(),
            url: absolute_url(req, secure),
            http_version: version_str(req.version()).to_string(),
            headers: headers_of(req.headers()),
            query_string: query_params(req.uri().query()),
            post_data,
            headers_size: -1,
            body_size: req.body().len() as i64,
        }
    }
}

impl Response {
    pub fn from_http(res: &HttpResponse, capture: &BodyCapture) -> Self {
        let (text, encoding) = match capture.encode(res.body()) {
            Some((text, encoding)) => (Some(text), encoding),
            None => (None, None),
        };
        Self {
            status: res.status().as_u16(),
            status_text: res
                .status()
                .canonical_reason()
                .unwrap_or_default()
                .to_string(),
            http_version: version_str(res.version()).to_string(),
            headers: headers_of(res.headers()),
            content: Content {
                size: res.body().len() as i64,
                mime_type: content_type(res.headers()),
                text,
                encoding,
            },
            redirect_url: res
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
            headers_size: -1,
            body_size: res.body().len() as i64,
        }
    }
}
