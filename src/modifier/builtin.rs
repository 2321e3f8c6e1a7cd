//! Leaf modifiers available to the configuration API

use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{StatusCode, Uri};
use std::sync::Mutex;

use super::filter::{Condition, Target, UrlCondition};
use super::{Context, HttpRequest, HttpResponse, Modifier, ModifierError};

/// Sets a header, replacing any existing values
#[derive(Debug, Clone)]
pub struct HeaderModifier {
    pub name: HeaderName,
    pub value: HeaderValue,
}

impl Modifier for HeaderModifier {
    fn modify_request(&self, _ctx: &mut Context, req: &mut HttpRequest) -> Result<(), ModifierError> {
        req.headers_mut().insert(self.name.clone(), self.value.clone());
        Ok(())
    }

    fn modify_response(
        &self,
        _ctx: &mut Context,
        res: &mut HttpResponse,
    ) -> Result<(), ModifierError> {
        res.headers_mut().insert(self.name.clone(), self.value.clone());
        Ok(())
    }
}

/// Removes every listed header
#[derive(Debug, Clone)]
pub struct HeaderBlacklist {
    pub names: Vec<HeaderName>,
}

impl Modifier for HeaderBlacklist {
    fn modify_request(&self, _ctx: &mut Context, req: &mut HttpRequest) -> Result<(), ModifierError> {
        for name in &self.names {
            req.headers_mut().remove(name);
        }
        Ok(())
    }

    fn modify_response(
        &self,
        _ctx: &mut Context,
        res: &mut HttpResponse,
    ) -> Result<(), ModifierError> {
        for name in &self.names {
            res.headers_mut().remove(name);
        }
        Ok(())
    }
}

/// Replaces the status code of the response
#[derive(Debug, Clone)]
pub struct StatusModifier {
    pub status: StatusCode,
}

impl Modifier for StatusModifier {
    fn modify_response(
        &self,
        _ctx: &mut Context,
        res: &mut HttpResponse,
    ) -> Result<(), ModifierError> {
        *res.status_mut() = self.status;
        Ok(())
    }
}

/// Replaces the body and its content type
#[derive(Debug, Clone)]
pub struct BodyModifier {
    pub content_type: HeaderValue,
    pub body: Bytes,
}

impl Modifier for BodyModifier {
    fn modify_request(&self, _ctx: &mut Context, req: &mut HttpRequest) -> Result<(), ModifierError> {
        req.headers_mut().insert(CONTENT_TYPE, self.content_type.clone());
        *req.body_mut() = self.body.clone();
        Ok(())
    }

    fn modify_response(
        &self,
        _ctx: &mut Context,
        res: &mut HttpResponse,
    ) -> Result<(), ModifierError> {
        res.headers_mut().insert(CONTENT_TYPE, self.content_type.clone());
        *res.body_mut() = self.body.clone();
        Ok(())
    }
}

/// Sets a query string parameter on the request, replacing existing values
#[derive(Debug, Clone)]
pub struct QueryStringModifier {
    pub name: String,
    pub value: String,
}

impl Modifier for QueryStringModifier {
    fn modify_request(&self, _ctx: &mut Context, req: &mut HttpRequest) -> Result<(), ModifierError> {
        let param = format!("{}={}", self.name, self.value);
        let uri = req.uri();
        let mut pairs: Vec<&str> = uri
            .query()
            .unwrap_or("")
            .split('&')
            .filter(|p| !p.is_empty())
            .filter(|p| p.split('=').next() != Some(self.name.as_str()))
            .collect();
        pairs.push(&param);

        let path_and_query = format!("{}?{}", uri.path(), pairs.join("&"));
        let mut parts = uri.clone().into_parts();
        parts.path_and_query = Some(
            path_and_query
                .parse()
                .map_err(|e| ModifierError::failed(format!("querystring: {}", e)))?,
        );
        *req.uri_mut() =
            Uri::from_parts(parts).map_err(|e| ModifierError::failed(format!("querystring: {}", e)))?;
        Ok(())
    }
}

/// Answers the request locally instead of forwarding it upstream
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipRoundTrip;

impl Modifier for SkipRoundTrip {
    fn modify_request(&self, ctx: &mut Context, _req: &mut HttpRequest) -> Result<(), ModifierError> {
        ctx.skip_round_trip();
        Ok(())
    }
}

/// Writes each request and response to the console log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogModifier {
    pub log_bodies: bool,
}

impl Modifier for LogModifier {
    fn modify_request(&self, ctx: &mut Context, req: &mut HttpRequest) -> Result<(), ModifierError> {
        if self.log_bodies && !req.body().is_empty() {
            tracing::info!(
                id = %ctx.id(),
                method = %req.method(),
                url = %req.uri(),
                body = %String::from_utf8_lossy(req.body()),
                "request"
            );
        } else {
            tracing::info!(id = %ctx.id(), method = %req.method(), url = %req.uri(), "request");
        }
        Ok(())
    }

    fn modify_response(
        &self,
        ctx: &mut Context,
        res: &mut HttpResponse,
    ) -> Result<(), ModifierError> {
        let url = ctx.request().map(|h| h.uri.to_string()).unwrap_or_default();
        if self.log_bodies && !res.body().is_empty() {
            tracing::info!(
                id = %ctx.id(),
                status = res.status().as_u16(),
                url = %url,
                body = %String::from_utf8_lossy(res.body()),
                "response"
            );
        } else {
            tracing::info!(id = %ctx.id(), status = res.status().as_u16(), url = %url, "response");
        }
        Ok(())
    }
}

/// Records a failure for every request whose URL does not match the
/// expected parts
pub struct UrlVerifier {
    expected: UrlCondition,
    errors: Mutex<Vec<String>>,
}

impl UrlVerifier {
    pub fn new(expected: UrlCondition) -> Self {
        Self {
            expected,
            errors: Mutex::new(Vec::new()),
        }
    }
}

impl Modifier for UrlVerifier {
    fn modify_request(&self, ctx: &mut Context, req: &mut HttpRequest) -> Result<(), ModifierError> {
        if !self.expected.matches(ctx, &Target::of(req)) {
            let mut errors = self
                .errors
                .lock()
                .map_err(|_| ModifierError::failed("url.Verifier: lock poisoned"))?;
            errors.push(format!(
                "request({}) url verification failure: {}",
                req.uri(),
                describe_url_condition(&self.expected)
            ));
        }
        Ok(())
    }

    fn verification_errors(&self) -> Vec<String> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn reset_verifications(&self) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.clear();
        }
    }
}

fn describe_url_condition(cond: &UrlCondition) -> String {
    let mut parts = Vec::new();
    if let Some(ref m) = cond.scheme {
        parts.push(format!("scheme {:?}", m.pattern()));
    }
    if let Some(ref m) = cond.host {
        parts.push(format!("host {:?}", m.pattern()));
    }
    if let Some(ref m) = cond.path {
        parts.push(format!("path {:?}", m.pattern()));
    }
    if let Some(ref m) = cond.query {
        parts.push(format!("query {:?}", m.pattern()));
    }
    format!("expected {}", parts.join(", "))
}

/// Records a failure for every message missing a header (or carrying a
/// different value)
pub struct HeaderVerifier {
    name: HeaderName,
    value: Option<HeaderValue>,
    errors: Mutex<Vec<String>>,
}

impl HeaderVerifier {
    pub fn new(name: HeaderName, value: Option<HeaderValue>) -> Self {
        Self {
            name,
            value,
            errors: Mutex::new(Vec::new()),
        }
    }

    fn check(&self, kind: &str, target: &str, headers: &hyper::HeaderMap) {
        let values: Vec<&HeaderValue> = headers.get_all(&self.name).iter().collect();
        let failure = match (&self.value, values.is_empty()) {
            (_, true) => Some(format!("{}({}) header verification failure: {} not found", kind, target, self.name)),
            (Some(expected), false) if !values.contains(&expected) => Some(format!(
                "{}({}) header verification failure: {} has {:?}, expected {:?}",
                kind, target, self.name, values, expected
            )),
            _ => None,
        };
        if let (Some(msg), Ok(mut errors)) = (failure, self.errors.lock()) {
            errors.push(msg);
        }
    }
}

impl Modifier for HeaderVerifier {
    fn modify_request(&self, _ctx: &mut Context, req: &mut HttpRequest) -> Result<(), ModifierError> {
        self.check("request", &req.uri().to_string(), req.headers());
        Ok(())
    }

    fn modify_response(
        &self,
        ctx: &mut Context,
        res: &mut HttpResponse,
    ) -> Result<(), ModifierError> {
        let url = ctx.request().map(|h| h.uri.to_string()).unwrap_or_default();
        self.check("response", &url, res.headers());
        Ok(())
    }

    fn verification_errors(&self) -> Vec<String> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn reset_verifications(&self) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.clear();
        }
    }
}
