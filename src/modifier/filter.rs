//! Conditional delegation of modifiers

use hyper::header::{HeaderName, HOST};
use hyper::{HeaderMap, Method, Uri};
use std::sync::Arc;

use super::matcher::PatternMatcher;
use super::{Context, HttpRequest, HttpResponse, Modifier, ModifierError};

/// The parts of a request a condition may look at
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
}

impl<'a> Target<'a> {
    pub fn of(req: &'a HttpRequest) -> Self {
        Self {
            method: req.method(),
            uri: req.uri(),
            headers: req.headers(),
        }
    }

    /// Target host without port; falls back to the Host header for
    /// origin-form requests
    pub fn host(&self) -> Option<String> {
        if let Some(host) = self.uri.host() {
            return Some(host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase());
        }
        let value = self.headers.get(HOST)?.to_str().ok()?;
        let host = match value.rsplit_once(':') {
            Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
            _ => value,
        };
        Some(host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase())
    }
}

/// A predicate evaluated once per phase by a [`Filter`].
pub trait Condition: Send + Sync {
    fn matches(&self, ctx: &Context, target: &Target<'_>) -> bool;

    /// Defaults to re-evaluating the request the exchange forwarded. A
    /// response without a recorded request never matches.
    fn matches_response(&self, ctx: &Context, _res: &HttpResponse) -> bool {
        match ctx.request() {
            Some(head) => self.matches(
                ctx,
                &Target {
                    method: &head.method,
                    uri: &head.uri,
                    headers: &head.headers,
                },
            ),
            None => false,
        }
    }
}

/// Delegates to exactly one of two optional children depending on a
/// condition; a missing child is a no-op.
pub struct Filter {
    condition: Arc<dyn Condition>,
    when_true: Option<Arc<dyn Modifier>>,
    when_false: Option<Arc<dyn Modifier>>,
}

impl Filter {
    pub fn new(condition: Arc<dyn Condition>) -> Self {
        Self {
            condition,
            when_true: None,
            when_false: None,
        }
    }

    pub fn when_true(mut self, modifier: Arc<dyn Modifier>) -> Self {
        self.when_true = Some(modifier);
        self
    }

    pub fn when_false(mut self, modifier: Arc<dyn Modifier>) -> Self {
        self.when_false = Some(modifier);
        self
    }

    fn branch(&self, matched: bool) -> Option<&Arc<dyn Modifier>> {
        if matched {
            self.when_true.as_ref()
        } else {
            self.when_false.as_ref()
        }
    }
}

impl Modifier for Filter {
    fn modify_request(&self, ctx: &mut Context, req: &mut HttpRequest) -> Result<(), ModifierError> {
        let matched = self.condition.matches(ctx, &Target::of(req));
        match self.branch(matched) {
            Some(m) => m.modify_request(ctx, req),
            None => Ok(()),
        }
    }

    fn modify_response(
        &self,
        ctx: &mut Context,
        res: &mut HttpResponse,
    ) -> Result<(), ModifierError> {
        let matched = self.condition.matches_response(ctx, res);
        match self.branch(matched) {
            Some(m) => m.modify_response(ctx, res),
            None => Ok(()),
        }
    }

    fn verification_errors(&self) -> Vec<String> {
        self.when_true
            .iter()
            .chain(self.when_false.iter())
            .flat_map(|m| m.verification_errors())
            .collect()
    }

    fn reset_verifications(&self) {
        for m in self.when_true.iter().chain(self.when_false.iter()) {
            m.reset_verifications();
        }
    }
}

/// Matches on scheme, host, path and query; unset parts match anything
#[derive(Debug, Clone, Default)]
pub struct UrlCondition {
    pub scheme: Option<PatternMatcher>,
    pub host: Option<PatternMatcher>,
    pub path: Option<PatternMatcher>,
    pub query: Option<PatternMatcher>,
}

impl UrlCondition {
    pub fn host(host: &str) -> Self {
        Self {
            host: Some(PatternMatcher::ignore_case(host)),
            ..Self::default()
        }
    }
}

impl Condition for UrlCondition {
    fn matches(&self, ctx: &Context, target: &Target<'_>) -> bool {
        if let Some(ref scheme) = self.scheme {
            let actual = target
                .uri
                .scheme_str()
                .unwrap_or(if ctx.is_secure() { "https" } else { "http" });
            if !scheme.matches(actual) {
                return false;
            }
        }
        if let Some(ref host) = self.host {
            match target.host() {
                Some(actual) if host.matches(&actual) => {}
                _ => return false,
            }
        }
        if let Some(ref path) = self.path {
            if !path.matches(target.uri.path()) {
                return false;
            }
        }
        if let Some(ref query) = self.query {
            if !query.matches(target.uri.query().unwrap_or("")) {
                return false;
            }
        }
        true
    }
}

/// Matches one HTTP method
#[derive(Debug, Clone)]
pub struct MethodCondition {
    pub method: Method,
}

impl Condition for MethodCondition {
    fn matches(&self, _ctx: &Context, target: &Target<'_>) -> bool {
        *target.method == self.method
    }
}

/// Matches when a header is present, optionally with a value pattern.
///
/// In the response phase the response's own headers are checked.
#[derive(Debug, Clone)]
pub struct HeaderCondition {
    pub name: HeaderName,
    pub value: Option<PatternMatcher>,
}

impl HeaderCondition {
    fn check(&self, headers: &HeaderMap) -> bool {
        let mut values = headers.get_all(&self.name).iter().peekable();
        if values.peek().is_none() {
            return false;
        }
        match self.value {
            None => true,
            Some(ref pattern) => {
                values.any(|v| v.to_str().map(|s| pattern.matches(s)).unwrap_or(false))
            }
        }
    }
}

impl Condition for HeaderCondition {
    fn matches(&self, _ctx: &Context, target: &Target<'_>) -> bool {
        self.check(target.headers)
    }

    fn matches_response(&self, _ctx: &Context, res: &HttpResponse) -> bool {
        self.check(res.headers())
    }
}

/// Matches requests addressed to the proxy's own configuration API
#[derive(Debug, Clone)]
pub struct ApiHostCondition {
    host: String,
}

impl ApiHostCondition {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_ascii_lowercase(),
        }
    }

    pub fn matches_target(&self, target: &Target<'_>) -> bool {
        target.host().as_deref() == Some(self.host.as_str())
    }
}

impl Condition for ApiHostCondition {
    fn matches(&self, _ctx: &Context, target: &Target<'_>) -> bool {
        self.matches_target(target)
    }
}
