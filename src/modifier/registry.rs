//! JSON construction of modifier trees
//!
//! A modifier message is an object with exactly one key, the type tag, whose
//! value holds the modifier's parameters:
//!
//! ```json
//! {"url.Filter": {"host": "example.com",
//!                 "modifier": {"header.Modifier": {"name": "X-Test", "value": "true"}}}}
//! ```
//!
//! Every modifier also accepts `"scope": ["request", "response"]`.

use base64::Engine;
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::builtin::{
    BodyModifier, HeaderBlacklist, HeaderModifier, HeaderVerifier, LogModifier,
    QueryStringModifier, SkipRoundTrip, StatusModifier, UrlVerifier,
};
use super::filter::{Condition, Filter, HeaderCondition, MethodCondition, UrlCondition};
use super::matcher::PatternMatcher;
use super::{Context, Group, HttpRequest, HttpResponse, Modifier, ModifierError};
use crate::error::{Error, Result};

/// Phase a modifier applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Request,
    Response,
}

/// Restricts a modifier to a subset of phases
pub struct Scoped {
    inner: Arc<dyn Modifier>,
    request: bool,
    response: bool,
}

impl Scoped {
    pub fn new(inner: Arc<dyn Modifier>, scopes: &[Scope]) -> Self {
        Self {
            inner,
            request: scopes.contains(&Scope::Request),
            response: scopes.contains(&Scope::Response),
        }
    }
}

impl Modifier for Scoped {
    fn modify_request(&self, ctx: &mut Context, req: &mut HttpRequest) -> std::result::Result<(), ModifierError> {
        if self.request {
            self.inner.modify_request(ctx, req)?;
        }
        Ok(())
    }

    fn modify_response(
        &self,
        ctx: &mut Context,
        res: &mut HttpResponse,
    ) -> std::result::Result<(), ModifierError> {
        if self.response {
            self.inner.modify_response(ctx, res)?;
        }
        Ok(())
    }

    fn verification_errors(&self) -> Vec<String> {
        self.inner.verification_errors()
    }

    fn reset_verifications(&self) {
        self.inner.reset_verifications()
    }
}

/// Builds a modifier from the parameters object of its message
pub type Factory = fn(&Map<String, Value>, &Registry) -> Result<Arc<dyn Modifier>>;

/// Maps type tags to modifier factories
pub struct Registry {
    factories: BTreeMap<&'static str, Factory>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("fifo.Group", build_group);
        registry.register("url.Filter", build_url_filter);
        registry.register("method.Filter", build_method_filter);
        registry.register("header.Filter", build_header_filter);
        registry.register("header.Modifier", build_header_modifier);
        registry.register("header.Blacklist", build_header_blacklist);
        registry.register("header.Verifier", build_header_verifier);
        registry.register("url.Verifier", build_url_verifier);
        registry.register("status.Modifier", build_status_modifier);
        registry.register("body.Modifier", build_body_modifier);
        registry.register("querystring.Modifier", build_querystring_modifier);
        registry.register("skip.RoundTrip", |_, _| Ok(Arc::new(SkipRoundTrip)));
        registry.register("log.Logger", build_logger);
        registry
    }
}

impl Registry {
    /// Registry without any tags
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, tag: &'static str, factory: Factory) {
        self.factories.insert(tag, factory);
    }

    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    /// Parse a modifier message from raw JSON
    pub fn parse(&self, body: &[u8]) -> Result<Arc<dyn Modifier>> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| Error::pipeline(format!("invalid JSON: {}", e)))?;
        self.parse_value(&value)
    }

    /// Parse a modifier message, recursing into nested messages
    pub fn parse_value(&self, value: &Value) -> Result<Arc<dyn Modifier>> {
        let message = value
            .as_object()
            .ok_or_else(|| Error::pipeline("modifier message must be a JSON object"))?;
        if message.len() != 1 {
            return Err(Error::pipeline(format!(
                "modifier message must have exactly one key, found {}",
                message.len()
            )));
        }
        let (tag, params) = message
            .iter()
            .next()
            .ok_or_else(|| Error::pipeline("empty modifier message"))?;

        let factory = self
            .factories
            .get(tag.as_str())
            .ok_or_else(|| Error::pipeline(format!("unknown modifier type: {}", tag)))?;
        let params = params
            .as_object()
            .ok_or_else(|| Error::pipeline(format!("{}: parameters must be an object", tag)))?;

        let modifier = factory(params, self).map_err(|e| match e {
            Error::Pipeline(msg) if !msg.starts_with(tag.as_str()) => {
                Error::pipeline(format!("{}: {}", tag, msg))
            }
            other => other,
        })?;

        match params.get("scope") {
            None => Ok(modifier),
            Some(scope) => {
                let scopes: Vec<Scope> = serde_json::from_value(scope.clone())
                    .map_err(|e| Error::pipeline(format!("{}: invalid scope: {}", tag, e)))?;
                if scopes.contains(&Scope::Request) && scopes.contains(&Scope::Response) {
                    Ok(modifier)
                } else {
                    Ok(Arc::new(Scoped::new(modifier, &scopes)))
                }
            }
        }
    }

    fn parse_optional(&self, params: &Map<String, Value>, key: &str) -> Result<Option<Arc<dyn Modifier>>> {
        match params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => self.parse_value(v).map(Some),
        }
    }

    fn filter(&self, condition: Arc<dyn Condition>, params: &Map<String, Value>) -> Result<Arc<dyn Modifier>> {
        let mut filter = Filter::new(condition);
        if let Some(m) = self.parse_optional(params, "modifier")? {
            filter = filter.when_true(m);
        }
        if let Some(m) = self.parse_optional(params, "else")? {
            filter = filter.when_false(m);
        }
        Ok(Arc::new(filter))
    }
}

fn params_as<T: DeserializeOwned>(params: &Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(params.clone())).map_err(|e| Error::pipeline(e.to_string()))
}

fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| Error::pipeline(format!("invalid header name: {:?}", name)))
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| Error::pipeline(format!("invalid header value: {:?}", value)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupParams {
    #[serde(default)]
    modifiers: Vec<Value>,
    #[serde(default)]
    aggregate_errors: bool,
}

fn build_group(params: &Map<String, Value>, registry: &Registry) -> Result<Arc<dyn Modifier>> {
    let p: GroupParams = params_as(params)?;
    let mut group = Group::new().with_aggregate_errors(p.aggregate_errors);
    for m in &p.modifiers {
        group.add(registry.parse_value(m)?);
    }
    Ok(Arc::new(group))
}

#[derive(Deserialize)]
struct UrlParams {
    scheme: Option<String>,
    host: Option<String>,
    path: Option<String>,
    query: Option<String>,
}

impl UrlParams {
    fn condition(&self) -> UrlCondition {
        UrlCondition {
            scheme: self.scheme.as_deref().map(PatternMatcher::ignore_case),
            host: self.host.as_deref().map(PatternMatcher::ignore_case),
            path: self.path.as_deref().map(PatternMatcher::new),
            query: self.query.as_deref().map(PatternMatcher::new),
        }
    }
}

fn build_url_filter(params: &Map<String, Value>, registry: &Registry) -> Result<Arc<dyn Modifier>> {
    let p: UrlParams = params_as(params)?;
    registry.filter(Arc::new(p.condition()), params)
}

fn build_url_verifier(params: &Map<String, Value>, _: &Registry) -> Result<Arc<dyn Modifier>> {
    let p: UrlParams = params_as(params)?;
    Ok(Arc::new(UrlVerifier::new(p.condition())))
}

#[derive(Deserialize)]
struct MethodParams {
    method: String,
}

fn build_method_filter(params: &Map<String, Value>, registry: &Registry) -> Result<Arc<dyn Modifier>> {
    let p: MethodParams = params_as(params)?;
    let method = Method::from_bytes(p.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| Error::pipeline(format!("invalid method: {:?}", p.method)))?;
    registry.filter(Arc::new(MethodCondition { method }), params)
}

#[derive(Deserialize)]
struct HeaderParams {
    name: String,
    value: Option<String>,
}

fn build_header_filter(params: &Map<String, Value>, registry: &Registry) -> Result<Arc<dyn Modifier>> {
    let p: HeaderParams = params_as(params)?;
    let condition = HeaderCondition {
        name: header_name(&p.name)?,
        value: p.value.as_deref().map(PatternMatcher::new),
    };
    registry.filter(Arc::new(condition), params)
}

fn build_header_modifier(params: &Map<String, Value>, _: &Registry) -> Result<Arc<dyn Modifier>> {
    let p: HeaderParams = params_as(params)?;
    let value = p
        .value
        .ok_or_else(|| Error::pipeline("missing field `value`"))?;
    Ok(Arc::new(HeaderModifier {
        name: header_name(&p.name)?,
        value: header_value(&value)?,
    }))
}

fn build_header_verifier(params: &Map<String, Value>, _: &Registry) -> Result<Arc<dyn Modifier>> {
    let p: HeaderParams = params_as(params)?;
    let value = p.value.as_deref().map(header_value).transpose()?;
    Ok(Arc::new(HeaderVerifier::new(header_name(&p.name)?, value)))
}

#[derive(Deserialize)]
struct BlacklistParams {
    names: Vec<String>,
}

fn build_header_blacklist(params: &Map<String, Value>, _: &Registry) -> Result<Arc<dyn Modifier>> {
    let p: BlacklistParams = params_as(params)?;
    let names = p
        .names
        .iter()
        .map(|n| header_name(n))
        .collect::<Result<Vec<_>>>()?;
    Ok(Arc::new(HeaderBlacklist { names }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusParams {
    status_code: u16,
}

fn build_status_modifier(params: &Map<String, Value>, _: &Registry) -> Result<Arc<dyn Modifier>> {
    let p: StatusParams = params_as(params)?;
    let status = StatusCode::from_u16(p.status_code)
        .map_err(|_| Error::pipeline(format!("invalid status code: {}", p.status_code)))?;
    Ok(Arc::new(StatusModifier { status }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BodyParams {
    content_type: String,
    /// Base64 encoded
    body: String,
}

fn build_body_modifier(params: &Map<String, Value>, _: &Registry) -> Result<Arc<dyn Modifier>> {
    let p: BodyParams = params_as(params)?;
    let body = base64::engine::general_purpose::STANDARD
        .decode(p.body.as_bytes())
        .map_err(|e| Error::pipeline(format!("body is not valid base64: {}", e)))?;
    Ok(Arc::new(BodyModifier {
        content_type: header_value(&p.content_type)?,
        body: Bytes::from(body),
    }))
}

#[derive(Deserialize)]
struct QueryStringParams {
    name: String,
    value: String,
}

fn build_querystring_modifier(params: &Map<String, Value>, _: &Registry) -> Result<Arc<dyn Modifier>> {
    let p: QueryStringParams = params_as(params)?;
    if p.name.is_empty() {
        return Err(Error::pipeline("query parameter name must not be empty"));
    }
    Ok(Arc::new(QueryStringModifier {
        name: p.name,
        value: p.value,
    }))
}

#[derive(Deserialize, Default)]
struct LoggerParams {
    #[serde(default)]
    bodies: bool,
}

fn build_logger(params: &Map<String, Value>, _: &Registry) -> Result<Arc<dyn Modifier>> {
    let p: LoggerParams = params_as(params)?;
    Ok(Arc::new(LogModifier { log_bodies: p.bodies }))
}
