//! The configuration API served on the proxy's own host name

use bytes::Bytes;
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE,
};
use hyper::{Method, StatusCode};
use serde_json::json;
use std::sync::Arc;

use super::response::buffered;
use crate::har::Recorder;
use crate::modifier::{HttpRequest, HttpResponse, InstalledPipeline, Modifier};
use crate::tls::Authority;

/// Endpoints for installing pipelines, reading verifier results, fetching the
/// root certificate and reading the in-memory transaction buffer.
pub struct Api {
    installed: Arc<InstalledPipeline>,
    recorder: Arc<Recorder>,
    authority: Option<Arc<Authority>>,
    cors: bool,
}

impl Api {
    pub fn new(
        installed: Arc<InstalledPipeline>,
        recorder: Arc<Recorder>,
        authority: Option<Arc<Authority>>,
    ) -> Self {
        Self {
            installed,
            recorder,
            authority,
            cors: false,
        }
    }

    pub fn with_cors(mut self, cors: bool) -> Self {
        self.cors = cors;
        self
    }

    pub fn handle(&self, req: HttpRequest) -> HttpResponse {
        tracing::debug!(method = %req.method(), path = %req.uri().path(), "API request");

        let mut res = if self.cors && req.method() == Method::OPTIONS {
            buffered(StatusCode::OK)
        } else {
            self.route(&req)
        };

        if self.cors {
            let headers = res.headers_mut();
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
            headers.insert(
                ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
            );
            headers.insert(
                ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("Content-Type"),
            );
        }
        res
    }

    fn route(&self, req: &HttpRequest) -> HttpResponse {
        match (req.method(), req.uri().path()) {
            (&Method::POST, "/configure") => match self.installed.install(req.body()) {
                Ok(()) => buffered(StatusCode::OK),
                Err(e) => {
                    tracing::warn!(error = %e, "Rejected pipeline configuration");
                    text(StatusCode::BAD_REQUEST, format!("{}\n", e))
                }
            },
            (&Method::GET, "/configure") => json_response(&self.installed.raw_json()),
            (&Method::GET, "/verify") => {
                let errors: Vec<_> = self
                    .installed
                    .verification_errors()
                    .into_iter()
                    .map(|message| json!({ "message": message }))
                    .collect();
                json_response(&json!({ "errors": errors }))
            }
            (&Method::POST, "/verify/reset") => {
                self.installed.reset_verifications();
                buffered(StatusCode::NO_CONTENT)
            }
            (&Method::GET, "/authority.cer") => match &self.authority {
                Some(authority) => {
                    let mut res = buffered(StatusCode::OK);
                    res.headers_mut().insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("application/x-x509-ca-cert"),
                    );
                    *res.body_mut() = Bytes::copy_from_slice(authority.cert_der().as_ref());
                    res
                }
                None => text(StatusCode::NOT_FOUND, "no certificate authority configured\n"),
            },
            (&Method::GET, "/logs") => match serde_json::to_value(self.recorder.export()) {
                Ok(har) => json_response(&har),
                Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e)),
            },
            (&Method::DELETE, "/logs/reset") => {
                self.recorder.reset();
                buffered(StatusCode::NO_CONTENT)
            }
            (_, path) => text(StatusCode::NOT_FOUND, format!("no API endpoint {}\n", path)),
        }
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    let mut res = buffered(status);
    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    *res.body_mut() = body.into();
    res
}

fn json_response(value: &serde_json::Value) -> HttpResponse {
    let mut res = buffered(StatusCode::OK);
    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    *res.body_mut() = Bytes::from(value.to_string());
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::har::recorder::tests::sample_entry;
    use crate::har::BodyCapture;
    use crate::modifier::Registry;
    use crate::test_report;
    use serde_json::Value;

    fn api() -> (Api, Arc<Recorder>) {
        let installed = Arc::new(InstalledPipeline::new(Registry::default()));
        let recorder = Arc::new(Recorder::new(BodyCapture::default()));
        let authority = Arc::new(
            Authority::generate("tapline", std::time::Duration::from_secs(3600)).unwrap(),
        );
        (
            Api::new(installed, recorder.clone(), Some(authority)),
            recorder,
        )
    }

    fn call(api: &Api, method: &str, path: &str, body: &str) -> HttpResponse {
        let req = hyper::Request::builder()
            .method(method)
            .uri(format!("http://tapline.proxy{}", path))
            .body(Bytes::from(body.to_string()))
            .unwrap();
        api.handle(req)
    }

    fn body_json(res: &HttpResponse) -> Value {
        serde_json::from_slice(res.body()).unwrap()
    }

    #[test]
    fn test_configure_roundtrip() {
        let t = test_report!("POST /configure installs and GET /configure returns it");
        let (api, _) = api();
        t.assert_eq("initial", &body_json(&call(&api, "GET", "/configure", "")), &json!({}));

        let message = r#"{"header.Modifier":{"scope":["request"],"name":"X-Test","value":"true"}}"#;
        let res = call(&api, "POST", "/configure", message);
        t.assert_eq("installed", &res.status(), &StatusCode::OK);

        let expected: Value = serde_json::from_str(message).unwrap();
        t.assert_eq("echoed", &body_json(&call(&api, "GET", "/configure", "")), &expected);
    }

    #[test]
    fn test_configure_rejects_bad_message() {
        let t = test_report!("Invalid modifier messages give 400 and keep the old pipeline");
        let (api, _) = api();
        let res = call(&api, "POST", "/configure", r#"{"nope.Modifier":{}}"#);
        t.assert_eq("status", &res.status(), &StatusCode::BAD_REQUEST);
        t.assert_contains("message", &String::from_utf8_lossy(res.body()), "unknown modifier type");
        t.assert_eq("unchanged", &body_json(&call(&api, "GET", "/configure", "")), &json!({}));
    }

    #[test]
    fn test_verify_and_reset() {
        let t = test_report!("GET /verify lists failures and POST /verify/reset clears them");
        let (api, _) = api();
        call(
            &api,
            "POST",
            "/configure",
            r#"{"header.Verifier":{"scope":["request"],"name":"X-Required"}}"#,
        );

        let mut ctx = crate::modifier::Context::detached();
        let mut req = hyper::Request::builder()
            .uri("http://example.com/")
            .body(Bytes::new())
            .unwrap();
        api.installed.modify_request(&mut ctx, &mut req).unwrap();

        let verify = body_json(&call(&api, "GET", "/verify", ""));
        let errors = verify["errors"].as_array().unwrap();
        t.assert_eq("one failure", &errors.len(), &1usize);
        t.assert_contains("message", errors[0]["message"].as_str().unwrap(), "x-required");

        let res = call(&api, "POST", "/verify/reset", "");
        t.assert_eq("reset status", &res.status(), &StatusCode::NO_CONTENT);
        let verify = body_json(&call(&api, "GET", "/verify", ""));
        t.assert_eq("cleared", &verify, &json!({ "errors": [] }));
    }

    #[test]
    fn test_authority_certificate() {
        let t = test_report!("GET /authority.cer serves the root DER");
        let (api, _) = api();
        let res = call(&api, "GET", "/authority.cer", "");
        t.assert_eq("status", &res.status(), &StatusCode::OK);
        t.assert_eq(
            "content type",
            &res.headers()[CONTENT_TYPE],
            &"application/x-x509-ca-cert",
        );
        t.assert_eq(
            "der",
            &res.body().as_ref(),
            &api.authority.as_ref().unwrap().cert_der().as_ref(),
        );
    }

    #[test]
    fn test_logs_and_reset() {
        let t = test_report!("GET /logs exports the buffer without draining it");
        let (api, recorder) = api();
        recorder.record(sample_entry("a", "GET"));

        let har = body_json(&call(&api, "GET", "/logs", ""));
        t.assert_eq("version", &har["log"]["version"], &json!("1.2"));
        t.assert_eq("entries", &har["log"]["entries"].as_array().unwrap().len(), &1usize);
        t.assert_eq("still buffered", &recorder.len(), &1usize);

        let res = call(&api, "DELETE", "/logs/reset", "");
        t.assert_eq("reset status", &res.status(), &StatusCode::NO_CONTENT);
        t.assert_true("drained", recorder.is_empty());
    }

    #[test]
    fn test_cors() {
        let t = test_report!("CORS preflights are answered when enabled");
        let (api, _) = api();
        let res = call(&api, "OPTIONS", "/configure", "");
        t.assert_eq("disabled", &res.status(), &StatusCode::NOT_FOUND);

        let api = api.with_cors(true);
        let res = call(&api, "OPTIONS", "/configure", "");
        t.assert_eq("preflight", &res.status(), &StatusCode::OK);
        t.assert_eq("origin", &res.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], &"*");
        let res = call(&api, "GET", "/configure", "");
        t.assert_true("on responses", res.headers().contains_key(ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[test]
    fn test_unknown_endpoint() {
        let t = test_report!("Unknown endpoints give 404");
        let (api, _) = api();
        t.assert_eq("status", &call(&api, "GET", "/nope", "").status(), &StatusCode::NOT_FOUND);
    }
}
