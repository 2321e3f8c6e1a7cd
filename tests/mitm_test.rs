#[macro_use]
#[path = "../src/test_support.rs"]
mod test_support;
mod common;

use common::{configure, echo_handler, ok_handler, plain_client, test_client, TestCa, TestProxy, TestUpstream};
use hyper::Method;
use serde_json::{Map, Value};
use std::sync::Arc;
use tapline::modifier::{Context, HttpRequest, Registry};
use tapline::{Modifier, ModifierError};

/// Remembers the CONNECT target on the session and stamps it onto every
/// later request of that session.
struct TunnelTag;

impl Modifier for TunnelTag {
    fn modify_request(&self, ctx: &mut Context, req: &mut HttpRequest) -> Result<(), ModifierError> {
        if *req.method() == Method::CONNECT {
            let host = req.uri().host().unwrap_or_default().to_string();
            ctx.session().set("tunnel", Value::from(host));
        } else if let Some(Value::String(host)) = ctx.session().get("tunnel") {
            req.headers_mut()
                .insert("x-tunnel", host.parse().unwrap());
        }
        Ok(())
    }
}

fn tunnel_tag(_: &Map<String, Value>, _: &Registry) -> tapline::Result<Arc<dyn Modifier>> {
    Ok(Arc::new(TunnelTag))
}

#[tokio::test]
async fn test_https_intercepted() {
    let t = test_report!("CONNECT tunnels are decrypted and forwarded over TLS");

    let ca = TestCa::generate();
    let upstream = TestUpstream::start(&ca, echo_handler()).await;
    let proxy = TestProxy::builder()
        .ca(&ca)
        .upstream(upstream.port())
        .start()
        .await;
    let client = test_client(proxy.addr(), &ca);

    let url = format!("https://localhost:{}/secure/path", upstream.port());
    t.action(format!("GET {} via proxy", url));
    let resp = client.get(&url).send().await.unwrap();

    t.assert_eq("status", &resp.status().as_u16(), &200u16);
    t.assert_true("via on response", resp.headers().contains_key("via"));
    let body = resp.text().await.unwrap();
    t.assert_contains("path", &body, "path=/secure/path");
    t.assert_contains("forwarded proto", &body, "x-forwarded-proto: https");
    t.assert_contains("via on request", &body, "via: 1.1 tapline");

    let entries = proxy.recorder.export_and_reset();
    let inner: Vec<_> = entries.iter().filter(|e| !e.is_connect()).collect();
    t.assert_eq("one decrypted exchange", &inner.len(), &1usize);
    t.assert_eq("recorded url", &inner[0].request.url, &url);
    t.assert_true(
        "tunnel recorded",
        entries.iter().any(|e| e.is_connect()),
    );

    proxy.shutdown().await;
    upstream.shutdown();
}

#[tokio::test]
async fn test_pipeline_applies_inside_tunnel() {
    let t = test_report!("Installed modifiers see decrypted requests");

    let ca = TestCa::generate();
    let upstream = TestUpstream::start(&ca, echo_handler()).await;
    let proxy = TestProxy::builder()
        .ca(&ca)
        .upstream(upstream.port())
        .start()
        .await;

    let resp = configure(
        &plain_client(proxy.addr()),
        r#"{"url.Filter": {"scheme": "https",
            "modifier": {"header.Modifier": {"scope": ["request"], "name": "X-Intercepted", "value": "yes"}}}}"#,
    )
    .await;
    t.assert_eq("configure status", &resp.status().as_u16(), &200u16);

    let body = test_client(proxy.addr(), &ca)
        .get(format!("https://localhost:{}/", upstream.port()))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    t.assert_contains("header added", &body, "x-intercepted: yes");

    proxy.shutdown().await;
    upstream.shutdown();
}

#[tokio::test]
async fn test_authority_certificate_served() {
    let t = test_report!("GET /authority.cer returns the signing root in DER");

    let ca = TestCa::generate();
    let proxy = TestProxy::builder().ca(&ca).start().await;

    let resp = plain_client(proxy.addr())
        .get("http://tapline.proxy/authority.cer")
        .send()
        .await
        .unwrap();
    t.assert_eq("status", &resp.status().as_u16(), &200u16);
    let der = resp.bytes().await.unwrap();
    t.assert_eq("der", &der.to_vec(), &ca.cert_der.to_vec());

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_blind_tunnel_without_mitm() {
    let t = test_report!("With interception off, CONNECT splices bytes to the origin");

    let ca = TestCa::generate();
    let upstream = TestUpstream::start(&ca, ok_handler("spliced")).await;
    let proxy = TestProxy::builder()
        .config(|c| c.tls.mitm = false)
        .ca(&ca)
        .upstream(upstream.port())
        .start()
        .await;

    let resp = test_client(proxy.addr(), &ca)
        .get(format!("https://localhost:{}/", upstream.port()))
        .send()
        .await
        .unwrap();
    t.assert_eq("status", &resp.status().as_u16(), &200u16);
    t.assert_true("no via from the proxy", !resp.headers().contains_key("via"));
    t.assert_eq("body", &resp.text().await.unwrap(), &"spliced".to_string());

    let entries = proxy.recorder.export_and_reset();
    t.assert_true(
        "only the CONNECT is visible",
        !entries.is_empty() && entries.iter().all(|e| e.is_connect()),
    );

    proxy.shutdown().await;
    upstream.shutdown();
}

#[tokio::test]
async fn test_connect_refused_by_pipeline() {
    let t = test_report!("A modifier answering CONNECT with 403 prevents the tunnel");

    let ca = TestCa::generate();
    let upstream = TestUpstream::start(&ca, ok_handler("unreachable")).await;
    let proxy = TestProxy::builder()
        .ca(&ca)
        .upstream(upstream.port())
        .start()
        .await;

    configure(
        &plain_client(proxy.addr()),
        r#"{"method.Filter": {"method": "CONNECT",
            "modifier": {"status.Modifier": {"scope": ["response"], "statusCode": 403}}}}"#,
    )
    .await;

    let result = test_client(proxy.addr(), &ca)
        .get(format!("https://localhost:{}/", upstream.port()))
        .send()
        .await;
    t.assert_true("request fails", result.is_err());

    let entries = proxy.recorder.export_and_reset();
    t.assert_eq("only the CONNECT", &entries.len(), &1usize);
    t.assert_true("is connect", entries[0].is_connect());

    proxy.shutdown().await;
    upstream.shutdown();
}

#[tokio::test]
async fn test_session_values_reach_decrypted_requests() {
    let t = test_report!("Values set while handling CONNECT are visible inside the tunnel");

    let ca = TestCa::generate();
    let upstream = TestUpstream::start(&ca, echo_handler()).await;
    let mut registry = Registry::default();
    registry.register("tunnel.Tag", tunnel_tag);
    let proxy = TestProxy::builder()
        .ca(&ca)
        .upstream(upstream.port())
        .registry(registry)
        .start()
        .await;

    let resp = configure(&plain_client(proxy.addr()), r#"{"tunnel.Tag": {}}"#).await;
    t.assert_eq("configure status", &resp.status().as_u16(), &200u16);

    let body = test_client(proxy.addr(), &ca)
        .get(format!("https://localhost:{}/", upstream.port()))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    t.assert_contains("tagged from CONNECT", &body, "x-tunnel: localhost");

    proxy.shutdown().await;
    upstream.shutdown();
}

#[tokio::test]
async fn test_skip_tls_verify_reaches_untrusted_origin() {
    let t = test_report!("skip_tls_verify lets intercepted requests reach origins with untrusted certificates");

    let ca = TestCa::generate();
    let upstream = TestUpstream::start(&ca, ok_handler("untrusted")).await;
    let url = format!("https://localhost:{}/", upstream.port());

    let verifying = TestProxy::builder()
        .signing_ca(&ca)
        .upstream(upstream.port())
        .start()
        .await;
    let resp = test_client(verifying.addr(), &ca).get(&url).send().await.unwrap();
    t.assert_eq("verified: bad gateway", &resp.status().as_u16(), &502u16);
    verifying.shutdown().await;

    let skipping = TestProxy::builder()
        .config(|c| c.tls.skip_tls_verify = true)
        .signing_ca(&ca)
        .upstream(upstream.port())
        .start()
        .await;
    let resp = test_client(skipping.addr(), &ca).get(&url).send().await.unwrap();
    t.assert_eq("skipped: ok", &resp.status().as_u16(), &200u16);
    t.assert_eq("body", &resp.text().await.unwrap(), &"untrusted".to_string());

    skipping.shutdown().await;
    upstream.shutdown();
}
