#[macro_use]
#[path = "../src/test_support.rs"]
mod test_support;
mod common;

use common::{plain_client, TestProxy};
use std::time::{Duration, Instant};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn slow_upstream(delay: Duration) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("finished")
                .set_delay(delay),
        )
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_in_flight_request_completes() {
    let t = test_report!("Shutdown waits for the in-flight request to finish");

    let server = slow_upstream(Duration::from_millis(500)).await;
    let mut proxy = TestProxy::start().await;
    let addr = proxy.addr();
    let client = plain_client(addr);

    let url = format!("{}/slow", server.uri());
    let request = tokio::spawn(async move { client.get(url).send().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    t.action("trigger shutdown while the request is in flight");
    proxy.trigger_shutdown();

    let resp = request.await.unwrap().unwrap();
    t.assert_eq("status", &resp.status().as_u16(), &200u16);
    t.assert_eq("body", &resp.text().await.unwrap(), &"finished".to_string());

    proxy.stopped().await.unwrap();
    let refused = tokio::net::TcpStream::connect(addr).await;
    t.assert_true("listener closed", refused.is_err());
}

#[tokio::test]
async fn test_grace_period_bounds_shutdown() {
    let t = test_report!("Connections outliving the grace period do not block shutdown");

    let server = slow_upstream(Duration::from_secs(10)).await;
    let mut proxy = TestProxy::builder()
        .grace(Duration::from_millis(200))
        .start()
        .await;
    let client = plain_client(proxy.addr());

    let url = format!("{}/stuck", server.uri());
    let _request = tokio::spawn(async move { client.get(url).send().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = Instant::now();
    proxy.trigger_shutdown();
    proxy.stopped().await.unwrap();

    t.assert_true(
        "stopped well before the upstream answered",
        started.elapsed() < Duration::from_secs(5),
    );
}

#[tokio::test]
async fn test_idle_connections_closed() {
    let t = test_report!("Idle keep-alive client connections do not delay shutdown");

    let server = slow_upstream(Duration::from_millis(0)).await;
    let mut proxy = TestProxy::start().await;
    let client = plain_client(proxy.addr());

    let resp = client
        .get(format!("{}/", server.uri()))
        .send()
        .await
        .unwrap();
    t.assert_eq("status", &resp.status().as_u16(), &200u16);
    resp.text().await.unwrap();

    let started = Instant::now();
    proxy.trigger_shutdown();
    proxy.stopped().await.unwrap();
    t.assert_true(
        "no grace wait",
        started.elapsed() < tapline::proxy::SHUTDOWN_GRACE,
    );
}
