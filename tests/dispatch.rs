
use bytes::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Method, Request, Response, Server, StatusCode};
use keypool::config::Config;
use keypool::logs::LogBuffer;
use keypool::proxy;
use keypool::state::ProxyState;
use keypool::usage::QueryFilter;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const GENERATION_BODY: &str = concat!(
    "{\"model\":\"llama3\",\"done\":false,\"response\":\"Hello\"}\n",
    "{\"model\":\"llama3\",\"done\":true,\"prompt_eval_count\":3,\"eval_count\":12}\n",
);

fn spawn_stub<F>(handler: F) -> SocketAddr
where
    F: Fn(&Request<Body>) -> Response<Body> + Clone + Send + Sync + 'static,
{
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();

    let make = make_service_fn(move |_| {
        let handler = handler.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handler(&req)) }
            }))
        }
    });
    tokio::spawn(async move {
        let _ = Server::from_tcp(listener).unwrap().serve(make).await;
    });
    addr
}

struct TestProxy {
    addr: SocketAddr,
    state: Arc<ProxyState>,
    _tmp: tempfile::TempDir,
    _stop: tokio::sync::oneshot::Sender<()>,
}

async fn spawn_proxy(upstream: SocketAddr, keys: &[&str], max_body_bytes: usize) -> TestProxy {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = Config {
        port: 0,
        upstream_url: format!("http://{upstream}"),
        proxy_auth_token: Some("proxy-secret".into()),
        allow_unauthenticated: false,
        app_version: "test".into(),
        data_dir: PathBuf::from(tmp.path()),
        keys: keys.iter().map(|s| s.to_string()).collect(),
        health_interval_secs: 3600,
        probe_timeout_ms: 2000,
        response_timeout_ms: 5000,
        max_body_bytes,
    };
    let state = Arc::new(ProxyState::new(cfg, LogBuffer::new(100)).unwrap());

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let serve_state = state.clone();
    tokio::spawn(async move {
        let _ = proxy::serve_http(listener, serve_state, async {
            let _ = stop_rx.await;
        })
        .await;
    });

    TestProxy {
        addr,
        state,
        _tmp: tmp,
        _stop: stop_tx,
    }
}

fn proxied_request(proxy: &TestProxy, token: Option<&str>, path: &str, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(format!("http://{}{path}", proxy.addr));
    if let Some(t) = token {
        builder = builder.header("authorization", format!("Bearer {t}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn send(req: Request<Body>) -> (StatusCode, Bytes) {
    let client = Client::new();
    let resp = client.request(req).await.unwrap();
    let status = resp.status();
    let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    (status, body)
}

fn stub_auth(req: &Request<Body>) -> String {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

#[tokio::test]
async fn forwards_generation_response_and_records_usage() {
    let seen: Arc<std::sync::Mutex<Vec<(String, String)>>> = Arc::default();
    let seen2 = seen.clone();
    let upstream = spawn_stub(move |req| {
        seen2.lock()
            .unwrap()
            .push((req.uri().path().to_string(), stub_auth(req)));
        Response::new(Body::from(GENERATION_BODY))
    });
    let proxy = spawn_proxy(upstream, &["key-a", "key-b"], 1 << 20).await;

    let (status, body) = send(proxied_request(
        &proxy,
        Some("proxy-secret"),
        "/chat",
        r#"{"model":"llama3","prompt":"hi"}"#,
    ))
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from(GENERATION_BODY));

    // The client path gets the api/ prefix and the proxy's own bearer is
    // replaced with the selected key.
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "/api/chat");
        assert_eq!(seen[0].1, "Bearer key-a");
    }

    // Accounting lands shortly after the stream completes.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let rows = proxy.state.usage.hourly().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].model, "llama3");
    assert_eq!(rows[0].key_index, 0);
    assert_eq!(rows[0].prompt_tokens, 3);
    assert_eq!(rows[0].completion_tokens, 12);

    let queries = proxy
        .state
        .usage
        .queries(QueryFilter {
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].model, "llama3");
    assert_eq!(queries[0].endpoint, "api/chat");
}

#[tokio::test]
async fn rotates_to_next_key_on_quota() {
    let upstream = spawn_stub(|req| {
        if stub_auth(req) == "Bearer throttled" {
            Response::builder()
                .status(StatusCode::TOO_MANY_REQUESTS)
                .body(Body::from(r#"{"error":"quota"}"#))
                .unwrap()
        } else {
            Response::new(Body::from(GENERATION_BODY))
        }
    });
    let proxy = spawn_proxy(upstream, &["throttled", "healthy"], 1 << 20).await;

    let before = keypool::util::now_ms();
    let (status, body) = send(proxied_request(
        &proxy,
        Some("proxy-secret"),
        "/chat",
        r#"{"model":"llama3"}"#,
    ))
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from(GENERATION_BODY));

    let now = keypool::util::now_ms();
    let snaps = proxy.state.keys.snapshot(now);
    assert!(!snaps[0].available);
    assert_eq!(snaps[0].backoff_level, 1);
    assert_eq!(snaps[0].last_error_status, Some(429));
    let until = snaps[0].penalty_until_ms.unwrap();
    assert!(until >= before + 15 * 60 * 1000 && until <= now + 15 * 60 * 1000);

    assert!(snaps[1].available);
    assert_eq!(snaps[1].backoff_level, 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let rows = proxy.state.usage.hourly().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key_index, 1);
}

#[tokio::test]
async fn surfaces_last_upstream_response_when_exhausted() {
    let upstream = spawn_stub(|_| {
        Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .body(Body::from(r#"{"error":"quota"}"#))
            .unwrap()
    });
    let proxy = spawn_proxy(upstream, &["one", "two"], 1 << 20).await;

    let (status, body) = send(proxied_request(
        &proxy,
        Some("proxy-secret"),
        "/chat",
        r#"{"model":"llama3"}"#,
    ))
    .await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body, Bytes::from(r#"{"error":"quota"}"#));

    let snaps = proxy.state.keys.snapshot(keypool::util::now_ms());
    assert!(snaps.iter().all(|s| !s.available));
    assert!(snaps.iter().all(|s| s.backoff_level == 1));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let rows = proxy.state.usage.hourly().await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn client_errors_are_terminal() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    let upstream = spawn_stub(move |_| {
        hits2.fetch_add(1, Ordering::SeqCst);
        Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Body::from(r#"{"error":"bad model"}"#))
            .unwrap()
    });
    let proxy = spawn_proxy(upstream, &["one", "two"], 1 << 20).await;

    let (status, body) = send(proxied_request(
        &proxy,
        Some("proxy-secret"),
        "/chat",
        r#"{"model":"nope"}"#,
    ))
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, Bytes::from(r#"{"error":"bad model"}"#));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let snaps = proxy.state.keys.snapshot(keypool::util::now_ms());
    assert!(snaps[0].available);
    assert_eq!(snaps[0].backoff_level, 0);
}

#[tokio::test]
async fn rejects_missing_and_wrong_tokens() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    let upstream = spawn_stub(move |_| {
        hits2.fetch_add(1, Ordering::SeqCst);
        Response::new(Body::from(GENERATION_BODY))
    });
    let proxy = spawn_proxy(upstream, &["k"], 1 << 20).await;

    let (status, _) = send(proxied_request(&proxy, None, "/chat", "{}")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(proxied_request(&proxy, Some("wrong"), "/chat", "{}")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn operator_reset_recovers_key() {
    let upstream = spawn_stub(|_| {
        Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .body(Body::from(r#"{"error":"quota"}"#))
            .unwrap()
    });
    let proxy = spawn_proxy(upstream, &["only"], 1 << 20).await;

    let (status, _) = send(proxied_request(
        &proxy,
        Some("proxy-secret"),
        "/chat",
        "{}",
    ))
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(!proxy.state.keys.snapshot(keypool::util::now_ms())[0].available);

    let reset = Request::builder()
        .method(Method::POST)
        .uri(format!("http://{}/health/keys/0/reset", proxy.addr))
        .header("authorization", "Bearer proxy-secret")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(reset).await;
    assert_eq!(status, StatusCode::OK);

    let list = Request::builder()
        .method(Method::GET)
        .uri(format!("http://{}/health/keys", proxy.addr))
        .header("authorization", "Bearer proxy-secret")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(list).await;
    assert_eq!(status, StatusCode::OK);
    let keys: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(keys[0]["available"], serde_json::Value::Bool(true));
    assert_eq!(keys[0]["backoff_level"], serde_json::json!(0));
}

#[tokio::test]
async fn oversized_body_is_rejected_before_any_attempt() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    let upstream = spawn_stub(move |_| {
        hits2.fetch_add(1, Ordering::SeqCst);
        Response::new(Body::from(GENERATION_BODY))
    });
    let proxy = spawn_proxy(upstream, &["k"], 64).await;

    let big = "x".repeat(200);
    let (status, _) = send(proxied_request(&proxy, Some("proxy-secret"), "/chat", &big)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn background_probe_rehabilitates_expired_penalty() {
    let upstream = spawn_stub(|req| {
        assert_eq!(req.uri().path(), "/api/tags");
        Response::new(Body::from(r#"{"models":[]}"#))
    });
    let proxy = spawn_proxy(upstream, &["k0"], 1 << 20).await;

    // Penalize in the past so the cooldown is already over when the
    // health loop first ticks.
    let then = keypool::util::now_ms() - 20 * 60 * 1000;
    proxy.state.keys.penalize_rate_limited(0, then, None);
    let snaps = proxy.state.keys.snapshot(keypool::util::now_ms());
    assert!(snaps[0].available);
    assert_eq!(snaps[0].backoff_level, 1);

    tokio::spawn(keypool::health::run(proxy.state.clone()));
    tokio::time::sleep(Duration::from_millis(600)).await;

    let snaps = proxy.state.keys.snapshot(keypool::util::now_ms());
    assert!(snaps[0].available);
    assert_eq!(snaps[0].backoff_level, 0);
    assert_eq!(snaps[0].last_error_status, None);
    assert!(proxy
        .state
        .upstream_ok
        .load(std::sync::atomic::Ordering::Relaxed));

    let probes = proxy.state.probe_cache.load_full();
    assert_eq!(probes.len(), 1);
    assert_eq!(probes[0].state, "ok");
}

#[tokio::test]
async fn health_endpoint_is_public_and_versioned() {
    let upstream = spawn_stub(|_| Response::new(Body::empty()));
    let proxy = spawn_proxy(upstream, &["k"], 1 << 20).await;

    let req = Request::builder()
        .method(Method::GET)
        .uri(format!("http://{}/health", proxy.addr))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(req).await;
    assert_eq!(status, StatusCode::OK);

    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["proxy_ok"], serde_json::Value::Bool(true));
    assert_eq!(v["version"], serde_json::json!("test"));
}
