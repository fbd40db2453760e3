
use crate::admin;
use crate::keys;
use crate::penalty::{classify_status, UpstreamOutcome};
use crate::state::{AuthOutcome, ProxyState};
use crate::upstream::{self, Attempt};
use crate::usage::UsageEvent;
use crate::util::now_ms;
use bytes::Bytes;
use hyper::body::HttpBody;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, HeaderMap, Method, Request, Response, Server, StatusCode};
use std::collections::HashSet;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

const DASHBOARD_HTML: &str = include_str!("static/dashboard.html");

pub async fn serve_http(
    listener: std::net::TcpListener,
    state: Arc<ProxyState>,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    listener.set_nonblocking(true)?;
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let state = state.clone();
        let remote_addr = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle(req, state, remote_addr).await) }
            }))
        }
    });

    Server::from_tcp(listener)?
        .tcp_nodelay(true)
        .serve(make_svc)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn handle(
    req: Request<Body>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
) -> Response<Body> {
    let path = req.uri().path();

    if req.method() == Method::GET {
        match path {
            "/" => {
                return Response::builder()
                    .status(StatusCode::FOUND)
                    .header("location", "/dashboard")
                    .body(Body::empty())
                    .unwrap_or_else(|_| Response::new(Body::empty()));
            }
            "/dashboard" => {
                return Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "text/html; charset=utf-8")
                    .header("cache-control", "no-store")
                    .body(Body::from(DASHBOARD_HTML))
                    .unwrap_or_else(|_| Response::new(Body::empty()));
            }
            "/favicon.ico" => return Response::new(Body::empty()),
            "/health" => return admin::health(&state),
            _ => {}
        }
    }

    if path.starts_with("/health/")
        || path == "/stats"
        || path.starts_with("/stats/")
        || path == "/queries"
        || path.starts_with("/queries/")
        || path == "/ratelimits"
        || path == "/logs"
    {
        return admin::handle_ops(req, state).await;
    }

    dispatch(req, state, client_addr).await
}

/// The per-request loop: pick a key, call upstream, classify, rotate on
/// quota and transient failures, stream the first 2xx back to the client.
async fn dispatch(
    req: Request<Body>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
) -> Response<Body> {
    match state.authorize(req.headers()) {
        AuthOutcome::Allowed => {}
        AuthOutcome::MissingToken => {
            return ProxyState::json_error(
                StatusCode::UNAUTHORIZED,
                "missing or invalid proxy token",
                "unauthorized",
            )
        }
        AuthOutcome::BadToken => {
            return ProxyState::json_error(
                StatusCode::FORBIDDEN,
                "invalid proxy token",
                "forbidden",
            )
        }
    }

    let client_ip = client_ip(req.headers(), client_addr);
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);
    let method = parts.method.clone();

    // The whole body is buffered up front so it can be replayed on retries.
    let body = match read_client_body(body, state.max_body_bytes).await {
        Ok(b) => b,
        Err(BodyError::TooLarge) => {
            return ProxyState::json_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request body too large",
                "body_too_large",
            )
        }
        Err(BodyError::Read) => {
            return ProxyState::json_error(
                StatusCode::BAD_GATEWAY,
                "failed to read request body",
                "body_read_error",
            )
        }
    };
    debug!(%method, %path, %client_ip, bytes = body.len(), "dispatching");

    // Archive the raw body and open its request-log row. Best-effort: the
    // proxying itself never depends on either.
    let archived = {
        let state = state.clone();
        let ip = client_ip.clone();
        let body = body.clone();
        tokio::task::spawn_blocking(move || state.archive.store(&ip, &body))
            .await
            .ok()
            .and_then(|res| {
                res.map_err(|e| warn!(error = %e, "archiving request body failed"))
                    .ok()
            })
    };
    let request_id = state
        .usage
        .create_request(
            client_ip.clone(),
            method.to_string(),
            upstream::clean_path(&path),
            archived,
        )
        .await;

    let usage_hint = state.usage.usage_by_key_2h().await;

    let mut excluded: HashSet<usize> = HashSet::new();
    let mut last_closed: Option<(StatusCode, HeaderMap, Bytes)> = None;
    let mut attempt_no = 0u32;

    loop {
        let now = now_ms();
        let Some(index) = keys::select_key(&state.keys, &excluded, &usage_hint, now) else {
            break;
        };
        excluded.insert(index);
        attempt_no += 1;
        let started = Instant::now();

        let attempt = state
            .upstream
            .call(
                method.clone(),
                &path,
                query.as_deref(),
                &parts.headers,
                state.keys.auth_header(index),
                body.clone(),
            )
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match attempt {
            Err(e) => {
                warn!(
                    attempt = attempt_no,
                    key = index,
                    latency_ms,
                    error = %e,
                    "upstream call failed; rotating key"
                );
                state.keys.penalize_transient(index, now, None);
            }
            Ok(Attempt::Open {
                status,
                headers,
                body,
            }) => {
                state.record_ratelimits(index, &headers);
                debug!(
                    attempt = attempt_no,
                    key = index,
                    status = status.as_u16(),
                    latency_ms,
                    "upstream accepted; streaming to client"
                );
                let ctx = RelayContext {
                    key_index: index,
                    client_ip: client_ip.clone(),
                    request_id,
                };
                return relay(state, status, headers, body, ctx);
            }
            Ok(Attempt::Closed {
                status,
                headers,
                body,
            }) => {
                state.record_ratelimits(index, &headers);
                match classify_status(status.as_u16()) {
                    UpstreamOutcome::RateLimited => {
                        let floor = upstream::ratelimit_reset_secs(&headers)
                            .map(|secs| now.saturating_add(secs * 1000));
                        let rec = state.keys.penalize_rate_limited(index, now, floor);
                        warn!(
                            attempt = attempt_no,
                            key = index,
                            level = rec.backoff_level,
                            latency_ms,
                            "upstream quota exceeded; rotating key"
                        );
                        last_closed = Some((status, headers, body));
                    }
                    UpstreamOutcome::Transient => {
                        state.keys.penalize_transient(index, now, Some(status.as_u16()));
                        warn!(
                            attempt = attempt_no,
                            key = index,
                            status = status.as_u16(),
                            latency_ms,
                            "upstream error; rotating key"
                        );
                        last_closed = Some((status, headers, body));
                    }
                    // 2xx arrives as Open; anything else is terminal for the
                    // client and not the key's fault.
                    UpstreamOutcome::Success | UpstreamOutcome::Forward => {
                        debug!(
                            attempt = attempt_no,
                            key = index,
                            status = status.as_u16(),
                            latency_ms,
                            "forwarding upstream response unchanged"
                        );
                        return closed_response(status, headers, body);
                    }
                }
            }
        }
    }

    match last_closed {
        Some((status, headers, body)) => {
            debug!(
                status = status.as_u16(),
                "all keys exhausted; surfacing last upstream response"
            );
            closed_response(status, headers, body)
        }
        None => ProxyState::json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "no upstream API keys available (all cooling down or unreachable)",
            "no_key_available",
        ),
    }
}

struct RelayContext {
    key_index: usize,
    client_ip: String,
    request_id: Option<i64>,
}

/// Streams the upstream body to the client byte-for-byte while keeping a
/// small tail. When the stream completes, the tail is parsed for the final
/// token counters and exactly one usage event is emitted. A client
/// disconnect aborts the relay and emits nothing.
fn relay(
    state: Arc<ProxyState>,
    status: StatusCode,
    mut headers: HeaderMap,
    body: Body,
    ctx: RelayContext,
) -> Response<Body> {
    upstream::sanitize_hop_headers(&mut headers);

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(32);
    tokio::spawn(async move {
        const TAIL_MAX: usize = 4096;
        let mut tail: Vec<u8> = Vec::new();
        let mut cancelled = false;

        let mut body = body;
        while let Some(chunk) = body.data().await {
            match chunk {
                Ok(chunk) => {
                    tail.extend_from_slice(&chunk);
                    if tail.len() > TAIL_MAX {
                        let cut = tail.len() - TAIL_MAX;
                        tail.drain(..cut);
                    }
                    if tx.send(Ok(chunk)).await.is_err() {
                        cancelled = true;
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "upstream stream ended early");
                    break;
                }
            }
        }

        if cancelled {
            debug!(
                key = ctx.key_index,
                "client disconnected mid-stream; dropping upstream response"
            );
            return;
        }

        match parse_generation_tail(&tail) {
            Some(found) => {
                state.usage.record_usage(UsageEvent {
                    client_ip: ctx.client_ip,
                    key_index: ctx.key_index,
                    model: found.model.clone(),
                    prompt_tokens: found.prompt_tokens,
                    completion_tokens: found.completion_tokens,
                });
                if let Some(id) = ctx.request_id {
                    state.usage.update_request(
                        id,
                        found.model,
                        found.prompt_tokens,
                        found.completion_tokens,
                    );
                }
            }
            None => debug!(key = ctx.key_index, "response carried no token counters"),
        }
    });

    let mut resp = Response::new(Body::wrap_stream(ReceiverStream::new(rx)));
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    resp
}

/// Forwards a non-streamed (bounded) upstream response to the client.
fn closed_response(status: StatusCode, mut headers: HeaderMap, body: Bytes) -> Response<Body> {
    upstream::sanitize_hop_headers(&mut headers);
    // The bounded read may have truncated the body; re-frame it.
    upstream::strip_body_framing(&mut headers);
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    resp
}

struct TailUsage {
    model: String,
    prompt_tokens: i64,
    completion_tokens: i64,
}

/// Finds the last complete JSON line in the response tail that carries the
/// generation counters. Works for both NDJSON streams (final `done` object)
/// and small non-streamed responses.
fn parse_generation_tail(tail: &[u8]) -> Option<TailUsage> {
    let text = String::from_utf8_lossy(tail);
    for line in text.lines().rev() {
        let line = line.trim();
        if !(line.starts_with('{') && line.ends_with('}')) {
            continue;
        }
        let Ok(v) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        let done = v.get("done").and_then(|d| d.as_bool()).unwrap_or(false);
        if !done && v.get("eval_count").is_none() {
            continue;
        }
        return Some(TailUsage {
            model: v
                .get("model")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown")
                .to_string(),
            prompt_tokens: v
                .get("prompt_eval_count")
                .and_then(|n| n.as_i64())
                .unwrap_or(0),
            completion_tokens: v.get("eval_count").and_then(|n| n.as_i64()).unwrap_or(0),
        });
    }
    None
}

enum BodyError {
    TooLarge,
    Read,
}

async fn read_client_body(mut body: Body, limit: usize) -> Result<Bytes, BodyError> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|_| BodyError::Read)?;
        if buf.len().saturating_add(chunk.len()) > limit {
            return Err(BodyError::TooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}

fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    if let Some(fwd) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = fwd.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    addr.ip().to_string()
}
