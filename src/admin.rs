
use crate::health::ProbeStatus;
use crate::state::{AuthOutcome, ProxyState};
use crate::usage::QueryFilter;
use crate::util::{now_ms, query_get};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Allowed `/stats/minute` windows, in minutes.
const MINUTE_WINDOWS: [u32; 7] = [10, 60, 120, 240, 360, 720, 1440];

/// Unauthenticated liveness summary. `upstream_ok` reflects the most recent
/// background probe round, never a synchronous check.
pub fn health(state: &ProxyState) -> Response<Body> {
    json_ok(&serde_json::json!({
        "proxy_ok": true,
        "upstream_ok": state.upstream_ok.load(Ordering::Relaxed),
        "version": state.version,
    }))
}

/// Operational endpoints. All of them share the proxy bearer auth.
pub async fn handle_ops(req: Request<Body>, state: Arc<ProxyState>) -> Response<Body> {
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

    let path = req.uri().path().to_string();
    let method = req.method().clone();

    match (&method, path.as_str()) {
        (&Method::GET, "/health/keys") => keys_health(&state).await,
        (&Method::GET, "/stats") => stats_hourly(&state).await,
        (&Method::GET, "/stats/minute") => stats_minute(&state, req.uri()).await,
        (&Method::GET, "/stats/24h") => stats_daily(&state).await,
        (&Method::GET, "/queries") => queries(&state, req.uri()).await,
        (&Method::GET, "/ratelimits") => ratelimits(&state),
        (&Method::GET, "/logs") => json_ok(&state.logs.entries()),
        _ => {
            if let Some(rest) = path.strip_prefix("/health/keys/") {
                return key_subroutes(&method, &state, rest);
            }
            if let Some(rest) = path.strip_prefix("/queries/") {
                return query_subroutes(&method, &state, rest).await;
            }
            not_found()
        }
    }
}

#[derive(Serialize)]
struct KeyHealthInfo {
    index: usize,
    available: bool,
    penalty_until_ms: Option<u64>,
    expires_in_secs: u64,
    backoff_level: u32,
    last_error_status: Option<u16>,
    last_error_at_ms: Option<u64>,
    probe: Option<ProbeStatus>,
    usage_2h: i64,
}

/// Live key table plus the cached probe results. The dashboard polls this
/// often; probing stays with the background loop, never here.
async fn keys_health(state: &Arc<ProxyState>) -> Response<Body> {
    let now = now_ms();
    let probes = state.probe_cache.load_full();
    let usage = state.usage.usage_by_key_2h().await;

    let out: Vec<KeyHealthInfo> = state
        .keys
        .snapshot(now)
        .into_iter()
        .map(|snap| KeyHealthInfo {
            index: snap.index,
            available: snap.available,
            penalty_until_ms: snap.penalty_until_ms,
            expires_in_secs: snap
                .penalty_until_ms
                .map_or(0, |t| t.saturating_sub(now) / 1000),
            backoff_level: snap.backoff_level,
            last_error_status: snap.last_error_status,
            last_error_at_ms: snap.last_error_at_ms,
            probe: probes.get(snap.index).cloned(),
            usage_2h: usage.get(&snap.index).copied().unwrap_or(0),
        })
        .collect();

    json_ok(&out)
}

fn key_subroutes(method: &Method, state: &Arc<ProxyState>, rest: &str) -> Response<Body> {
    let mut parts = rest.split('/');
    let index: usize = match parts.next().and_then(|s| s.parse().ok()) {
        Some(i) => i,
        None => {
            return ProxyState::json_error(
                StatusCode::BAD_REQUEST,
                "invalid key index",
                "bad_request",
            )
        }
    };
    if !state.keys.contains(index) {
        return ProxyState::json_error(
            StatusCode::NOT_FOUND,
            "key index out of range",
            "not_found",
        );
    }

    match (method, parts.next().unwrap_or("")) {
        (&Method::POST, "reset") => {
            state.keys.reset(index);
            tracing::info!(key = index, "operator reset");
            json_ok(&serde_json::json!({ "status": "reset", "key_index": index }))
        }
        (&Method::POST, "penalize") => {
            let rec = state.keys.penalize_manual(index, now_ms());
            tracing::info!(key = index, "operator penalize");
            json_ok(&serde_json::json!({
                "status": "penalized",
                "key_index": index,
                "expires_in_secs": rec
                    .penalty_until_ms
                    .map_or(0, |t| t.saturating_sub(now_ms()) / 1000),
            }))
        }
        (_, "reset" | "penalize") => method_not_allowed(),
        _ => not_found(),
    }
}

async fn stats_hourly(state: &Arc<ProxyState>) -> Response<Body> {
    match state.usage.hourly().await {
        Ok(rows) => json_ok(&rows),
        Err(e) => storage_error(e),
    }
}

async fn stats_minute(state: &Arc<ProxyState>, uri: &http::Uri) -> Response<Body> {
    let window = query_get(uri, "window")
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|w| MINUTE_WINDOWS.contains(w))
        .unwrap_or(60);
    match state.usage.minute(window).await {
        Ok(rows) => json_ok(&rows),
        Err(e) => storage_error(e),
    }
}

async fn stats_daily(state: &Arc<ProxyState>) -> Response<Body> {
    match state.usage.daily().await {
        Ok(rows) => json_ok(&rows),
        Err(e) => storage_error(e),
    }
}

async fn queries(state: &Arc<ProxyState>, uri: &http::Uri) -> Response<Body> {
    let filter = QueryFilter {
        limit: query_get(uri, "limit")
            .and_then(|s| s.parse().ok())
            .unwrap_or(50),
        offset: query_get(uri, "offset")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        ip: query_get(uri, "ip").map(str::to_string),
        model: query_get(uri, "model").map(str::to_string),
    };
    match state.usage.queries(filter).await {
        Ok(rows) => json_ok(&rows),
        Err(e) => storage_error(e),
    }
}

async fn query_subroutes(
    method: &Method,
    state: &Arc<ProxyState>,
    rest: &str,
) -> Response<Body> {
    let mut parts = rest.split('/');
    let id: i64 = match parts.next().and_then(|s| s.parse().ok()) {
        Some(id) => id,
        None => {
            return ProxyState::json_error(
                StatusCode::BAD_REQUEST,
                "invalid query id",
                "bad_request",
            )
        }
    };
    if parts.next() != Some("body") {
        return not_found();
    }
    if method != Method::GET {
        return method_not_allowed();
    }

    let rel = match state.usage.request_file_path(id).await {
        Ok(Some(rel)) => rel,
        Ok(None) => {
            return ProxyState::json_error(
                StatusCode::NOT_FOUND,
                "request body not found",
                "not_found",
            )
        }
        Err(e) => return storage_error(e),
    };

    let state2 = state.clone();
    let read = tokio::task::spawn_blocking(move || state2.archive.read(&rel)).await;
    match read {
        Ok(Ok(bytes)) => match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(v) => json_ok(&v),
            Err(_) => json_ok(&serde_json::json!({
                "raw": String::from_utf8_lossy(&bytes)
            })),
        },
        _ => ProxyState::json_error(
            StatusCode::NOT_FOUND,
            "archived body no longer exists",
            "not_found",
        ),
    }
}

fn ratelimits(state: &Arc<ProxyState>) -> Response<Body> {
    let snap = state.ratelimits_snapshot();
    let mut out = serde_json::Map::new();
    for (index, headers) in snap {
        let entry = serde_json::to_value(headers).unwrap_or_default();
        out.insert(format!("key_{index}"), entry);
    }
    json_ok(&serde_json::Value::Object(out))
}

fn storage_error(e: anyhow::Error) -> Response<Body> {
    tracing::warn!(error = %e, "stats query failed");
    ProxyState::json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "usage storage query failed",
        "storage_error",
    )
}

fn not_found() -> Response<Body> {
    ProxyState::json_error(StatusCode::NOT_FOUND, "not found", "not_found")
}

fn method_not_allowed() -> Response<Body> {
    ProxyState::json_error(
        StatusCode::METHOD_NOT_ALLOWED,
        "method not allowed",
        "method_not_allowed",
    )
}

fn json_ok<T: ?Sized + Serialize>(v: &T) -> Response<Body> {
    let body = match serde_json::to_vec(v) {
        Ok(b) => b,
        Err(_) => br#"{"error":"json"}"#.to_vec(),
    };
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .header("cache-control", "no-store")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::from("{}")))
}
