
use crate::archive::RequestArchive;
use crate::config::Config;
use crate::health::ProbeStatus;
use crate::keys::KeyTable;
use crate::logs::LogBuffer;
use crate::upstream::UpstreamTarget;
use crate::usage::UsageStore;
use crate::util::bearer_token;
use ahash::AHashMap;
use arc_swap::ArcSwap;
use hyper::{Body, HeaderMap, Response};
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;
use std::time::Duration;

pub enum AuthOutcome {
    Allowed,
    /// No bearer token on the request (or not a bearer scheme).
    MissingToken,
    /// A bearer token was presented but does not match.
    BadToken,
}

/// Shared process state: configuration-derived settings plus every handle
/// that crosses task boundaries.
pub struct ProxyState {
    pub version: String,
    pub auth_token: Option<String>,
    pub allow_unauthenticated: bool,
    pub max_body_bytes: usize,
    pub probe_timeout: Duration,
    pub health_interval: Duration,

    pub keys: KeyTable,
    pub upstream: UpstreamTarget,
    pub usage: UsageStore,
    pub archive: RequestArchive,
    pub logs: LogBuffer,

    /// Latest background probe round, swapped wholesale each tick.
    pub probe_cache: ArcSwap<Vec<ProbeStatus>>,
    /// Whether the last probe round reached the upstream at all.
    pub upstream_ok: AtomicBool,
    /// Latest `x-ratelimit-*` response headers, per key index.
    pub ratelimits: Mutex<AHashMap<usize, AHashMap<String, String>>>,
}

impl ProxyState {
    pub fn new(cfg: Config, logs: LogBuffer) -> anyhow::Result<Self> {
        let keys = KeyTable::new(&cfg.keys)?;
        let upstream = UpstreamTarget::new(
            &cfg.upstream_url,
            Duration::from_millis(cfg.response_timeout_ms),
        )?;
        let usage = UsageStore::open(&cfg.data_dir)?;
        let archive = RequestArchive::new(&cfg.data_dir);

        Ok(Self {
            version: cfg.app_version,
            auth_token: cfg.proxy_auth_token,
            allow_unauthenticated: cfg.allow_unauthenticated,
            max_body_bytes: cfg.max_body_bytes,
            probe_timeout: Duration::from_millis(cfg.probe_timeout_ms),
            health_interval: Duration::from_secs(cfg.health_interval_secs),
            keys,
            upstream,
            usage,
            archive,
            logs,
            probe_cache: ArcSwap::from_pointee(Vec::new()),
            upstream_ok: AtomicBool::new(false),
            ratelimits: Mutex::new(AHashMap::new()),
        })
    }

    pub fn authorize(&self, headers: &HeaderMap) -> AuthOutcome {
        if self.allow_unauthenticated {
            return AuthOutcome::Allowed;
        }
        let Some(expected) = self.auth_token.as_deref() else {
            // Startup validation guarantees a token when auth is on.
            return AuthOutcome::BadToken;
        };
        match bearer_token(headers) {
            None => AuthOutcome::MissingToken,
            Some(token) if token == expected => AuthOutcome::Allowed,
            Some(_) => AuthOutcome::BadToken,
        }
    }

    pub fn record_ratelimits(&self, key_index: usize, headers: &HeaderMap) {
        let mut captured = AHashMap::new();
        for (name, value) in headers {
            let name = name.as_str();
            if name.starts_with("x-ratelimit-") {
                if let Ok(v) = value.to_str() {
                    captured.insert(name.to_string(), v.to_string());
                }
            }
        }
        if captured.is_empty() {
            return;
        }
        let mut store = self.ratelimits.lock().unwrap_or_else(|e| e.into_inner());
        store.insert(key_index, captured);
    }

    pub fn ratelimits_snapshot(&self) -> AHashMap<usize, AHashMap<String, String>> {
        self.ratelimits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Standardized JSON error body.
    pub fn json_error(status: http::StatusCode, message: &str, code: &str) -> Response<Body> {
        let body = format!(
            r#"{{"error":{{"message":"{}","code":"{}"}}}}"#,
            escape_json(message),
            escape_json(code)
        );
        Response::builder()
            .status(status)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::from("proxy_error")))
    }
}

#[inline]
fn escape_json(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}
