
use bytes::Bytes;
use http::uri::{Authority, Scheme};
use hyper::body::HttpBody;
use hyper::client::HttpConnector;
use hyper::header::{
    AUTHORIZATION, CONNECTION, CONTENT_LENGTH, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use hyper::{Body, Client, HeaderMap, Method, Request, StatusCode, Uri};
use hyper_rustls::HttpsConnectorBuilder;
use std::time::Duration;

/// At most this much of a non-2xx upstream body is read back and surfaced.
pub const ERROR_BODY_LIMIT: usize = 8 * 1024;

/// Result of a single upstream attempt that produced an HTTP status.
pub enum Attempt {
    /// 2xx: the body is still open and must be relayed to the client.
    Open {
        status: StatusCode,
        headers: HeaderMap,
        body: Body,
    },
    /// Non-2xx: the body was read (bounded) and the response closed.
    Closed {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
}

/// The one HTTP client talking to the upstream API. Shared process-wide so
/// connection pooling survives retries and long streams.
pub struct UpstreamTarget {
    scheme: Scheme,
    authority: Authority,
    client: Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>,
    response_timeout: Duration,
}

impl UpstreamTarget {
    pub fn new(base_url: &str, response_timeout: Duration) -> anyhow::Result<Self> {
        let base: Uri = base_url.parse()?;
        let scheme = base
            .scheme()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("upstream URL missing scheme: {base_url}"))?;
        let authority = base
            .authority()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("upstream URL missing host: {base_url}"))?;
        if !matches!(base.path(), "" | "/") {
            anyhow::bail!("upstream URL must not carry a path: {base_url}");
        }

        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(64)
            .build::<_, Body>(https);

        Ok(Self {
            scheme,
            authority,
            client,
            response_timeout,
        })
    }

    /// Issues one upstream call with the chosen key. The timeout bounds
    /// time-to-status only; an open 2xx body streams untimed.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        client_headers: &HeaderMap,
        auth: &hyper::header::HeaderValue,
        body: Bytes,
    ) -> anyhow::Result<Attempt> {
        let uri = self.build_uri(&clean_path(path), query)?;
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body))?;
        *req.headers_mut() = client_headers.clone();
        sanitize_hop_headers(req.headers_mut());
        req.headers_mut().insert(AUTHORIZATION, auth.clone());

        let resp = tokio::time::timeout(self.response_timeout, self.client.request(req))
            .await
            .map_err(|_| anyhow::anyhow!("upstream response timeout"))??;

        let status = resp.status();
        let (parts, body) = resp.into_parts();
        if status.is_success() {
            return Ok(Attempt::Open {
                status,
                headers: parts.headers,
                body,
            });
        }

        let body = read_bounded(body, ERROR_BODY_LIMIT).await;
        Ok(Attempt::Closed {
            status,
            headers: parts.headers,
            body,
        })
    }

    /// Cheap reachability check for one key: `GET /api/tags`.
    pub async fn probe(
        &self,
        auth: &hyper::header::HeaderValue,
        timeout: Duration,
    ) -> anyhow::Result<StatusCode> {
        let uri = self.build_uri("api/tags", None)?;
        let mut req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())?;
        req.headers_mut().insert(AUTHORIZATION, auth.clone());

        let resp = tokio::time::timeout(timeout, self.client.request(req))
            .await
            .map_err(|_| anyhow::anyhow!("probe timeout"))??;
        Ok(resp.status())
    }

    fn build_uri(&self, clean: &str, query: Option<&str>) -> anyhow::Result<Uri> {
        let mut pq = String::with_capacity(clean.len() + 2);
        pq.push('/');
        pq.push_str(clean);
        if let Some(q) = query {
            pq.push('?');
            pq.push_str(q);
        }
        let mut parts = http::uri::Parts::default();
        parts.scheme = Some(self.scheme.clone());
        parts.authority = Some(self.authority.clone());
        parts.path_and_query = Some(pq.parse()?);
        Ok(Uri::from_parts(parts)?)
    }
}

/// Normalizes a client path for the upstream wire: paths already under
/// `api/` or `v1/` pass through untouched, anything else gets the `api/`
/// prefix. Never produces `api/api` or `v1/v1`.
pub fn clean_path(raw: &str) -> String {
    let p = raw.trim_start_matches('/');
    if p.is_empty() || p == "api" {
        "api".to_string()
    } else if p == "v1" || p.starts_with("api/") || p.starts_with("v1/") {
        p.to_string()
    } else {
        format!("api/{p}")
    }
}

/// Removes hop-by-hop headers that must not cross the proxy in either
/// direction. `Host` is dropped too; hyper derives it from the URI.
pub fn sanitize_hop_headers(headers: &mut HeaderMap) {
    headers.remove(CONNECTION);
    headers.remove(HOST);
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
    headers.remove(PROXY_AUTHENTICATE);
    headers.remove(PROXY_AUTHORIZATION);
    headers.remove(TE);
    headers.remove(TRAILER);
    headers.remove(TRANSFER_ENCODING);
    headers.remove(UPGRADE);
}

/// Seconds until the key's quota resets, when the upstream advertises it.
pub fn ratelimit_reset_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

async fn read_bounded(mut body: Body, limit: usize) -> Bytes {
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        let Ok(chunk) = chunk else { break };
        let room = limit - buf.len();
        if chunk.len() >= room {
            buf.extend_from_slice(&chunk[..room]);
            break;
        }
        buf.extend_from_slice(&chunk);
    }
    Bytes::from(buf)
}

/// Strips headers that no longer describe a bounded, re-framed error body.
pub fn strip_body_framing(headers: &mut HeaderMap) {
    headers.remove(CONTENT_LENGTH);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_path_adds_api_prefix_once() {
        assert_eq!(clean_path("/chat"), "api/chat");
        assert_eq!(clean_path("chat"), "api/chat");
        assert_eq!(clean_path("/api/chat"), "api/chat");
        assert_eq!(clean_path("/api/api/chat"), "api/api/chat");
        assert_eq!(clean_path("/v1/chat/completions"), "v1/chat/completions");
        assert_eq!(clean_path("/v1"), "v1");
        assert_eq!(clean_path(""), "api");
        assert_eq!(clean_path("/"), "api");
        assert_eq!(clean_path("/api"), "api");
    }

    #[test]
    fn hop_headers_are_dropped_and_the_rest_pass() {
        let mut h = HeaderMap::new();
        h.insert(CONNECTION, "keep-alive".parse().unwrap());
        h.insert(HOST, "proxy.local".parse().unwrap());
        h.insert(TRANSFER_ENCODING, "chunked".parse().unwrap());
        h.insert(UPGRADE, "websocket".parse().unwrap());
        h.insert("x-custom", "1".parse().unwrap());
        h.insert("content-type", "application/json".parse().unwrap());

        sanitize_hop_headers(&mut h);

        assert!(h.get(CONNECTION).is_none());
        assert!(h.get(HOST).is_none());
        assert!(h.get(TRANSFER_ENCODING).is_none());
        assert!(h.get(UPGRADE).is_none());
        assert_eq!(h.get("x-custom").unwrap(), "1");
        assert_eq!(h.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn ratelimit_reset_parses_plain_seconds() {
        let mut h = HeaderMap::new();
        assert_eq!(ratelimit_reset_secs(&h), None);
        h.insert("x-ratelimit-reset", "3600".parse().unwrap());
        assert_eq!(ratelimit_reset_secs(&h), Some(3600));
        h.insert("x-ratelimit-reset", "soon".parse().unwrap());
        assert_eq!(ratelimit_reset_secs(&h), None);
    }

    #[test]
    fn target_rejects_base_with_path() {
        let timeout = Duration::from_secs(1);
        assert!(UpstreamTarget::new("https://ollama.com", timeout).is_ok());
        assert!(UpstreamTarget::new("https://ollama.com/", timeout).is_ok());
        assert!(UpstreamTarget::new("https://ollama.com/api", timeout).is_err());
        assert!(UpstreamTarget::new("ollama.com", timeout).is_err());
    }
}
