
use std::time::{SystemTime, UNIX_EPOCH};

#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
/// Returns `None` for a missing header or any other scheme.
pub fn bearer_token(headers: &hyper::HeaderMap) -> Option<&str> {
    let raw = headers
        .get(hyper::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .trim();
    let token = raw
        .strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Very small query parser for `?a=b&c=d`. No percent-decoding.
#[inline]
pub fn query_get<'a>(uri: &'a http::Uri, key: &str) -> Option<&'a str> {
    let q = uri.query()?;
    for part in q.split('&') {
        let mut it = part.splitn(2, '=');
        let k = it.next()?;
        if k == key {
            return it.next();
        }
    }
    None
}
