
use std::time::Duration;

/// Cooldown ladder for consecutive rate-limit (429) penalties.
pub const RATE_LIMIT_LADDER: [Duration; 6] = [
    Duration::from_secs(15 * 60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(2 * 60 * 60),
    Duration::from_secs(6 * 60 * 60),
    Duration::from_secs(12 * 60 * 60),
    Duration::from_secs(24 * 60 * 60),
];

/// Flat cooldown for upstream 5xx and local transport failures.
pub const TRANSIENT_PENALTY: Duration = Duration::from_secs(30);

/// How a single upstream attempt is treated by the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamOutcome {
    /// 2xx: stream the body to the client.
    Success,
    /// 429: ladder penalty, rotate to another key.
    RateLimited,
    /// 500/502/503/504: short penalty, rotate to another key.
    Transient,
    /// Everything else: forward to the client as-is, no penalty.
    Forward,
}

pub fn classify_status(status: u16) -> UpstreamOutcome {
    match status {
        200..=299 => UpstreamOutcome::Success,
        429 => UpstreamOutcome::RateLimited,
        500 | 502 | 503 | 504 => UpstreamOutcome::Transient,
        _ => UpstreamOutcome::Forward,
    }
}

/// `backoff_level` counts consecutive rate-limit penalties; 0 means none.
/// The n-th penalty (level n) cools the key down for `RATE_LIMIT_LADDER[n-1]`.
pub fn max_backoff_level() -> u32 {
    RATE_LIMIT_LADDER.len() as u32
}

/// Computes the next rate-limit step: the incremented (saturating) level and
/// the new penalty deadline. Pure; `now_ms` is wall-clock milliseconds.
pub fn rate_limit_step(level: u32, now_ms: u64) -> (u32, u64) {
    let new_level = (level + 1).min(max_backoff_level());
    let cooldown = RATE_LIMIT_LADDER[(new_level - 1) as usize];
    (new_level, now_ms.saturating_add(cooldown.as_millis() as u64))
}

/// Deadline for re-parking a key at its current level without advancing it
/// (manual penalize). A healthy key parks at the first ladder step.
pub fn hold_step(level: u32, now_ms: u64) -> u64 {
    let idx = level.saturating_sub(1).min(max_backoff_level() - 1);
    now_ms.saturating_add(RATE_LIMIT_LADDER[idx as usize].as_millis() as u64)
}

pub fn transient_step(now_ms: u64) -> u64 {
    now_ms.saturating_add(TRANSIENT_PENALTY.as_millis() as u64)
}
