
use crate::state::ProxyState;
use crate::util::now_ms;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cached result of the latest probe round for one key, served by
/// `/health/keys`. `state` is one of: `ok`, `rate_limited`, `error`,
/// `offline`, `penalized` (skipped because the cooldown is still running).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProbeStatus {
    pub key_index: usize,
    pub state: String,
    pub status: Option<u16>,
    pub checked_at_ms: Option<u64>,
}

impl ProbeStatus {
    fn skipped(key_index: usize) -> Self {
        Self {
            key_index,
            state: "penalized".into(),
            status: None,
            checked_at_ms: None,
        }
    }
}

/// Background key rehabilitation loop. Every tick it probes each key whose
/// cooldown is absent or expired and clears or re-applies penalties based on
/// the probe result. Probing is owned here alone; the on-demand snapshot
/// endpoints only read the cache.
pub async fn run(state: Arc<ProxyState>) {
    info!(
        interval_secs = state.health_interval.as_secs(),
        "key health worker started"
    );
    let mut tick = tokio::time::interval(state.health_interval);
    loop {
        tick.tick().await;
        run_tick(&state).await;
    }
}

async fn run_tick(state: &Arc<ProxyState>) {
    let now = now_ms();
    let snapshots = state.keys.snapshot(now);

    let mut results: Vec<Option<ProbeStatus>> = vec![None; snapshots.len()];
    let mut join = tokio::task::JoinSet::new();
    for snap in snapshots {
        let index = snap.index;
        if !snap.probe_due(now) {
            results[index] = Some(ProbeStatus::skipped(index));
            continue;
        }
        let state = state.clone();
        join.spawn(async move { probe_key(&state, index).await });
    }

    let mut probed = 0usize;
    let mut reached = 0usize;
    while let Some(res) = join.join_next().await {
        let Ok(status) = res else { continue };
        probed += 1;
        if status.status.is_some() {
            reached += 1;
        }
        let index = status.key_index;
        results[index] = Some(status);
    }

    if probed > 0 {
        state.upstream_ok.store(reached > 0, Ordering::Relaxed);
    }

    let cache: Vec<ProbeStatus> = results
        .into_iter()
        .enumerate()
        .map(|(i, r)| r.unwrap_or_else(|| ProbeStatus::skipped(i)))
        .collect();
    state.probe_cache.store(Arc::new(cache));
}

async fn probe_key(state: &Arc<ProxyState>, index: usize) -> ProbeStatus {
    let auth = state.keys.auth_header(index).clone();
    let result = state.upstream.probe(&auth, state.probe_timeout).await;
    let now = now_ms();

    match result {
        Ok(status) if status.is_success() => {
            state.keys.reset(index);
            debug!(key = index, "probe ok");
            ProbeStatus {
                key_index: index,
                state: "ok".into(),
                status: Some(status.as_u16()),
                checked_at_ms: Some(now),
            }
        }
        Ok(status) if status.as_u16() == 429 => {
            let rec = state.keys.penalize_rate_limited(index, now, None);
            warn!(
                key = index,
                level = rec.backoff_level,
                "probe rate-limited; key stays in cooldown"
            );
            ProbeStatus {
                key_index: index,
                state: "rate_limited".into(),
                status: Some(429),
                checked_at_ms: Some(now),
            }
        }
        Ok(status) => {
            state
                .keys
                .penalize_transient(index, now, Some(status.as_u16()));
            warn!(key = index, status = status.as_u16(), "probe failed");
            ProbeStatus {
                key_index: index,
                state: "error".into(),
                status: Some(status.as_u16()),
                checked_at_ms: Some(now),
            }
        }
        Err(e) => {
            state.keys.penalize_transient(index, now, None);
            debug!(key = index, error = %e, "probe unreachable");
            ProbeStatus {
                key_index: index,
                state: "offline".into(),
                status: None,
                checked_at_ms: Some(now),
            }
        }
    }
}
