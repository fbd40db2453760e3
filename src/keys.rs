
use crate::penalty;
use ahash::AHashMap;
use hyper::header::HeaderValue;
use std::collections::HashSet;
use std::sync::Mutex;

/// Mutable status of one API key. The secret itself lives outside this
/// struct and never changes for the process lifetime.
#[derive(Debug, Clone, Default)]
pub struct KeyRecord {
    pub penalty_until_ms: Option<u64>,
    pub backoff_level: u32,
    pub last_error_status: Option<u16>,
    pub last_error_at_ms: Option<u64>,
    pub next_probe_at_ms: Option<u64>,
}

impl KeyRecord {
    /// A key is selectable iff it has no penalty deadline in the future.
    pub fn available(&self, now_ms: u64) -> bool {
        self.penalty_until_ms.map_or(true, |t| t <= now_ms)
    }
}

/// Consistent copy of one key's status, safe to serialize (no secret).
#[derive(Debug, Clone, serde::Serialize)]
pub struct KeySnapshot {
    pub index: usize,
    pub available: bool,
    pub penalty_until_ms: Option<u64>,
    pub backoff_level: u32,
    pub last_error_status: Option<u16>,
    pub last_error_at_ms: Option<u64>,
    pub next_probe_at_ms: Option<u64>,
}

impl KeySnapshot {
    /// The background controller may probe this key now.
    pub fn probe_due(&self, now_ms: u64) -> bool {
        self.next_probe_at_ms.map_or(true, |t| t <= now_ms)
    }
}

struct KeyEntry {
    auth_header: HeaderValue,
    status: Mutex<KeyRecord>,
}

/// Fixed-size, index-addressed table of API keys. Each record sits behind
/// its own mutex; critical sections are short and never suspend.
pub struct KeyTable {
    entries: Vec<KeyEntry>,
}

impl KeyTable {
    pub fn new(keys: &[String]) -> anyhow::Result<Self> {
        let mut entries = Vec::with_capacity(keys.len());
        for k in keys {
            let k = k.trim();
            if k.is_empty() {
                continue;
            }
            let mut auth_header = HeaderValue::from_str(&format!("Bearer {k}"))
                .map_err(|_| anyhow::anyhow!("invalid key (cannot be used in HTTP header)"))?;
            auth_header.set_sensitive(true);
            entries.push(KeyEntry {
                auth_header,
                status: Mutex::new(KeyRecord::default()),
            });
        }
        if entries.is_empty() {
            anyhow::bail!("no usable API keys");
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, index: usize) -> bool {
        index < self.entries.len()
    }

    pub fn auth_header(&self, index: usize) -> &HeaderValue {
        &self.entries[index].auth_header
    }

    fn lock(&self, index: usize) -> std::sync::MutexGuard<'_, KeyRecord> {
        self.entries[index]
            .status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, index: usize) -> KeyRecord {
        self.lock(index).clone()
    }

    pub fn snapshot(&self, now_ms: u64) -> Vec<KeySnapshot> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, e)| {
                let rec = e.status.lock().unwrap_or_else(|p| p.into_inner());
                KeySnapshot {
                    index,
                    available: rec.available(now_ms),
                    penalty_until_ms: rec.penalty_until_ms,
                    backoff_level: rec.backoff_level,
                    last_error_status: rec.last_error_status,
                    last_error_at_ms: rec.last_error_at_ms,
                    next_probe_at_ms: rec.next_probe_at_ms,
                }
            })
            .collect()
    }

    pub fn eligible_indices(&self, exclude: &HashSet<usize>, now_ms: u64) -> Vec<usize> {
        (0..self.entries.len())
            .filter(|i| !exclude.contains(i) && self.lock(*i).available(now_ms))
            .collect()
    }

    /// Applies a rate-limit penalty. No-op while an earlier penalty deadline
    /// is still in the future, so concurrent 429s on the same key advance
    /// the ladder exactly once per penalty window (first writer wins).
    /// `floor_until_ms` (from an upstream reset header) can only lengthen
    /// the cooldown, never shorten it.
    pub fn penalize_rate_limited(
        &self,
        index: usize,
        now_ms: u64,
        floor_until_ms: Option<u64>,
    ) -> KeyRecord {
        let mut rec = self.lock(index);
        if !rec.available(now_ms) {
            return rec.clone();
        }
        let (level, until) = penalty::rate_limit_step(rec.backoff_level, now_ms);
        let until = floor_until_ms.map_or(until, |f| until.max(f));
        rec.backoff_level = level;
        rec.penalty_until_ms = Some(until);
        rec.last_error_status = Some(429);
        rec.last_error_at_ms = Some(now_ms);
        rec.next_probe_at_ms = Some(until);
        rec.clone()
    }

    /// Short flat penalty for upstream 5xx / transport failures. Does not
    /// advance the backoff level and never shortens an existing deadline.
    pub fn penalize_transient(&self, index: usize, now_ms: u64, status: Option<u16>) -> KeyRecord {
        let mut rec = self.lock(index);
        let until = penalty::transient_step(now_ms).max(rec.penalty_until_ms.unwrap_or(0));
        rec.penalty_until_ms = Some(until);
        if status.is_some() {
            rec.last_error_status = status;
        }
        rec.last_error_at_ms = Some(now_ms);
        rec.next_probe_at_ms = Some(until);
        rec.clone()
    }

    /// Re-parks a key at its current ladder level without advancing it.
    pub fn penalize_manual(&self, index: usize, now_ms: u64) -> KeyRecord {
        let mut rec = self.lock(index);
        let until = penalty::hold_step(rec.backoff_level, now_ms);
        rec.penalty_until_ms = Some(until);
        rec.last_error_at_ms = Some(now_ms);
        rec.next_probe_at_ms = Some(until);
        rec.clone()
    }

    /// Clears penalty, backoff level and error markers. Used by operator
    /// reset and by the health controller after a successful probe.
    pub fn reset(&self, index: usize) {
        let mut rec = self.lock(index);
        *rec = KeyRecord::default();
    }
}

/// Picks the next key for an attempt: eligible keys minus the exclude set,
/// ranked by ascending recent usage (missing hint entries count as zero),
/// ties broken by the smallest index. Deterministic for identical inputs.
pub fn select_key(
    table: &KeyTable,
    exclude: &HashSet<usize>,
    usage_hint: &AHashMap<usize, i64>,
    now_ms: u64,
) -> Option<usize> {
    let mut eligible = table.eligible_indices(exclude, now_ms);
    eligible.sort_by_key(|i| (usage_hint.get(i).copied().unwrap_or(0), *i));
    eligible.first().copied()
}
