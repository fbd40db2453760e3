
use ahash::AHashMap;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::mpsc::{self, Sender};
use std::thread;
use tokio::sync::oneshot;
use tracing::warn;

/// One token-accounting record, produced after a completed upstream call.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub client_ip: String,
    pub key_index: usize,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HourlyRow {
    pub bucket: String,
    pub client_ip: String,
    pub key_index: i64,
    pub model: String,
    pub requests: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MinuteRow {
    pub minute: String,
    pub model: String,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HourBucketRow {
    pub hour_bucket: String,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RequestRow {
    pub id: i64,
    pub timestamp: String,
    pub client_ip: String,
    pub method: String,
    pub endpoint: String,
    pub model: String,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub file_path: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct QueryFilter {
    pub limit: u32,
    pub offset: u32,
    pub ip: Option<String>,
    pub model: Option<String>,
}

enum Command {
    Usage(UsageEvent),
    CreateRequest {
        client_ip: String,
        method: String,
        endpoint: String,
        file_path: Option<String>,
        reply: oneshot::Sender<Option<i64>>,
    },
    UpdateRequest {
        id: i64,
        model: String,
        prompt_tokens: i64,
        completion_tokens: i64,
    },
    UsageByKey2h {
        reply: oneshot::Sender<AHashMap<usize, i64>>,
    },
    Hourly {
        reply: oneshot::Sender<anyhow::Result<Vec<HourlyRow>>>,
    },
    Minute {
        window_mins: u32,
        reply: oneshot::Sender<anyhow::Result<Vec<MinuteRow>>>,
    },
    Daily {
        reply: oneshot::Sender<anyhow::Result<Vec<HourBucketRow>>>,
    },
    Queries {
        filter: QueryFilter,
        reply: oneshot::Sender<anyhow::Result<Vec<RequestRow>>>,
    },
    RequestFilePath {
        id: i64,
        reply: oneshot::Sender<anyhow::Result<Option<String>>>,
    },
}

/// The usage database handle. One dedicated OS thread owns the SQLite
/// connection; every write and dashboard query goes through its channel,
/// which serializes storage access without holding locks on request paths.
pub struct UsageStore {
    tx: Sender<Command>,
}

impl UsageStore {
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("usage.db"))?;
        init_schema(&conn)?;

        let (tx, rx) = mpsc::channel::<Command>();
        thread::Builder::new()
            .name("usage-db".into())
            .spawn(move || {
                while let Ok(cmd) = rx.recv() {
                    run_command(&conn, cmd);
                }
            })?;

        Ok(Self { tx })
    }

    /// Fire-and-forget: accounting failures are logged, never surfaced.
    pub fn record_usage(&self, event: UsageEvent) {
        if self.tx.send(Command::Usage(event)).is_err() {
            warn!("usage store is down; dropping usage event");
        }
    }

    pub async fn create_request(
        &self,
        client_ip: String,
        method: String,
        endpoint: String,
        file_path: Option<String>,
    ) -> Option<i64> {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::CreateRequest {
            client_ip,
            method,
            endpoint,
            file_path,
            reply,
        };
        if self.tx.send(cmd).is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub fn update_request(&self, id: i64, model: String, prompt_tokens: i64, completion_tokens: i64) {
        let cmd = Command::UpdateRequest {
            id,
            model,
            prompt_tokens,
            completion_tokens,
        };
        if self.tx.send(cmd).is_err() {
            warn!("usage store is down; dropping request update");
        }
    }

    /// Per-key token totals over the last two hours, used as the selection
    /// hint. Best-effort: an empty map on any failure.
    pub async fn usage_by_key_2h(&self) -> AHashMap<usize, i64> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::UsageByKey2h { reply }).is_err() {
            return AHashMap::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn hourly(&self) -> anyhow::Result<Vec<HourlyRow>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Hourly { reply })
            .map_err(|_| anyhow::anyhow!("usage store is down"))?;
        rx.await?
    }

    pub async fn minute(&self, window_mins: u32) -> anyhow::Result<Vec<MinuteRow>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Minute { window_mins, reply })
            .map_err(|_| anyhow::anyhow!("usage store is down"))?;
        rx.await?
    }

    pub async fn daily(&self) -> anyhow::Result<Vec<HourBucketRow>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Daily { reply })
            .map_err(|_| anyhow::anyhow!("usage store is down"))?;
        rx.await?
    }

    pub async fn queries(&self, filter: QueryFilter) -> anyhow::Result<Vec<RequestRow>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Queries { filter, reply })
            .map_err(|_| anyhow::anyhow!("usage store is down"))?;
        rx.await?
    }

    pub async fn request_file_path(&self, id: i64) -> anyhow::Result<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::RequestFilePath { id, reply })
            .map_err(|_| anyhow::anyhow!("usage store is down"))?;
        rx.await?
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS usage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
            client_ip TEXT,
            key_index INTEGER,
            model TEXT,
            prompt_tokens INTEGER,
            completion_tokens INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_usage_timestamp ON usage (timestamp);
        CREATE TABLE IF NOT EXISTS requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
            client_ip TEXT,
            method TEXT,
            endpoint TEXT,
            model TEXT,
            prompt_tokens INTEGER,
            completion_tokens INTEGER,
            file_path TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_requests_timestamp ON requests (timestamp);",
    )
}

fn run_command(conn: &Connection, cmd: Command) {
    match cmd {
        Command::Usage(ev) => {
            let res = conn.execute(
                "INSERT INTO usage (client_ip, key_index, model, prompt_tokens, completion_tokens)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    ev.client_ip,
                    ev.key_index as i64,
                    ev.model,
                    ev.prompt_tokens,
                    ev.completion_tokens
                ],
            );
            if let Err(e) = res {
                warn!(error = %e, "recording usage failed");
            }
        }
        Command::CreateRequest {
            client_ip,
            method,
            endpoint,
            file_path,
            reply,
        } => {
            let res = conn
                .execute(
                    "INSERT INTO requests (client_ip, method, endpoint, file_path, model)
                     VALUES (?1, ?2, ?3, ?4, 'pending')",
                    params![client_ip, method, endpoint, file_path],
                )
                .map(|_| conn.last_insert_rowid());
            let id = match res {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(error = %e, "creating request log failed");
                    None
                }
            };
            let _ = reply.send(id);
        }
        Command::UpdateRequest {
            id,
            model,
            prompt_tokens,
            completion_tokens,
        } => {
            let res = conn.execute(
                "UPDATE requests SET model = ?1, prompt_tokens = ?2, completion_tokens = ?3
                 WHERE id = ?4",
                params![model, prompt_tokens, completion_tokens, id],
            );
            if let Err(e) = res {
                warn!(error = %e, "updating request log failed");
            }
        }
        Command::UsageByKey2h { reply } => {
            let _ = reply.send(usage_by_key_2h(conn).unwrap_or_else(|e| {
                warn!(error = %e, "usage hint query failed");
                AHashMap::new()
            }));
        }
        Command::Hourly { reply } => {
            let _ = reply.send(hourly(conn).map_err(Into::into));
        }
        Command::Minute { window_mins, reply } => {
            let _ = reply.send(minute(conn, window_mins).map_err(Into::into));
        }
        Command::Daily { reply } => {
            let _ = reply.send(daily(conn).map_err(Into::into));
        }
        Command::Queries { filter, reply } => {
            let _ = reply.send(queries(conn, &filter).map_err(Into::into));
        }
        Command::RequestFilePath { id, reply } => {
            let res = conn
                .query_row(
                    "SELECT file_path FROM requests WHERE id = ?1",
                    params![id],
                    |row| row.get::<_, Option<String>>(0),
                )
                .optional()
                .map(|opt| opt.flatten())
                .map_err(Into::into);
            let _ = reply.send(res);
        }
    }
}

fn usage_by_key_2h(conn: &Connection) -> rusqlite::Result<AHashMap<usize, i64>> {
    let mut stmt = conn.prepare(
        "SELECT key_index, SUM(prompt_tokens + completion_tokens)
         FROM usage
         WHERE timestamp >= datetime('now', '-2 hours')
         GROUP BY key_index",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, Option<i64>>(1)?.unwrap_or(0),
        ))
    })?;
    let mut map = AHashMap::new();
    for row in rows {
        let (idx, total) = row?;
        if idx >= 0 {
            map.insert(idx as usize, total);
        }
    }
    Ok(map)
}

fn hourly(conn: &Connection) -> rusqlite::Result<Vec<HourlyRow>> {
    let mut stmt = conn.prepare(
        "SELECT strftime('%Y-%m-%dT%H:00:00Z', timestamp) AS bucket,
                client_ip, key_index, model,
                COUNT(*) AS requests,
                SUM(prompt_tokens) AS prompt_tokens,
                SUM(completion_tokens) AS completion_tokens
         FROM usage
         GROUP BY bucket, client_ip, key_index, model
         ORDER BY bucket DESC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(HourlyRow {
            bucket: row.get(0)?,
            client_ip: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            key_index: row.get(2)?,
            model: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            requests: row.get(4)?,
            prompt_tokens: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
            completion_tokens: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
        })
    })?;
    rows.collect()
}

fn minute(conn: &Connection, window_mins: u32) -> rusqlite::Result<Vec<MinuteRow>> {
    let mut stmt = conn.prepare(
        "SELECT strftime('%Y-%m-%dT%H:%M:00Z', timestamp) AS minute,
                model,
                SUM(prompt_tokens + completion_tokens) AS total_tokens
         FROM usage
         WHERE timestamp >= datetime('now', ?1)
         GROUP BY minute, model
         ORDER BY minute ASC",
    )?;
    let window = format!("-{window_mins} minutes");
    let rows = stmt.query_map(params![window], |row| {
        Ok(MinuteRow {
            minute: row.get(0)?,
            model: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            total_tokens: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
        })
    })?;
    rows.collect()
}

fn daily(conn: &Connection) -> rusqlite::Result<Vec<HourBucketRow>> {
    let mut stmt = conn.prepare(
        "SELECT strftime('%Y-%m-%dT%H:00:00Z', timestamp) AS hour_bucket,
                SUM(prompt_tokens + completion_tokens) AS total_tokens
         FROM usage
         WHERE timestamp >= datetime('now', '-24 hours')
         GROUP BY hour_bucket
         ORDER BY hour_bucket ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(HourBucketRow {
            hour_bucket: row.get(0)?,
            total_tokens: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
        })
    })?;
    rows.collect()
}

fn queries(conn: &Connection, filter: &QueryFilter) -> rusqlite::Result<Vec<RequestRow>> {
    let mut sql = String::from(
        "SELECT id, timestamp, client_ip, method, endpoint, model,
                prompt_tokens, completion_tokens, file_path
         FROM requests WHERE 1=1",
    );
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(ip) = &filter.ip {
        sql.push_str(" AND client_ip = ?");
        values.push(ip.clone().into());
    }
    if let Some(model) = &filter.model {
        sql.push_str(" AND model = ?");
        values.push(model.clone().into());
    }
    sql.push_str(" ORDER BY timestamp DESC LIMIT ? OFFSET ?");
    values.push(i64::from(filter.limit.clamp(1, 5000)).into());
    values.push(i64::from(filter.offset).into());

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(values), |row| {
        Ok(RequestRow {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            client_ip: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            method: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            endpoint: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            model: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            prompt_tokens: row.get(6)?,
            completion_tokens: row.get(7)?,
            file_path: row.get(8)?,
        })
    })?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, UsageStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = UsageStore::open(tmp.path()).unwrap();
        (tmp, store)
    }

    fn event(key_index: usize, model: &str, prompt: i64, completion: i64) -> UsageEvent {
        UsageEvent {
            client_ip: "127.0.0.1".into(),
            key_index,
            model: model.into(),
            prompt_tokens: prompt,
            completion_tokens: completion,
        }
    }

    #[tokio::test]
    async fn usage_rows_aggregate_by_hour_and_key() {
        let (_tmp, store) = store();
        store.record_usage(event(0, "llama3", 3, 12));
        store.record_usage(event(0, "llama3", 1, 4));
        store.record_usage(event(1, "qwen3", 10, 20));

        let rows = store.hourly().await.unwrap();
        assert_eq!(rows.len(), 2);
        let llama = rows.iter().find(|r| r.model == "llama3").unwrap();
        assert_eq!(llama.requests, 2);
        assert_eq!(llama.prompt_tokens, 4);
        assert_eq!(llama.completion_tokens, 16);

        let hint = store.usage_by_key_2h().await;
        assert_eq!(hint.get(&0), Some(&20));
        assert_eq!(hint.get(&1), Some(&30));

        let minutes = store.minute(60).await.unwrap();
        assert_eq!(minutes.len(), 2);
        let day = store.daily().await.unwrap();
        assert_eq!(day.len(), 1);
        assert_eq!(day[0].total_tokens, 50);
    }

    #[tokio::test]
    async fn request_rows_update_after_completion() {
        let (_tmp, store) = store();
        let id = store
            .create_request(
                "10.0.0.1".into(),
                "POST".into(),
                "api/chat".into(),
                Some("10.0.0.1/2026-08-02/x.json.gz".into()),
            )
            .await
            .unwrap();

        let rows = store.queries(QueryFilter { limit: 10, ..Default::default() }).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].model, "pending");

        store.update_request(id, "llama3".into(), 3, 12);
        let rows = store.queries(QueryFilter { limit: 10, ..Default::default() }).await.unwrap();
        assert_eq!(rows[0].model, "llama3");
        assert_eq!(rows[0].prompt_tokens, Some(3));

        let path = store.request_file_path(id).await.unwrap();
        assert_eq!(path.as_deref(), Some("10.0.0.1/2026-08-02/x.json.gz"));
        assert_eq!(store.request_file_path(id + 99).await.unwrap(), None);
    }

    #[tokio::test]
    async fn query_filters_by_ip_and_model() {
        let (_tmp, store) = store();
        let _ = store
            .create_request("1.1.1.1".into(), "POST".into(), "api/chat".into(), None)
            .await;
        let _ = store
            .create_request("2.2.2.2".into(), "POST".into(), "api/generate".into(), None)
            .await;

        let rows = store
            .queries(QueryFilter {
                limit: 10,
                ip: Some("1.1.1.1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].endpoint, "api/chat");
    }
}
