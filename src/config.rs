
use serde::Deserialize;
use std::path::PathBuf;

pub const DEFAULT_UPSTREAM_URL: &str = "https://ollama.com";

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen port, HTTP only.
    pub port: u16,

    /// Upstream base URL (scheme + authority, no path).
    pub upstream_url: String,

    /// Bearer token required on proxied and operational endpoints.
    pub proxy_auth_token: Option<String>,

    /// Explicitly disables the token check.
    pub allow_unauthenticated: bool,

    /// Reported by `/health`; overridable for container builds.
    pub app_version: String,

    /// Directory for the usage database and the request archive.
    pub data_dir: PathBuf,

    /// Upstream API keys, in configuration order.
    pub keys: Vec<String>,

    pub health_interval_secs: u64,
    pub probe_timeout_ms: u64,

    /// Bounds time-to-first-status on upstream calls; streaming bodies are
    /// not time-limited.
    pub response_timeout_ms: u64,

    pub max_body_bytes: usize,
}

/// On-disk shape of the key file. Keys come from here and nowhere else.
#[derive(Debug, Deserialize)]
struct KeyFile {
    keys: Vec<String>,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("config: cannot read {path}: {e}"))?;
        let keys = parse_key_file(&s)?;

        let mut cfg = Config {
            port: 11434,
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            proxy_auth_token: None,
            allow_unauthenticated: false,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: PathBuf::from("data"),
            keys,
            health_interval_secs: 60,
            probe_timeout_ms: 10_000,
            response_timeout_ms: 120_000,
            max_body_bytes: 16 * 1024 * 1024,
        };
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Ok(port) = std::env::var("PORT") {
            self.port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("config: invalid PORT value {port:?}"))?;
        }
        if let Ok(url) = std::env::var("OLLAMA_CLOUD_URL") {
            self.upstream_url = url;
        }
        if let Ok(token) = std::env::var("PROXY_AUTH_TOKEN") {
            let token = token.trim().to_string();
            if !token.is_empty() {
                self.proxy_auth_token = Some(token);
            }
        }
        if let Ok(v) = std::env::var("ALLOW_UNAUTHENTICATED_ACCESS") {
            self.allow_unauthenticated = v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("APP_VERSION") {
            self.app_version = v;
        }
        if let Ok(v) = std::env::var("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.keys.is_empty() {
            anyhow::bail!("config: no API keys configured");
        }
        if !(self.upstream_url.starts_with("http://") || self.upstream_url.starts_with("https://"))
        {
            anyhow::bail!("config: upstream URL must start with http:// or https://");
        }
        if self.proxy_auth_token.is_none() && !self.allow_unauthenticated {
            anyhow::bail!(
                "config: PROXY_AUTH_TOKEN is not set; set it or opt out with \
                 ALLOW_UNAUTHENTICATED_ACCESS=true"
            );
        }
        Ok(())
    }
}

fn parse_key_file(yaml: &str) -> anyhow::Result<Vec<String>> {
    let file: KeyFile =
        serde_yaml::from_str(yaml).map_err(|e| anyhow::anyhow!("config: invalid key file: {e}"))?;
    let keys: Vec<String> = file
        .keys
        .into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();
    if keys.is_empty() {
        anyhow::bail!("config: key file contains no usable keys");
    }
    Ok(keys)
}
